// propsd: Secret resolution
// Walks property trees for $tokend sentinels and resolves them against the
// local secret broker, degrading every failure to a null substitution

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{TokendError, TokendResult};
use crate::properties;

/// A mapping whose sole key is this marker is a secret reference.
pub const SENTINEL_KEY: &str = "$tokend";

/// Secret broker interface
///
/// `generic` secrets resolve with a GET against their resource path;
/// `transit` and `kms` decryption posts a request body instead.
#[async_trait]
pub trait SecretBroker: Send + Sync + 'static {
    async fn get(&self, resource: &str) -> TokendResult<Value>;
    async fn post(&self, resource: &str, body: Value) -> TokendResult<Value>;
}

/// HTTP client for a Tokend-dialect secret broker
pub struct TokendClient {
    base: String,
    http: reqwest::Client,
}

impl TokendClient {
    pub fn new(host: &str, port: u16) -> TokendResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| TokendError::Network(format!("building broker client: {}", e)))?;
        Ok(Self {
            base: format!("http://{}:{}", host, port),
            http,
        })
    }

    fn url(&self, resource: &str) -> String {
        if resource.starts_with('/') {
            format!("{}{}", self.base, resource)
        } else {
            format!("{}/{}", self.base, resource)
        }
    }

    async fn unpack(response: reqwest::Response, resource: &str) -> TokendResult<Value> {
        if !response.status().is_success() {
            return Err(TokendError::Status(format!(
                "{} for {}",
                response.status(),
                resource
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| TokendError::Malformed(format!("{}: {}", resource, e)))
    }
}

#[async_trait]
impl SecretBroker for TokendClient {
    async fn get(&self, resource: &str) -> TokendResult<Value> {
        let response = self
            .http
            .get(self.url(resource))
            .send()
            .await
            .map_err(|e| TokendError::Network(format!("GET {}: {}", resource, e)))?;
        Self::unpack(response, resource).await
    }

    async fn post(&self, resource: &str, body: Value) -> TokendResult<Value> {
        let response = self
            .http
            .post(self.url(resource))
            .json(&body)
            .send()
            .await
            .map_err(|e| TokendError::Network(format!("POST {}: {}", resource, e)))?;
        Self::unpack(response, resource).await
    }
}

/// Resolves `$tokend` sentinels in a property tree.
///
/// `transform` returns an overlay tree holding only the sentinel paths, each
/// set to its resolved plaintext or `null`; the caller deep-merges the
/// overlay on top of the input. Successful resolutions are cached by the
/// SHA-1 signature of the sentinel spec; the whole cache is wiped every
/// TTL plus up to 60 seconds of jitter.
pub struct TokendTransformer {
    broker: Arc<dyn SecretBroker>,
    cache: Mutex<HashMap<String, Value>>,
    ttl: Duration,
    wiper: Mutex<Option<JoinHandle<()>>>,
}

impl TokendTransformer {
    pub fn new(broker: Arc<dyn SecretBroker>, ttl: Duration) -> Self {
        Self {
            broker,
            cache: Mutex::new(HashMap::new()),
            ttl,
            wiper: Mutex::new(None),
        }
    }

    /// Start the periodic cache wipe. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut wiper = self.wiper.lock();
        if wiper.is_some() {
            return;
        }
        let me = Arc::clone(self);
        *wiper = Some(tokio::spawn(async move {
            loop {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..60_000));
                tokio::time::sleep(me.ttl + jitter).await;
                let purged = {
                    let mut cache = me.cache.lock();
                    let purged = cache.len();
                    cache.clear();
                    purged
                };
                debug!(purged, "wiped secret cache");
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.wiper.lock().take() {
            handle.abort();
        }
    }

    /// Resolve every sentinel in `tree` and return the overlay of
    /// substitutions. Never fails; a broker error or malformed secret
    /// degrades that sentinel to `null`.
    pub async fn transform(&self, tree: &Value) -> Value {
        let mut collected = Vec::new();
        collect(tree, &mut Vec::new(), &mut collected);

        let mut overlay = Value::Object(Map::new());
        for (path, spec) in collected {
            let resolved = self.resolve(&spec).await.unwrap_or(Value::Null);
            properties::set_path(&mut overlay, &path, resolved);
        }
        overlay
    }

    async fn resolve(&self, spec: &Value) -> Option<Value> {
        let signature = properties::signature(spec);
        if let Some(cached) = self.cache.lock().get(&signature) {
            return Some(cached.clone());
        }

        let kind = spec.get("type").and_then(Value::as_str).unwrap_or_default();
        let Some(resource) = spec.get("resource").and_then(Value::as_str) else {
            warn!("secret sentinel is missing a resource, substituting null");
            return None;
        };

        let response = match kind {
            "generic" => self.broker.get(resource).await,
            "transit" => {
                let body = json!({
                    "key": spec.get("key").cloned().unwrap_or(Value::Null),
                    "ciphertext": spec.get("ciphertext").cloned().unwrap_or(Value::Null),
                });
                self.broker.post(resource, body).await
            }
            "kms" => {
                let mut body = Map::new();
                body.insert("key".to_string(), json!("KMS"));
                body.insert(
                    "ciphertext".to_string(),
                    spec.get("ciphertext").cloned().unwrap_or(Value::Null),
                );
                if let Some(region) = spec.get("region") {
                    body.insert("region".to_string(), region.clone());
                }
                if let Some(datakey) = spec.get("datakey") {
                    body.insert("datakey".to_string(), datakey.clone());
                }
                self.broker.post(resource, Value::Object(body)).await
            }
            other => {
                warn!(
                    kind = other,
                    resource, "unsupported secret type, substituting null"
                );
                return None;
            }
        };

        let document = match response {
            Ok(document) => document,
            Err(err) => {
                warn!(resource, error = %err, "secret resolution failed, substituting null");
                return None;
            }
        };

        let Some(plaintext) = document.get("plaintext") else {
            warn!(
                resource,
                "broker response carries no plaintext, substituting null"
            );
            return None;
        };

        let plaintext = plaintext.clone();
        self.cache.lock().insert(signature, plaintext.clone());
        Some(plaintext)
    }
}

/// Depth-first sentinel collection. A mapping whose only key is `$tokend`
/// records its path and is not descended into.
fn collect(tree: &Value, path: &mut Vec<String>, out: &mut Vec<(Vec<String>, Value)>) {
    let Value::Object(map) = tree else {
        return;
    };
    if map.len() == 1 {
        if let Some(spec) = map.get(SENTINEL_KEY) {
            out.push((path.clone(), spec.clone()));
            return;
        }
    }
    for (key, value) in map {
        path.push(key.clone());
        collect(value, path, out);
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBroker {
        gets: AtomicUsize,
        posts: AtomicUsize,
        response: Value,
    }

    impl FakeBroker {
        fn returning(response: Value) -> Arc<Self> {
            Arc::new(Self {
                gets: AtomicUsize::new(0),
                posts: AtomicUsize::new(0),
                response,
            })
        }
    }

    #[async_trait]
    impl SecretBroker for FakeBroker {
        async fn get(&self, _resource: &str) -> TokendResult<Value> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }

        async fn post(&self, _resource: &str, _body: Value) -> TokendResult<Value> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn sentinel_tree() -> Value {
        json!({
            "password": {"$tokend": {"type": "generic", "resource": "/v1/secret/kali/root/password"}},
            "plain": "value"
        })
    }

    #[tokio::test]
    async fn generic_secret_resolves_to_plaintext() {
        // Arrange
        let broker = FakeBroker::returning(json!({"plaintext": "toor"}));
        let transformer = TokendTransformer::new(broker.clone(), Duration::from_secs(300));

        // Act
        let overlay = transformer.transform(&sentinel_tree()).await;

        // Assert: only the sentinel path appears in the overlay
        assert_eq!(overlay, json!({"password": "toor"}));
        assert_eq!(broker.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_prevents_repeat_broker_calls_within_ttl() {
        let broker = FakeBroker::returning(json!({"plaintext": "toor"}));
        let transformer = TokendTransformer::new(broker.clone(), Duration::from_secs(300));

        transformer.transform(&sentinel_tree()).await;
        transformer.transform(&sentinel_tree()).await;

        assert_eq!(
            broker.gets.load(Ordering::SeqCst),
            1,
            "same sentinel spec within TTL must hit the broker at most once"
        );
    }

    #[tokio::test]
    async fn missing_plaintext_degrades_to_null() {
        let broker = FakeBroker::returning(json!({"plaintexts": "toor"}));
        let transformer = TokendTransformer::new(broker, Duration::from_secs(300));

        let overlay = transformer.transform(&sentinel_tree()).await;

        assert_eq!(overlay, json!({"password": null}));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let broker = FakeBroker::returning(json!({"plaintexts": "toor"}));
        let transformer = TokendTransformer::new(broker.clone(), Duration::from_secs(300));

        transformer.transform(&sentinel_tree()).await;
        transformer.transform(&sentinel_tree()).await;

        assert_eq!(broker.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_secret_type_substitutes_null_without_broker_call() {
        let broker = FakeBroker::returning(json!({"plaintext": "toor"}));
        let transformer = TokendTransformer::new(broker.clone(), Duration::from_secs(300));

        let tree = json!({
            "secret": {"$tokend": {"type": "someBrandNewSecretType", "resource": "/x"}}
        });
        let overlay = transformer.transform(&tree).await;

        assert_eq!(overlay, json!({"secret": null}));
        assert_eq!(broker.gets.load(Ordering::SeqCst), 0);
        assert_eq!(broker.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transit_and_kms_dispatch_as_posts() {
        let broker = FakeBroker::returning(json!({"plaintext": "clear"}));
        let transformer = TokendTransformer::new(broker.clone(), Duration::from_secs(300));

        let tree = json!({
            "a": {"$tokend": {"type": "transit", "resource": "/v1/transit/decrypt", "key": "k", "ciphertext": "c"}},
            "b": {"$tokend": {"type": "kms", "resource": "/v1/kms/decrypt", "ciphertext": "c2", "region": "us-east-1"}}
        });
        let overlay = transformer.transform(&tree).await;

        assert_eq!(overlay, json!({"a": "clear", "b": "clear"}));
        assert_eq!(broker.posts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn nested_sentinels_are_collected_at_depth() {
        let broker = FakeBroker::returning(json!({"plaintext": "deep"}));
        let transformer = TokendTransformer::new(broker, Duration::from_secs(300));

        let tree = json!({
            "database": {"credentials": {"password": {"$tokend": {"type": "generic", "resource": "/v1/secret/db"}}}}
        });
        let overlay = transformer.transform(&tree).await;

        assert_eq!(
            overlay,
            json!({"database": {"credentials": {"password": "deep"}}})
        );
    }

    #[tokio::test]
    async fn tree_without_sentinels_yields_empty_overlay() {
        let broker = FakeBroker::returning(json!({"plaintext": "unused"}));
        let transformer = TokendTransformer::new(broker.clone(), Duration::from_secs(300));

        let overlay = transformer.transform(&json!({"a": {"b": 1}})).await;

        assert_eq!(overlay, json!({}));
        assert_eq!(broker.gets.load(Ordering::SeqCst), 0);
    }
}
