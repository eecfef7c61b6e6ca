// propsd: Instance metadata source
// Walks a fixed hierarchy on the instance-metadata HTTP service and
// materializes it as a nested mapping under the reserved key `instance`

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::error::{SourceError, SourceResult};
use crate::source::{FetchOutcome, Fetcher};

/// Scalar leaves fetched on every tick, as (property key, metadata path)
const SCALAR_PATHS: &[(&str, &str)] = &[
    ("ami-id", "meta-data/ami-id"),
    ("hostname", "meta-data/hostname"),
    ("instance-id", "meta-data/instance-id"),
    ("instance-type", "meta-data/instance-type"),
    ("local-hostname", "meta-data/local-hostname"),
    ("local-ipv4", "meta-data/local-ipv4"),
    ("public-hostname", "meta-data/public-hostname"),
    ("public-ipv4", "meta-data/public-ipv4"),
    ("reservation-id", "meta-data/reservation-id"),
    ("availability-zone", "meta-data/placement/availability-zone"),
];

const IDENTITY_DOCUMENT: &str = "dynamic/instance-identity/document";
const CREDENTIALS_LISTING: &str = "meta-data/iam/security-credentials/";

/// Instance-metadata seam: GET one path, `None` when absent
#[async_trait]
pub trait MetadataClient: Send + Sync + 'static {
    async fn get(&self, path: &str) -> SourceResult<Option<String>>;
}

/// HTTP client for the instance-metadata service
pub struct ImdsClient {
    base: String,
    http: reqwest::Client,
}

impl ImdsClient {
    /// `host` is `host` or `host:port`.
    pub fn new(host: &str) -> SourceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(3))
            .build()
            .map_err(|e| SourceError::Network(format!("building metadata client: {}", e)))?;
        Ok(Self {
            base: format!("http://{}", host),
            http,
        })
    }
}

#[async_trait]
impl MetadataClient for ImdsClient {
    async fn get(&self, path: &str) -> SourceResult<Option<String>> {
        let url = format!("{}/latest/{}", self.base, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::from_http(path, &e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SourceError::Network(format!(
                "{}: status {}",
                path,
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Network(format!("{}: {}", path, e)))?;
        Ok(Some(body))
    }
}

/// Builds the `instance` tree from scalar leaves, the identity document,
/// and the IAM role credentials. There is no entity tag; change detection
/// is a signature over the assembled tree.
pub struct MetadataFetcher {
    client: Arc<dyn MetadataClient>,
}

impl MetadataFetcher {
    pub fn new(client: Arc<dyn MetadataClient>) -> Self {
        Self { client }
    }

    /// Fixed name for the metadata source.
    pub fn source_name() -> &'static str {
        "ec2-metadata"
    }
}

#[async_trait]
impl Fetcher for MetadataFetcher {
    fn kind(&self) -> &'static str {
        "ec2-metadata"
    }

    async fn fetch(&self, _signature: Option<&str>) -> SourceResult<FetchOutcome> {
        let mut instance = Map::new();

        for (key, path) in SCALAR_PATHS {
            if let Some(text) = self.client.get(path).await? {
                instance.insert((*key).to_string(), Value::String(text));
            }
        }

        if let Some(document) = self.client.get(IDENTITY_DOCUMENT).await? {
            match serde_json::from_str::<Value>(&document) {
                Ok(identity) => {
                    if let Some(account) = identity.get("accountId").cloned() {
                        instance.insert("account".to_string(), account);
                    }
                    if let Some(region) = identity.get("region").cloned() {
                        instance.insert("region".to_string(), region);
                    }
                    instance.insert("identity".to_string(), identity);
                }
                Err(err) => warn!(error = %err, "identity document is not JSON, skipping"),
            }
        }

        if let Some(listing) = self.client.get(CREDENTIALS_LISTING).await? {
            if let Some(role) = listing.lines().find(|line| !line.trim().is_empty()) {
                let path = format!("{}{}", CREDENTIALS_LISTING, role.trim());
                if let Some(document) = self.client.get(&path).await? {
                    match serde_json::from_str::<Value>(&document) {
                        Ok(credentials) => {
                            instance.insert("credentials".to_string(), credentials);
                        }
                        Err(err) => {
                            warn!(error = %err, "credentials document is not JSON, skipping");
                        }
                    }
                }
            }
        }

        Ok(FetchOutcome::Properties {
            value: json!({ "instance": Value::Object(instance) }),
            etag: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{PollingSource, Source, SourceEvent};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeMetadata {
        responses: Mutex<HashMap<String, String>>,
        refuse_first: AtomicUsize,
    }

    impl FakeMetadata {
        fn new(entries: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    entries
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                refuse_first: AtomicUsize::new(0),
            })
        }

        fn refuse_next(&self, count: usize) {
            self.refuse_first.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MetadataClient for FakeMetadata {
        async fn get(&self, path: &str) -> SourceResult<Option<String>> {
            if self
                .refuse_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SourceError::ConnectionRefused(
                    "169.254.169.254:80".to_string(),
                ));
            }
            Ok(self.responses.lock().get(path).cloned())
        }
    }

    fn populated() -> Arc<FakeMetadata> {
        FakeMetadata::new(&[
            ("meta-data/ami-id", "4aface7a"),
            ("meta-data/instance-id", "i-0123456789"),
            ("meta-data/instance-type", "t3.small"),
            ("meta-data/placement/availability-zone", "us-east-1a"),
            (
                "dynamic/instance-identity/document",
                r#"{"accountId":"12345","region":"us-east-1"}"#,
            ),
            ("meta-data/iam/security-credentials/", "app-role"),
            (
                "meta-data/iam/security-credentials/app-role",
                r#"{"AccessKeyId":"AKIA","SecretAccessKey":"secret"}"#,
            ),
        ])
    }

    #[tokio::test]
    async fn walks_tree_into_instance_mapping() {
        // Arrange
        let fetcher = MetadataFetcher::new(populated());

        // Act
        let outcome = fetcher.fetch(None).await.unwrap();

        // Assert
        let FetchOutcome::Properties { value, etag } = outcome else {
            panic!("expected properties");
        };
        assert_eq!(etag, None);
        let instance = value.get("instance").unwrap();
        assert_eq!(instance.get("ami-id"), Some(&json!("4aface7a")));
        assert_eq!(instance.get("account"), Some(&json!("12345")));
        assert_eq!(instance.get("region"), Some(&json!("us-east-1")));
        assert_eq!(
            instance.pointer("/credentials/AccessKeyId"),
            Some(&json!("AKIA"))
        );
        // Absent leaves are skipped, not errors
        assert!(instance.get("public-ipv4").is_none());
    }

    #[tokio::test]
    async fn identical_trees_gate_on_signature() {
        let source = PollingSource::new(
            MetadataFetcher::source_name(),
            MetadataFetcher::new(populated()),
            Duration::from_millis(50),
        );
        let mut rx = source.subscribe();
        Arc::clone(&source).initialize().await;

        assert!(matches!(rx.recv().await, Ok(SourceEvent::Startup)));
        assert!(matches!(rx.recv().await, Ok(SourceEvent::Update)));
        assert!(matches!(rx.recv().await, Ok(SourceEvent::NoUpdate)));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn connection_refusal_is_reported_distinctly_and_recovers() {
        // Arrange: the first tick is refused, later ticks succeed
        let client = populated();
        client.refuse_next(1);
        let source = PollingSource::new(
            MetadataFetcher::source_name(),
            MetadataFetcher::new(client),
            Duration::from_millis(50),
        );
        let mut rx = source.subscribe();

        // Act
        Arc::clone(&source).initialize().await;

        // Assert: error first, still running, then a successful update
        assert!(matches!(rx.recv().await, Ok(SourceEvent::Startup)));
        match rx.recv().await {
            Ok(SourceEvent::Error(message)) => {
                assert!(message.contains("Connection refused"), "got: {}", message);
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert!(!source.status().ok);
        assert!(source.status().running);

        assert!(matches!(rx.recv().await, Ok(SourceEvent::Update)));
        assert!(source.status().ok);
        source.shutdown().await;
    }
}
