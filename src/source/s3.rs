// propsd: S3 source
// Conditional GET against an object store; serves both the index document
// and child property files depending on the payload mode

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{SourceError, SourceResult};
use crate::source::{FetchOutcome, Fetcher};

/// Document schema version this service understands
const SUPPORTED_VERSION: &str = "1.0";

/// Outcome of one object-store GET
#[derive(Debug)]
pub enum ObjectFetch {
    /// Entity tag matched (HTTP 304)
    NotModified,
    /// The object does not exist
    NotFound,
    Body {
        bytes: Vec<u8>,
        etag: Option<String>,
    },
}

/// Object store seam: conditional GET keyed by (bucket, path)
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get(&self, bucket: &str, key: &str, etag: Option<&str>) -> SourceResult<ObjectFetch>;
}

/// AWS S3 implementation of the object store seam
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    /// Build the client from ambient AWS configuration. An explicit
    /// `endpoint` forces path-style addressing (needed for S3-compatible
    /// stores and local stacks).
    pub async fn new(endpoint: Option<&str>, region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, bucket: &str, key: &str, etag: Option<&str>) -> SourceResult<ObjectFetch> {
        let mut request = self.client.get_object().bucket(bucket).key(key);
        if let Some(etag) = etag {
            request = request.if_none_match(etag);
        }
        match request.send().await {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string);
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| {
                        SourceError::Network(format!("reading s3://{}/{}: {}", bucket, key, e))
                    })?
                    .into_bytes()
                    .to_vec();
                Ok(ObjectFetch::Body { bytes, etag })
            }
            Err(SdkError::ServiceError(context)) => {
                let status = context.raw().status().as_u16();
                if status == 304 {
                    Ok(ObjectFetch::NotModified)
                } else if status == 404 || context.err().is_no_such_key() {
                    Ok(ObjectFetch::NotFound)
                } else {
                    Err(SourceError::Network(format!(
                        "s3://{}/{}: {}",
                        bucket,
                        key,
                        context.err()
                    )))
                }
            }
            Err(err) => Err(SourceError::Network(format!(
                "s3://{}/{}: {}",
                bucket, key, err
            ))),
        }
    }
}

/// Which part of the fetched document becomes the source's property tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Payload {
    /// Child property file: `{"version": "1.0", "properties": {...}}`
    Properties,
    /// Index document: `{"version": "1.0", "sources": [...]}`
    Index,
}

impl S3Payload {
    fn extract(&self, doc: &Value, location: &str) -> SourceResult<Value> {
        if let Some(version) = doc.get("version").and_then(Value::as_str) {
            if version != SUPPORTED_VERSION {
                warn!(location, version, "unexpected document version");
            }
        }
        match self {
            S3Payload::Properties => Ok(doc
                .get("properties")
                .cloned()
                .unwrap_or_else(|| json!({}))),
            S3Payload::Index => {
                let sources = doc.get("sources").cloned().unwrap_or_else(|| json!([]));
                if !sources.is_array() {
                    return Err(SourceError::Parse(format!(
                        "{}: index `sources` is not a sequence",
                        location
                    )));
                }
                Ok(json!({ "sources": sources }))
            }
        }
    }
}

/// Fetches one JSON document from the object store with entity-tag gating
pub struct S3Fetcher {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    path: String,
    payload: S3Payload,
}

impl S3Fetcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        path: impl Into<String>,
        payload: S3Payload,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            path: path.into(),
            payload,
        }
    }

    /// Canonical source name for a bucket/path pair; doubles as the
    /// identity the plugin manager diffs against.
    pub fn source_name(bucket: &str, path: &str) -> String {
        format!("s3-{}-{}", bucket, path)
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.path)
    }
}

#[async_trait]
impl Fetcher for S3Fetcher {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn fetch(&self, signature: Option<&str>) -> SourceResult<FetchOutcome> {
        match self.store.get(&self.bucket, &self.path, signature).await? {
            ObjectFetch::NotModified => Ok(FetchOutcome::Unchanged),
            ObjectFetch::NotFound => Ok(FetchOutcome::Missing),
            ObjectFetch::Body { bytes, etag } => {
                let doc: Value = serde_json::from_slice(&bytes).map_err(|e| {
                    SourceError::Parse(format!("{}: {}", self.location(), e))
                })?;
                let value = self.payload.extract(&doc, &self.location())?;
                Ok(FetchOutcome::Properties { value, etag })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{PollingSource, Source, SourceEvent};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// In-memory object store keyed by (bucket, key)
    pub struct FakeObjectStore {
        objects: Mutex<HashMap<(String, String), (String, Vec<u8>)>>,
    }

    impl FakeObjectStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                objects: Mutex::new(HashMap::new()),
            })
        }

        fn put(&self, bucket: &str, key: &str, etag: &str, body: &str) {
            self.objects.lock().insert(
                (bucket.to_string(), key.to_string()),
                (etag.to_string(), body.as_bytes().to_vec()),
            );
        }
    }

    #[async_trait]
    impl ObjectStore for FakeObjectStore {
        async fn get(
            &self,
            bucket: &str,
            key: &str,
            etag: Option<&str>,
        ) -> SourceResult<ObjectFetch> {
            let objects = self.objects.lock();
            match objects.get(&(bucket.to_string(), key.to_string())) {
                None => Ok(ObjectFetch::NotFound),
                Some((current, _)) if etag == Some(current.as_str()) => {
                    Ok(ObjectFetch::NotModified)
                }
                Some((current, body)) => Ok(ObjectFetch::Body {
                    bytes: body.clone(),
                    etag: Some(current.clone()),
                }),
            }
        }
    }

    #[tokio::test]
    async fn etag_match_yields_no_update() {
        // Arrange
        let store = FakeObjectStore::new();
        store.put(
            "bucket",
            "global.json",
            "v1",
            r#"{"version":"1.0","properties":{"a":1}}"#,
        );
        let source = PollingSource::new(
            S3Fetcher::source_name("bucket", "global.json"),
            S3Fetcher::new(store.clone(), "bucket", "global.json", S3Payload::Properties),
            Duration::from_millis(50),
        );
        let mut rx = source.subscribe();

        // Act
        Arc::clone(&source).initialize().await;

        // Assert: first tick installs, second tick is etag-gated
        assert!(matches!(rx.recv().await, Ok(SourceEvent::Startup)));
        assert!(matches!(rx.recv().await, Ok(SourceEvent::Update)));
        assert!(matches!(rx.recv().await, Ok(SourceEvent::NoUpdate)));
        assert_eq!(source.properties(), serde_json::json!({"a": 1}));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn missing_object_clears_to_empty_tree() {
        let store = FakeObjectStore::new();
        let source = PollingSource::new(
            S3Fetcher::source_name("bucket", "gone.json"),
            S3Fetcher::new(store, "bucket", "gone.json", S3Payload::Properties),
            Duration::from_secs(60),
        );
        let mut rx = source.subscribe();
        Arc::clone(&source).initialize().await;

        assert!(matches!(rx.recv().await, Ok(SourceEvent::Startup)));
        assert!(matches!(rx.recv().await, Ok(SourceEvent::Update)));
        assert_eq!(source.properties(), serde_json::json!({}));
        assert!(source.status().ok);
        source.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_payload_keeps_previous_properties() {
        let store = FakeObjectStore::new();
        store.put(
            "bucket",
            "app.json",
            "v1",
            r#"{"version":"1.0","properties":{"a":1}}"#,
        );
        let source = PollingSource::new(
            S3Fetcher::source_name("bucket", "app.json"),
            S3Fetcher::new(store.clone(), "bucket", "app.json", S3Payload::Properties),
            Duration::from_millis(50),
        );
        let mut rx = source.subscribe();
        Arc::clone(&source).initialize().await;
        assert!(matches!(rx.recv().await, Ok(SourceEvent::Startup)));
        assert!(matches!(rx.recv().await, Ok(SourceEvent::Update)));

        // Corrupt the object; the etag changes so a later tick re-fetches
        store.put("bucket", "app.json", "v2", "{not json");

        // A tick may still land on the old etag first; skip NoUpdates
        loop {
            match rx.recv().await {
                Ok(SourceEvent::NoUpdate) => continue,
                Ok(SourceEvent::Error(_)) => break,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(source.properties(), serde_json::json!({"a": 1}));
        assert!(!source.status().ok);
        source.shutdown().await;
    }

    #[tokio::test]
    async fn index_payload_exposes_sources_sequence() {
        let store = FakeObjectStore::new();
        store.put(
            "bucket",
            "index.json",
            "v1",
            r#"{"version":"1.0","sources":[{"name":"global","type":"s3","parameters":{"path":"global.json"}}]}"#,
        );
        let source = PollingSource::new(
            S3Fetcher::source_name("bucket", "index.json"),
            S3Fetcher::new(store, "bucket", "index.json", S3Payload::Index),
            Duration::from_secs(60),
        );
        let mut rx = source.subscribe();
        Arc::clone(&source).initialize().await;

        assert!(matches!(rx.recv().await, Ok(SourceEvent::Startup)));
        assert!(matches!(rx.recv().await, Ok(SourceEvent::Update)));
        let properties = source.properties();
        let sources = properties.get("sources").and_then(Value::as_array).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].get("name"), Some(&serde_json::json!("global")));
        source.shutdown().await;
    }
}
