// propsd: Plugin manager
// Owns the index and metadata sources, interpolates source specs against
// instance metadata, and keeps the storage's source list in step with the
// index document

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TemplateError;
use crate::source::{
    CatalogClient, ConsulSource, MetadataClient, MetadataFetcher, ObjectStore, PollingSource,
    S3Fetcher, S3Payload, Source, SourceEvent, SourceStatus,
};
use crate::storage::Storage;
use crate::template;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The index source type alias
pub type S3Source = PollingSource<S3Fetcher>;
/// The metadata source type alias
pub type MetadataSource = PollingSource<MetadataFetcher>;

/// One source spec as read from the index document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

impl SourceSpec {
    fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    fn parameter_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }
}

/// Events emitted by the plugin manager
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Interpolation succeeded; carries the resolved source specs
    SourcesGenerated(Vec<SourceSpec>),
    /// The storage list was reconciled; carries the source names in order
    SourcesRegistered(Vec<String>),
    Error(String),
}

/// Settings the manager needs to build its terminal sources and children
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub index_bucket: String,
    pub index_path: String,
    pub index_interval: Duration,
    pub metadata_interval: Duration,
    /// Default interval for child sources that do not set one
    pub source_interval: Duration,
}

struct ManagerState {
    running: bool,
    ok: bool,
}

/// Keeps the storage's source list consistent with the interpolated index.
///
/// Reloads are driven purely by `update` events from the index and metadata
/// sources; a failed interpolation waits for the next update instead of
/// arming a timer.
pub struct PluginManager {
    index: Arc<S3Source>,
    metadata: Arc<MetadataSource>,
    storage: Arc<Storage>,
    store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn CatalogClient>,
    options: ManagerOptions,
    children: Mutex<HashMap<String, SourceSpec>>,
    state: RwLock<ManagerState>,
    events: broadcast::Sender<ManagerEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PluginManager {
    pub fn new(
        storage: Arc<Storage>,
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn CatalogClient>,
        metadata_client: Arc<dyn MetadataClient>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let index = PollingSource::new(
            S3Fetcher::source_name(&options.index_bucket, &options.index_path),
            S3Fetcher::new(
                Arc::clone(&store),
                options.index_bucket.clone(),
                options.index_path.clone(),
                S3Payload::Index,
            ),
            options.index_interval,
        );
        let metadata = PollingSource::new(
            MetadataFetcher::source_name(),
            MetadataFetcher::new(metadata_client),
            options.metadata_interval,
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            index,
            metadata,
            storage,
            store,
            catalog,
            options,
            children: Mutex::new(HashMap::new()),
            state: RwLock::new(ManagerState {
                running: false,
                ok: false,
            }),
            events,
            task: Mutex::new(None),
        })
    }

    /// Start the index and metadata sources and react to their updates.
    /// Idempotent.
    pub async fn initialize(self: &Arc<Self>) {
        {
            let mut task = self.task.lock();
            if task.is_some() {
                return;
            }
            let me = Arc::clone(self);
            let mut index_rx = self.index.subscribe();
            let mut metadata_rx = self.metadata.subscribe();
            *task = Some(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        event = index_rx.recv() => event,
                        event = metadata_rx.recv() => event,
                    };
                    match event {
                        Ok(SourceEvent::Update) => me.reload_sources().await,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            me.reload_sources().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        self.state.write().running = true;
        Arc::clone(&self.index).initialize().await;
        Arc::clone(&self.metadata).initialize().await;
        info!(
            index = %self.index.name(),
            "plugin manager initialized"
        );
    }

    /// Recompute the interpolated source list and reconcile the storage.
    async fn reload_sources(self: &Arc<Self>) {
        let index_properties = self.index.properties();
        let Some(raw_sources) = index_properties.get("sources").and_then(Value::as_array) else {
            debug!("index has no sources yet, skipping reload");
            return;
        };
        let metadata_properties = self.metadata.properties();

        // Interpolate every string parameter; an unresolved path aborts the
        // whole reload and waits for the next index or metadata update
        let mut specs: Vec<SourceSpec> = Vec::with_capacity(raw_sources.len());
        for raw in raw_sources {
            let mut spec: SourceSpec = match serde_json::from_value(raw.clone()) {
                Ok(spec) => spec,
                Err(err) => {
                    warn!(error = %err, "malformed source spec in index, skipping");
                    self.fail(format!("Malformed source spec: {}", err));
                    return;
                }
            };
            for (_, value) in spec.parameters.iter_mut() {
                match template::coerce(value, &metadata_properties) {
                    Ok(coerced) => *value = coerced,
                    Err(TemplateError::Unresolved(path)) => {
                        self.fail(format!(
                            "Unresolved template path {} in source {}",
                            path, spec.name
                        ));
                        return;
                    }
                }
            }
            specs.push(spec);
        }

        let _ = self
            .events
            .send(ManagerEvent::SourcesGenerated(specs.clone()));

        self.reconcile(specs).await;
    }

    /// Diff the interpolated specs against the current children and adjust
    /// the storage, preserving index order.
    async fn reconcile(self: &Arc<Self>, specs: Vec<SourceSpec>) {
        let current = self.children.lock().clone();
        let mut ok = true;
        let mut next: HashMap<String, SourceSpec> = HashMap::new();
        let mut order: Vec<(String, String)> = Vec::new();
        let mut create: Vec<(String, SourceSpec)> = Vec::new();

        for spec in specs {
            let Some((kind, name)) = self.identity(&spec) else {
                ok = false;
                continue;
            };
            let key = format!("{}/{}", kind, name);
            if next.contains_key(&key) {
                warn!(source = %key, "duplicate source in index, skipping");
                ok = false;
                continue;
            }
            order.push((kind, name));
            if current.get(&key) != Some(&spec) {
                create.push((key.clone(), spec.clone()));
            }
            next.insert(key, spec);
        }

        // Tear down removed and changed sources first so replacements can
        // register under the same identity
        let stale: Vec<String> = current
            .keys()
            .filter(|key| {
                !next.contains_key(*key) || create.iter().any(|(created, _)| created == *key)
            })
            .cloned()
            .collect();
        for key in stale {
            let Some((kind, name)) = key.split_once('/') else {
                continue;
            };
            if let Some(source) = self.storage.unregister(kind, name) {
                source.shutdown().await;
                debug!(source = %key, "source shut down and unregistered");
            }
        }

        for (key, spec) in create {
            let Some(source) = self.instantiate(&spec) else {
                next.remove(&key);
                ok = false;
                continue;
            };
            match self.storage.register(Arc::clone(&source)) {
                Ok(()) => {
                    Arc::clone(&source).initialize().await;
                }
                Err(err) => {
                    warn!(source = %key, error = %err, "registration rejected");
                    next.remove(&key);
                    ok = false;
                }
            }
        }

        self.storage.reorder(&order);
        *self.children.lock() = next;

        let registered: Vec<String> = self
            .storage
            .sources()
            .iter()
            .map(|source| source.name().to_string())
            .collect();
        let _ = self
            .events
            .send(ManagerEvent::SourcesRegistered(registered));
        self.state.write().ok = ok;
    }

    /// The storage identity a spec will register under, or None for an
    /// unknown type or an unusable spec.
    fn identity(&self, spec: &SourceSpec) -> Option<(String, String)> {
        match spec.kind.as_str() {
            "s3" => {
                let Some(path) = spec.parameter_str("path") else {
                    self.fail(format!("Source {} is missing parameters.path", spec.name));
                    return None;
                };
                let bucket = spec
                    .parameter_str("bucket")
                    .unwrap_or(&self.options.index_bucket);
                Some(("s3".to_string(), S3Fetcher::source_name(bucket, path)))
            }
            "consul" => Some(("consul".to_string(), spec.name.clone())),
            other => {
                self.fail(format!("Source type {} not implemented", other));
                None
            }
        }
    }

    /// Build a source instance for an interpolated spec.
    fn instantiate(&self, spec: &SourceSpec) -> Option<Arc<dyn Source>> {
        let interval = spec
            .parameter_u64("interval")
            .map(Duration::from_millis)
            .unwrap_or(self.options.source_interval);
        match spec.kind.as_str() {
            "s3" => {
                let path = spec.parameter_str("path")?;
                let bucket = spec
                    .parameter_str("bucket")
                    .unwrap_or(&self.options.index_bucket);
                let source = PollingSource::new(
                    S3Fetcher::source_name(bucket, path),
                    S3Fetcher::new(Arc::clone(&self.store), bucket, path, S3Payload::Properties),
                    interval,
                );
                Some(source as Arc<dyn Source>)
            }
            "consul" => {
                let source =
                    ConsulSource::new(spec.name.clone(), Arc::clone(&self.catalog), interval);
                Some(source as Arc<dyn Source>)
            }
            _ => None,
        }
    }

    fn fail(&self, message: String) {
        warn!("{}", message);
        self.state.write().ok = false;
        let _ = self.events.send(ManagerEvent::Error(message));
    }

    /// Stop everything: the reload task, the terminal sources, and every
    /// child in storage.
    pub async fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.index.shutdown().await;
        self.metadata.shutdown().await;
        for source in self.storage.sources() {
            self.storage.unregister(source.kind(), source.name());
            source.shutdown().await;
        }
        self.children.lock().clear();
        let mut state = self.state.write();
        state.running = false;
        info!("plugin manager shut down");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn running(&self) -> bool {
        self.state.read().running
    }

    pub fn ok(&self) -> bool {
        self.state.read().ok
    }

    /// Status of the index source, reported separately by the HTTP layer.
    pub fn index_status(&self) -> SourceStatus {
        self.index.status()
    }

    /// Status of the metadata source.
    pub fn metadata_status(&self) -> SourceStatus {
        self.metadata.status()
    }

    /// Overall health: the terminal sources and every registered child.
    pub fn healthy(&self) -> bool {
        self.index.status().ok
            && self.metadata.status().ok
            && self.storage.health().ok
    }

    /// Source counts by type, including the terminal sources.
    pub fn plugin_counts(&self) -> serde_json::Map<String, Value> {
        let mut counts: serde_json::Map<String, Value> = serde_json::Map::new();
        let mut bump = |kind: &str| {
            let next = counts
                .get(kind)
                .and_then(Value::as_u64)
                .unwrap_or(0)
                + 1;
            counts.insert(kind.to_string(), Value::from(next));
        };
        bump(self.index.kind());
        bump(self.metadata.kind());
        for source in self.storage.sources() {
            bump(source.kind());
        }
        counts
    }
}
