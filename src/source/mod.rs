// propsd: Source abstraction
// A source is a periodically refreshed, parsed view of one external feed.
// PollingSource owns the tick loop, change detection, and lifecycle events;
// fetchers supply the backend-specific fetch and parse.

pub mod consul;
pub mod metadata;
pub mod s3;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::{SourceError, SourceResult};
use crate::properties;

pub use consul::{CatalogClient, CatalogPage, ConsulCatalog, ConsulSource, ServiceNode};
pub use metadata::{ImdsClient, MetadataClient, MetadataFetcher};
pub use s3::{ObjectFetch, ObjectStore, S3Fetcher, S3ObjectStore, S3Payload};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle events emitted by every source
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Startup,
    /// New data was parsed and installed
    Update,
    /// Fetch succeeded but nothing changed
    NoUpdate,
    Shutdown,
    Error(String),
}

/// Source lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceState {
    Created,
    Running,
    Failed,
    Stopped,
}

/// Point-in-time source status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ok: bool,
    pub running: bool,
    pub updated: Option<DateTime<Utc>>,
    pub interval: u64,
    pub state: SourceState,
}

/// Common contract for every property feed
#[async_trait]
pub trait Source: Send + Sync {
    fn kind(&self) -> &'static str;
    fn name(&self) -> &str;

    /// Snapshot of the current parsed property tree
    fn properties(&self) -> Value;

    fn status(&self) -> SourceStatus;

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent>;

    /// Begin the periodic fetch loop, first fetch immediate. Idempotent.
    async fn initialize(self: Arc<Self>);

    /// Stop the loop, cancel in-flight work, reset the signature, and emit
    /// `Shutdown`. No further events are observed afterwards. Idempotent.
    async fn shutdown(&self);
}

/// Outcome of one backend fetch
#[derive(Debug)]
pub enum FetchOutcome {
    /// Entity tag or signature matched; keep the current properties
    Unchanged,
    /// The upstream document does not exist
    Missing,
    /// A freshly parsed property tree, with the entity tag when the backend
    /// supplies one (etag-less backends are signature-gated instead)
    Properties {
        value: Value,
        etag: Option<String>,
    },
}

/// Backend-specific fetch and parse
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// Fetch the upstream document. `signature` carries the last known etag
    /// for conditional requests; etag-less backends ignore it.
    async fn fetch(&self, signature: Option<&str>) -> SourceResult<FetchOutcome>;
}

struct Inner {
    ok: bool,
    state: SourceState,
    updated: Option<DateTime<Utc>>,
    signature: Option<String>,
    properties: Value,
}

/// Periodic fetcher with etag/signature change detection
pub struct PollingSource<F: Fetcher> {
    name: String,
    fetcher: F,
    interval: Duration,
    timeout: Duration,
    inner: RwLock<Inner>,
    events: broadcast::Sender<SourceEvent>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl<F: Fetcher> PollingSource<F> {
    pub fn new(name: impl Into<String>, fetcher: F, interval: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            name: name.into(),
            fetcher,
            interval,
            timeout: fetch_timeout(interval),
            inner: RwLock::new(Inner {
                ok: false,
                state: SourceState::Created,
                updated: None,
                signature: None,
                properties: Value::Object(Map::new()),
            }),
            events,
            task: Mutex::new(None),
        })
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let signature = self.inner.read().signature.clone();
        let fetched =
            tokio::time::timeout(self.timeout, self.fetcher.fetch(signature.as_deref())).await;
        let outcome = match fetched {
            Ok(outcome) => outcome,
            Err(_) => Err(SourceError::Timeout(format!(
                "{} did not answer within {:?}",
                self.name, self.timeout
            ))),
        };

        match outcome {
            Ok(FetchOutcome::Unchanged) => {
                {
                    let mut inner = self.inner.write();
                    inner.ok = true;
                    inner.state = SourceState::Running;
                }
                self.emit(SourceEvent::NoUpdate);
            }
            Ok(FetchOutcome::Missing) => {
                {
                    let mut inner = self.inner.write();
                    inner.ok = true;
                    inner.state = SourceState::Running;
                    inner.properties = Value::Object(Map::new());
                    inner.signature = None;
                    inner.updated = Some(Utc::now());
                }
                debug!(source = %self.name, "upstream document is absent, cleared properties");
                self.emit(SourceEvent::Update);
            }
            Ok(FetchOutcome::Properties { value, etag }) => {
                let next = etag.unwrap_or_else(|| properties::signature(&value));
                let changed = {
                    let mut inner = self.inner.write();
                    inner.ok = true;
                    inner.state = SourceState::Running;
                    let changed = inner.signature.as_deref() != Some(next.as_str());
                    if changed {
                        inner.signature = Some(next);
                        inner.properties = value;
                        inner.updated = Some(Utc::now());
                    }
                    changed
                };
                if changed {
                    self.emit(SourceEvent::Update);
                } else {
                    self.emit(SourceEvent::NoUpdate);
                }
            }
            Err(err) => {
                {
                    let mut inner = self.inner.write();
                    inner.ok = false;
                    inner.state = SourceState::Failed;
                }
                warn!(source = %self.name, error = %err, "fetch failed");
                self.emit(SourceEvent::Error(err.to_string()));
            }
        }
    }

    fn emit(&self, event: SourceEvent) {
        // Only errors when no receiver is subscribed, which is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl<F: Fetcher> Source for PollingSource<F> {
    fn kind(&self) -> &'static str {
        self.fetcher.kind()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn properties(&self) -> Value {
        self.inner.read().properties.clone()
    }

    fn status(&self) -> SourceStatus {
        // Lock order matches initialize(): task first, then inner
        let running = self.task.lock().is_some();
        let inner = self.inner.read();
        SourceStatus {
            name: self.name.clone(),
            kind: self.kind().to_string(),
            ok: inner.ok,
            running,
            updated: inner.updated,
            interval: self.interval.as_millis() as u64,
            state: inner.state,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    async fn initialize(self: Arc<Self>) {
        {
            let mut task = self.task.lock();
            if task.is_some() {
                return;
            }
            self.inner.write().state = SourceState::Running;
            self.emit(SourceEvent::Startup);
            let (tx, rx) = watch::channel(false);
            let me = Arc::clone(&self);
            let handle = tokio::spawn(async move { me.run(rx).await });
            *task = Some((tx, handle));
        }
        debug!(source = %self.name, interval = ?self.interval, "source initialized");
    }

    async fn shutdown(&self) {
        let taken = self.task.lock().take();
        let Some((stop, handle)) = taken else {
            return;
        };
        let _ = stop.send(true);
        handle.abort();
        let _ = handle.await;
        {
            let mut inner = self.inner.write();
            inner.state = SourceState::Stopped;
            inner.signature = None;
        }
        self.emit(SourceEvent::Shutdown);
        debug!(source = %self.name, "source shut down");
    }
}

fn fetch_timeout(interval: Duration) -> Duration {
    std::cmp::max(interval / 2, Duration::from_secs(1))
}
