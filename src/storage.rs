// propsd: Property storage
// Holds the ordered list of active sources, deep-merges their trees in
// source order, resolves secrets, and emits debounced build events

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::properties;
use crate::source::{Source, SourceEvent, SourceStatus};
use crate::tokend::TokendTransformer;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by the storage layer
#[derive(Debug, Clone)]
pub enum StorageEvent {
    /// A rebuild completed; carries the merged tree with secrets resolved
    Build(Arc<Value>),
}

/// Aggregate health over the registered sources
#[derive(Debug, Clone)]
pub struct StorageHealth {
    pub ok: bool,
    pub code: u16,
    pub sources: Vec<SourceStatus>,
}

/// Ordered collection of active sources and their merged property view.
///
/// Updates are funneled through a hold-down window: bursts of source
/// updates coalesce into a single rebuild, and a rebuild in progress
/// coalesces further updates into one follow-up rebuild.
pub struct Storage {
    sources: RwLock<Vec<Arc<dyn Source>>>,
    properties: RwLock<Arc<Value>>,
    transformer: Arc<TokendTransformer>,
    hold_down: Duration,
    events: broadcast::Sender<StorageEvent>,
    update_tx: mpsc::Sender<()>,
    builds: AtomicU64,
    builder: Mutex<Option<JoinHandle<()>>>,
}

impl Storage {
    /// Create the storage and start its builder task.
    pub fn new(transformer: Arc<TokendTransformer>, hold_down: Duration) -> Arc<Self> {
        // Capacity 1: every signal beyond the pending one coalesces
        let (update_tx, update_rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let storage = Arc::new(Self {
            sources: RwLock::new(Vec::new()),
            properties: RwLock::new(Arc::new(Value::Object(Map::new()))),
            transformer,
            hold_down,
            events,
            update_tx,
            builds: AtomicU64::new(0),
            builder: Mutex::new(None),
        });
        let me = Arc::clone(&storage);
        *storage.builder.lock() = Some(tokio::spawn(async move {
            me.run(update_rx).await;
        }));
        storage
    }

    async fn run(&self, mut update_rx: mpsc::Receiver<()>) {
        while update_rx.recv().await.is_some() {
            tokio::time::sleep(self.hold_down).await;
            // Drain anything that arrived during the hold-down window
            while update_rx.try_recv().is_ok() {}
            self.build().await;
        }
    }

    /// Append a source and subscribe to its updates. A duplicate
    /// `(type, name)` is rejected.
    pub fn register(&self, source: Arc<dyn Source>) -> StorageResult<()> {
        {
            let mut sources = self.sources.write();
            if sources
                .iter()
                .any(|s| s.kind() == source.kind() && s.name() == source.name())
            {
                return Err(StorageError::DuplicateSource(format!(
                    "{}/{}",
                    source.kind(),
                    source.name()
                )));
            }
            sources.push(Arc::clone(&source));
        }

        let mut rx = source.subscribe();
        let update_tx = self.update_tx.clone();
        let label = format!("{}/{}", source.kind(), source.name());
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SourceEvent::Update) => {
                        let _ = update_tx.try_send(());
                    }
                    Ok(SourceEvent::Error(message)) => {
                        warn!(source = %label, error = %message, "source reported an error");
                    }
                    Ok(SourceEvent::Shutdown) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(source = %label, skipped, "event listener lagged");
                        let _ = update_tx.try_send(());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        debug!(source = %format!("{}/{}", source.kind(), source.name()), "source registered");
        Ok(())
    }

    /// Remove a source by identity. The merged view rebuilds without it.
    pub fn unregister(&self, kind: &str, name: &str) -> Option<Arc<dyn Source>> {
        let removed = {
            let mut sources = self.sources.write();
            let position = sources
                .iter()
                .position(|s| s.kind() == kind && s.name() == name)?;
            Some(sources.remove(position))
        };
        self.update();
        removed
    }

    /// Reorder the source list to match `order` (pairs of kind, name).
    /// Sources not named keep their relative order at the end.
    pub fn reorder(&self, order: &[(String, String)]) {
        let mut sources = self.sources.write();
        let position = |source: &Arc<dyn Source>| {
            order
                .iter()
                .position(|(kind, name)| source.kind() == kind && source.name() == name)
                .unwrap_or(usize::MAX)
        };
        sources.sort_by_key(position);
    }

    /// Schedule a rebuild after the hold-down window.
    pub fn update(&self) {
        let _ = self.update_tx.try_send(());
    }

    /// Merge every source tree in list order, resolve secrets, install the
    /// result, and emit a build event.
    pub async fn build(&self) {
        let sources: Vec<Arc<dyn Source>> = self.sources.read().clone();

        // Each source's tree is read exactly once per rebuild; mid-build
        // updates land in the next coalesced rebuild
        let mut merged = Value::Object(Map::new());
        for source in &sources {
            properties::deep_merge(&mut merged, &source.properties());
        }

        let overlay = self.transformer.transform(&merged).await;
        properties::deep_merge(&mut merged, &overlay);

        let resolved = Arc::new(merged);
        *self.properties.write() = Arc::clone(&resolved);
        let builds = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(builds, sources = sources.len(), "property tree rebuilt");
        let _ = self.events.send(StorageEvent::Build(resolved));
    }

    /// The last successfully built tree, secrets resolved.
    pub fn properties(&self) -> Arc<Value> {
        Arc::clone(&self.properties.read())
    }

    pub fn sources(&self) -> Vec<Arc<dyn Source>> {
        self.sources.read().clone()
    }

    /// Number of completed rebuilds.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    /// Aggregate health: ok is the conjunction of every source's ok.
    pub fn health(&self) -> StorageHealth {
        let sources: Vec<SourceStatus> = self
            .sources
            .read()
            .iter()
            .map(|source| source.status())
            .collect();
        let ok = sources.iter().all(|status| status.ok);
        StorageHealth {
            ok,
            code: if ok { 200 } else { 503 },
            sources,
        }
    }

    /// Stop the builder task. Registered sources are shut down by their
    /// owner, not here.
    pub fn close(&self) {
        if let Some(handle) = self.builder.lock().take() {
            handle.abort();
        }
    }
}
