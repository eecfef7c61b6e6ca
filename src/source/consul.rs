// propsd: Catalog source
// Watches a service-discovery catalog with blocking queries. A service-list
// watcher maintains one health watcher per (service, tag); each health
// watcher publishes {consul: {name: {addresses: [...]}}}

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SourceError, SourceResult};
use crate::source::{Source, SourceEvent, SourceState, SourceStatus};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Reserved root key for catalog output
const CONSUL_KEY: &str = "consul";

/// One page of a blocking query, with the catalog's change cursor
#[derive(Debug, Clone)]
pub struct CatalogPage<T> {
    pub value: T,
    pub index: u64,
}

/// One service instance from a health query
#[derive(Debug, Clone)]
pub struct ServiceNode {
    pub node_address: String,
    pub service_address: Option<String>,
}

impl ServiceNode {
    /// The service address when present, the node address otherwise.
    pub fn address(&self) -> &str {
        self.service_address
            .as_deref()
            .filter(|address| !address.is_empty())
            .unwrap_or(&self.node_address)
    }
}

/// Catalog seam: blocking queries against the service list and per-service
/// health endpoints
#[async_trait]
pub trait CatalogClient: Send + Sync + 'static {
    /// Mapping of service name to tags, blocking until `index` advances.
    async fn services(&self, index: u64) -> SourceResult<CatalogPage<BTreeMap<String, Vec<String>>>>;

    /// Passing instances of one service, optionally tag-filtered.
    async fn service_nodes(
        &self,
        service: &str,
        tag: Option<&str>,
        index: u64,
    ) -> SourceResult<CatalogPage<Vec<ServiceNode>>>;
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: HealthNode,
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Address", default)]
    address: String,
}

/// HTTP client for a Consul-dialect catalog
pub struct ConsulCatalog {
    base: String,
    wait: String,
    http: reqwest::Client,
}

impl ConsulCatalog {
    pub fn new(host: &str, port: u16) -> SourceResult<Self> {
        // The client timeout must outlast the blocking-query wait
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(70))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SourceError::Network(format!("building catalog client: {}", e)))?;
        Ok(Self {
            base: format!("http://{}:{}", host, port),
            wait: "55s".to_string(),
            http,
        })
    }

    fn cursor(response: &reqwest::Response) -> u64 {
        response
            .headers()
            .get("X-Consul-Index")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CatalogClient for ConsulCatalog {
    async fn services(&self, index: u64) -> SourceResult<CatalogPage<BTreeMap<String, Vec<String>>>> {
        let url = format!("{}/v1/catalog/services", self.base);
        let response = self
            .http
            .get(&url)
            .query(&[("index", index.to_string()), ("wait", self.wait.clone())])
            .send()
            .await
            .map_err(|e| SourceError::from_http("catalog/services", &e))?;
        if !response.status().is_success() {
            return Err(SourceError::Network(format!(
                "catalog/services: status {}",
                response.status()
            )));
        }
        let next = Self::cursor(&response);
        let value = response
            .json::<BTreeMap<String, Vec<String>>>()
            .await
            .map_err(|e| SourceError::Parse(format!("catalog/services: {}", e)))?;
        Ok(CatalogPage { value, index: next })
    }

    async fn service_nodes(
        &self,
        service: &str,
        tag: Option<&str>,
        index: u64,
    ) -> SourceResult<CatalogPage<Vec<ServiceNode>>> {
        let url = format!("{}/v1/health/service/{}", self.base, service);
        let mut query = vec![
            ("index".to_string(), index.to_string()),
            ("wait".to_string(), self.wait.clone()),
            ("passing".to_string(), "true".to_string()),
        ];
        if let Some(tag) = tag {
            query.push(("tag".to_string(), tag.to_string()));
        }
        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| SourceError::from_http(service, &e))?;
        if !response.status().is_success() {
            return Err(SourceError::Network(format!(
                "health/service/{}: status {}",
                service,
                response.status()
            )));
        }
        let next = Self::cursor(&response);
        let entries = response
            .json::<Vec<HealthEntry>>()
            .await
            .map_err(|e| SourceError::Parse(format!("health/service/{}: {}", service, e)))?;
        let value = entries
            .into_iter()
            .map(|entry| ServiceNode {
                node_address: entry.node.address,
                service_address: if entry.service.address.is_empty() {
                    None
                } else {
                    Some(entry.service.address)
                },
            })
            .collect();
        Ok(CatalogPage { value, index: next })
    }
}

struct ConsulInner {
    ok: bool,
    state: SourceState,
    updated: Option<DateTime<Utc>>,
    properties: Value,
}

/// Source over a service-discovery catalog.
///
/// The main task watches the service list; each named watch
/// (`service` or `service-tag`) gets its own health-watch task. An empty
/// health result retires the watch and removes the entry.
pub struct ConsulSource {
    name: String,
    catalog: Arc<dyn CatalogClient>,
    interval: Duration,
    inner: RwLock<ConsulInner>,
    events: broadcast::Sender<SourceEvent>,
    // Lock order: watchers before inner
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ConsulSource {
    pub fn new(
        name: impl Into<String>,
        catalog: Arc<dyn CatalogClient>,
        interval: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            name: name.into(),
            catalog,
            interval,
            inner: RwLock::new(ConsulInner {
                ok: false,
                state: SourceState::Created,
                updated: None,
                properties: json!({ CONSUL_KEY: {} }),
            }),
            events,
            watchers: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        })
    }

    fn emit(&self, event: SourceEvent) {
        let _ = self.events.send(event);
    }

    fn set_ok(&self, ok: bool) {
        let mut inner = self.inner.write();
        inner.ok = ok;
        inner.state = if ok {
            SourceState::Running
        } else {
            SourceState::Failed
        };
    }

    /// Install sorted unique addresses under the watch name. Returns
    /// whether anything changed.
    fn set_entry(&self, name: &str, addresses: Vec<String>) -> bool {
        let mut inner = self.inner.write();
        let next = json!({ "addresses": addresses });
        let entries = inner
            .properties
            .get_mut(CONSUL_KEY)
            .and_then(Value::as_object_mut);
        let Some(entries) = entries else {
            return false;
        };
        if entries.get(name) == Some(&next) {
            return false;
        }
        entries.insert(name.to_string(), next);
        inner.updated = Some(Utc::now());
        true
    }

    /// Drop the entry for a retired or vanished watch. Returns whether it
    /// existed.
    fn remove_entry(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        let entries = inner
            .properties
            .get_mut(CONSUL_KEY)
            .and_then(Value::as_object_mut);
        let Some(entries) = entries else {
            return false;
        };
        let existed = entries.remove(name).is_some();
        if existed {
            inner.updated = Some(Utc::now());
        }
        existed
    }

    async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) {
        let mut cursor = 0u64;
        let mut stop_rx = stop.clone();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                page = self.catalog.services(cursor) => match page {
                    Ok(page) => {
                        cursor = if page.index < cursor { 0 } else { page.index };
                        self.sync_watchers(&page.value, &stop);
                        self.set_ok(true);
                    }
                    Err(err) => {
                        self.set_ok(false);
                        warn!(source = %self.name, error = %err, "service list watch failed");
                        self.emit(SourceEvent::Error(err.to_string()));
                        tokio::select! {
                            _ = stop_rx.changed() => break,
                            _ = tokio::time::sleep(self.interval) => {}
                        }
                    }
                }
            }
        }
    }

    /// Reconcile health watchers against the current service list.
    fn sync_watchers(
        self: &Arc<Self>,
        services: &BTreeMap<String, Vec<String>>,
        stop: &watch::Receiver<bool>,
    ) {
        let mut desired: Vec<(String, String, Option<String>)> = Vec::new();
        for (service, tags) in services {
            if tags.is_empty() {
                desired.push((service.clone(), service.clone(), None));
            } else {
                for tag in tags {
                    desired.push((
                        format!("{}-{}", service, tag),
                        service.clone(),
                        Some(tag.clone()),
                    ));
                }
            }
        }

        let wanted: HashSet<&String> = desired.iter().map(|(name, _, _)| name).collect();
        let mut watchers = self.watchers.lock();

        let stale: Vec<String> = watchers
            .keys()
            .filter(|name| !wanted.contains(name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(handle) = watchers.remove(&name) {
                handle.abort();
            }
            debug!(source = %self.name, watch = %name, "service disappeared, watcher torn down");
            if self.remove_entry(&name) {
                self.emit(SourceEvent::Update);
            }
        }

        for (name, service, tag) in desired {
            if watchers.contains_key(&name) {
                continue;
            }
            let me = Arc::clone(self);
            let watch_stop = stop.clone();
            let watch_name = name.clone();
            let handle = tokio::spawn(async move {
                me.watch_service(watch_name, service, tag, watch_stop).await;
            });
            watchers.insert(name, handle);
        }
    }

    async fn watch_service(
        self: Arc<Self>,
        name: String,
        service: String,
        tag: Option<String>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut cursor = 0u64;
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                page = self.catalog.service_nodes(&service, tag.as_deref(), cursor) => match page {
                    Ok(page) => {
                        cursor = if page.index < cursor { 0 } else { page.index };
                        let mut addresses: Vec<String> = page
                            .value
                            .iter()
                            .map(|node| node.address().to_string())
                            .collect();
                        addresses.sort();
                        addresses.dedup();
                        if addresses.is_empty() {
                            // No passing instances left: the watch ends and
                            // the entry is retired
                            self.watchers.lock().remove(&name);
                            if self.remove_entry(&name) {
                                self.emit(SourceEvent::Update);
                            }
                            break;
                        }
                        if self.set_entry(&name, addresses) {
                            self.emit(SourceEvent::Update);
                        }
                        self.set_ok(true);
                    }
                    Err(err) => {
                        self.set_ok(false);
                        warn!(source = %self.name, watch = %name, error = %err, "health watch failed");
                        self.emit(SourceEvent::Error(err.to_string()));
                        tokio::select! {
                            _ = stop.changed() => return,
                            _ = tokio::time::sleep(self.interval) => {}
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Source for ConsulSource {
    fn kind(&self) -> &'static str {
        "consul"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn properties(&self) -> Value {
        self.inner.read().properties.clone()
    }

    fn status(&self) -> SourceStatus {
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
        debug!(source = %self.name, "catalog source initialized");
    }

    async fn shutdown(&self) {
        let taken = self.task.lock().take();
        let Some((stop, handle)) = taken else {
            return;
        };
        let _ = stop.send(true);
        handle.abort();
        let _ = handle.await;
        let drained: Vec<JoinHandle<()>> = self.watchers.lock().drain().map(|(_, h)| h).collect();
        for watcher in drained {
            watcher.abort();
        }
        {
            let mut inner = self.inner.write();
            inner.state = SourceState::Stopped;
        }
        self.emit(SourceEvent::Shutdown);
        debug!(source = %self.name, "catalog source shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeCatalog {
        service_pages: Mutex<VecDeque<CatalogPage<BTreeMap<String, Vec<String>>>>>,
        node_pages: Mutex<HashMap<String, VecDeque<CatalogPage<Vec<ServiceNode>>>>>,
    }

    impl FakeCatalog {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                service_pages: Mutex::new(VecDeque::new()),
                node_pages: Mutex::new(HashMap::new()),
            })
        }

        fn push_services(&self, index: u64, entries: &[(&str, &[&str])]) {
            let value = entries
                .iter()
                .map(|(service, tags)| {
                    (
                        service.to_string(),
                        tags.iter().map(|t| t.to_string()).collect(),
                    )
                })
                .collect();
            self.service_pages
                .lock()
                .push_back(CatalogPage { value, index });
        }

        fn push_nodes(&self, key: &str, index: u64, addresses: &[(&str, Option<&str>)]) {
            let value = addresses
                .iter()
                .map(|(node, service)| ServiceNode {
                    node_address: node.to_string(),
                    service_address: service.map(str::to_string),
                })
                .collect();
            self.node_pages
                .lock()
                .entry(key.to_string())
                .or_default()
                .push_back(CatalogPage { value, index });
        }
    }

    #[async_trait]
    impl CatalogClient for FakeCatalog {
        async fn services(
            &self,
            _index: u64,
        ) -> SourceResult<CatalogPage<BTreeMap<String, Vec<String>>>> {
            loop {
                if let Some(page) = self.service_pages.lock().pop_front() {
                    return Ok(page);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        async fn service_nodes(
            &self,
            service: &str,
            tag: Option<&str>,
            _index: u64,
        ) -> SourceResult<CatalogPage<Vec<ServiceNode>>> {
            let key = match tag {
                Some(tag) => format!("{}-{}", service, tag),
                None => service.to_string(),
            };
            loop {
                if let Some(page) = self.node_pages.lock().get_mut(&key).and_then(VecDeque::pop_front) {
                    return Ok(page);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    async fn wait_for(source: &ConsulSource, predicate: impl Fn(&Value) -> bool) {
        for _ in 0..200 {
            if predicate(&source.properties()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "condition not reached, properties: {}",
            source.properties()
        );
    }

    #[tokio::test]
    async fn publishes_sorted_unique_addresses() {
        // Arrange: one untagged service with shuffled, duplicated addresses
        let catalog = FakeCatalog::new();
        catalog.push_services(1, &[("web", &[])]);
        catalog.push_nodes(
            "web",
            1,
            &[
                ("10.0.0.2", None),
                ("10.0.0.1", Some("172.16.0.1")),
                ("10.0.0.2", None),
            ],
        );
        let source = ConsulSource::new("consul", catalog.clone(), Duration::from_millis(20));

        // Act
        Arc::clone(&source).initialize().await;

        // Assert: service address preferred over node address, sorted, unique
        wait_for(&source, |props| {
            props.pointer("/consul/web/addresses")
                == Some(&json!(["10.0.0.2", "172.16.0.1"]))
        })
        .await;
        source.shutdown().await;
    }

    #[tokio::test]
    async fn tagged_services_get_one_watch_per_tag() {
        let catalog = FakeCatalog::new();
        catalog.push_services(1, &[("api", &["v1", "v2"])]);
        catalog.push_nodes("api-v1", 1, &[("10.0.1.1", None)]);
        catalog.push_nodes("api-v2", 1, &[("10.0.2.1", None)]);
        let source = ConsulSource::new("consul", catalog, Duration::from_millis(20));
        Arc::clone(&source).initialize().await;

        wait_for(&source, |props| {
            props.pointer("/consul/api-v1/addresses") == Some(&json!(["10.0.1.1"]))
                && props.pointer("/consul/api-v2/addresses") == Some(&json!(["10.0.2.1"]))
        })
        .await;
        source.shutdown().await;
    }

    #[tokio::test]
    async fn empty_health_result_retires_the_entry() {
        let catalog = FakeCatalog::new();
        catalog.push_services(1, &[("web", &[])]);
        catalog.push_nodes("web", 1, &[("10.0.0.1", None)]);
        let source = ConsulSource::new("consul", catalog.clone(), Duration::from_millis(20));
        Arc::clone(&source).initialize().await;

        wait_for(&source, |props| {
            props.pointer("/consul/web/addresses").is_some()
        })
        .await;

        // Act: the service loses its last passing instance
        catalog.push_nodes("web", 2, &[]);

        // Assert: the entry is removed and the watcher retired
        wait_for(&source, |props| props.pointer("/consul/web").is_none()).await;
        assert!(source.watchers.lock().is_empty());
        source.shutdown().await;
    }

    #[tokio::test]
    async fn disappeared_service_tears_down_its_watcher() {
        let catalog = FakeCatalog::new();
        catalog.push_services(1, &[("web", &[])]);
        catalog.push_nodes("web", 1, &[("10.0.0.1", None)]);
        let source = ConsulSource::new("consul", catalog.clone(), Duration::from_millis(20));
        Arc::clone(&source).initialize().await;

        wait_for(&source, |props| {
            props.pointer("/consul/web/addresses").is_some()
        })
        .await;

        // Act: next service list no longer carries the service
        catalog.push_services(2, &[]);

        wait_for(&source, |props| props.pointer("/consul/web").is_none()).await;
        source.shutdown().await;
    }
}
