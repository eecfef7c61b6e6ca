// propsd: main entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};

use propsd::api::{self, ApiState};
use propsd::manager::{ManagerOptions, PluginManager};
use propsd::source::{ConsulCatalog, ImdsClient, S3ObjectStore};
use propsd::storage::Storage;
use propsd::tokend::{TokendClient, TokendTransformer};
use propsd::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Configuration file from the first argument or PROPSD_CONFIG
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PROPSD_CONFIG").ok())
        .map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    info!("Starting propsd");
    info!(
        "Index: s3://{}/{} every {}ms",
        config.index.bucket, config.index.path, config.index.interval
    );
    info!("Metadata service: {}", config.metadata.host);
    info!(
        "Consul catalog: {}:{}",
        config.consul.host, config.consul.port
    );
    info!(
        "Secret broker: {}:{}",
        config.tokend.host, config.tokend.port
    );

    // Remote clients behind their seams
    let store = Arc::new(
        S3ObjectStore::new(
            config.index.endpoint.as_deref(),
            config.index.region.as_deref(),
        )
        .await,
    );
    let catalog = Arc::new(ConsulCatalog::new(&config.consul.host, config.consul.port)?);
    let metadata_client = Arc::new(ImdsClient::new(&config.metadata.host)?);
    let broker = Arc::new(TokendClient::new(&config.tokend.host, config.tokend.port)?);

    // Core wiring: transformer -> storage -> plugin manager
    let transformer = Arc::new(TokendTransformer::new(
        broker,
        Duration::from_millis(config.tokend.cache_ttl),
    ));
    transformer.start();
    let storage = Storage::new(
        Arc::clone(&transformer),
        Duration::from_millis(config.storage.hold_down),
    );
    let manager = PluginManager::new(
        Arc::clone(&storage),
        store,
        catalog,
        metadata_client,
        ManagerOptions {
            index_bucket: config.index.bucket.clone(),
            index_path: config.index.path.clone(),
            index_interval: Duration::from_millis(config.index.interval),
            metadata_interval: Duration::from_millis(config.metadata.interval),
            source_interval: Duration::from_millis(config.index.interval),
        },
    );
    manager.initialize().await;

    let state = ApiState::new(Arc::clone(&storage), Arc::clone(&manager));
    let app = api::router(state);
    let address = format!("{}:{}", config.service.host, config.service.port);
    let listener = TcpListener::bind(&address).await?;
    info!("Listening on http://{}", address);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    manager.shutdown().await;
    transformer.stop();
    storage.close();

    match result {
        Ok(()) => {
            info!("Server stopped");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
