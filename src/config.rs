// propsd: Configuration
// TOML file with environment variable overrides; env > file > defaults

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, ConfigResult};

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub index: IndexConfig,
    pub metadata: MetadataConfig,
    pub consul: ConsulConfig,
    pub tokend: TokendConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub bucket: String,
    pub path: String,
    /// Fetch interval in milliseconds
    pub interval: u64,
    /// Optional S3-compatible endpoint; forces path-style addressing
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// `host` or `host:port` of the instance-metadata service
    pub host: String,
    pub interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokendConfig {
    pub host: String,
    pub port: u16,
    /// Secret cache TTL in milliseconds
    #[serde(rename = "cacheTTL")]
    pub cache_ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Hold-down window in milliseconds for coalescing source updates
    pub hold_down: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            index: IndexConfig::default(),
            metadata: MetadataConfig::default(),
            consul: ConsulConfig::default(),
            tokend: TokendConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9100,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            path: "index.json".to_string(),
            interval: 60_000,
            endpoint: None,
            region: None,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            host: "169.254.169.254".to_string(),
            interval: 30_000,
        }
    }
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8500,
        }
    }
}

impl Default for TokendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4500,
            cache_ttl: 300_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { hold_down: 100 }
    }
}

impl Config {
    /// Load configuration: defaults, then the optional TOML file, then
    /// environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
                toml::from_str(&content)
                    .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_str("PROPSD_SERVICE_HOST") {
            self.service.host = value;
        }
        if let Some(value) = env_u64("PROPSD_SERVICE_PORT") {
            self.service.port = value as u16;
        }
        if let Some(value) = env_str("PROPSD_INDEX_BUCKET") {
            self.index.bucket = value;
        }
        if let Some(value) = env_str("PROPSD_INDEX_PATH") {
            self.index.path = value;
        }
        if let Some(value) = env_u64("PROPSD_INDEX_INTERVAL") {
            self.index.interval = value;
        }
        if let Some(value) = env_str("PROPSD_INDEX_ENDPOINT") {
            self.index.endpoint = Some(value);
        }
        if let Some(value) = env_str("PROPSD_INDEX_REGION") {
            self.index.region = Some(value);
        }
        if let Some(value) = env_str("PROPSD_METADATA_HOST") {
            self.metadata.host = value;
        }
        if let Some(value) = env_u64("PROPSD_METADATA_INTERVAL") {
            self.metadata.interval = value;
        }
        if let Some(value) = env_str("PROPSD_CONSUL_HOST") {
            self.consul.host = value;
        }
        if let Some(value) = env_u64("PROPSD_CONSUL_PORT") {
            self.consul.port = value as u16;
        }
        if let Some(value) = env_str("PROPSD_TOKEND_HOST") {
            self.tokend.host = value;
        }
        if let Some(value) = env_u64("PROPSD_TOKEND_PORT") {
            self.tokend.port = value as u16;
        }
        if let Some(value) = env_u64("PROPSD_CACHE_TTL") {
            self.tokend.cache_ttl = value;
        }
        if let Some(value) = env_u64("BUILD_HOLD_DOWN") {
            self.storage.hold_down = value;
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.index.bucket.is_empty() {
            return Err(ConfigError::Invalid(
                "index.bucket must be set".to_string(),
            ));
        }
        if self.index.path.is_empty() {
            return Err(ConfigError::Invalid("index.path must be set".to_string()));
        }
        if self.index.interval == 0 {
            return Err(ConfigError::Invalid(
                "index.interval must be positive".to_string(),
            ));
        }
        if self.storage.hold_down == 0 {
            return Err(ConfigError::Invalid(
                "storage.hold_down must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    let value = env_str(name)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(variable = name, value = %value, "ignoring non-numeric override");
            None
        }
    }
}
