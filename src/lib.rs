// propsd: Per-node dynamic property service
// Merges an S3 index, instance metadata, and Consul catalog feeds into one
// live property tree, resolves secrets through a local broker, and serves
// the result over a small HTTP API

// Enforce proper error handling - no unwrap/expect in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod api;
pub mod config;
pub mod error;
pub mod manager;
pub mod properties;
pub mod source;
pub mod storage;
pub mod template;
pub mod tokend;

pub use config::Config;
pub use error::{ConfigError, SourceError, StorageError, TemplateError, TokendError};
pub use manager::{ManagerEvent, ManagerOptions, PluginManager, SourceSpec};
pub use source::{Source, SourceEvent, SourceState, SourceStatus};
pub use storage::{Storage, StorageEvent};
pub use tokend::{SecretBroker, TokendClient, TokendTransformer};
