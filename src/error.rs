// propsd: Error types

use thiserror::Error;

/// Source result type
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors raised by source fetch loops and their remote clients
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl SourceError {
    /// Classify a reqwest failure, keeping connection refusal distinct
    pub fn from_http(context: &str, err: &reqwest::Error) -> Self {
        if err.is_connect() {
            SourceError::ConnectionRefused(format!("{}: {}", context, err))
        } else if err.is_timeout() {
            SourceError::Timeout(format!("{}: {}", context, err))
        } else {
            SourceError::Network(format!("{}: {}", context, err))
        }
    }
}

/// Template result type
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors raised while interpolating `{{ dotted.path }}` placeholders
#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    #[error("Unresolved template path: {0}")]
    Unresolved(String),
}

/// Tokend result type
pub type TokendResult<T> = Result<T, TokendError>;

/// Errors raised while talking to the secret broker
///
/// These never escape the transformer; every failure degrades the affected
/// sentinel to `null`.
#[derive(Debug, Clone, Error)]
pub enum TokendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Broker returned status {0}")]
    Status(String),

    #[error("Malformed broker response: {0}")]
    Malformed(String),
}

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the property storage layer
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Duplicate source: {0}")]
    DuplicateSource(String),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
