//! Error types for relayguard

use std::io;

use thiserror::Error;

/// Result type alias for relayguard
pub type Result<T> = std::result::Result<T, Error>;

/// Relayguard errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No endpoint registered for the given listen port
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(u16),

    /// Endpoint exists but monitoring is disabled for it
    #[error("Monitoring disabled for endpoint {0}")]
    MonitoringDisabled(u16),

    /// A switch is already in flight for this endpoint
    #[error("Switch already in flight for endpoint {0}")]
    SwitchInFlight(u16),

    /// Provider referenced by an endpoint does not exist or is disabled
    #[error("Provider not available: {0}")]
    ProviderNotFound(String),

    /// Upstream acquisition failed
    #[error("Provider error: {message}")]
    Provider {
        /// Human-readable failure description
        message: String,
        /// Whether another attempt may succeed
        retryable: bool,
    },

    /// Candidate upstream rejected before apply
    #[error("Validation error: {0}")]
    Validation(String),

    /// The proxy engine rejected or failed to apply a configuration
    #[error("Engine apply error: {0}")]
    EngineApply(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a retryable provider error
    pub fn provider_transient(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error
    pub fn provider_fatal(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            retryable: false,
        }
    }

    /// Check whether another acquisition attempt may succeed.
    ///
    /// Transport-level failures are retryable; malformed provider
    /// configuration or response shapes are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Io(_) => true,
            _ => false,
        }
    }
}
