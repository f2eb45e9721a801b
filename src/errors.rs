//! Fuzzy Watch Error Hierarchy
//!
//! Defines the error types of the pattern-based watch subsystem, categorized
//! by the layer that raises them.
//!
//! Capacity conditions (too many patterns, too many matched services) are
//! normally surfaced through watcher callbacks rather than returned; only the
//! synchronous server admission path returns `PatternOverLimit`.

use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Fuzzy watch protocol and admission failures
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Transport failures talking to the remote side
    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl Error {
    /// Transient errors are retried invisibly by the background resync loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The connected server has not advertised fuzzy watch support
    #[error("Remote server does not support fuzzy watch")]
    CapabilityUnsupported,

    /// Namespace already holds `limit` active patterns
    #[error("Fuzzy watch pattern count over limit {limit}, pattern {pattern} rejected")]
    PatternOverLimit { pattern: String, limit: usize },

    #[error("Invalid fuzzy watch pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid service key: {0}")]
    InvalidServiceKey(String),

    /// Tearing down a bootstrap mid-flight is not allowed; race it against a timeout instead
    #[error("Bootstrap future can not be cancelled")]
    BootstrapCancelUnsupported,

    #[error("Bootstrap did not finish within {0:?}")]
    BootstrapTimeout(Duration),

    /// The owning context went away before the bootstrap finished
    #[error("Bootstrap abandoned before completion")]
    BootstrapAbandoned,
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Remote call did not answer in time
    #[error("{request_type} request timeout after {duration:?}")]
    Timeout {
        request_type: &'static str,
        duration: Duration,
    },

    /// Endpoint unavailable (HTTP 503 equivalent)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// No live connection for the addressed client
    #[error("Client {0} is not connected")]
    ClientNotConnected(String),
}

/// Failure reported by a user supplied watcher callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatcherError {
    #[error("Watcher failed: {0}")]
    Failed(String),

    #[error("Watcher panicked: {0}")]
    Panicked(String),
}

impl From<String> for WatcherError {
    fn from(reason: String) -> Self {
        WatcherError::Failed(reason)
    }
}

impl From<&str> for WatcherError {
    fn from(reason: &str) -> Self {
        WatcherError::Failed(reason.to_string())
    }
}
