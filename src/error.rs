//! Error types for the monitor

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the monitor
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Upstream price source errors
    #[error("Token not found: {0}")]
    TokenNotFound(String),

    #[error("Upstream rate limited")]
    RateLimited,

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    // Message gateway errors
    #[error("Gateway connection failed: {0}")]
    GatewayConnection(String),

    #[error("Gateway disconnected")]
    GatewayDisconnected,

    // Cache errors
    #[error("Cache persistence failed: {0}")]
    CachePersistence(String),

    // Notification sink errors
    #[error("Alert delivery failed: {0}")]
    SinkDelivery(String),

    // Lifecycle misuse (programming errors, never swallowed)
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited
                | Error::Upstream(_)
                | Error::GatewayConnection(_)
                | Error::GatewayDisconnected
                | Error::SinkDelivery(_)
        )
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Upstream(e.to_string())
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
