//! Error types for the resilient connection.

use thiserror::Error;

/// Errors reported by a store capability.
///
/// This is the boundary between the backend and the supervisor: whether an
/// error is retried depends solely on [`StoreError::is_transient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Wrong type for key: {0}")]
    WrongType(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Connectivity failures; these turn into a wait-and-retry cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionRefused(_) | StoreError::ConnectionLost(_) | StoreError::Timeout
        )
    }
}

/// Main error type for client operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection supervisor is already running")]
    AlreadyStarted,

    #[error("Connection supervisor has not been started")]
    NotStarted,

    #[error("Subscriptions must be registered before connecting")]
    SubscribeWhileConnected,

    #[error("Subscriptions are already registered")]
    AlreadySubscribed,

    #[error("No subscriptions registered")]
    NoSubscriptions,

    #[error("Configuration is locked while the supervisor is running")]
    ConfigLocked,

    #[error("Connection closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Programmer errors: the call was rejected without effect.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::AlreadyConnected
                | Error::AlreadyStarted
                | Error::NotStarted
                | Error::SubscribeWhileConnected
                | Error::AlreadySubscribed
                | Error::NoSubscriptions
                | Error::ConfigLocked
        )
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type at the store capability boundary.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
