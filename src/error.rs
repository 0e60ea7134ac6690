use thiserror::Error;

use crate::types::TransactionMode;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Infrastructure errors for the dispatch and receive engine
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid queue address: {0}")]
    InvalidAddress(String),

    /// Transient store failure; the enclosing unit of work rolls back and the
    /// message stays in the queue for a later attempt
    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store cannot honor the requested transaction mode. Fatal, never
    /// silently downgraded.
    #[error("Transaction mode {0} is not supported by this store")]
    UnsupportedMode(TransactionMode),

    #[error("Invalid transport transaction state: {0}")]
    InvalidTransactionState(&'static str),

    #[error("Delayed delivery requested but no scheduler is configured")]
    DelayedDeliveryUnavailable,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure raised by the processing pipeline for a structurally valid
/// message. Routed through the retry policy, never swallowed.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable failure description
    pub message: String,
}

impl HandlerError {
    /// Create a handler error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}
