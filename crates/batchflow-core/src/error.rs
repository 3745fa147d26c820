//! Error types for batchflow.
//!
//! These are engine-level errors: failures to create or read a batch, invalid
//! requests, rejected state transitions. Per-item processing failures are
//! modelled separately by [`crate::ItemError`] and never surface here.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using batchflow's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for batchflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Batch record not found
    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),

    /// Batch item not found
    #[error("Batch item not found: {0}")]
    ItemNotFound(Uuid),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A status change that the batch or item state machine forbids
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation aborted through a cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("test resource".to_string());
        assert_eq!(err.to_string(), "Not found: test resource");
    }

    #[test]
    fn test_error_display_batch_not_found() {
        let id = Uuid::nil();
        let err = Error::BatchNotFound(id);
        assert_eq!(err.to_string(), format!("Batch not found: {}", id));
    }

    #[test]
    fn test_error_display_item_not_found() {
        let id = Uuid::new_v4();
        let err = Error::ItemNotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = Error::InvalidTransition("completed -> processing".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid transition: completed -> processing"
        );
    }

    #[test]
    fn test_error_display_cancelled() {
        let err = Error::Cancelled("aborted by caller".to_string());
        assert_eq!(err.to_string(), "Cancelled: aborted by caller");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
