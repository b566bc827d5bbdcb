//! Error types for the request engine.

use thiserror::Error;

use crate::domain::batch::BatchJobId;
use crate::domain::request::{RequestStatus, RowId};

/// Result type alias using the barrage error type.
pub type Result<T> = std::result::Result<T, BarrageError>;

/// Main error type for the request engine.
#[derive(Error, Debug)]
pub enum BarrageError {
    /// Request row not found
    #[error("Request not found: {0}")]
    RequestNotFound(RowId),

    /// The row's stored status no longer matches the status the caller observed.
    ///
    /// Callers re-read the row and re-decide; see [`crate::RequestStore::transition`].
    #[error("Store conflict on request {id}: expected status '{expected}', found '{actual}'")]
    StoreConflict {
        id: RowId,
        expected: RequestStatus,
        actual: RequestStatus,
    },

    /// The requested status change is not an edge of the state machine
    #[error("Invalid state transition: request {id} cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        id: RowId,
        from: RequestStatus,
        to: RequestStatus,
    },

    /// The row failed and its failure count reached its attempts cap
    #[error("Request {id} exhausted its attempts ({failures}/{cap}): {last_error}")]
    CapacityExceeded {
        id: RowId,
        failures: u32,
        cap: u32,
        last_error: String,
    },

    /// The generation service rejected the request outright
    #[error("Request {id} was rejected by the generation service: {reason}")]
    ServiceRejection { id: RowId, reason: String },

    /// Submitting a batch job to the batch service failed
    #[error("Batch {batch} submission failed: {reason}")]
    BatchSubmission { batch: BatchJobId, reason: String },

    /// Awaiting a result took longer than the configured limit
    #[error("Timed out waiting for request {0}")]
    AwaitTimeout(RowId),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Validation error (e.g., empty model name, malformed row update)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BarrageError {
    /// Whether this error is a compare-and-update conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BarrageError::StoreConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_both_statuses() {
        let id = RowId::new();
        let error = BarrageError::StoreConflict {
            id,
            expected: RequestStatus::Running,
            actual: RequestStatus::Succeeded,
        };

        assert!(error.is_conflict());
        let message = error.to_string();
        assert!(message.contains("expected status 'running'"));
        assert!(message.contains("found 'succeeded'"));
    }

    #[test]
    fn test_capacity_exceeded_is_not_conflict() {
        let error = BarrageError::CapacityExceeded {
            id: RowId::new(),
            failures: 3,
            cap: 3,
            last_error: "rate limited".to_string(),
        };

        assert!(!error.is_conflict());
        assert!(error.to_string().contains("(3/3)"));
    }
}
