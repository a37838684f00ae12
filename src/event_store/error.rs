//! Event Store Errors
//!
//! Backend-independent error taxonomy. Adapters classify their native
//! failures into these kinds at the store boundary.

/// Errors that can occur in the event store
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Malformed request, rejected before any I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic concurrency conflict on the version register
    #[error("Concurrency conflict for {aggregate_type} {aggregate_id}: expected version {expected}")]
    ConcurrencyConflict {
        aggregate_type: String,
        aggregate_id: String,
        expected: i64,
    },

    /// Unique indexed property already owned by a different aggregate
    #[error("Duplicate unique property {aggregate_type}.{property_name} = {property_value:?} (owned by {owner_id})")]
    DuplicateUniqueProperty {
        aggregate_type: String,
        property_name: String,
        property_value: String,
        owner_id: String,
    },

    /// Backend unreachable, timed out or asked us to retry
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    /// Any other backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Payload or snapshot state could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Check if this error is a concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }

    /// Check if this error is a unique property collision
    pub fn is_duplicate_unique_property(&self) -> bool {
        matches!(self, EventStoreError::DuplicateUniqueProperty { .. })
    }

    /// Check if the same call may simply be retried with backoff.
    ///
    /// A concurrency conflict is not retryable as-is: the caller has to
    /// reload the aggregate and re-run the business operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::TransientStorage(_))
    }
}

/// PostgreSQL SQLSTATE codes that ask the client to retry
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

impl From<sqlx::Error> for EventStoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => EventStoreError::TransientStorage(err.to_string()),
            sqlx::Error::Database(db)
                if matches!(
                    db.code().as_deref(),
                    Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
                ) =>
            {
                EventStoreError::TransientStorage(err.to_string())
            }
            _ => EventStoreError::Storage(err.to_string()),
        }
    }
}
