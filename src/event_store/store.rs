//! Storage Contracts
//!
//! Abstract append/read/unique-index contract implemented by each backend.
//! A backend must execute `append` as one atomic unit.

use async_trait::async_trait;

use super::{
    AggregateKey, AggregateVersion, AppendRequest, DeleteOutcome, EventStoreError, PendingEvent,
    PersistentEvent,
};

/// Event store: version register, persistent log and unique index
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically advance the version register, append the log and outbox
    /// rows, and claim the unique index entries. Returns the new version.
    ///
    /// Fails with `ConcurrencyConflict` when the register is not at
    /// `expected_version`, and with `DuplicateUniqueProperty` when an index
    /// value belongs to another aggregate. Nothing is written on failure.
    async fn append(&self, request: AppendRequest) -> Result<i64, EventStoreError>;

    /// Events with version strictly greater than `from_version`, ascending
    async fn load_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from_version: i64,
    ) -> Result<Vec<PersistentEvent>, EventStoreError>;

    /// Owner of a uniquely indexed property value, if any
    async fn find_id_by_unique_indexed_property(
        &self,
        aggregate_type: &str,
        property_name: &str,
        property_value: &str,
    ) -> Result<Option<String>, EventStoreError>;

    /// Version register row for an aggregate
    async fn load_version(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<AggregateVersion>, EventStoreError>;

    /// Current version, 0 when the aggregate is unknown
    async fn current_version(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<i64, EventStoreError> {
        Ok(self
            .load_version(aggregate_type, aggregate_id)
            .await?
            .map(|row| row.current_version)
            .unwrap_or(0))
    }
}

/// Outbox queue: durable but not yet delivered events
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Pending rows of one aggregate, ascending by version
    async fn load_pending_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<PendingEvent>, EventStoreError>;

    /// Remove one delivered row
    async fn delete_pending_event(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        version: i64,
    ) -> Result<DeleteOutcome, EventStoreError>;

    /// Up to `limit` distinct aggregates that have pending rows
    async fn find_aggregates_with_pending_events(
        &self,
        limit: usize,
    ) -> Result<Vec<AggregateKey>, EventStoreError>;

    /// Total number of pending rows
    async fn count_pending_events(&self) -> Result<u64, EventStoreError>;
}
