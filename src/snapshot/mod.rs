//! Snapshot module
//!
//! Aggregate state checkpoints used to skip replay of summarized history.
//! Snapshots are an optimization only; losing one never loses data.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event_store::EventStoreError;

pub use memory::InMemorySnapshotStore;
pub use postgres::PgSnapshotStore;

/// Aggregate state as of `version`
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub version: i64,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        version: i64,
        state: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            version,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Snapshot storage keyed by aggregate
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot for the aggregate, if any
    async fn find(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<Snapshot>, EventStoreError>;

    /// Store a snapshot, replacing any older one
    async fn save(&self, snapshot: Snapshot) -> Result<(), EventStoreError>;
}
