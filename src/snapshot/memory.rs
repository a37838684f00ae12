use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::event_store::{AggregateKey, EventStoreError};

use super::{Snapshot, SnapshotStore};

/// Snapshots held in process memory
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<AggregateKey, Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn find(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| EventStoreError::Storage("snapshot lock poisoned".into()))?;

        Ok(snapshots
            .get(&AggregateKey::new(aggregate_type, aggregate_id))
            .cloned())
    }

    async fn save(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| EventStoreError::Storage("snapshot lock poisoned".into()))?;

        let key = AggregateKey::new(&snapshot.aggregate_type, &snapshot.aggregate_id);
        // Never move a checkpoint backwards
        if let Some(existing) = snapshots.get(&key) {
            if existing.version > snapshot.version {
                return Ok(());
            }
        }
        snapshots.insert(key, snapshot);
        Ok(())
    }
}
