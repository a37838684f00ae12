//! In-Memory Event Store
//!
//! Process-local backend. A single mutex guards all tables, so each call is
//! one atomic unit exactly like a database transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    AggregateKey, AggregateVersion, AppendRequest, DeleteOutcome, EventStore, EventStoreError,
    OutboxStore, PendingEvent, PersistentEvent, UniqueIndexEntry,
};

type UniqueKey = (String, String, String);

#[derive(Debug, Default)]
struct Tables {
    versions: HashMap<AggregateKey, i64>,
    events: BTreeMap<AggregateKey, Vec<PersistentEvent>>,
    pending: BTreeMap<AggregateKey, BTreeMap<i64, PendingEvent>>,
    unique_index: HashMap<UniqueKey, UniqueIndexEntry>,
}

/// Event store and outbox held in process memory
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    tables: Mutex<Tables>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, EventStoreError> {
        self.tables
            .lock()
            .map_err(|_| EventStoreError::Storage("in-memory store lock poisoned".into()))
    }

    /// All unique index entries, for inspection
    pub fn unique_index_entries(&self) -> Result<Vec<UniqueIndexEntry>, EventStoreError> {
        Ok(self.lock()?.unique_index.values().cloned().collect())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, request: AppendRequest) -> Result<i64, EventStoreError> {
        request.validate()?;

        let mut tables = self.lock()?;
        let key = AggregateKey::new(&request.aggregate_type, &request.aggregate_id);

        // Every check happens before the first write, so a failure leaves
        // the tables untouched.
        let current = tables.versions.get(&key).copied().unwrap_or(0);
        if current != request.expected_version {
            tracing::warn!(
                aggregate_type = %request.aggregate_type,
                aggregate_id = %request.aggregate_id,
                expected = request.expected_version,
                actual = current,
                "Version register compare-and-set failed"
            );
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_type: request.aggregate_type,
                aggregate_id: request.aggregate_id,
                expected: request.expected_version,
            });
        }

        for property in &request.unique_properties {
            let unique_key = (
                request.aggregate_type.clone(),
                property.name.clone(),
                property.value.clone(),
            );
            if let Some(entry) = tables.unique_index.get(&unique_key) {
                if entry.aggregate_id != request.aggregate_id {
                    return Err(EventStoreError::DuplicateUniqueProperty {
                        aggregate_type: request.aggregate_type.clone(),
                        property_name: property.name.clone(),
                        property_value: property.value.clone(),
                        owner_id: entry.aggregate_id.clone(),
                    });
                }
            }
        }

        let new_version = request.new_version();
        let rows = request.to_persistent_events();

        tables.versions.insert(key.clone(), new_version);
        let pending = tables.pending.entry(key.clone()).or_default();
        for row in &rows {
            pending.insert(row.version, row.clone());
        }
        tables.events.entry(key).or_default().extend(rows);

        for property in request.unique_properties {
            let unique_key = (
                request.aggregate_type.clone(),
                property.name.clone(),
                property.value.clone(),
            );
            tables.unique_index.entry(unique_key).or_insert(UniqueIndexEntry {
                aggregate_type: request.aggregate_type.clone(),
                property_name: property.name,
                property_value: property.value,
                aggregate_id: request.aggregate_id.clone(),
            });
        }

        tracing::debug!(
            aggregate_type = %request.aggregate_type,
            aggregate_id = %request.aggregate_id,
            version = new_version,
            "Events appended"
        );

        Ok(new_version)
    }

    async fn load_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from_version: i64,
    ) -> Result<Vec<PersistentEvent>, EventStoreError> {
        let tables = self.lock()?;
        let key = AggregateKey::new(aggregate_type, aggregate_id);

        Ok(tables
            .events
            .get(&key)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.version > from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_id_by_unique_indexed_property(
        &self,
        aggregate_type: &str,
        property_name: &str,
        property_value: &str,
    ) -> Result<Option<String>, EventStoreError> {
        let tables = self.lock()?;
        let unique_key = (
            aggregate_type.to_string(),
            property_name.to_string(),
            property_value.to_string(),
        );

        Ok(tables
            .unique_index
            .get(&unique_key)
            .map(|entry| entry.aggregate_id.clone()))
    }

    async fn load_version(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<AggregateVersion>, EventStoreError> {
        let tables = self.lock()?;
        let key = AggregateKey::new(aggregate_type, aggregate_id);

        Ok(tables.versions.get(&key).map(|version| AggregateVersion {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            current_version: *version,
        }))
    }
}

#[async_trait]
impl OutboxStore for InMemoryEventStore {
    async fn load_pending_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<PendingEvent>, EventStoreError> {
        let tables = self.lock()?;
        let key = AggregateKey::new(aggregate_type, aggregate_id);

        Ok(tables
            .pending
            .get(&key)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_pending_event(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        version: i64,
    ) -> Result<DeleteOutcome, EventStoreError> {
        let mut tables = self.lock()?;
        let key = AggregateKey::new(aggregate_type, aggregate_id);

        let Some(rows) = tables.pending.get_mut(&key) else {
            return Ok(DeleteOutcome::AlreadyGone);
        };
        let removed = rows.remove(&version).is_some();
        if rows.is_empty() {
            tables.pending.remove(&key);
        }

        Ok(if removed {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::AlreadyGone
        })
    }

    async fn find_aggregates_with_pending_events(
        &self,
        limit: usize,
    ) -> Result<Vec<AggregateKey>, EventStoreError> {
        let tables = self.lock()?;

        Ok(tables
            .pending
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(key, _)| key.clone())
            .take(limit)
            .collect())
    }

    async fn count_pending_events(&self) -> Result<u64, EventStoreError> {
        let tables = self.lock()?;
        Ok(tables.pending.values().map(|rows| rows.len() as u64).sum())
    }
}
