//! Repository module
//!
//! Rebuilds aggregates from their event history (optionally starting from a
//! snapshot) and coordinates save-then-publish.

use std::marker::PhantomData;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::aggregate::{Aggregate, AggregateFactory, DomainEvent};
use crate::context::OperationContext;
use crate::event_store::{AppendRequest, EventStore, EventStoreError, NewEvent, PersistentEvent};
use crate::outbox::{OutboxError, OutboxPublisher};
use crate::snapshot::{Snapshot, SnapshotStore};

/// Errors returned by the repository
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Events are durable at `version`; delivery is left to the sweep
    #[error("Saved at version {version} but publishing failed: {source}")]
    PublishAfterSave {
        version: i64,
        #[source]
        source: OutboxError,
    },

    /// Stored history does not line up with the aggregate's version
    #[error("Replay of {aggregate_id} out of sequence: event version {event_version}, aggregate at {aggregate_version}")]
    ReplayOutOfSequence {
        aggregate_id: String,
        event_version: i64,
        aggregate_version: i64,
    },
}

impl RepositoryError {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, RepositoryError::Store(e) if e.is_concurrency_conflict())
    }

    pub fn is_duplicate_unique_property(&self) -> bool {
        matches!(self, RepositoryError::Store(e) if e.is_duplicate_unique_property())
    }
}

/// What happened to the snapshot after a save
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotWrite {
    /// No snapshot store, or the aggregate's policy declined
    Skipped,
    Written,
    /// The save stands; only the checkpoint is missing
    Failed(String),
}

/// Result of a successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Durable version after the append
    pub version: i64,
    pub snapshot: SnapshotWrite,
    /// Events delivered inline by `save_and_publish`
    pub published: Option<usize>,
}

/// Event-sourced repository for one aggregate type
pub struct Repository<A, F> {
    store: Arc<dyn EventStore>,
    publisher: OutboxPublisher,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    factory: F,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, F> Repository<A, F>
where
    A: Aggregate,
    F: AggregateFactory<A>,
{
    pub fn new(store: Arc<dyn EventStore>, publisher: OutboxPublisher, factory: F) -> Self {
        Self {
            store,
            publisher,
            snapshots: None,
            factory,
            _aggregate: PhantomData,
        }
    }

    /// Enable snapshot reads and writes
    pub fn with_snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Append the aggregate's pending events.
    ///
    /// On failure the pending events stay on the aggregate and no snapshot
    /// is written.
    pub async fn save(
        &self,
        aggregate: &mut A,
        context: &OperationContext,
    ) -> Result<SaveOutcome, RepositoryError> {
        let request = Self::append_request(aggregate, context)?;
        let version = self.store.append(request).await?;

        aggregate.clear_pending_events();
        let snapshot = self.write_snapshot(aggregate).await;

        Ok(SaveOutcome {
            version,
            snapshot,
            published: None,
        })
    }

    /// Save, then deliver this aggregate's outbox rows right away
    pub async fn save_and_publish(
        &self,
        aggregate: &mut A,
        context: &OperationContext,
        cancel: &CancellationToken,
    ) -> Result<SaveOutcome, RepositoryError> {
        let mut outcome = self.save(aggregate, context).await?;

        let published = self
            .publisher
            .flush_pending_events(A::aggregate_type(), aggregate.id(), cancel)
            .await
            .map_err(|source| {
                tracing::warn!(
                    aggregate_type = A::aggregate_type(),
                    aggregate_id = aggregate.id(),
                    version = outcome.version,
                    error = %source,
                    "Inline publish failed; events stay pending"
                );
                RepositoryError::PublishAfterSave {
                    version: outcome.version,
                    source,
                }
            })?;

        outcome.published = Some(published);
        Ok(outcome)
    }

    /// Load an aggregate by replaying events (with snapshot optimization)
    pub async fn find(&self, aggregate_id: &str) -> Result<Option<A>, RepositoryError> {
        if aggregate_id.is_empty() {
            return Err(EventStoreError::Validation("aggregate id is empty".into()).into());
        }

        let snapshot = match &self.snapshots {
            Some(snapshots) => snapshots.find(A::aggregate_type(), aggregate_id).await?,
            None => None,
        };

        match snapshot {
            Some(snapshot) => {
                let state: A::State =
                    serde_json::from_value(snapshot.state).map_err(EventStoreError::from)?;
                let mut aggregate = self.factory.restore(aggregate_id, snapshot.version, state);

                let events = self
                    .store
                    .load_events(A::aggregate_type(), aggregate_id, snapshot.version)
                    .await?;
                Self::replay(&mut aggregate, events)?;

                tracing::debug!(
                    aggregate_type = A::aggregate_type(),
                    aggregate_id,
                    snapshot_version = snapshot.version,
                    version = aggregate.version(),
                    "Aggregate loaded from snapshot"
                );
                Ok(Some(aggregate))
            }
            None => {
                let events = self
                    .store
                    .load_events(A::aggregate_type(), aggregate_id, 0)
                    .await?;
                if events.is_empty() {
                    return Ok(None);
                }

                let mut aggregate = self.factory.create(aggregate_id);
                Self::replay(&mut aggregate, events)?;
                Ok(Some(aggregate))
            }
        }
    }

    /// Owner of a uniquely indexed property value for this aggregate type
    pub async fn find_id_by_unique_indexed_property(
        &self,
        property_name: &str,
        property_value: &str,
    ) -> Result<Option<String>, RepositoryError> {
        Ok(self
            .store
            .find_id_by_unique_indexed_property(A::aggregate_type(), property_name, property_value)
            .await?)
    }

    fn append_request(
        aggregate: &A,
        context: &OperationContext,
    ) -> Result<AppendRequest, RepositoryError> {
        let pending = aggregate.pending_events();
        let expected_version = aggregate.version() - pending.len() as i64;

        let events = pending
            .iter()
            .enumerate()
            .map(|(offset, event)| {
                Ok(NewEvent::new(
                    aggregate.id(),
                    expected_version + 1 + offset as i64,
                    event.event_type(),
                    serde_json::to_value(event)?,
                ))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()
            .map_err(EventStoreError::from)?;

        Ok(AppendRequest::new(
            A::aggregate_type(),
            aggregate.id(),
            expected_version,
            events,
            context.clone(),
        )
        .with_unique_properties(aggregate.unique_properties()))
    }

    fn replay(aggregate: &mut A, events: Vec<PersistentEvent>) -> Result<(), RepositoryError> {
        for stored in events {
            if stored.version != aggregate.version() + 1 {
                return Err(RepositoryError::ReplayOutOfSequence {
                    aggregate_id: stored.aggregate_id,
                    event_version: stored.version,
                    aggregate_version: aggregate.version(),
                });
            }
            let event: A::Event =
                serde_json::from_value(stored.payload).map_err(EventStoreError::from)?;
            aggregate.apply(event);
        }
        Ok(())
    }

    async fn write_snapshot(&self, aggregate: &A) -> SnapshotWrite {
        let Some(snapshots) = &self.snapshots else {
            return SnapshotWrite::Skipped;
        };
        if !aggregate.should_snapshot() {
            return SnapshotWrite::Skipped;
        }

        let result = match serde_json::to_value(aggregate.state()) {
            Ok(state) => {
                snapshots
                    .save(Snapshot::new(
                        A::aggregate_type(),
                        aggregate.id(),
                        aggregate.version(),
                        state,
                    ))
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => SnapshotWrite::Written,
            Err(e) => {
                tracing::warn!(
                    aggregate_type = A::aggregate_type(),
                    aggregate_id = aggregate.id(),
                    version = aggregate.version(),
                    error = %e,
                    "Snapshot write failed"
                );
                SnapshotWrite::Failed(e.to_string())
            }
        }
    }
}
