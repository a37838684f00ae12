//! Aggregate module
//!
//! The minimal capability set the repository needs from an event-sourced
//! aggregate, plus the factories that build fresh and rehydrated instances.

use serde::{de::DeserializeOwned, Serialize};

use crate::event_store::UniqueProperty;

/// Default number of versions between snapshots
pub const SNAPSHOT_INTERVAL: i64 = 100;

/// An event an aggregate raises and replays
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    /// Event type name stored next to the payload
    fn event_type(&self) -> &'static str;
}

/// Aggregate trait that all aggregates must implement
pub trait Aggregate: Send + Sync {
    /// The type of events this aggregate handles
    type Event: DomainEvent;

    /// Serializable state captured in snapshots
    type State: Serialize + DeserializeOwned + Send + Sync;

    /// Get the aggregate type tag (for storage)
    fn aggregate_type() -> &'static str;

    /// Get the aggregate ID
    fn id(&self) -> &str;

    /// Current version, including events not stored yet
    fn version(&self) -> i64;

    /// Apply a stored event during replay.
    ///
    /// Must advance the version by exactly one and must not record the
    /// event as pending.
    fn apply(&mut self, event: Self::Event);

    /// Events raised since the last successful save, oldest first
    fn pending_events(&self) -> &[Self::Event];

    /// Forget pending events once they are durable
    fn clear_pending_events(&mut self);

    /// State captured by snapshots
    fn state(&self) -> &Self::State;

    /// Uniquely indexed property values this aggregate claims
    fn unique_properties(&self) -> Vec<UniqueProperty> {
        Vec::new()
    }

    /// Check if a snapshot should be created
    fn should_snapshot(&self) -> bool {
        self.version() > 0 && self.version() % SNAPSHOT_INTERVAL == 0
    }
}

/// Builds aggregate instances for the repository
pub trait AggregateFactory<A: Aggregate>: Send + Sync {
    /// A fresh instance with no history
    fn create(&self, aggregate_id: &str) -> A;

    /// An instance rehydrated from a snapshot taken at `version`
    fn restore(&self, aggregate_id: &str, version: i64, state: A::State) -> A;
}

/// Factory built from two closures
pub struct FnFactory<C, R> {
    create: C,
    restore: R,
}

impl<C, R> FnFactory<C, R> {
    pub fn new(create: C, restore: R) -> Self {
        Self { create, restore }
    }
}

impl<A, C, R> AggregateFactory<A> for FnFactory<C, R>
where
    A: Aggregate,
    C: Fn(&str) -> A + Send + Sync,
    R: Fn(&str, i64, A::State) -> A + Send + Sync,
{
    fn create(&self, aggregate_id: &str) -> A {
        (self.create)(aggregate_id)
    }

    fn restore(&self, aggregate_id: &str, version: i64, state: A::State) -> A {
        (self.restore)(aggregate_id, version, state)
    }
}
