//! Event Store module
//!
//! Persistence layer for Event Sourcing: version register, persistent log,
//! outbox queue and unique index behind one atomic append.

mod error;
mod memory;
mod model;
mod postgres;
mod store;

pub use error::EventStoreError;
pub use memory::InMemoryEventStore;
pub use model::{
    AggregateKey, AggregateVersion, AppendRequest, DeleteOutcome, NewEvent, PendingEvent,
    PersistentEvent, UniqueIndexEntry, UniqueProperty,
};
pub use postgres::PgEventStore;
pub use store::{EventStore, OutboxStore};
