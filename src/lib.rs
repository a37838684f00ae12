//! event_outbox Library
//!
//! Event-sourced persistence with a transactional outbox: atomic,
//! conflict-detecting append; at-least-once delivery to a message
//! transport; snapshot-accelerated aggregate replay.

pub mod aggregate;
pub mod config;
pub mod context;
pub mod db;
pub mod event_store;
pub mod jobs;
pub mod outbox;
pub mod repository;
pub mod snapshot;

pub use aggregate::{Aggregate, AggregateFactory, DomainEvent, FnFactory};
pub use config::Config;
pub use context::OperationContext;
pub use event_store::{
    AppendRequest, EventStore, EventStoreError, InMemoryEventStore, NewEvent, OutboxStore,
    PgEventStore, UniqueProperty,
};
pub use outbox::{ChannelTransport, Envelope, MessageTransport, OutboxError, OutboxPublisher};
pub use repository::{Repository, RepositoryError, SaveOutcome, SnapshotWrite};
pub use snapshot::{InMemorySnapshotStore, PgSnapshotStore, Snapshot, SnapshotStore};
