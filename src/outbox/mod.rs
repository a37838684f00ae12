//! Outbox module
//!
//! Reliable hand-off of stored events to a messaging layer: durable write,
//! best-effort publish, retry by sweep.

mod error;
mod publisher;
mod transport;

pub use error::OutboxError;
pub use publisher::{FlushFailure, OutboxPublisher, SweepReport, DEFAULT_SWEEP_BATCH_SIZE};
pub use transport::{ChannelTransport, Envelope, MessageTransport, TransportError};
