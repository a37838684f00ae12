//! Outbox Errors

use crate::event_store::{AggregateKey, EventStoreError};

use super::TransportError;

/// Errors from draining the outbox
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// Reading or deleting pending rows failed
    #[error("Outbox store error: {0}")]
    Store(#[from] EventStoreError),

    /// The transport did not accept the batch; rows stay pending
    #[error("Transport error for {aggregate}: {source}")]
    Transport {
        aggregate: AggregateKey,
        #[source]
        source: TransportError,
    },

    #[error("Outbox drain cancelled")]
    Cancelled,
}

impl OutboxError {
    /// True when the drain stopped because the cancellation token fired
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            OutboxError::Cancelled
                | OutboxError::Transport {
                    source: TransportError::Cancelled,
                    ..
                }
        )
    }
}
