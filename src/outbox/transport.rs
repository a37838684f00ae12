//! Message Transport
//!
//! The messaging layer the outbox drains into. Delivery is at-least-once;
//! consumers must be idempotent on `message_id`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event_store::PendingEvent;

/// What the transport receives for each event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub version: i64,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contributor: Option<String>,
    pub payload: serde_json::Value,
}

impl From<&PendingEvent> for Envelope {
    fn from(event: &PendingEvent) -> Self {
        Self {
            message_id: event.message_id,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            version: event.version,
            event_type: event.event_type.clone(),
            operation_id: event.operation_id,
            correlation_id: event.correlation_id,
            contributor: event.contributor.clone(),
            payload: event.payload.clone(),
        }
    }
}

/// Transport failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Transport rejected batch: {0}")]
    Rejected(String),

    #[error("Send cancelled")]
    Cancelled,
}

/// Sink for ordered envelope batches
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver one ordered batch. Either the whole batch is accepted or the
    /// call fails.
    async fn send(
        &self,
        envelopes: Vec<Envelope>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;
}

/// In-process transport over a tokio channel; one message per batch
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<Vec<Envelope>>,
}

impl ChannelTransport {
    /// Create a transport and the receiving end consumers read from
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<Envelope>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl MessageTransport for ChannelTransport {
    async fn send(
        &self,
        envelopes: Vec<Envelope>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            sent = self.sender.send(envelopes) => {
                sent.map_err(|_| TransportError::Unavailable("channel closed".into()))
            }
        }
    }
}
