//! Event Store Records
//!
//! Row-level shapes shared by every storage adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::OperationContext;

use super::EventStoreError;

/// Identifies one aggregate instance: (aggregate type tag, aggregate id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub aggregate_type: String,
    pub aggregate_id: String,
}

impl AggregateKey {
    pub fn new(aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
        }
    }
}

impl std::fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.aggregate_id)
    }
}

/// Row of the version register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateVersion {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub current_version: i64,
}

/// An event produced by an aggregate, not yet stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub aggregate_id: String,
    pub version: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub raised_at: DateTime<Utc>,
    pub message_id: Uuid,
}

impl NewEvent {
    /// Create a new event record, stamped now with a fresh message ID
    pub fn new(
        aggregate_id: impl Into<String>,
        version: i64,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            version,
            event_type: event_type.into(),
            payload,
            raised_at: Utc::now(),
            message_id: Uuid::new_v4(),
        }
    }
}

/// Immutable record of the persistent log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub version: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub raised_at: DateTime<Utc>,
    pub message_id: Uuid,
    pub operation_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
    pub contributor: Option<String>,
}

/// Outbox row: same shape as the log record, deleted once delivered
pub type PendingEvent = PersistentEvent;

impl PersistentEvent {
    pub(crate) fn from_new(aggregate_type: &str, event: &NewEvent, context: &OperationContext) -> Self {
        Self {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: event.aggregate_id.clone(),
            version: event.version,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            raised_at: event.raised_at,
            message_id: event.message_id,
            operation_id: context.operation_id,
            correlation_id: context.correlation_id,
            contributor: context.contributor.clone(),
        }
    }
}

/// A uniquely indexed property value declared by an aggregate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueProperty {
    pub name: String,
    pub value: String,
}

impl UniqueProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Row of the unique index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndexEntry {
    pub aggregate_type: String,
    pub property_name: String,
    pub property_value: String,
    pub aggregate_id: String,
}

/// Everything one atomic append needs
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub expected_version: i64,
    pub events: Vec<NewEvent>,
    pub unique_properties: Vec<UniqueProperty>,
    pub context: OperationContext,
}

impl AppendRequest {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        expected_version: i64,
        events: Vec<NewEvent>,
        context: OperationContext,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            expected_version,
            events,
            unique_properties: Vec::new(),
            context,
        }
    }

    pub fn with_unique_properties(mut self, properties: Vec<UniqueProperty>) -> Self {
        self.unique_properties = properties;
        self
    }

    /// Version the register holds once this request commits
    pub fn new_version(&self) -> i64 {
        self.expected_version
            .saturating_add(i64::try_from(self.events.len()).unwrap_or(i64::MAX))
    }

    /// Reject malformed requests before touching storage
    pub fn validate(&self) -> Result<(), EventStoreError> {
        if self.aggregate_type.is_empty() {
            return Err(EventStoreError::Validation("aggregate type is empty".into()));
        }
        if self.aggregate_id.is_empty() {
            return Err(EventStoreError::Validation("aggregate id is empty".into()));
        }
        if self.events.is_empty() {
            return Err(EventStoreError::Validation(format!(
                "no events to append for {}",
                self.aggregate_id
            )));
        }
        if self.expected_version < 0 {
            return Err(EventStoreError::Validation(format!(
                "negative expected version {}",
                self.expected_version
            )));
        }

        let fits = i64::try_from(self.events.len())
            .ok()
            .and_then(|len| self.expected_version.checked_add(len))
            .is_some();
        if !fits {
            return Err(EventStoreError::Validation(format!(
                "{} events after version {} overflow the version counter",
                self.events.len(),
                self.expected_version
            )));
        }

        // Cannot overflow: bounded by expected_version + len, checked above
        for (offset, event) in self.events.iter().enumerate() {
            if event.aggregate_id != self.aggregate_id {
                return Err(EventStoreError::Validation(format!(
                    "event for aggregate {} in append for {}",
                    event.aggregate_id, self.aggregate_id
                )));
            }
            let expected = self.expected_version + 1 + offset as i64;
            if event.version != expected {
                return Err(EventStoreError::Validation(format!(
                    "event version {} out of sequence, expected {}",
                    event.version, expected
                )));
            }
        }

        for property in &self.unique_properties {
            if property.name.is_empty() {
                return Err(EventStoreError::Validation("unique property name is empty".into()));
            }
        }

        Ok(())
    }

    /// Log and outbox rows this request writes, in version order
    pub(crate) fn to_persistent_events(&self) -> Vec<PersistentEvent> {
        self.events
            .iter()
            .map(|event| PersistentEvent::from_new(&self.aggregate_type, event, &self.context))
            .collect()
    }
}

/// Outcome of removing one pending row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// A concurrent drain already removed the row
    AlreadyGone,
}
