//! Common test utilities

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use event_outbox::aggregate::{Aggregate, DomainEvent, FnFactory, SNAPSHOT_INTERVAL};
use event_outbox::event_store::{
    AggregateKey, AggregateVersion, AppendRequest, DeleteOutcome, EventStore, EventStoreError,
    InMemoryEventStore, NewEvent, OutboxStore, PendingEvent, PersistentEvent, UniqueProperty,
};
use event_outbox::outbox::{Envelope, MessageTransport, TransportError};
use event_outbox::snapshot::{Snapshot, SnapshotStore};
use event_outbox::OperationContext;

// =========================================================================
// User aggregate fixture
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UserEvent {
    UserRegistered { username: String, email: String },
    DisplayNameChanged { display_name: String },
    UserDeactivated { reason: Option<String> },
}

impl DomainEvent for UserEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UserEvent::UserRegistered { .. } => "UserRegistered",
            UserEvent::DisplayNameChanged { .. } => "DisplayNameChanged",
            UserEvent::UserDeactivated { .. } => "UserDeactivated",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub active: bool,
    pub renames: u32,
}

#[derive(Debug)]
pub struct User {
    id: String,
    version: i64,
    state: UserState,
    pending: Vec<UserEvent>,
    snapshot_every: i64,
    /// Events applied through replay since construction
    pub replayed: usize,
}

impl User {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: 0,
            state: UserState::default(),
            pending: Vec::new(),
            snapshot_every: SNAPSHOT_INTERVAL,
            replayed: 0,
        }
    }

    pub fn restore(id: &str, version: i64, state: UserState) -> Self {
        Self {
            version,
            state,
            ..Self::new(id)
        }
    }

    pub fn register(id: &str, username: &str, email: &str) -> Self {
        let mut user = Self::new(id);
        user.raise(UserEvent::UserRegistered {
            username: username.to_string(),
            email: email.to_string(),
        });
        user
    }

    pub fn with_snapshot_every(mut self, every: i64) -> Self {
        self.snapshot_every = every;
        self
    }

    pub fn rename(&mut self, display_name: &str) {
        self.raise(UserEvent::DisplayNameChanged {
            display_name: display_name.to_string(),
        });
    }

    pub fn deactivate(&mut self, reason: Option<&str>) {
        self.raise(UserEvent::UserDeactivated {
            reason: reason.map(str::to_string),
        });
    }

    fn raise(&mut self, event: UserEvent) {
        self.mutate(&event);
        self.version += 1;
        self.pending.push(event);
    }

    fn mutate(&mut self, event: &UserEvent) {
        match event {
            UserEvent::UserRegistered { username, email } => {
                self.state.username = username.clone();
                self.state.email = email.clone();
                self.state.active = true;
            }
            UserEvent::DisplayNameChanged { display_name } => {
                self.state.display_name = Some(display_name.clone());
                self.state.renames += 1;
            }
            UserEvent::UserDeactivated { .. } => {
                self.state.active = false;
            }
        }
    }
}

impl Aggregate for User {
    type Event = UserEvent;
    type State = UserState;

    fn aggregate_type() -> &'static str {
        "User"
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: UserEvent) {
        self.mutate(&event);
        self.version += 1;
        self.replayed += 1;
    }

    fn pending_events(&self) -> &[UserEvent] {
        &self.pending
    }

    fn clear_pending_events(&mut self) {
        self.pending.clear();
    }

    fn state(&self) -> &UserState {
        &self.state
    }

    fn unique_properties(&self) -> Vec<UniqueProperty> {
        if self.state.email.is_empty() {
            return Vec::new();
        }
        vec![UniqueProperty::new("email", &self.state.email)]
    }

    fn should_snapshot(&self) -> bool {
        self.version > 0 && self.version % self.snapshot_every == 0
    }
}

pub type UserFactory = FnFactory<fn(&str) -> User, fn(&str, i64, UserState) -> User>;

pub fn user_factory() -> UserFactory {
    FnFactory::new(User::new as fn(&str) -> User, User::restore as fn(&str, i64, UserState) -> User)
}

// =========================================================================
// Event store helpers
// =========================================================================

pub fn context() -> OperationContext {
    OperationContext::new()
        .with_operation_id(uuid::Uuid::new_v4())
        .with_correlation_id(uuid::Uuid::new_v4())
        .with_contributor("integration-test")
}

/// Build an append of `count` events for `id` starting after `expected`
pub fn append_request(aggregate_type: &str, id: &str, expected: i64, count: i64) -> AppendRequest {
    let events = (1..=count)
        .map(|offset| {
            NewEvent::new(
                id,
                expected + offset,
                "Ticked",
                serde_json::json!({ "tick": expected + offset }),
            )
        })
        .collect();
    AppendRequest::new(aggregate_type, id, expected, events, context())
}

/// Event store wrapper that records every `load_events` call
pub struct RecordingEventStore {
    inner: Arc<InMemoryEventStore>,
    loads: Mutex<Vec<(String, i64, usize)>>,
}

impl RecordingEventStore {
    pub fn new(inner: Arc<InMemoryEventStore>) -> Self {
        Self {
            inner,
            loads: Mutex::new(Vec::new()),
        }
    }

    /// (aggregate id, from_version, events returned) per call
    pub fn loads(&self) -> Vec<(String, i64, usize)> {
        self.loads.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStore for RecordingEventStore {
    async fn append(&self, request: AppendRequest) -> Result<i64, EventStoreError> {
        self.inner.append(request).await
    }

    async fn load_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from_version: i64,
    ) -> Result<Vec<PersistentEvent>, EventStoreError> {
        let events = self
            .inner
            .load_events(aggregate_type, aggregate_id, from_version)
            .await?;
        self.loads
            .lock()
            .unwrap()
            .push((aggregate_id.to_string(), from_version, events.len()));
        Ok(events)
    }

    async fn find_id_by_unique_indexed_property(
        &self,
        aggregate_type: &str,
        property_name: &str,
        property_value: &str,
    ) -> Result<Option<String>, EventStoreError> {
        self.inner
            .find_id_by_unique_indexed_property(aggregate_type, property_name, property_value)
            .await
    }

    async fn load_version(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<AggregateVersion>, EventStoreError> {
        self.inner.load_version(aggregate_type, aggregate_id).await
    }
}

/// Outbox store whose row deletes fail with a transient error
pub struct FailingDeleteStore {
    inner: Arc<InMemoryEventStore>,
}

impl FailingDeleteStore {
    pub fn new(inner: Arc<InMemoryEventStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl OutboxStore for FailingDeleteStore {
    async fn load_pending_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<PendingEvent>, EventStoreError> {
        self.inner.load_pending_events(aggregate_type, aggregate_id).await
    }

    async fn delete_pending_event(
        &self,
        _aggregate_type: &str,
        _aggregate_id: &str,
        _version: i64,
    ) -> Result<DeleteOutcome, EventStoreError> {
        Err(EventStoreError::TransientStorage("connection reset".into()))
    }

    async fn find_aggregates_with_pending_events(
        &self,
        limit: usize,
    ) -> Result<Vec<AggregateKey>, EventStoreError> {
        self.inner.find_aggregates_with_pending_events(limit).await
    }

    async fn count_pending_events(&self) -> Result<u64, EventStoreError> {
        self.inner.count_pending_events().await
    }
}

/// Snapshot store whose writes always fail
pub struct FailingSnapshotStore;

#[async_trait]
impl SnapshotStore for FailingSnapshotStore {
    async fn find(
        &self,
        _aggregate_type: &str,
        _aggregate_id: &str,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        Ok(None)
    }

    async fn save(&self, _snapshot: Snapshot) -> Result<(), EventStoreError> {
        Err(EventStoreError::TransientStorage("snapshot table unavailable".into()))
    }
}

// =========================================================================
// Transport fixture
// =========================================================================

/// Transport that records batches and can fail chosen aggregates
#[derive(Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<Vec<Envelope>>>,
    failing: Mutex<HashSet<String>>,
    barrier: Option<Barrier>,
    calls: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every send until `parties` sends are in flight
    pub fn with_barrier(parties: usize) -> Self {
        Self {
            barrier: Some(Barrier::new(parties)),
            ..Self::default()
        }
    }

    pub fn fail_for(&self, aggregate_id: &str) {
        self.failing.lock().unwrap().insert(aggregate_id.to_string());
    }

    pub fn recover(&self, aggregate_id: &str) {
        self.failing.lock().unwrap().remove(aggregate_id);
    }

    pub fn batches(&self) -> Vec<Vec<Envelope>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered_events(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn send(
        &self,
        envelopes: Vec<Envelope>,
        _cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }

        let failing = envelopes
            .first()
            .map(|e| self.failing.lock().unwrap().contains(&e.aggregate_id))
            .unwrap_or(false);
        if failing {
            return Err(TransportError::Unavailable("broker down".into()));
        }

        self.batches.lock().unwrap().push(envelopes);
        Ok(())
    }
}

/// Transport that fires the token mid-send, as a shutdown would
pub struct CancellingTransport {
    cancel: CancellationToken,
    calls: AtomicUsize,
}

impl CancellingTransport {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageTransport for CancellingTransport {
    async fn send(
        &self,
        _envelopes: Vec<Envelope>,
        _cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        Err(TransportError::Cancelled)
    }
}
