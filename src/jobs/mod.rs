//! Scheduled Jobs
//!
//! Background sweep that catches every outbox row not published inline.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::outbox::{OutboxError, OutboxPublisher, SweepReport};

/// Configuration for the outbox sweeper
#[derive(Debug, Clone)]
pub struct OutboxSweeperConfig {
    /// Interval between sweeps (default: 5 seconds)
    pub sweep_interval: Duration,
}

impl Default for OutboxSweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Outbox Sweeper - periodically drains the whole outbox
pub struct OutboxSweeper {
    publisher: OutboxPublisher,
    config: OutboxSweeperConfig,
}

impl OutboxSweeper {
    /// Create a new sweeper with the default interval
    pub fn new(publisher: OutboxPublisher) -> Self {
        Self {
            publisher,
            config: OutboxSweeperConfig::default(),
        }
    }

    /// Create with custom configuration
    pub fn with_config(publisher: OutboxPublisher, config: OutboxSweeperConfig) -> Self {
        Self { publisher, config }
    }

    /// Start the sweeper in the background.
    /// The loop exits once `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    /// Run the sweep loop
    async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_ms = self.config.sweep_interval.as_millis() as u64,
            batch_size = self.publisher.batch_size(),
            "Outbox sweeper started"
        );

        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_once(&cancel).await;
                    for error in &report.errors {
                        tracing::error!(error = %error, "Outbox sweep failed");
                    }
                }
            }
        }

        tracing::info!("Outbox sweeper stopped");
    }

    /// Run one sweep (for manual trigger or testing)
    pub async fn run_once(&self, cancel: &CancellationToken) -> SweepRunReport {
        let mut report = SweepRunReport::default();

        match self.publisher.flush_all_pending_events(cancel).await {
            Ok(sweep) => report.absorb(sweep),
            Err(OutboxError::Cancelled) => report.cancelled = true,
            Err(e) => report.errors.push(e.to_string()),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running one sweep
#[derive(Debug, Clone, Default)]
pub struct SweepRunReport {
    pub passes: u32,
    pub events_published: u64,
    pub aggregates_flushed: u64,
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub completed_at: DateTime<Utc>,
}

impl SweepRunReport {
    fn absorb(&mut self, sweep: SweepReport) {
        self.passes = sweep.passes;
        self.events_published = sweep.events_published;
        self.aggregates_flushed = sweep.aggregates_flushed;
        self.errors.extend(
            sweep
                .failures
                .into_iter()
                .map(|failure| format!("{}: {}", failure.aggregate, failure.error)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::context::OperationContext;
    use crate::event_store::{AppendRequest, EventStore, InMemoryEventStore, NewEvent, OutboxStore};
    use crate::outbox::ChannelTransport;

    async fn seeded_store(aggregates: usize) -> Arc<InMemoryEventStore> {
        let store = Arc::new(InMemoryEventStore::new());
        for i in 0..aggregates {
            let id = format!("agg-{i}");
            let events = vec![NewEvent::new(&id, 1, "Created", serde_json::json!({}))];
            store
                .append(AppendRequest::new("Test", &id, 0, events, OperationContext::new()))
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn test_sweeper_config_default() {
        let config = OutboxSweeperConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_sweep_run_report_default() {
        let report = SweepRunReport::default();
        assert_eq!(report.events_published, 0);
        assert!(report.errors.is_empty());
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_run_once_drains_outbox() {
        let store = seeded_store(3).await;
        let (transport, mut receiver) = ChannelTransport::new(16);
        let publisher = OutboxPublisher::new(store.clone(), Arc::new(transport));
        let sweeper = OutboxSweeper::new(publisher);

        let report = sweeper.run_once(&CancellationToken::new()).await;

        assert_eq!(report.events_published, 3);
        assert!(report.errors.is_empty());
        assert_eq!(store.count_pending_events().await.unwrap(), 0);
        let mut batches = 0;
        while receiver.try_recv().is_ok() {
            batches += 1;
        }
        assert_eq!(batches, 3);
    }

    #[tokio::test]
    async fn test_run_once_reports_cancellation() {
        let store = seeded_store(1).await;
        let (transport, _receiver) = ChannelTransport::new(16);
        let sweeper = OutboxSweeper::new(OutboxPublisher::new(store.clone(), Arc::new(transport)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = sweeper.run_once(&cancel).await;

        assert!(report.cancelled);
        assert_eq!(store.count_pending_events().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_started_sweeper_stops_on_cancel() {
        let store = seeded_store(2).await;
        let (transport, mut receiver) = ChannelTransport::new(16);
        let config = OutboxSweeperConfig {
            sweep_interval: Duration::from_millis(10),
        };
        let sweeper = OutboxSweeper::with_config(
            OutboxPublisher::new(store.clone(), Arc::new(transport)),
            config,
        );
        let cancel = CancellationToken::new();
        let handle = sweeper.start(cancel.clone());

        receiver.recv().await.unwrap();
        receiver.recv().await.unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.count_pending_events().await.unwrap(), 0);
    }
}
