//! Outbox Publisher
//!
//! Drains pending events to the transport, one ordered batch per aggregate.
//! Overlapping drains of the same aggregate are tolerated: a row already
//! deleted by another drain counts as delivered.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::event_store::{AggregateKey, DeleteOutcome, OutboxStore};

use super::{Envelope, MessageTransport, OutboxError};

/// Distinct aggregates fetched per sweep pass
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 1000;

/// A flush that failed during a sweep
#[derive(Debug)]
pub struct FlushFailure {
    pub aggregate: AggregateKey,
    pub error: OutboxError,
}

/// Result of a system-wide sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Passes that found work
    pub passes: u32,
    pub aggregates_flushed: u64,
    pub events_published: u64,
    pub failures: Vec<FlushFailure>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Publishes outbox rows through a message transport
#[derive(Clone)]
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn MessageTransport>,
    batch_size: usize,
}

impl std::fmt::Debug for OutboxPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxPublisher")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>, transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            store,
            transport,
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }

    /// Override the number of aggregates handled per sweep pass
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Deliver every pending event of one aggregate, then delete the rows.
    ///
    /// Returns the number of events handed to the transport. On transport
    /// failure nothing is deleted.
    pub async fn flush_pending_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        cancel: &CancellationToken,
    ) -> Result<usize, OutboxError> {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }

        let pending = self
            .store
            .load_pending_events(aggregate_type, aggregate_id)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let envelopes: Vec<Envelope> = pending.iter().map(Envelope::from).collect();
        self.transport
            .send(envelopes, cancel)
            .await
            .map_err(|source| OutboxError::Transport {
                aggregate: AggregateKey::new(aggregate_type, aggregate_id),
                source,
            })?;

        for event in &pending {
            let outcome = self
                .store
                .delete_pending_event(aggregate_type, aggregate_id, event.version)
                .await?;

            if outcome == DeleteOutcome::AlreadyGone {
                tracing::debug!(
                    aggregate_type,
                    aggregate_id,
                    version = event.version,
                    "Pending event already removed by a concurrent drain"
                );
            }
        }

        tracing::debug!(
            aggregate_type,
            aggregate_id,
            events = pending.len(),
            "Pending events published"
        );

        Ok(pending.len())
    }

    /// Drain the whole outbox in bounded passes.
    ///
    /// Each pass takes up to `batch_size` aggregates with pending rows and
    /// flushes them concurrently. Aggregates whose flush failed are skipped
    /// for the rest of the sweep; their rows stay pending for the next one.
    /// The sweep ends when a pass finds nothing else to flush.
    pub async fn flush_all_pending_events(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SweepReport, OutboxError> {
        let mut report = SweepReport::default();
        let mut failed: HashSet<AggregateKey> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                return Err(OutboxError::Cancelled);
            }

            let batch: Vec<AggregateKey> = self
                .store
                .find_aggregates_with_pending_events(self.batch_size.saturating_add(failed.len()))
                .await?
                .into_iter()
                .filter(|key| !failed.contains(key))
                .take(self.batch_size)
                .collect();
            if batch.is_empty() {
                break;
            }

            report.passes += 1;

            let results = join_all(batch.iter().map(|key| {
                self.flush_pending_events(&key.aggregate_type, &key.aggregate_id, cancel)
            }))
            .await;

            for (key, result) in batch.into_iter().zip(results) {
                match result {
                    Ok(published) => {
                        report.aggregates_flushed += 1;
                        report.events_published += published as u64;
                    }
                    // Picked up by the check at the top of the next pass
                    Err(error) if error.is_cancelled() && cancel.is_cancelled() => {}
                    Err(error) => {
                        tracing::warn!(aggregate = %key, error = %error, "Outbox flush failed");
                        failed.insert(key.clone());
                        report.failures.push(FlushFailure {
                            aggregate: key,
                            error,
                        });
                    }
                }
            }
        }

        if report.events_published > 0 {
            tracing::info!(
                passes = report.passes,
                aggregates = report.aggregates_flushed,
                events = report.events_published,
                failures = report.failures.len(),
                "Outbox sweep finished"
            );
        }

        Ok(report)
    }
}
