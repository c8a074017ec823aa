// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background task that turns buffered and spilled records into batches.
//!
//! The scheduler owns the only delivery path: one batch is in flight at a
//! time. A cycle runs on every flush interval tick, whenever the buffer
//! crosses its high-water mark, and on an explicit flush request.
//!
//! Each cycle drains the buffer first, then tops the batch up from the
//! spillover store while the byte budget allows. On success the spilled part
//! is committed. On failure the spilled part is rolled back and the buffered
//! part is put back at the head of the buffer, or spilled when it no longer
//! fits.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::buffer::BufferEntry;
use crate::config::ShipperConfig;
use crate::constants::MAX_BATCH_RECORDS;
use crate::errors::{Fault, SpilloverError};
use crate::flusher::ShipOutcome;
use crate::record::LogRecord;
use crate::shipper::Pipeline;
use crate::spillover::{SpilledBatch, SpilloverStore};

/// Result of one scheduler cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered or spilled.
    Idle,
    /// The batch was answered. `records` were acknowledged.
    Delivered { records: usize },
    /// The batch could not be delivered and was kept for a later cycle.
    Failed,
    /// Delivery is suspended until the API key is replaced.
    Suspended,
}

#[derive(Debug)]
pub(crate) enum SchedulerCommand {
    Flush(oneshot::Sender<FlushOutcome>),
}

#[derive(Clone, Debug)]
pub(crate) struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Runs a cycle now and waits for its outcome.
    pub(crate) async fn flush(&self) -> Result<FlushOutcome, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {e}"))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {e}"))
    }

    /// Asks the scheduler to run its final drain and stop.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub(crate) struct Scheduler {
    pipeline: Arc<Pipeline>,
    flush_interval: Duration,
    max_batch_bytes: usize,
    shutdown_timeout: Duration,
    rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    cancel: CancellationToken,
}

impl Scheduler {
    #[must_use]
    pub(crate) fn new(pipeline: Arc<Pipeline>, config: &ShipperConfig) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let scheduler = Self {
            pipeline,
            flush_interval: config.flush_interval,
            max_batch_bytes: config.max_payload_bytes,
            shutdown_timeout: config.shutdown_timeout,
            rx,
            cancel: cancel.clone(),
        };
        (scheduler, SchedulerHandle { tx, cancel })
    }

    pub(crate) async fn run(mut self) {
        debug!("LOGS | Scheduler started");
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        // After a failed cycle, wait for the next tick instead of reacting to
        // every enqueue above the high-water mark.
        let mut backing_off = false;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    backing_off = !self.cycle_succeeded().await;
                }
                () = self.pipeline.buffer.high_water_reached(), if !backing_off => {
                    backing_off = !self.cycle_succeeded().await;
                    ticker.reset();
                }
                command = self.rx.recv() => match command {
                    Some(SchedulerCommand::Flush(response_tx)) => {
                        let outcome = self.flush_cycle().await;
                        backing_off = matches!(outcome, FlushOutcome::Failed | FlushOutcome::Suspended);
                        if response_tx.send(outcome).is_err() {
                            debug!("LOGS | Flush requester went away before the outcome was ready");
                        }
                    }
                    None => break,
                },
            }
        }

        self.final_drain().await;
        debug!("LOGS | Scheduler stopped");
    }

    async fn cycle_succeeded(&self) -> bool {
        matches!(
            self.flush_cycle().await,
            FlushOutcome::Idle | FlushOutcome::Delivered { .. }
        )
    }

    /// Sends what is left in the buffer, within the shutdown budget.
    async fn final_drain(&self) {
        let drain = async {
            loop {
                match self.flush_cycle().await {
                    FlushOutcome::Delivered { .. } if !self.pipeline.buffer.is_empty() => {}
                    _ => break,
                }
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!(
                "LOGS | Final flush timed out after {} ms, {} buffered records were not sent",
                self.shutdown_timeout.as_millis(),
                self.pipeline.buffer.len()
            );
        }
        let remaining = self.pipeline.buffer.len();
        if remaining > 0 {
            warn!(
                "LOGS | Shutting down with {} undelivered buffered records",
                remaining
            );
        }
    }

    /// Runs one drain, ship and settle cycle.
    pub(crate) async fn flush_cycle(&self) -> FlushOutcome {
        if let Some(fault) = self.pipeline.fault() {
            debug!("LOGS | Skipping flush: {}", fault);
            return FlushOutcome::Suspended;
        }

        let entries = self
            .pipeline
            .buffer
            .drain_batch(self.max_batch_bytes, MAX_BATCH_RECORDS);
        let buffered_bytes: usize = entries.iter().map(|entry| entry.size).sum();

        let spilled = if buffered_bytes < self.max_batch_bytes {
            let budget = (self.max_batch_bytes - buffered_bytes) as u64;
            self.peek_spillover(budget).await
        } else {
            None
        };

        let spilled_count = spilled.as_ref().map_or(0, |batch| batch.records.len());
        if entries.is_empty() && spilled_count == 0 {
            if let Some(batch) = spilled {
                self.settle_spillover(batch, true).await;
            }
            return FlushOutcome::Idle;
        }

        let time = Instant::now();
        let records = entries
            .iter()
            .map(|entry| &entry.record)
            .chain(spilled.iter().flat_map(|batch| batch.records.iter()));
        let outcome = self.pipeline.flusher.ship(records).await;

        match outcome {
            ShipOutcome::Delivered {
                delivered,
                rejected,
            } => {
                self.pipeline.stats.add_delivered(delivered as u64);
                self.pipeline.stats.add_rejected(rejected as u64);
                if let Some(batch) = spilled {
                    self.settle_spillover(batch, true).await;
                }
                debug!(
                    "LOGS | Flushed {} buffered and {} spilled records in {} ms",
                    entries.len(),
                    spilled_count,
                    time.elapsed().as_millis()
                );
                FlushOutcome::Delivered { records: delivered }
            }
            ShipOutcome::Failed => {
                self.keep_undelivered(entries, spilled).await;
                FlushOutcome::Failed
            }
            ShipOutcome::Unauthorized(status) => {
                self.pipeline.set_fault(Fault::Unauthorized { status });
                self.keep_undelivered(entries, spilled).await;
                FlushOutcome::Suspended
            }
        }
    }

    async fn keep_undelivered(&self, entries: Vec<BufferEntry>, spilled: Option<SpilledBatch>) {
        self.pipeline.stats.add_failed_batches(1);
        if let Some(batch) = spilled {
            self.settle_spillover(batch, false).await;
        }

        let total = entries.len();
        let overflow = self.pipeline.buffer.requeue_front(entries);
        self.pipeline
            .stats
            .add_requeued((total - overflow.len()) as u64);
        if overflow.is_empty() {
            return;
        }

        let records: Vec<LogRecord> = overflow.into_iter().map(|entry| entry.record).collect();
        let pipeline = Arc::clone(&self.pipeline);
        if let Err(e) = tokio::task::spawn_blocking(move || pipeline.spill(records)).await {
            error!("LOGS | Failed to spill undelivered records: {}", e);
        }
    }

    async fn peek_spillover(&self, budget: u64) -> Option<SpilledBatch> {
        let result = self
            .with_spillover(move |store| store.peek_batch(budget))
            .await?;
        match result {
            Ok(batch) => batch,
            Err(SpilloverError::PeekInFlight) => None,
            Err(e) => {
                warn!("LOGS | Failed to read spilled records: {}", e);
                None
            }
        }
    }

    async fn settle_spillover(&self, batch: SpilledBatch, delivered: bool) {
        let token = batch.token;
        if !delivered {
            if let Some(store) = &self.pipeline.spillover {
                store.rollback(token);
            }
            return;
        }
        if let Some(Err(e)) = self.with_spillover(move |store| store.commit(token)).await {
            warn!("LOGS | Failed to delete delivered spillover segments: {}", e);
        }
    }

    async fn with_spillover<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&SpilloverStore) -> T + Send + 'static,
    {
        let store = Arc::clone(self.pipeline.spillover.as_ref()?);
        match tokio::task::spawn_blocking(move || f(&store)).await {
            Ok(value) => Some(value),
            Err(e) => {
                error!("LOGS | Spillover task failed: {}", e);
                None
            }
        }
    }
}
