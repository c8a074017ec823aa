// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The sink handed to the host logging framework, and the lifecycle around it.
//!
//! ```no_run
//! use teraops_logs::{LogEvent, LogShipper, ShipperConfig};
//!
//! # async fn run() -> Result<(), teraops_logs::errors::StartupError> {
//! let shipper = LogShipper::start(ShipperConfig::new("my-api-key")).await?;
//! shipper.accept(LogEvent::new("user signed in").with_severity("info"));
//! shipper.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::BoundedBuffer;
use crate::config::ShipperConfig;
use crate::enrichment::{Enricher, ResourceMetadata};
use crate::errors::{Fault, SpilloverError, StartupError};
use crate::flusher::Flusher;
use crate::logger;
use crate::normalizer::normalize;
use crate::record::{LogEvent, LogRecord};
use crate::redaction::Redactor;
use crate::scheduler::{FlushOutcome, Scheduler, SchedulerHandle};
use crate::spillover::SpilloverStore;
use crate::stats::{ShipperStats, StatsSnapshot};

/// Narrow capability registered with the host logging framework.
///
/// `accept` returns quickly, never fails and never panics. Whatever happens
/// to the event afterwards is reflected in the shipper's statistics only.
pub trait LogSink: Send + Sync {
    fn accept(&self, event: LogEvent);
}

/// Stages and stores shared by the producer path and the scheduler.
#[derive(Debug)]
pub(crate) struct Pipeline {
    pub(crate) enricher: Enricher,
    pub(crate) redactor: Redactor,
    pub(crate) buffer: BoundedBuffer,
    pub(crate) spillover: Option<Arc<SpilloverStore>>,
    pub(crate) flusher: Flusher,
    pub(crate) stats: ShipperStats,
    fault: RwLock<Option<Fault>>,
}

impl Pipeline {
    pub(crate) fn new(
        config: &ShipperConfig,
        flusher: Flusher,
        spillover: Option<SpilloverStore>,
    ) -> Self {
        Self {
            enricher: Enricher::new(ResourceMetadata::detect()),
            redactor: Redactor::default(),
            buffer: BoundedBuffer::new(config.max_buffer_size, config.effective_high_water_mark()),
            spillover: spillover.map(Arc::new),
            flusher,
            stats: ShipperStats::default(),
            fault: RwLock::new(None),
        }
    }

    /// Normalizes, enriches, redacts and queues one event.
    pub(crate) fn ingest(&self, event: LogEvent) {
        let Some(event) = normalize(event) else {
            self.stats.add_dropped_invalid(1);
            return;
        };
        let record = self.redactor.apply(self.enricher.enrich(event));
        self.stats.add_accepted(1);

        if let Err(record) = self.buffer.enqueue(record) {
            self.spill(vec![record]);
        }
    }

    /// Writes records the buffer cannot hold to the spillover store.
    pub(crate) fn spill(&self, records: Vec<LogRecord>) {
        let count = records.len() as u64;
        let Some(store) = &self.spillover else {
            debug!("LOGS | Buffer full and spillover disabled, dropping {} records", count);
            self.stats.add_dropped_overflow(count);
            return;
        };

        match store.append(&records) {
            Ok(outcome) => {
                self.stats.add_spilled(outcome.written as u64);
                self.stats.add_spill_evicted(outcome.evicted as u64);
                self.stats.add_dropped_overflow(outcome.dropped as u64);
            }
            Err(e) => {
                warn!("LOGS | Failed to spill {} records: {}", count, e);
                self.stats.add_dropped_overflow(count);
            }
        }
    }

    pub(crate) fn fault(&self) -> Option<Fault> {
        *self.fault.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_fault(&self, fault: Fault) {
        *self.fault.write().unwrap_or_else(PoisonError::into_inner) = Some(fault);
    }

    fn clear_fault(&self) -> Option<Fault> {
        self.fault
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A running log shipping pipeline.
///
/// Created with [`LogShipper::start`], which also spawns the background
/// scheduler on the current Tokio runtime. [`LogShipper::shutdown`] runs a
/// final bounded flush; records still buffered after it are lost, spilled
/// ones stay on disk for the next run.
#[derive(Debug)]
pub struct LogShipper {
    pipeline: Arc<Pipeline>,
    scheduler: SchedulerHandle,
    task: JoinHandle<()>,
}

impl LogShipper {
    /// Validates the configuration, optionally the API key, and starts shipping.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, on an HTTP client that cannot be
    /// built, and when the ingestion API refuses the API key. A spillover
    /// directory that cannot be used is not fatal: the shipper runs
    /// memory-only instead.
    pub async fn start(config: ShipperConfig) -> Result<Self, StartupError> {
        config.validate()?;
        if config.debug {
            logger::init_debug_logging();
        }

        let flusher = Flusher::new(&config)?;
        if config.validate_api_key {
            flusher.validate_api_key().await?;
        }

        let spillover = if config.spillover_enabled {
            open_spillover(&config).await
        } else {
            None
        };
        let spillover_dir = spillover.as_ref().map(|store| store.dir().to_path_buf());

        let pipeline = Arc::new(Pipeline::new(&config, flusher, spillover));
        let (scheduler, handle) = Scheduler::new(Arc::clone(&pipeline), &config);
        let task = tokio::spawn(scheduler.run());

        info!(
            "LOGS | Log shipper started: endpoint={}, mode={:?}, spillover={:?}",
            pipeline.flusher.endpoint(),
            config.mode,
            spillover_dir
        );

        Ok(Self {
            pipeline,
            scheduler: handle,
            task,
        })
    }

    /// Hands one event to the pipeline.
    pub fn accept(&self, event: LogEvent) {
        self.pipeline.ingest(event);
    }

    /// Runs a delivery cycle now and waits for it.
    pub async fn force_flush(&self) -> FlushOutcome {
        match self.scheduler.flush().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("LOGS | {}", e);
                FlushOutcome::Failed
            }
        }
    }

    /// Stops the scheduler after its final flush.
    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        if let Err(e) = self.task.await {
            error!("LOGS | Scheduler task failed: {}", e);
        }
        let stats = self.pipeline.stats.snapshot();
        debug!(
            "LOGS | Log shipper stopped: accepted={}, delivered={}, spilled={}, dropped={}",
            stats.accepted,
            stats.delivered,
            stats.spilled,
            stats.dropped_invalid + stats.dropped_overflow + stats.spill_evicted
        );
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.pipeline.stats.snapshot()
    }

    /// The condition suspending delivery, if any.
    #[must_use]
    pub fn fault(&self) -> Option<Fault> {
        self.pipeline.fault()
    }

    /// Replaces the API key and resumes a delivery suspended by an auth fault.
    pub fn set_api_key(&self, api_key: impl Into<String>) {
        self.pipeline.flusher.set_api_key(api_key.into());
        if let Some(fault) = self.pipeline.clear_fault() {
            info!("LOGS | API key replaced, resuming delivery after: {}", fault);
        }
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.pipeline.buffer.len()
    }

    #[must_use]
    pub fn spilled_len(&self) -> usize {
        self.pipeline
            .spillover
            .as_ref()
            .map_or(0, |store| store.len())
    }
}

impl LogSink for LogShipper {
    fn accept(&self, event: LogEvent) {
        LogShipper::accept(self, event);
    }
}

async fn open_spillover(config: &ShipperConfig) -> Option<SpilloverStore> {
    let dir = config.spillover_dir();
    let max_bytes = config.max_spillover_bytes;
    let segment_bytes = config.spillover_segment_bytes;
    let opened = tokio::task::spawn_blocking(move || {
        match SpilloverStore::open(&dir, max_bytes, segment_bytes) {
            Err(SpilloverError::Locked(_)) => {
                // Another process owns the shared directory, keep ours apart.
                let own = dir.join(format!("process-{}", std::process::id()));
                warn!(
                    "LOGS | Spillover directory {} is in use, falling back to {}",
                    dir.display(),
                    own.display()
                );
                SpilloverStore::open(own, max_bytes, segment_bytes)
            }
            opened => opened,
        }
    })
    .await;
    match opened {
        Ok(Ok(store)) => {
            if !store.is_empty() {
                info!(
                    "LOGS | Recovered {} spilled records from {}",
                    store.len(),
                    store.dir().display()
                );
            }
            Some(store)
        }
        Ok(Err(e)) => {
            warn!("LOGS | Spillover unavailable, degrading to memory-only: {}", e);
            None
        }
        Err(e) => {
            error!("LOGS | Failed to open spillover store: {}", e);
            None
        }
    }
}
