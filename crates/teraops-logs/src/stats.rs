// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters describing what the pipeline did with the records it was given.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ShipperStats {
    accepted: AtomicU64,
    dropped_invalid: AtomicU64,
    spilled: AtomicU64,
    spill_evicted: AtomicU64,
    dropped_overflow: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
    failed_batches: AtomicU64,
    requeued: AtomicU64,
}

/// Point-in-time copy of [`ShipperStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Records that passed normalization and entered the pipeline.
    pub accepted: u64,
    /// Events rejected by normalization.
    pub dropped_invalid: u64,
    /// Records written to the spillover store.
    pub spilled: u64,
    /// Spilled records evicted to respect the disk budget.
    pub spill_evicted: u64,
    /// Records lost because neither the buffer nor the spillover store could take them.
    pub dropped_overflow: u64,
    /// Records acknowledged by the ingestion API.
    pub delivered: u64,
    /// Records in chunks permanently refused with a 4xx.
    pub rejected: u64,
    /// Batches that exhausted their retries or hit an auth failure.
    pub failed_batches: u64,
    /// Records put back in the buffer after a failed batch.
    pub requeued: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl ShipperStats {
            $(
                pub(crate) fn $name(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*

            #[must_use]
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    add_accepted => accepted,
    add_dropped_invalid => dropped_invalid,
    add_spilled => spilled,
    add_spill_evicted => spill_evicted,
    add_dropped_overflow => dropped_overflow,
    add_delivered => delivered,
    add_rejected => rejected,
    add_failed_batches => failed_batches,
    add_requeued => requeued,
}
