// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory FIFO shared by every producer thread.
//!
//! The lock is held only for the push or the pop itself. Record sizes are
//! computed before the lock is taken, and nothing in here ever waits on I/O.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::record::LogRecord;

/// A record together with its serialized size, computed once on enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    pub record: LogRecord,
    pub size: usize,
}

impl BufferEntry {
    #[must_use]
    pub fn new(record: LogRecord) -> Self {
        let size = record.encoded_len();
        Self { record, size }
    }
}

#[derive(Debug)]
pub struct BoundedBuffer {
    entries: Mutex<VecDeque<BufferEntry>>,
    capacity: usize,
    high_water_mark: usize,
    high_water: Notify,
}

impl BoundedBuffer {
    /// Creates a buffer holding at most `capacity` records.
    ///
    /// Whenever an enqueue leaves `high_water_mark` or more records queued,
    /// [`BoundedBuffer::high_water_reached`] resolves.
    #[must_use]
    pub fn new(capacity: usize, high_water_mark: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity,
            high_water_mark: high_water_mark.clamp(1, capacity.max(1)),
            high_water: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<BufferEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a record, returning the new length.
    ///
    /// A full buffer hands the record back untouched so the caller can divert
    /// it elsewhere.
    pub fn enqueue(&self, record: LogRecord) -> Result<usize, LogRecord> {
        self.enqueue_entry(BufferEntry::new(record))
            .map_err(|entry| entry.record)
    }

    fn enqueue_entry(&self, entry: BufferEntry) -> Result<usize, BufferEntry> {
        let len = {
            let mut entries = self.lock();
            if entries.len() >= self.capacity {
                return Err(entry);
            }
            entries.push_back(entry);
            entries.len()
        };
        if len >= self.high_water_mark {
            self.high_water.notify_one();
        }
        Ok(len)
    }

    /// Removes the longest prefix fitting in `max_bytes` and `max_count`.
    ///
    /// The first entry is always taken, even when it alone exceeds
    /// `max_bytes`, so an oversized record cannot wedge the queue.
    pub fn drain_batch(&self, max_bytes: usize, max_count: usize) -> Vec<BufferEntry> {
        let mut entries = self.lock();
        let mut batch = Vec::new();
        let mut bytes = 0;
        while batch.len() < max_count {
            let Some(size) = entries.front().map(|entry| entry.size) else {
                break;
            };
            if !batch.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            if let Some(entry) = entries.pop_front() {
                batch.push(entry);
            }
        }
        batch
    }

    /// Puts undelivered entries back at the head of the queue, in order.
    ///
    /// Only as many as currently fit are re-queued: the newest ones, which
    /// keep their place ahead of anything enqueued since. The oldest entries
    /// that do not fit are returned to the caller.
    pub fn requeue_front(&self, mut batch: Vec<BufferEntry>) -> Vec<BufferEntry> {
        let mut entries = self.lock();
        let room = self.capacity.saturating_sub(entries.len());
        let overflow_len = batch.len().saturating_sub(room);
        let requeued = batch.split_off(overflow_len);
        for entry in requeued.into_iter().rev() {
            entries.push_front(entry);
        }
        batch
    }

    /// Resolves once an enqueue crosses the high-water mark.
    pub async fn high_water_reached(&self) {
        self.high_water.notified().await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
