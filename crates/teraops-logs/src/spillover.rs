// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-backed overflow queue for records the in-memory buffer cannot hold.
//!
//! Records are appended as JSON lines to segment files named
//! `spillover-<seq>.jsonl`, where `seq` is a zero-padded, monotonically
//! increasing sequence number. Lexicographic order of the file names is
//! creation order, so recovery after a restart is a directory scan and a sort.
//!
//! ```text
//!   oldest                                          newest
//!   ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐
//!   │ seq 7      │ │ seq 8      │ │ seq 9      │ │ seq 10     │ <- writer
//!   │ in flight  │ │ sealed     │ │ sealed     │ │ open       │
//!   └────────────┘ └────────────┘ └────────────┘ └────────────┘
//!        ^ read cursor: peek -> commit | rollback
//! ```
//!
//! Reads work on whole segments. A peek hands out every record of the
//! selected segments and marks them in flight; a commit deletes their files,
//! a rollback makes them visible again in their original place.
//!
//! A store holds an advisory lock on its directory for as long as it is
//! open, so two stores never share segment files.
//!
//! The total size of all segments never exceeds the configured budget. When
//! an append would cross it, the oldest data is evicted first. Segments that
//! are in flight are only evicted once every newer sealed segment is gone.

use fslock::LockFile;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::errors::SpilloverError;
use crate::record::LogRecord;

const SEGMENT_PREFIX: &str = "spillover-";
const SEGMENT_SUFFIX: &str = ".jsonl";
const WRITE_CHECK_FILE: &str = ".spillover-write-check";
const LOCK_FILE: &str = "spillover.lock";

/// Handle to a set of peeked segments, consumed by commit or rollback.
#[derive(Debug, PartialEq, Eq)]
pub struct PeekToken {
    id: u64,
    seqs: Vec<u64>,
}

/// Records read from disk, in FIFO order, plus the token that settles them.
#[derive(Debug)]
pub struct SpilledBatch {
    pub records: Vec<LogRecord>,
    pub token: PeekToken,
}

/// What an append did to the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Records written to disk.
    pub written: usize,
    /// Previously spilled records evicted to make room.
    pub evicted: usize,
    /// Records larger than the whole budget, discarded.
    pub dropped: usize,
}

#[derive(Debug)]
struct Segment {
    seq: u64,
    path: PathBuf,
    bytes: u64,
    records: usize,
    in_flight: bool,
}

#[derive(Debug)]
struct Writer {
    seq: u64,
    file: File,
}

#[derive(Debug, Default)]
struct State {
    segments: VecDeque<Segment>,
    writer: Option<Writer>,
    next_seq: u64,
    total_bytes: u64,
    in_flight: Option<u64>,
    next_token: u64,
}

/// Exclusive lock on a store directory, released on drop.
struct DirLock(LockFile);

impl fmt::Debug for DirLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DirLock")
    }
}

#[derive(Debug)]
pub struct SpilloverStore {
    dir: PathBuf,
    max_bytes: u64,
    segment_bytes: u64,
    state: Mutex<State>,
    _lock: DirLock,
}

impl SpilloverStore {
    /// Opens the store in `dir`, recovering segments left by a previous run.
    ///
    /// Trailing partial lines (a write torn by a crash) are cut off. Empty
    /// segments are removed. If the recovered data exceeds `max_bytes`, the
    /// oldest segments are evicted right away.
    ///
    /// # Errors
    ///
    /// Returns [`SpilloverError::Unwritable`] when the directory cannot be
    /// created or written to, [`SpilloverError::Locked`] when another store
    /// already holds it, and [`SpilloverError::Io`] when scanning fails.
    pub fn open(
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        segment_bytes: u64,
    ) -> Result<Self, SpilloverError> {
        let dir = dir.into();
        let lock = lock_dir(&dir)?;
        ensure_writable(&dir)?;

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(seq) = segment_seq(&path) {
                found.push((seq, path));
            }
        }
        found.sort_unstable_by_key(|(seq, _)| *seq);

        let mut state = State::default();
        for (seq, path) in found {
            state.next_seq = seq + 1;
            let (bytes, records) = recover_segment(&path)?;
            if records == 0 {
                remove_segment_file(&path);
                continue;
            }
            state.total_bytes += bytes;
            state.segments.push_back(Segment {
                seq,
                path,
                bytes,
                records,
                in_flight: false,
            });
        }

        let store = Self {
            dir,
            max_bytes,
            segment_bytes: segment_bytes.max(1),
            state: Mutex::new(state),
            _lock: lock,
        };

        {
            let mut state = store.lock();
            let mut evicted = 0;
            while state.total_bytes > store.max_bytes {
                match evict_oldest(&mut state) {
                    Some(records) => evicted += records,
                    None => break,
                }
            }
            if !state.segments.is_empty() {
                debug!(
                    "LOGS | Recovered {} spilled records in {} segments ({} bytes) from {}",
                    state.segments.iter().map(|s| s.records).sum::<usize>(),
                    state.segments.len(),
                    state.total_bytes,
                    store.dir.display()
                );
            }
            if evicted > 0 {
                warn!(
                    "LOGS | Evicted {} recovered spilled records to stay within {} bytes",
                    evicted, store.max_bytes
                );
            }
        }

        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends records in order, evicting the oldest spilled data if needed.
    ///
    /// # Errors
    ///
    /// Fails when a record cannot be encoded or the segment cannot be
    /// written. Records appended before the failure stay on disk.
    pub fn append(&self, records: &[LogRecord]) -> Result<AppendOutcome, SpilloverError> {
        let mut lines = Vec::with_capacity(records.len());
        for record in records {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            lines.push(line);
        }

        let mut outcome = AppendOutcome::default();
        let mut state = self.lock();
        for line in lines {
            let len = line.len() as u64;
            if len > self.max_bytes {
                outcome.dropped += 1;
                continue;
            }

            while state.total_bytes + len > self.max_bytes {
                match evict_oldest(&mut state) {
                    Some(records) => outcome.evicted += records,
                    None => break,
                }
            }

            let needs_rotation = match (&state.writer, state.segments.back()) {
                (Some(writer), Some(open)) if open.seq == writer.seq => {
                    open.bytes > 0 && open.bytes + len > self.segment_bytes
                }
                _ => true,
            };
            if needs_rotation {
                self.rotate(&mut state)?;
            }

            let Some(writer) = state.writer.as_mut() else {
                continue;
            };
            if let Err(e) = writer.file.write_all(&line) {
                discard_torn_tail(&mut state);
                return Err(e.into());
            }
            if let Some(open) = state.segments.back_mut() {
                open.bytes += len;
                open.records += 1;
            }
            state.total_bytes += len;
            outcome.written += 1;
        }

        if outcome.evicted > 0 {
            warn!(
                "LOGS | Spillover budget of {} bytes reached, evicted {} oldest records",
                self.max_bytes, outcome.evicted
            );
        }
        if outcome.dropped > 0 {
            warn!(
                "LOGS | Dropped {} records larger than the spillover budget",
                outcome.dropped
            );
        }
        Ok(outcome)
    }

    fn rotate(&self, state: &mut State) -> Result<(), SpilloverError> {
        state.writer = None;
        let seq = state.next_seq;
        let path = self.dir.join(segment_file_name(seq));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        state.next_seq += 1;
        state.segments.push_back(Segment {
            seq,
            path,
            bytes: 0,
            records: 0,
            in_flight: false,
        });
        state.writer = Some(Writer { seq, file });
        Ok(())
    }

    /// Reads the oldest spilled records without deleting them.
    ///
    /// Whole segments are taken from the head while they fit in `max_bytes`;
    /// the head segment is always taken, even alone over budget. The open
    /// segment is sealed if it is part of the batch. Returns `None` when
    /// nothing is spilled.
    ///
    /// # Errors
    ///
    /// Only one peek may be outstanding: a second one fails with
    /// [`SpilloverError::PeekInFlight`] until the first is settled.
    pub fn peek_batch(&self, max_bytes: u64) -> Result<Option<SpilledBatch>, SpilloverError> {
        let (token, paths) = {
            let mut state = self.lock();
            if state.in_flight.is_some() {
                return Err(SpilloverError::PeekInFlight);
            }

            let mut selected = 0;
            let mut bytes = 0;
            for segment in &state.segments {
                if selected > 0 && bytes + segment.bytes > max_bytes {
                    break;
                }
                bytes += segment.bytes;
                selected += 1;
            }
            if selected == 0 {
                return Ok(None);
            }

            let mut seqs = Vec::with_capacity(selected);
            let mut paths = Vec::with_capacity(selected);
            for segment in state.segments.iter_mut().take(selected) {
                segment.in_flight = true;
                seqs.push(segment.seq);
                paths.push(segment.path.clone());
            }
            if state
                .writer
                .as_ref()
                .is_some_and(|writer| seqs.contains(&writer.seq))
            {
                state.writer = None;
            }

            let id = state.next_token;
            state.next_token += 1;
            state.in_flight = Some(id);
            (PeekToken { id, seqs }, paths)
        };

        let mut records = Vec::new();
        for path in &paths {
            if let Err(e) = read_segment(path, &mut records) {
                self.rollback(token);
                return Err(e.into());
            }
        }
        Ok(Some(SpilledBatch { records, token }))
    }

    /// Deletes the segments of a delivered batch.
    ///
    /// # Errors
    ///
    /// Returns the first failure to remove a segment file. The segments are
    /// forgotten either way.
    pub fn commit(&self, token: PeekToken) -> Result<(), SpilloverError> {
        let mut state = self.lock();
        if state.in_flight != Some(token.id) {
            warn!("LOGS | Ignoring commit of a stale spillover batch");
            return Ok(());
        }
        state.in_flight = None;

        let mut result = Ok(());
        for seq in token.seqs {
            let Some(index) = state.segments.iter().position(|s| s.seq == seq) else {
                continue;
            };
            if let Some(segment) = state.segments.remove(index) {
                state.total_bytes -= segment.bytes;
                match fs::remove_file(&segment.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        if result.is_ok() {
                            result = Err(SpilloverError::Io(e));
                        }
                    }
                }
            }
        }
        result
    }

    /// Makes the segments of an undelivered batch visible again, in place.
    pub fn rollback(&self, token: PeekToken) {
        let mut state = self.lock();
        if state.in_flight != Some(token.id) {
            warn!("LOGS | Ignoring rollback of a stale spillover batch");
            return;
        }
        state.in_flight = None;
        for segment in state.segments.iter_mut() {
            if token.seqs.contains(&segment.seq) {
                segment.in_flight = false;
            }
        }
    }

    /// Number of records on disk, including those in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().segments.iter().map(|s| s.records).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().segments.is_empty()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.lock().segments.len()
    }
}

/// Removes one segment: the oldest sealed idle one, then the oldest in
/// flight, then the open one. Returns the number of records lost.
fn evict_oldest(state: &mut State) -> Option<usize> {
    let writer_seq = state.writer.as_ref().map(|writer| writer.seq);
    let index = state
        .segments
        .iter()
        .position(|s| !s.in_flight && Some(s.seq) != writer_seq)
        .or_else(|| state.segments.iter().position(|s| s.in_flight))
        .or_else(|| (!state.segments.is_empty()).then_some(0))?;

    let segment = state.segments.remove(index)?;
    if Some(segment.seq) == writer_seq {
        state.writer = None;
    }
    state.total_bytes -= segment.bytes;
    remove_segment_file(&segment.path);
    Some(segment.records)
}

/// Cuts the open segment back to its last complete line after a failed
/// write and closes the writer, so the next append starts a new segment.
fn discard_torn_tail(state: &mut State) {
    let Some(writer) = state.writer.take() else {
        return;
    };
    let Some(open) = state.segments.iter().find(|s| s.seq == writer.seq) else {
        return;
    };
    let truncated = OpenOptions::new()
        .write(true)
        .open(&open.path)
        .and_then(|file| file.set_len(open.bytes));
    if let Err(e) = truncated {
        warn!(
            "LOGS | Failed to truncate spillover segment {}: {}",
            open.path.display(),
            e
        );
    }
}

fn unwritable(dir: &Path, e: &io::Error) -> SpilloverError {
    SpilloverError::Unwritable(format!("{}: {}", dir.display(), e))
}

/// Creates `dir` if needed and takes its lock file without waiting.
fn lock_dir(dir: &Path) -> Result<DirLock, SpilloverError> {
    fs::create_dir_all(dir).map_err(|e| unwritable(dir, &e))?;
    let mut lock = LockFile::open(&dir.join(LOCK_FILE)).map_err(|e| unwritable(dir, &e))?;
    if !lock.try_lock()? {
        return Err(SpilloverError::Locked(dir.display().to_string()));
    }
    Ok(DirLock(lock))
}

fn ensure_writable(dir: &Path) -> Result<(), SpilloverError> {
    let check = dir.join(WRITE_CHECK_FILE);
    File::create(&check)
        .and_then(|mut file| file.write_all(b"ok"))
        .and_then(|()| fs::remove_file(&check))
        .map_err(|e| unwritable(dir, &e))
}

fn segment_file_name(seq: u64) -> String {
    format!("{SEGMENT_PREFIX}{seq:020}{SEGMENT_SUFFIX}")
}

fn segment_seq(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Truncates a torn trailing line and returns the valid size and line count.
fn recover_segment(path: &Path) -> Result<(u64, usize), SpilloverError> {
    let contents = fs::read(path)?;
    let valid_len = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    if valid_len < contents.len() {
        warn!(
            "LOGS | Discarding {} bytes of a torn write in {}",
            contents.len() - valid_len,
            path.display()
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len as u64)?;
        file.sync_data()?;
    }
    let records = contents[..valid_len].iter().filter(|&&b| b == b'\n').count();
    Ok((valid_len as u64, records))
}

fn read_segment(path: &Path, records: &mut Vec<LogRecord>) -> io::Result<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                "LOGS | Skipping unreadable spilled record in {}: {}",
                path.display(),
                e
            ),
        }
    }
    Ok(())
}

fn remove_segment_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(
                "LOGS | Failed to remove spillover segment {}: {}",
                path.display(),
                e
            );
        }
    }
}
