// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-memory FIFO backed by a write-ahead journal.
//!
//! Every push appends a PUSH record and every pop appends a POP record
//! before the in-memory deque is touched, both under the same lock, so the
//! journal order always equals the mutation order. Replaying the journal
//! against an empty deque rebuilds the exact queue state.
//!
//! ## Rotation
//!
//! The journal only grows. Once it passes the soft size limit *and* the queue
//! has been drained, it is moved aside, a fresh journal is opened and the old
//! one is deleted. While items are pending the journal keeps growing.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, error, info, warn};

use crate::{
    FlushMode, QueueConfig, Result,
    error::{IoSnafu, NoTransactionLogSnafu},
    message::{JournalRecord, OP_POP, ReadOutcome, RecordReader, encode_push},
    path::{journal_backup_path, journal_path, rotation_dir, validate_queue_name},
    store::QueueStore,
};

struct Entry {
    /// Unix microseconds at enqueue time, for age reporting.
    enqueued_at: i64,
    payload:     Bytes,
}

struct JournalState {
    /// `None` once the queue has been closed.
    log:         Option<File>,
    logsize:     u64,
    items:       VecDeque<Entry>,
    total_items: u64,
    current_age: u64,
}

/// A durable FIFO queue with a rotating transaction journal.
pub struct TransactionalQueue {
    name:              String,
    base_path:         PathBuf,
    path:              PathBuf,
    soft_log_max_size: u64,
    flush_mode:        FlushMode,
    initial_bytes:     u64,
    state:             Mutex<JournalState>,
}

impl TransactionalQueue {
    /// Opens (or creates) the journal `base_path/<name>` and replays it.
    ///
    /// A torn or unreadable tail is cut off the file so later appends follow
    /// the last complete record.
    pub fn open(config: &QueueConfig, name: &str) -> Result<Self> {
        validate_queue_name(name)?;
        let path = journal_path(&config.base_path, name);
        let log = open_journal(&path)?;

        let mut state = JournalState {
            log:         None,
            logsize:     0,
            items:       VecDeque::new(),
            total_items: 0,
            current_age: 0,
        };
        let initial_bytes = replay(name, &path, &log, &mut state)?;
        state.log = Some(log);

        info!(
            queue = name,
            path = ?path,
            items = state.items.len(),
            logsize = state.logsize,
            "Journal replayed"
        );

        Ok(Self {
            name: name.to_string(),
            base_path: config.base_path.clone(),
            path,
            soft_log_max_size: config.soft_log_max_size,
            flush_mode: config.flush_mode,
            initial_bytes,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn is_open(&self) -> bool { self.state.lock().log.is_some() }

    fn write_record(&self, state: &mut JournalState, record: &[u8]) -> Result<()> {
        let log = state.log.as_mut().context(NoTransactionLogSnafu {
            name: self.name.as_str(),
        })?;
        log.write_all(record).context(IoSnafu { path: &self.path })?;
        if self.flush_mode == FlushMode::Sync {
            log.sync_data().context(IoSnafu { path: &self.path })?;
        }
        state.logsize += record.len() as u64;
        Ok(())
    }

    /// Swaps in an empty journal once the log is past its soft limit and
    /// the queue is drained.
    ///
    /// The current handle stays installed until the fresh journal is open,
    /// so a failure at any step leaves the queue writable.
    fn maybe_rotate(&self, state: &mut JournalState) -> Result<()> {
        if state.logsize <= self.soft_log_max_size || !state.items.is_empty() {
            return Ok(());
        }

        let rotation = rotation_dir(&self.base_path);
        std::fs::create_dir_all(&rotation).context(IoSnafu { path: &rotation })?;
        let backup = journal_backup_path(&self.base_path, &self.name, Utc::now().timestamp());
        std::fs::rename(&self.path, &backup).context(IoSnafu { path: &self.path })?;

        let fresh = match open_journal(&self.path) {
            Ok(fresh) => fresh,
            Err(e) => {
                if let Err(undo) = std::fs::rename(&backup, &self.path) {
                    error!(
                        queue = %self.name,
                        backup = ?backup,
                        error = %undo,
                        "Failed to restore journal after rotation error"
                    );
                }
                return Err(e);
            }
        };
        drop(state.log.replace(fresh));
        let old_size = std::mem::take(&mut state.logsize);

        if let Err(e) = std::fs::remove_file(&backup) {
            warn!(queue = %self.name, backup = ?backup, error = %e, "Failed to remove rotated journal");
        }
        info!(queue = %self.name, old_size, "Journal rotated");
        Ok(())
    }
}

impl QueueStore for TransactionalQueue {
    fn name(&self) -> &str { &self.name }

    fn push(&self, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        self.write_record(&mut state, &encode_push(&payload)?)?;
        state.total_items += 1;
        state.items.push_back(Entry {
            enqueued_at: now_micros(),
            payload,
        });
        Ok(())
    }

    fn pop(&self) -> Result<Option<Bytes>> {
        let mut state = self.state.lock();
        if state.log.is_none() {
            return NoTransactionLogSnafu {
                name: self.name.as_str(),
            }
            .fail();
        }

        let Some(entry) = state.items.pop_front() else {
            warn!(queue = %self.name, "Pop on an empty queue, ignoring");
            return Ok(None);
        };
        if let Err(e) = self.write_record(&mut state, &[OP_POP]) {
            state.items.push_front(entry);
            return Err(e);
        }

        state.current_age = age_millis(entry.enqueued_at);
        // The POP is already durable; a failed rotation must not lose the item.
        if let Err(e) = self.maybe_rotate(&mut state) {
            error!(queue = %self.name, error = %e, "Journal rotation failed");
        }
        Ok(Some(entry.payload))
    }

    fn len(&self) -> u64 { self.state.lock().items.len() as u64 }

    fn logsize(&self) -> u64 { self.state.lock().logsize }

    fn total_items(&self) -> u64 { self.state.lock().total_items }

    fn initial_bytes(&self) -> u64 { self.initial_bytes }

    fn current_age(&self) -> u64 { self.state.lock().current_age }

    fn close(&self) -> Result<()> {
        // Taken under the lock: a concurrent caller sees the old handle or none.
        let log = self.state.lock().log.take();
        if let Some(log) = log {
            log.sync_all().context(IoSnafu { path: &self.path })?;
            debug!(queue = %self.name, "Journal closed");
        }
        Ok(())
    }

    fn purge(&self) -> Result<()> {
        self.close()?;
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(e).context(IoSnafu { path: &self.path })
            }
            _ => {
                info!(queue = %self.name, "Journal purged");
                Ok(())
            }
        }
    }
}

fn open_journal(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .context(IoSnafu { path })
}

/// Rebuilds `state` from the journal; returns the replayed payload bytes.
fn replay(name: &str, path: &Path, log: &File, state: &mut JournalState) -> Result<u64> {
    let file_len = log.metadata().context(IoSnafu { path })?.len();
    let mut reader = RecordReader::new(BufReader::new(log), file_len);
    let mut bytes: u64 = 0;
    let now = now_micros();

    loop {
        match reader.next_journal_record().context(IoSnafu { path })? {
            ReadOutcome::Record(JournalRecord::Push(payload)) => {
                bytes += payload.len() as u64;
                state.total_items += 1;
                state.items.push_back(Entry {
                    enqueued_at: now,
                    payload,
                });
            }
            ReadOutcome::Record(JournalRecord::Pop) => match state.items.pop_front() {
                Some(entry) => bytes = bytes.saturating_sub(entry.payload.len() as u64),
                None => warn!(queue = name, "Journal pops an empty queue, ignoring"),
            },
            ReadOutcome::End => break,
            ReadOutcome::Stop(anomaly) => {
                warn!(
                    queue = name,
                    offset = reader.offset(),
                    file_len,
                    ?anomaly,
                    "Discarding unreadable journal tail"
                );
                log.set_len(reader.offset()).context(IoSnafu { path })?;
                break;
            }
        }
    }

    state.logsize = reader.offset();
    debug!(queue = name, bytes, "Journal replay complete");
    Ok(bytes)
}

pub(crate) fn now_micros() -> i64 { Utc::now().timestamp_micros() }

fn age_millis(enqueued_at: i64) -> u64 {
    u64::try_from((now_micros() - enqueued_at) / 1000).unwrap_or(0)
}
