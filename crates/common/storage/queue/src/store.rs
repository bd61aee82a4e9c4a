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

use std::sync::Arc;

use bytes::Bytes;
use snafu::ResultExt;

use crate::{
    CompositeQueue, QueueConfig, Result, StorageKind, TransactionalQueue,
    error::IoSnafu,
    path::{journal_path, segment_dir},
};

/// A named, durable FIFO of opaque payloads.
///
/// Implementations serialize their own mutations; every method takes `&self`.
pub trait QueueStore: Send + Sync {
    fn name(&self) -> &str;

    /// Durably appends `payload` to the tail.
    fn push(&self, payload: Bytes) -> Result<()>;

    /// Removes and returns the head, or `None` when empty.
    fn pop(&self) -> Result<Option<Bytes>>;

    /// Number of pending items.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool { self.len() == 0 }

    /// Bytes currently occupied on disk.
    fn logsize(&self) -> u64;

    /// Items ever pushed, including those replayed at open.
    fn total_items(&self) -> u64;

    /// Payload bytes that were pending when the queue was opened.
    fn initial_bytes(&self) -> u64;

    /// Milliseconds the most recently popped item spent in the queue.
    fn current_age(&self) -> u64;

    /// Flushes and releases file handles. Further mutations fail.
    fn close(&self) -> Result<()>;

    /// Closes the queue and deletes its files.
    fn purge(&self) -> Result<()>;
}

/// Opens the queue `name` with the storage kind selected by `config`.
pub fn open_store(config: &QueueConfig, name: &str) -> Result<Arc<dyn QueueStore>> {
    Ok(match config.storage_kind {
        StorageKind::Transactional => Arc::new(TransactionalQueue::open(config, name)?),
        StorageKind::Composite => Arc::new(CompositeQueue::open(config, name)?),
    })
}

/// Whether `name` has files on disk under either storage kind.
pub fn store_exists(config: &QueueConfig, name: &str) -> bool {
    journal_path(&config.base_path, name).exists() || segment_dir(&config.base_path, name).exists()
}

/// Deletes the on-disk files of a queue that is not open.
pub fn remove_store_files(config: &QueueConfig, name: &str) -> Result<()> {
    let journal = journal_path(&config.base_path, name);
    if journal.exists() {
        std::fs::remove_file(&journal).context(IoSnafu { path: &journal })?;
    }
    let segments = segment_dir(&config.base_path, name);
    if segments.exists() {
        std::fs::remove_dir_all(&segments).context(IoSnafu { path: &segments })?;
    }
    Ok(())
}
