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

//! Two-tier queue: a bounded journaled buffer in front of a segmented
//! overflow log.
//!
//! Once anything has spilled into the backing log, new items keep going there
//! until it drains. Admitting them to the primary earlier would let them be
//! popped before older spilled items.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::{QueueConfig, Result, SegmentedLog, TransactionalQueue, store::QueueStore};

pub struct CompositeQueue {
    name:        String,
    primary:     TransactionalQueue,
    backing:     SegmentedLog,
    capacity:    u64,
    /// Serializes routing decisions against segment transfers.
    guard:       Mutex<()>,
    total_items: AtomicU64,
}

impl CompositeQueue {
    pub fn open(config: &QueueConfig, name: &str) -> Result<Self> {
        let primary = TransactionalQueue::open(config, name)?;
        let backing = SegmentedLog::open(config, name)?;
        // The primary journal also replays items that arrived via the backing
        // log, so seed from pending items rather than summing replay counters.
        let total_items = primary.len() + backing.len();

        Ok(Self {
            name: name.to_string(),
            primary,
            backing,
            capacity: config.primary_capacity.max(1),
            guard: Mutex::new(()),
            total_items: AtomicU64::new(total_items),
        })
    }

    pub fn primary_length(&self) -> u64 { self.primary.len() }

    pub fn backing_length(&self) -> u64 { self.backing.len() }

    pub fn backing_logsize(&self) -> u64 { self.backing.logsize() }
}

impl QueueStore for CompositeQueue {
    fn name(&self) -> &str { &self.name }

    fn push(&self, payload: Bytes) -> Result<()> {
        let _guard = self.guard.lock();
        if self.primary.len() >= self.capacity || !self.backing.is_empty() {
            self.backing.push(&payload)?;
        } else {
            self.primary.push(payload)?;
        }
        self.total_items.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn pop(&self) -> Result<Option<Bytes>> {
        let _guard = self.guard.lock();
        // A sealed segment can be empty after tail repair, so keep pulling
        // until something lands in the primary or the backing log is drained.
        while self.primary.is_empty() && !self.backing.is_empty() {
            let moved = self.backing.consume_into(|payload| self.primary.push(payload))?;
            debug!(queue = %self.name, moved, "Refilled primary from backing log");
        }
        self.primary.pop()
    }

    fn len(&self) -> u64 { self.primary.len() + self.backing.len() }

    fn logsize(&self) -> u64 { self.primary.logsize() + self.backing.logsize() }

    fn total_items(&self) -> u64 { self.total_items.load(Ordering::Relaxed) }

    fn initial_bytes(&self) -> u64 { self.primary.initial_bytes() + self.backing.initial_bytes() }

    fn current_age(&self) -> u64 { self.primary.current_age() }

    fn close(&self) -> Result<()> {
        let _guard = self.guard.lock();
        let primary = self.primary.close();
        let backing = self.backing.close();
        primary.and(backing)
    }

    fn purge(&self) -> Result<()> {
        let _guard = self.guard.lock();
        let primary = self.primary.purge();
        let backing = self.backing.purge();
        primary.and(backing)
    }
}
