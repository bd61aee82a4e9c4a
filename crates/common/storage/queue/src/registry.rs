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

//! Owner of every named queue in one broker.
//!
//! Queues are opened lazily on first reference. Construction of a given name
//! is guarded by a per-name lock that is only ever *tried*: a caller that
//! loses the race gets a miss instead of waiting, so request handling never
//! blocks on another connection's journal replay.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use snafu::ensure;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    QueueConfig, Result,
    error::InaccessiblePathSnafu,
    path::validate_queue_name,
    store::{QueueStore, open_store, remove_store_files, store_exists},
};

struct QueueSlot {
    store:   Arc<dyn QueueStore>,
    expired: AtomicU64,
    /// Pending payload bytes attributed to this queue.
    bytes:   AtomicI64,
}

/// Registry-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub get_hits:      u64,
    pub get_misses:    u64,
    /// Items ever stored through this registry.
    pub total_items:   u64,
    /// Approximate pending payload bytes, seeded from replay.
    pub current_bytes: u64,
    /// Pending items across all live queues.
    pub current_size:  u64,
}

/// Per-queue figures reported by `STATS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub name:          String,
    pub items:         u64,
    pub total_items:   u64,
    pub logsize:       u64,
    pub expired_items: u64,
    /// Milliseconds the last popped item waited.
    pub age:           u64,
}

pub struct QueueRegistry {
    config:        QueueConfig,
    queues:        RwLock<HashMap<String, Arc<QueueSlot>>>,
    init_locks:    Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown:      AtomicBool,
    get_hits:      AtomicU64,
    get_misses:    AtomicU64,
    total_items:   AtomicU64,
    current_bytes: AtomicI64,
}

impl QueueRegistry {
    /// Creates a registry rooted at `config.base_path`, which must be an
    /// existing, writable directory.
    pub fn new(config: QueueConfig) -> Result<Self> {
        ensure!(
            is_writable_dir(&config.base_path),
            InaccessiblePathSnafu {
                path: config.base_path.clone(),
            }
        );
        info!(
            path = ?config.base_path,
            storage = %config.storage_kind,
            "Queue registry ready"
        );

        Ok(Self {
            config,
            queues: RwLock::new(HashMap::new()),
            init_locks: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            get_hits: AtomicU64::new(0),
            get_misses: AtomicU64::new(0),
            total_items: AtomicU64::new(0),
            current_bytes: AtomicI64::new(0),
        })
    }

    pub const fn config(&self) -> &QueueConfig { &self.config }

    pub fn is_shutdown(&self) -> bool { self.shutdown.load(Ordering::Acquire) }

    /// Returns the queue `name`, opening it on first use.
    ///
    /// `None` means "not ready": the registry is shut down, the name is not
    /// usable, the queue failed to open, or another caller is constructing it
    /// right now.
    pub fn get_or_create(&self, name: &str) -> Option<Arc<dyn QueueStore>> {
        self.slot(name).map(|slot| Arc::clone(&slot.store))
    }

    fn slot(&self, name: &str) -> Option<Arc<QueueSlot>> {
        if self.is_shutdown() {
            return None;
        }
        if let Some(slot) = self.queues.read().get(name) {
            return Some(Arc::clone(slot));
        }
        if let Err(e) = validate_queue_name(name) {
            debug!(queue = name, error = %e, "Rejected queue name");
            return None;
        }

        let lock = self.init_lock(name);
        let Some(_constructing) = lock.try_lock() else {
            debug!(queue = name, "Queue is being opened by another caller");
            return None;
        };
        // The previous holder may have finished between our read and the lock.
        if let Some(slot) = self.queues.read().get(name) {
            return Some(Arc::clone(slot));
        }
        if self.is_shutdown() {
            return None;
        }

        let span = info_span!("open_queue", queue = name);
        let _entered = span.enter();
        let store = match open_store(&self.config, name) {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "Failed to open queue");
                return None;
            }
        };

        let initial = i64::try_from(store.initial_bytes()).unwrap_or(i64::MAX);
        self.current_bytes.fetch_add(initial, Ordering::Relaxed);
        let slot = Arc::new(QueueSlot {
            store,
            expired: AtomicU64::new(0),
            bytes: AtomicI64::new(initial),
        });
        self.queues.write().insert(name.to_string(), Arc::clone(&slot));
        info!(items = slot.store.len(), "Queue opened");
        Some(slot)
    }

    pub(crate) fn init_lock(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.init_locks.lock().entry(name.to_string()).or_default())
    }

    /// Appends `payload` to `name`. `Ok(false)` when the queue is not ready.
    pub fn put(&self, name: &str, payload: Bytes) -> Result<bool> {
        let Some(slot) = self.slot(name) else {
            return Ok(false);
        };
        let len = payload_len(&payload);
        slot.store.push(payload)?;
        self.total_items.fetch_add(1, Ordering::Relaxed);
        self.current_bytes.fetch_add(len, Ordering::Relaxed);
        slot.bytes.fetch_add(len, Ordering::Relaxed);
        Ok(true)
    }

    /// Pops the head of `name`. A missing, unready or empty queue is a miss.
    pub fn take(&self, name: &str) -> Result<Option<Bytes>> {
        let popped = match self.slot(name) {
            Some(slot) if !slot.store.is_empty() => {
                let popped = slot.store.pop()?;
                if let Some(payload) = &popped {
                    let len = payload_len(payload);
                    self.current_bytes.fetch_sub(len, Ordering::Relaxed);
                    slot.bytes.fetch_sub(len, Ordering::Relaxed);
                }
                popped
            }
            _ => None,
        };

        let counter = if popped.is_some() {
            &self.get_hits
        } else {
            &self.get_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(popped)
    }

    /// Counts an item of `name` dropped because its expiry had passed.
    pub fn record_expired(&self, name: &str) {
        if let Some(slot) = self.queues.read().get(name) {
            slot.expired.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Removes `name` and deletes its files. Returns whether anything existed,
    /// loaded or only on disk.
    pub fn delete(&self, name: &str) -> Result<bool> {
        if validate_queue_name(name).is_err() {
            return Ok(false);
        }
        let lock = self.init_lock(name);
        let _constructing = lock.lock();

        let removed = self.queues.write().remove(name);
        if let Some(slot) = removed {
            self.current_bytes
                .fetch_sub(slot.bytes.load(Ordering::Relaxed), Ordering::Relaxed);
            slot.store.purge()?;
            info!(queue = name, "Queue deleted");
            return Ok(true);
        }
        if store_exists(&self.config, name) {
            remove_store_files(&self.config, name)?;
            info!(queue = name, "Unloaded queue deleted from disk");
            return Ok(true);
        }
        Ok(false)
    }

    pub fn stats(&self) -> RegistryStats {
        let current_size = self.queues.read().values().map(|s| s.store.len()).sum();
        RegistryStats {
            get_hits: self.get_hits.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            total_items: self.total_items.load(Ordering::Relaxed),
            current_bytes: u64::try_from(self.current_bytes.load(Ordering::Relaxed)).unwrap_or(0),
            current_size,
        }
    }

    /// Figures for every live queue, sorted by name.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<QueueStats> = self
            .queues
            .read()
            .iter()
            .map(|(name, slot)| QueueStats {
                name:          name.clone(),
                items:         slot.store.len(),
                total_items:   slot.store.total_items(),
                logsize:       slot.store.logsize(),
                expired_items: slot.expired.load(Ordering::Relaxed),
                age:           slot.store.current_age(),
            })
            .collect();
        stats.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Rejects all further lookups and closes every open queue.
    ///
    /// In-flight operations that already hold a queue finish against it; the
    /// journal handles are closed afterwards.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<(String, Arc<QueueSlot>)> = self.queues.write().drain().collect();
        info!(queues = drained.len(), "Shutting down queue registry");
        for (name, slot) in drained {
            if let Err(e) = slot.store.close() {
                warn!(queue = %name, error = %e, "Failed to close queue");
            }
        }
    }
}

fn payload_len(payload: &Bytes) -> i64 { i64::try_from(payload.len()).unwrap_or(i64::MAX) }

fn is_writable_dir(path: &std::path::Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let marker = path.join(format!(".roost-write-check-{}", std::process::id()));
    let writable = std::fs::File::create(&marker).is_ok();
    let _ = std::fs::remove_file(&marker);
    writable
}
