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

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

/// Process-level counters reported by `STATS`, shared by all connections.
#[derive(Debug)]
pub struct ServerStats {
    started_at:        Instant,
    curr_connections:  AtomicU64,
    total_connections: AtomicU64,
    cmd_get:           AtomicU64,
    cmd_set:           AtomicU64,
    bytes_read:        AtomicU64,
    bytes_written:     AtomicU64,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self {
            started_at:        Instant::now(),
            curr_connections:  AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            cmd_get:           AtomicU64::new(0),
            cmd_set:           AtomicU64::new(0),
            bytes_read:        AtomicU64::new(0),
            bytes_written:     AtomicU64::new(0),
        }
    }
}

impl ServerStats {
    pub fn uptime_secs(&self) -> u64 { self.started_at.elapsed().as_secs() }

    /// Counts a new connection until the returned guard is dropped.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.curr_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn curr_connections(&self) -> u64 { self.curr_connections.load(Ordering::Relaxed) }

    pub fn total_connections(&self) -> u64 { self.total_connections.load(Ordering::Relaxed) }

    pub fn cmd_get(&self) -> u64 { self.cmd_get.load(Ordering::Relaxed) }

    pub fn cmd_set(&self) -> u64 { self.cmd_set.load(Ordering::Relaxed) }

    pub fn bytes_read(&self) -> u64 { self.bytes_read.load(Ordering::Relaxed) }

    pub fn bytes_written(&self) -> u64 { self.bytes_written.load(Ordering::Relaxed) }

    pub(crate) fn record_get(&self) { self.cmd_get.fetch_add(1, Ordering::Relaxed); }

    pub(crate) fn record_set(&self) { self.cmd_set.fetch_add(1, Ordering::Relaxed); }

    pub(crate) fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Decrements the live connection count on drop.
pub struct ConnectionGuard {
    stats: Arc<ServerStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) { self.stats.curr_connections.fetch_sub(1, Ordering::Relaxed); }
}

/// User and system CPU time of this process, in seconds.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn rusage() -> (f64, f64) {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: `usage` is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return (0.0, 0.0);
    }
    // SAFETY: getrusage returned 0, so the struct is initialised.
    let usage = unsafe { usage.assume_init() };
    (timeval_secs(usage.ru_utime), timeval_secs(usage.ru_stime))
}

#[cfg(not(unix))]
pub fn rusage() -> (f64, f64) { (0.0, 0.0) }

#[cfg(unix)]
#[allow(clippy::cast_precision_loss)]
fn timeval_secs(tv: libc::timeval) -> f64 { tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0 }
