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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Journal size after which the log is rotated, once the queue is empty.
pub const DEFAULT_SOFT_LOG_MAX_SIZE: u64 = 16 * 1024 * 1024;

/// Items per segment file of the overflow log.
pub const DEFAULT_SEGMENT_MAX_ITEMS: u64 = 10_000;

/// Items held by the journaled primary tier of a composite queue.
pub const DEFAULT_PRIMARY_CAPACITY: u64 = 10_000;

/// Storage configuration shared by every queue in a registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, SmartDefault)]
#[serde(default)]
pub struct QueueConfig {
    /// Root directory holding all queue journals and segment directories.
    #[default(_code = "PathBuf::from(\"/var/spool/roost\")")]
    pub base_path:         PathBuf,
    pub storage_kind:      StorageKind,
    #[default(DEFAULT_SOFT_LOG_MAX_SIZE)]
    pub soft_log_max_size: u64,
    #[default(DEFAULT_SEGMENT_MAX_ITEMS)]
    pub segment_max_items: u64,
    #[default(DEFAULT_PRIMARY_CAPACITY)]
    pub primary_capacity:  u64,
    pub flush_mode:        FlushMode,
}

/// Which persistence strategy backs each named queue.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// One rotating write-ahead journal per queue.
    #[default]
    #[display("transactional")]
    Transactional,
    /// A bounded journaled buffer in front of an unbounded segmented log.
    #[display("composite")]
    Composite,
}

impl std::str::FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "transactional" => Ok(Self::Transactional),
            "composite" => Ok(Self::Composite),
            other => Err(format!("unknown storage kind: {other}")),
        }
    }
}

/// Durability of individual journal and segment writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Hand each record to the OS page cache.
    #[default]
    Os,
    /// `fdatasync` after every record.
    Sync,
}
