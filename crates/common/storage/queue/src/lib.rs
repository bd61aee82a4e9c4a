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

//! Durable named FIFO queues.
//!
//! - [`TransactionalQueue`]: in-memory deque replayed from a write-ahead
//!   journal.
//! - [`SegmentedLog`]: unbounded overflow log split into numbered segment
//!   files.
//! - [`CompositeQueue`]: a bounded journaled buffer in front of a segmented
//!   log.
//! - [`QueueRegistry`]: lazily opens one [`QueueStore`] per name and keeps
//!   hit/miss/byte statistics.

pub mod builder;
pub mod composite;
pub mod config;
pub mod error;
pub mod journal;
mod message;
pub mod path;
pub mod registry;
pub mod segment;
pub mod store;

pub use builder::QueueRegistryBuilder;
pub use composite::CompositeQueue;
pub use config::{FlushMode, QueueConfig, StorageKind};
pub use error::{QueueError, Result};
pub use journal::TransactionalQueue;
pub use registry::{QueueRegistry, QueueStats, RegistryStats};
pub use segment::SegmentedLog;
pub use store::{QueueStore, open_store};
