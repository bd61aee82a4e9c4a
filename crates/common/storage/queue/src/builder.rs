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

use crate::{FlushMode, QueueConfig, QueueRegistry, Result, StorageKind};

/// Fluent construction of a [`QueueRegistry`].
pub struct QueueRegistryBuilder {
    config: QueueConfig,
}

impl QueueRegistryBuilder {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            config: QueueConfig {
                base_path: base_path.into(),
                ..Default::default()
            },
        }
    }

    pub fn from_config(config: QueueConfig) -> Self { Self { config } }

    pub fn storage_kind(mut self, kind: StorageKind) -> Self {
        self.config.storage_kind = kind;
        self
    }

    pub fn soft_log_max_size(mut self, size: u64) -> Self {
        self.config.soft_log_max_size = size;
        self
    }

    pub fn segment_max_items(mut self, items: u64) -> Self {
        self.config.segment_max_items = items;
        self
    }

    pub fn primary_capacity(mut self, capacity: u64) -> Self {
        self.config.primary_capacity = capacity;
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    pub fn build(self) -> Result<QueueRegistry> { QueueRegistry::new(self.config) }
}
