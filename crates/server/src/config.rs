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

use bon::Builder;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Default port of the memcache text protocol listener.
pub const DEFAULT_PORT: u16 = 22122;

/// Default largest `set` payload, as in memcached.
pub const DEFAULT_MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Configuration options for the memcache protocol server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
#[builder(finish_fn = build)]
pub struct MemcacheServerConfig {
    /// The address to bind the listener
    #[default(format!("127.0.0.1:{DEFAULT_PORT}"))]
    #[builder(default = format!("127.0.0.1:{DEFAULT_PORT}"))]
    pub bind_address:      String,
    /// Seconds without any received byte before a connection is closed;
    /// `0` disables the timeout.
    #[default(60)]
    #[builder(default = 60)]
    pub idle_timeout_secs: u64,
    /// Longest command line buffered while waiting for its CRLF.
    #[default(2048)]
    #[builder(default = 2048)]
    pub max_line_length:   usize,
    /// Largest `set` payload; bigger items are skipped unbuffered.
    #[default(DEFAULT_MAX_ITEM_SIZE)]
    #[builder(default = DEFAULT_MAX_ITEM_SIZE)]
    pub max_item_size:     usize,
}
