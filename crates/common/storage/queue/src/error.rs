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

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Queue operation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Filesystem I/O failure on a journal or segment file.
    #[snafu(display("IO error on {}", path.display()))]
    Io {
        path:   PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// The queue was closed; its journal handle is gone.
    #[snafu(display("No transaction log for queue {name}"))]
    NoTransactionLog { name: String },

    /// The registry root does not exist or is not writable.
    #[snafu(display("'{}' must exist and be read-writable", path.display()))]
    InaccessiblePath { path: PathBuf },

    /// Queue names map to file names, so they are restricted.
    #[snafu(display("Invalid queue name: {name:?}"))]
    InvalidQueueName { name: String },

    /// A payload too long for the 4-byte length prefix.
    #[snafu(display("Item of {len} bytes does not fit a record"))]
    ItemTooLarge { len: usize },

    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
