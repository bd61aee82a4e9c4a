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

//! memcache text protocol front end for roost queues.
//!
//! [`protocol::ProtocolHandler`] turns bytes into queue operations;
//! [`memcache::start_memcache_server`] drives one handler per TCP
//! connection.

pub mod command;
pub mod config;
pub mod envelope;
pub mod memcache;
pub mod protocol;
pub mod stats;

use std::net::SocketAddr;

pub use config::MemcacheServerConfig;
pub use memcache::start_memcache_server;
pub use protocol::{ProtocolError, ProtocolHandler, Reply};
use snafu::{ResultExt, Snafu};
pub use stats::ServerStats;
use tokio::{sync::oneshot::Receiver, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to bind {addr}"))]
    Bind {
        addr:   SocketAddr,
        #[snafu(source)]
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse address {addr}"))]
    ParseAddress {
        addr:   String,
        #[snafu(source)]
        source: std::net::AddrParseError,
    },

    #[snafu(display("Server task failed"))]
    TaskJoin {
        #[snafu(source)]
        source: tokio::task::JoinError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle for managing a running listener.
///
/// The handle uses a cancellation token for graceful shutdown: cancelling
/// it stops the accept loop and makes every open connection finish its
/// current reply and close.
pub struct ServiceHandler {
    /// Join handle for the accept loop
    join_handle:        JoinHandle<()>,
    /// Token for signalling shutdown
    cancellation_token: CancellationToken,
    /// Receiver for server start notification
    started_rx:         Option<Receiver<()>>,
    /// Address actually bound, useful with port 0
    local_addr:         SocketAddr,
}

impl ServiceHandler {
    /// Waits until the accept loop is running. Returns immediately on later
    /// calls.
    pub async fn wait_for_start(&mut self) -> Result<()> {
        if let Some(started_rx) = self.started_rx.take() {
            // A dropped sender means the task already ended; wait_for_stop
            // reports why.
            let _ = started_rx.await;
        }
        Ok(())
    }

    /// Waits for the accept loop to finish. Use after [`Self::shutdown`].
    pub async fn wait_for_stop(self) -> Result<()> {
        self.join_handle.await.context(TaskJoinSnafu)
    }

    /// Signals the listener to stop accepting and close its connections.
    pub fn shutdown(&self) { self.cancellation_token.cancel(); }

    pub fn is_finished(&self) -> bool { self.join_handle.is_finished() }

    pub const fn local_addr(&self) -> SocketAddr { self.local_addr }
}
