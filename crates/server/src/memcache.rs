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

//! TCP transport for [`ProtocolHandler`].

use std::{net::SocketAddr, sync::Arc, time::Duration};

use roost_common_storage_queue::QueueRegistry;
use snafu::ResultExt;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    BindSnafu, MemcacheServerConfig, ParseAddressSnafu, Result, ServiceHandler,
    protocol::ProtocolHandler, stats::ServerStats,
};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Binds the listener and spawns the accept loop.
///
/// Each connection gets its own [`ProtocolHandler`]. A client `shutdown`
/// command cancels `shutdown_request` so the owner can stop the broker;
/// [`ServiceHandler::shutdown`] only stops this listener.
///
/// # Errors
/// Returns an error if the bind address cannot be parsed or bound.
pub async fn start_memcache_server(
    config: MemcacheServerConfig,
    registry: Arc<QueueRegistry>,
    shutdown_request: CancellationToken,
) -> Result<ServiceHandler> {
    let bind_addr = config
        .bind_address
        .parse::<SocketAddr>()
        .context(ParseAddressSnafu {
            addr: config.bind_address.clone(),
        })?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .context(BindSnafu { addr: bind_addr })?;
    let local_addr = listener.local_addr().context(BindSnafu { addr: bind_addr })?;

    let stats = Arc::new(ServerStats::default());
    let cancellation_token = CancellationToken::new();
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let token = cancellation_token.clone();

    let join_handle = tokio::spawn(async move {
        info!("memcache server (on {}) started", local_addr);
        let _ = started_tx.send(());
        loop {
            tokio::select! {
                () = token.cancelled() => {
                    info!("memcache server (on {}) received shutdown signal", local_addr);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection = Connection {
                            registry: Arc::clone(&registry),
                            stats: Arc::clone(&stats),
                            config: config.clone(),
                            stop: token.clone(),
                            shutdown_request: shutdown_request.clone(),
                        };
                        tokio::spawn(
                            connection
                                .serve(stream)
                                .instrument(info_span!("conn", peer = %peer)),
                        );
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
        info!("memcache server (on {}) task completed", local_addr);
    });

    Ok(ServiceHandler {
        join_handle,
        cancellation_token,
        started_rx: Some(started_rx),
        local_addr,
    })
}

struct Connection {
    registry:         Arc<QueueRegistry>,
    stats:            Arc<ServerStats>,
    config:           MemcacheServerConfig,
    stop:             CancellationToken,
    shutdown_request: CancellationToken,
}

impl Connection {
    async fn serve(self, mut stream: TcpStream) {
        let _guard = self.stats.connection_opened();
        let mut handler = ProtocolHandler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            self.config.max_line_length,
        )
        .with_max_item_size(self.config.max_item_size);
        let idle_timeout = (self.config.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.idle_timeout_secs));
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        debug!("Connection opened");

        loop {
            let read = tokio::select! {
                () = self.stop.cancelled() => break,
                read = read_with_timeout(&mut stream, &mut buf, idle_timeout) => read,
            };
            let n = match read {
                Ok(Some(0)) => break,
                Ok(Some(n)) => n,
                Ok(None) => {
                    debug!(
                        pending_set = handler.is_awaiting_data(),
                        "Idle timeout, closing connection"
                    );
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "Read failed");
                    break;
                }
            };

            let reply = handler.receive(&buf[..n]);
            if !reply.response.is_empty() {
                if let Err(e) = stream.write_all(&reply.response).await {
                    debug!(error = %e, "Write failed");
                    break;
                }
            }
            if reply.shutdown {
                self.shutdown_request.cancel();
                break;
            }
            if reply.close {
                break;
            }
        }

        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
        debug!("Connection closed");
    }
}

/// `Ok(None)` when no byte arrived within `timeout`.
async fn read_with_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> std::io::Result<Option<usize>> {
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(read) => read.map(Some),
            Err(_elapsed) => Ok(None),
        },
        None => stream.read(buf).await.map(Some),
    }
}
