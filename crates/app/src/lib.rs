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

//! Broker lifecycle: storage registry, memcache listener and shutdown
//! signalling wired together.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use roost_common_storage_queue::{QueueConfig, QueueRegistry, QueueRegistryBuilder};
use roost_common_telemetry as telemetry;
use roost_server::{MemcacheServerConfig, start_memcache_server};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{ResultExt, Whatever};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(SmartDefault)]
pub struct App {
    /// Application configuration
    pub config:             AppConfig,
    /// Set while the listener is accepting
    #[default(_code = "Arc::new(AtomicBool::new(false))")]
    pub running:            Arc<AtomicBool>,
    /// Cancelled to request a broker shutdown, by a signal or a client
    #[default(_code = "CancellationToken::new()")]
    pub cancellation_token: CancellationToken,
}

#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault, Builder)]
#[serde(default)]
pub struct AppConfig {
    /// memcache listener configuration
    #[builder(default)]
    pub server:                   MemcacheServerConfig,
    /// Queue storage configuration
    #[builder(default)]
    pub storage:                  QueueConfig,
    /// Logging configuration
    #[builder(default)]
    pub logging:                  telemetry::LoggingOptions,
    /// Also stop on SIGINT and SIGTERM, not only on a client `shutdown`
    #[default = true]
    #[builder(default = true)]
    pub enable_graceful_shutdown: bool,
}

impl AppConfig {
    #[must_use]
    pub fn open(self) -> App {
        App {
            config: self,
            ..Default::default()
        }
    }
}

pub struct AppHandle {
    running:            Arc<AtomicBool>,
    cancellation_token: CancellationToken,
    local_addr:         SocketAddr,
    registry:           Arc<QueueRegistry>,
    stopped_rx:         Option<oneshot::Receiver<()>>,
    task:               JoinHandle<()>,
}

impl AppHandle {
    /// Requests a graceful shutdown, as a client `shutdown` command would.
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        self.cancellation_token.cancel();
    }

    #[must_use]
    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr { self.local_addr }

    #[must_use]
    pub fn registry(&self) -> &Arc<QueueRegistry> { &self.registry }

    /// Waits until the listener has stopped and every queue is closed.
    pub async fn wait_for_shutdown(mut self) {
        if let Some(stopped_rx) = self.stopped_rx.take() {
            let _ = stopped_rx.await;
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Shutdown task failed");
        }
    }
}

impl App {
    /// Opens the registry, binds the listener and spawns the task that tears
    /// both down once shutdown is requested.
    ///
    /// # Errors
    /// Fails if the spool directory is unusable or the address cannot be
    /// bound.
    pub async fn start(&self) -> Result<AppHandle, Whatever> {
        let storage = self.config.storage.clone();
        std::fs::create_dir_all(&storage.base_path).with_whatever_context(|_| {
            format!("Failed to create spool directory {}", storage.base_path.display())
        })?;
        let registry = Arc::new(
            QueueRegistryBuilder::from_config(storage)
                .build()
                .whatever_context("Failed to open queue registry")?,
        );

        let mut server = start_memcache_server(
            self.config.server.clone(),
            Arc::clone(&registry),
            self.cancellation_token.clone(),
        )
        .await
        .whatever_context("Failed to start memcache server")?;
        server
            .wait_for_start()
            .await
            .whatever_context("memcache server failed to start")?;
        let local_addr = server.local_addr();

        self.running.store(true, Ordering::SeqCst);
        info!(
            addr = %local_addr,
            spool = %self.config.storage.base_path.display(),
            storage = %self.config.storage.storage_kind,
            "roost started"
        );

        let (stopped_tx, stopped_rx) = oneshot::channel::<()>();
        let running = Arc::clone(&self.running);
        let cancellation_token = self.cancellation_token.clone();
        let enable_graceful_shutdown = self.config.enable_graceful_shutdown;
        let task_registry = Arc::clone(&registry);

        let task = tokio::spawn(async move {
            if enable_graceful_shutdown {
                shutdown_signal(&cancellation_token).await;
            } else {
                cancellation_token.cancelled().await;
            }

            info!("Shutting down memcache server");
            server.shutdown();
            if let Err(e) = server.wait_for_stop().await {
                warn!(error = %e, "memcache server did not stop cleanly");
            }
            task_registry.shutdown();
            running.store(false, Ordering::SeqCst);
            info!("roost shutdown complete");
            let _ = stopped_tx.send(());
        });

        Ok(AppHandle {
            running: Arc::clone(&self.running),
            cancellation_token: self.cancellation_token.clone(),
            local_addr,
            registry,
            stopped_rx: Some(stopped_rx),
            task,
        })
    }

    /// Installs logging, runs the broker and blocks until it has shut down.
    ///
    /// # Errors
    /// Fails if logging cannot be installed or the broker cannot start.
    pub async fn run(self) -> Result<(), Whatever> {
        let _guards = telemetry::init_global_logging("roost", &self.config.logging)
            .whatever_context("Failed to initialize logging")?;
        telemetry::set_panic_hook();

        let handle = self.start().await?;
        handle.wait_for_shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal(shutdown_request: &CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C signal"); },
        () = terminate => { info!("Received terminate signal"); },
        () = shutdown_request.cancelled() => { info!("Received shutdown request"); },
    }
    shutdown_request.cancel();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use roost_common_storage_queue::StorageKind;
    use tempfile::TempDir;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;

    fn test_config(temp_dir: &TempDir) -> AppConfig {
        AppConfig::builder()
            .server(
                MemcacheServerConfig::builder()
                    .bind_address("127.0.0.1:0".to_string())
                    .build(),
            )
            .storage(QueueConfig {
                base_path: temp_dir.path().join("spool"),
                ..Default::default()
            })
            .enable_graceful_shutdown(false)
            .build()
    }

    async fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
        stream.write_all(request).await.unwrap();
        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_app_creation() {
        let app = AppConfig::default().open();
        assert!(!app.running.load(Ordering::SeqCst));
        assert!(app.config.enable_graceful_shutdown);
        assert_eq!(app.config.storage.storage_kind, StorageKind::Transactional);
    }

    #[tokio::test]
    async fn test_start_creates_spool_and_serves() {
        telemetry::init_default_ut_logging();
        let temp_dir = TempDir::new().unwrap();
        let app = test_config(&temp_dir).open();
        let handle = app.start().await.unwrap();
        assert!(handle.is_running());
        assert!(temp_dir.path().join("spool").is_dir());

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        roundtrip(&mut stream, b"set jobs 0 0 3\r\nabc\r\n", b"STORED\r\n").await;
        roundtrip(&mut stream, b"get jobs\r\n", b"VALUE jobs 0 3\r\nabc\r\nEND\r\n").await;

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_for_shutdown())
            .await
            .unwrap();
        assert!(!app.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_client_shutdown_stops_app() {
        let temp_dir = TempDir::new().unwrap();
        let app = test_config(&temp_dir).open();
        let handle = app.start().await.unwrap();
        let registry = Arc::clone(handle.registry());

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        roundtrip(&mut stream, b"set mail 0 0 2\r\nhi\r\n", b"STORED\r\n").await;
        stream.write_all(b"shutdown\r\n").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.wait_for_shutdown())
            .await
            .unwrap();
        assert!(registry.is_shutdown());
        assert!(app.cancellation_token.is_cancelled());

        // The stored item survives the restart.
        let handle = test_config(&temp_dir).open().start().await.unwrap();
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        roundtrip(&mut stream, b"get mail\r\n", b"VALUE mail 0 2\r\nhi\r\nEND\r\n").await;
        handle.shutdown();
        handle.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn test_unwritable_spool_fails_start() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let config = AppConfig::builder()
            .server(
                MemcacheServerConfig::builder()
                    .bind_address("127.0.0.1:0".to_string())
                    .build(),
            )
            .storage(QueueConfig {
                base_path: blocker.join("spool"),
                ..Default::default()
            })
            .build();

        assert!(config.open().start().await.is_err());
    }
}
