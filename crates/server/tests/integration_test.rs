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

use std::{sync::Arc, time::Duration};

use roost_common_storage_queue::{QueueRegistry, QueueRegistryBuilder, StorageKind};
use roost_server::{MemcacheServerConfig, ServiceHandler, start_memcache_server};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

struct TestServer {
    _temp_dir:        TempDir,
    registry:         Arc<QueueRegistry>,
    handle:           ServiceHandler,
    shutdown_request: CancellationToken,
}

async fn start(kind: StorageKind, idle_timeout_secs: u64) -> TestServer {
    let temp_dir = TempDir::new().unwrap();
    let registry = Arc::new(
        QueueRegistryBuilder::new(temp_dir.path())
            .storage_kind(kind)
            .primary_capacity(2)
            .segment_max_items(2)
            .build()
            .unwrap(),
    );
    let config = MemcacheServerConfig::builder()
        .bind_address("127.0.0.1:0".to_string())
        .idle_timeout_secs(idle_timeout_secs)
        .build();
    let shutdown_request = CancellationToken::new();
    let mut handle = start_memcache_server(config, Arc::clone(&registry), shutdown_request.clone())
        .await
        .unwrap();
    handle.wait_for_start().await.unwrap();
    TestServer {
        _temp_dir: temp_dir,
        registry,
        handle,
        shutdown_request,
    }
}

/// Sends `request` and reads until the reply ends with `terminator`.
async fn roundtrip(stream: &mut TcpStream, request: &[u8], terminator: &str) -> String {
    stream.write_all(request).await.unwrap();
    let mut reply = Vec::new();
    let mut buf = [0u8; 4096];
    while !reply.ends_with(terminator.as_bytes()) {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed early, got {:?}", String::from_utf8_lossy(&reply));
        reply.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(reply).unwrap()
}

#[tokio::test]
async fn test_set_get_over_tcp() {
    let server = start(StorageKind::Transactional, 60).await;
    let mut client = TcpStream::connect(server.handle.local_addr()).await.unwrap();

    assert_eq!(roundtrip(&mut client, b"set q 0 0 5\r\nhello\r\n", "\r\n").await, "STORED\r\n");
    assert_eq!(
        roundtrip(&mut client, b"get q\r\n", "END\r\n").await,
        "VALUE q 0 5\r\nhello\r\nEND\r\n"
    );
    assert_eq!(roundtrip(&mut client, b"get q\r\n", "END\r\n").await, "END\r\n");

    server.handle.shutdown();
    server.handle.wait_for_stop().await.unwrap();
}

#[tokio::test]
async fn test_fifo_across_connections_with_composite_storage() {
    let server = start(StorageKind::Composite, 60).await;
    let addr = server.handle.local_addr();

    let mut producer = TcpStream::connect(addr).await.unwrap();
    for i in 0..7 {
        let request = format!("set jobs 0 0 1\r\n{i}\r\n");
        assert_eq!(roundtrip(&mut producer, request.as_bytes(), "\r\n").await, "STORED\r\n");
    }
    drop(producer);

    let mut consumer = TcpStream::connect(addr).await.unwrap();
    for i in 0..7 {
        assert_eq!(
            roundtrip(&mut consumer, b"get jobs\r\n", "END\r\n").await,
            format!("VALUE jobs 0 1\r\n{i}\r\nEND\r\n")
        );
    }

    let stats = roundtrip(&mut consumer, b"stats\r\n", "END\r\n").await;
    assert!(stats.contains("STAT total_items 7\r\n"));
    assert!(stats.contains("STAT queue_jobs_items 0\r\n"));
    assert!(stats.contains("STAT total_connections 2\r\n"));

    server.handle.shutdown();
}

#[tokio::test]
async fn test_shutdown_command_requests_broker_stop() {
    let server = start(StorageKind::Transactional, 60).await;
    let mut client = TcpStream::connect(server.handle.local_addr()).await.unwrap();

    client.write_all(b"shutdown\r\n").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), server.shutdown_request.cancelled())
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    server.handle.shutdown();
    server.handle.wait_for_stop().await.unwrap();
    server.registry.shutdown();
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let server = start(StorageKind::Transactional, 1).await;
    let mut client = TcpStream::connect(server.handle.local_addr()).await.unwrap();

    // A partial set must not be committed when the timeout fires.
    client.write_all(b"set q 0 0 10\r\nabc").await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert!(server.registry.take("q").unwrap().is_none());

    server.handle.shutdown();
}

#[tokio::test]
async fn test_quit_closes_only_that_connection() {
    let server = start(StorageKind::Transactional, 60).await;
    let addr = server.handle.local_addr();
    let mut quitter = TcpStream::connect(addr).await.unwrap();
    let mut other = TcpStream::connect(addr).await.unwrap();

    quitter.write_all(b"quit\r\n").await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(quitter.read(&mut buf).await.unwrap(), 0);

    let reply = roundtrip(&mut other, b"version\r\n", "\r\n").await;
    assert!(reply.starts_with("VERSION "));
    assert!(!server.shutdown_request.is_cancelled());

    server.handle.shutdown();
}
