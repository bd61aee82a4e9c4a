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

use std::sync::{Arc, Barrier};

use bytes::{BufMut, Bytes, BytesMut};
use roost_common_storage_queue::{
    QueueConfig, QueueRegistry, QueueRegistryBuilder, QueueStore, StorageKind,
    TransactionalQueue,
};
use tempfile::TempDir;
use test_case::test_case;

fn registry(temp_dir: &TempDir, kind: StorageKind) -> QueueRegistry {
    QueueRegistryBuilder::new(temp_dir.path())
        .storage_kind(kind)
        .primary_capacity(3)
        .segment_max_items(2)
        .soft_log_max_size(256)
        .build()
        .unwrap()
}

fn drain(registry: &QueueRegistry, name: &str) -> Vec<Bytes> {
    std::iter::from_fn(|| registry.take(name).unwrap()).collect()
}

#[test_case(StorageKind::Transactional ; "transactional")]
#[test_case(StorageKind::Composite ; "composite")]
fn test_fifo_order(kind: StorageKind) {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(&temp_dir, kind);

    for item in ["a", "b", "c", "d", "e", "f", "g"] {
        assert!(registry.put("jobs", Bytes::from(item)).unwrap());
    }

    assert_eq!(drain(&registry, "jobs"), vec!["a", "b", "c", "d", "e", "f", "g"]);
}

#[test_case(StorageKind::Transactional ; "transactional")]
#[test_case(StorageKind::Composite ; "composite")]
fn test_restart_preserves_pending_items(kind: StorageKind) {
    let temp_dir = TempDir::new().unwrap();

    {
        let registry = registry(&temp_dir, kind);
        for i in 0..12 {
            registry.put("jobs", Bytes::from(format!("job-{i}"))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(registry.take("jobs").unwrap().unwrap(), format!("job-{i}"));
        }
        registry.shutdown();
    }

    let registry = registry(&temp_dir, kind);
    let expected: Vec<Bytes> = (5..12).map(|i| Bytes::from(format!("job-{i}"))).collect();
    assert_eq!(drain(&registry, "jobs"), expected);
}

#[test]
fn test_rotation_keeps_every_item() {
    let temp_dir = TempDir::new().unwrap();
    let config = QueueConfig {
        base_path: temp_dir.path().to_path_buf(),
        soft_log_max_size: 128,
        ..Default::default()
    };
    let queue = TransactionalQueue::open(&config, "rotating").unwrap();

    for i in 0..50 {
        let item = Bytes::from(format!("{i:0>40}"));
        queue.push(item.clone()).unwrap();
        assert_eq!(queue.pop().unwrap(), Some(item));
        assert!(queue.logsize() <= 128 + 1 + 4 + 40 + 1);
    }
    queue.close().unwrap();

    let queue = TransactionalQueue::open(&config, "rotating").unwrap();
    assert!(queue.is_empty());
}

#[test]
fn test_composite_overflow_routing() {
    let temp_dir = TempDir::new().unwrap();
    let config = QueueConfig {
        base_path: temp_dir.path().to_path_buf(),
        storage_kind: StorageKind::Composite,
        primary_capacity: 5,
        ..Default::default()
    };
    let queue = roost_common_storage_queue::CompositeQueue::open(&config, "spill").unwrap();

    for i in 0..6 {
        queue.push(Bytes::from(format!("{i}"))).unwrap();
    }
    assert_eq!(queue.primary_length(), 5);
    assert_eq!(queue.backing_length(), 1);

    let popped: Vec<Bytes> = std::iter::from_fn(|| queue.pop().unwrap()).collect();
    let expected: Vec<Bytes> = (0..6).map(|i| Bytes::from(format!("{i}"))).collect();
    assert_eq!(popped, expected);
}

#[test]
fn test_concurrent_producers_on_distinct_queues() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Arc::new(registry(&temp_dir, StorageKind::Transactional));
    let producers = 4;
    let per_producer = 200;
    let barrier = Arc::new(Barrier::new(producers));

    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let name = format!("queue-{p}");
                barrier.wait();
                let mut stored = 0;
                while stored < per_producer {
                    let mut buf = BytesMut::new();
                    buf.put_u32_le(stored);
                    if registry.put(&name, buf.freeze()).unwrap() {
                        stored += 1;
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for p in 0..producers {
        let items = drain(&registry, &format!("queue-{p}"));
        let order: Vec<u32> = items
            .iter()
            .map(|b| u32::from_le_bytes(b[..4].try_into().unwrap()))
            .collect();
        assert_eq!(order, (0..per_producer).collect::<Vec<_>>());
    }
    assert_eq!(registry.stats().total_items, u64::from(per_producer) * producers as u64);
}

#[test]
fn test_shutdown_then_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(&temp_dir, StorageKind::Composite);
    registry.put("a", Bytes::from("1")).unwrap();
    registry.put("b", Bytes::from("2")).unwrap();

    registry.shutdown();
    assert!(registry.queue_names().is_empty());
    assert!(registry.take("a").unwrap().is_none());

    let reopened = QueueRegistry::new(registry.config().clone()).unwrap();
    assert_eq!(reopened.take("a").unwrap().unwrap(), "1");
    assert_eq!(reopened.take("b").unwrap().unwrap(), "2");
}
