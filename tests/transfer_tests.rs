//! Integration tests for load/save transfers between the two halves.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use kv_connector::cache::block::{BlockHash, BlockTransfer, KvBlockPool, LayerIndex};
use kv_connector::cache::state::{SaveSpec, TransferStatus};
use kv_connector::config::{BackpressurePolicy, ConnectorConfig};
use kv_connector::connector::storage::StorageScheduler;
use kv_connector::connector::{
    ConnectorFactory, ConnectorMetadata, ConnectorOutput, ConnectorRegistry, RequestInfo,
    RuntimeVersion, TransferEvent,
};
use kv_connector::error::{ConnectorError, TransferError};
use kv_connector::transfer::store::{KvStore, StoreError};

const BLOCK_SIZE: usize = 4;

/// Store that claims every block and never completes a transfer.
struct StalledStore;

#[async_trait]
impl KvStore for StalledStore {
    fn name(&self) -> &str {
        "stalled"
    }

    fn contains(&self, _hash: BlockHash) -> bool {
        true
    }

    async fn get(&self, _hash: BlockHash, _layer: LayerIndex) -> Result<Option<Bytes>, StoreError> {
        std::future::pending().await
    }

    async fn put(&self, _hash: BlockHash, _layer: LayerIndex, _data: Bytes) -> Result<(), StoreError> {
        std::future::pending().await
    }
}

fn stalled_factory() -> ConnectorFactory {
    ConnectorFactory::new(
        Arc::new(ConnectorRegistry::with_builtins()),
        RuntimeVersion::Current,
    )
    .with_store("stalled", Arc::new(StalledStore))
}

fn storage_config(store: &str, kv_role: &str) -> ConnectorConfig {
    let mut config = ConnectorConfig::for_connector("StorageConnector")
        .with_option("store", json!(store));
    config.kv_role = Some(kv_role.to_string());
    config.layout.num_layers = 1;
    config.layout.block_size = BLOCK_SIZE;
    config
}

fn prompt(request_id: &str) -> RequestInfo {
    RequestInfo::from_tokens(request_id, &(0..9).collect::<Vec<_>>(), BLOCK_SIZE)
}

#[tokio::test]
async fn test_load_timeout_falls_back_to_recompute() {
    let factory = stalled_factory();
    let mut config = storage_config("stalled", "consumer");
    config.transfer.load_timeout_ms = 50;
    let config = Arc::new(config);

    let mut scheduler = factory.create_scheduler(config.clone()).unwrap();
    let worker = factory.create_worker(config).unwrap();
    let pool = Arc::new(KvBlockPool::new(16, 1));
    worker.register_kv_caches(pool.clone()).unwrap();

    let request = prompt("r1");
    assert_eq!(scheduler.get_num_new_matched_blocks(&request, 0).unwrap(), 2);
    scheduler.update_state_after_alloc(&request, &[7, 8, 9], 2).unwrap();
    worker.bind_connector_metadata(scheduler.build_connector_meta()).unwrap();
    worker.start_load_kv().unwrap();
    assert_eq!(scheduler.transfer_status("r1"), Some(TransferStatus::Loading));

    let started = Instant::now();
    let outcome = worker.wait_for_layer_load(0, &[7, 8, 9]).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(outcome.ready.is_empty());
    assert_eq!(outcome.recompute, vec![7, 8]);
    assert!(pool.grant_holder(7).is_none());

    let output = worker.get_finished();
    match &output.events[..] {
        [TransferEvent::LoadFailed {
            request_id,
            block_ids,
            error,
        }] => {
            assert_eq!(request_id, "r1");
            assert_eq!(block_ids, &vec![7, 8]);
            assert_eq!(
                error,
                &TransferError::LoadTimeout {
                    request_id: "r1".to_string(),
                    block_ids: vec![7, 8],
                    timeout_ms: 50,
                }
            );
        }
        other => panic!("expected one load failure, got {other:?}"),
    }

    scheduler.update_connector_output(&output);
    assert_eq!(scheduler.transfer_status("r1"), Some(TransferStatus::LoadFailed));
    let storage = scheduler
        .as_any()
        .downcast_ref::<StorageScheduler>()
        .unwrap();
    assert!(storage.tracker().reservation(7).is_none());

    // Later layers do not wait on the expired load again.
    let outcome = worker.wait_for_layer_load(0, &[7, 8, 9]).await;
    assert!(outcome.ready.is_empty());

    let stats = worker.backend_stats();
    assert_eq!(stats[0].health.total_failures, 1);
}

#[tokio::test]
async fn test_cancelled_reservations_are_reusable() {
    let factory = stalled_factory();
    let config = Arc::new(storage_config("stalled", "consumer"));

    let mut scheduler = factory.create_scheduler(config.clone()).unwrap();
    let worker = factory.create_worker(config).unwrap();
    let pool = Arc::new(KvBlockPool::new(16, 1));
    worker.register_kv_caches(pool.clone()).unwrap();

    let first = prompt("r1");
    assert_eq!(scheduler.get_num_new_matched_blocks(&first, 0).unwrap(), 2);
    scheduler.update_state_after_alloc(&first, &[7, 8, 9], 2).unwrap();
    worker.bind_connector_metadata(scheduler.build_connector_meta()).unwrap();
    worker.start_load_kv().unwrap();
    assert_eq!(pool.grant_holder(7).as_deref(), Some("r1"));

    assert_eq!(scheduler.cancel_request("r1"), vec![7, 8]);
    assert_eq!(scheduler.transfer_status("r1"), None);
    assert!(scheduler.cancel_request("r1").is_empty());
    let err = scheduler
        .update_state_after_alloc(&first, &[7, 8, 9], 2)
        .unwrap_err();
    assert!(err.is_cancellation());

    let second = prompt("r2");
    assert_eq!(scheduler.get_num_new_matched_blocks(&second, 0).unwrap(), 2);
    scheduler.update_state_after_alloc(&second, &[7, 8, 10], 2).unwrap();

    let meta = scheduler.build_connector_meta();
    assert_eq!(meta.cancelled, vec!["r1".to_string()]);
    assert_eq!(meta.loads.len(), 1);
    assert_eq!(meta.loads[0].request_id, "r2");

    worker.bind_connector_metadata(meta).unwrap();
    worker.start_load_kv().unwrap();
    assert_eq!(pool.grant_holder(7).as_deref(), Some("r2"));
    assert_eq!(pool.grant_holder(8).as_deref(), Some("r2"));

    // Nothing is reported for the cancelled request.
    let output = worker.get_finished();
    assert!(output.events.iter().all(|e| e.request_id() != "r1"));
    assert!(output.events.is_empty());
}

#[tokio::test]
async fn test_fail_fast_rejects_saves_over_capacity() {
    let factory = stalled_factory();
    let mut config = storage_config("stalled", "producer");
    config.transfer.max_inflight_bytes = 48;
    config.transfer.backpressure = BackpressurePolicy::FailFast;
    let config = Arc::new(config);

    let worker = factory.create_worker(config).unwrap();
    let pool = Arc::new(KvBlockPool::new(16, 1));
    worker.register_kv_caches(pool.clone()).unwrap();

    pool.store_computed(0, 0, Bytes::from(vec![0u8; 32])).unwrap();
    pool.store_computed(1, 0, Bytes::from(vec![1u8; 32])).unwrap();
    let meta = ConnectorMetadata {
        saves: vec![SaveSpec {
            request_id: "r1".to_string(),
            blocks: vec![
                BlockTransfer { block_id: 0, hash: 100 },
                BlockTransfer { block_id: 1, hash: 101 },
            ],
        }],
        ..Default::default()
    };

    worker.bind_connector_metadata(meta).unwrap();
    match worker.save_kv_layer(0) {
        Err(ConnectorError::Transfer(TransferError::CapacityExceeded {
            requested,
            inflight,
            capacity,
        })) => {
            assert_eq!(requested, 32);
            assert_eq!(inflight, 32);
            assert_eq!(capacity, 48);
        }
        other => panic!("expected capacity error, got {other:?}"),
    }

    let stats = worker.backend_stats();
    assert_eq!(stats[0].queue.total_scheduled, 1);
    assert_eq!(stats[0].queue.total_rejected, 1);
}

#[tokio::test]
async fn test_disk_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(
        storage_config("local-disk", "both")
            .with_option("backend", json!("disk"))
            .with_option("path", json!(dir.path().to_string_lossy()))
            .with_option("zstd_level", json!(3)),
    );
    let request = prompt("r1");

    {
        let factory = ConnectorFactory::new(
            Arc::new(ConnectorRegistry::with_builtins()),
            RuntimeVersion::Current,
        );
        factory.open_stores(&config).await.unwrap();

        let mut scheduler = factory.create_scheduler(config.clone()).unwrap();
        let worker = factory.create_worker(config.clone()).unwrap();
        let pool = Arc::new(KvBlockPool::new(16, 1));
        worker.register_kv_caches(pool.clone()).unwrap();

        assert_eq!(scheduler.get_num_new_matched_blocks(&request, 0).unwrap(), 0);
        scheduler.update_state_after_alloc(&request, &[0, 1, 2], 0).unwrap();
        pool.store_computed(0, 0, Bytes::from(vec![7u8; 256])).unwrap();
        pool.store_computed(1, 0, Bytes::from(vec![9u8; 256])).unwrap();

        worker.bind_connector_metadata(scheduler.build_connector_meta()).unwrap();
        worker.save_kv_layer(0).unwrap();
        worker.wait_for_save().await;
        scheduler.update_connector_output(&worker.get_finished());
        assert_eq!(scheduler.transfer_status("r1"), Some(TransferStatus::Saved));
        assert!(!scheduler.request_finished("r1"));
    }

    // A new process indexes the directory and serves the blocks.
    let factory = ConnectorFactory::new(
        Arc::new(ConnectorRegistry::with_builtins()),
        RuntimeVersion::Current,
    );
    factory.open_stores(&config).await.unwrap();
    let mut scheduler = factory.create_scheduler(config.clone()).unwrap();
    let worker = factory.create_worker(config).unwrap();
    let pool = Arc::new(KvBlockPool::new(16, 1));
    worker.register_kv_caches(pool.clone()).unwrap();

    let request = prompt("r2");
    assert_eq!(scheduler.get_num_new_matched_blocks(&request, 0).unwrap(), 2);
    scheduler.update_state_after_alloc(&request, &[4, 5, 6], 2).unwrap();
    worker.bind_connector_metadata(scheduler.build_connector_meta()).unwrap();
    worker.start_load_kv().unwrap();
    let outcome = worker.wait_for_layer_load(0, &[4, 5, 6]).await;
    assert_eq!(outcome.ready, vec![4, 5]);
    assert_eq!(pool.read_layer(4, 0).unwrap(), Bytes::from(vec![7u8; 256]));
    assert_eq!(pool.read_layer(5, 0).unwrap(), Bytes::from(vec![9u8; 256]));

    let mut events = Vec::new();
    for _ in 0..100 {
        events.extend(worker.get_finished().events);
        if !events.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    scheduler.update_connector_output(&ConnectorOutput {
        events,
        children: Vec::new(),
    });
    assert_eq!(scheduler.transfer_status("r2"), Some(TransferStatus::Loaded));
}
