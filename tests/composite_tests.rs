//! Integration tests for the composite connector over several stores.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use kv_connector::cache::block::{BlockHash, BlockId, KvBlockPool, LayerIndex};
use kv_connector::cache::state::{StateError, TransferStatus};
use kv_connector::config::ConnectorConfig;
use kv_connector::connector::multi::{MultiScheduler, SaveOutcome};
use kv_connector::connector::{
    BuildContext, ConnectorClass, ConnectorFactory, ConnectorInstance, ConnectorMetadata,
    ConnectorOutput, ConnectorRegistry, ConnectorRole, ModuleCatalog, RequestInfo,
    RuntimeVersion, SchedulerConnector, TransferEvent,
};
use kv_connector::error::{ConnectorError, Result, TransferError};
use kv_connector::transfer::store::{KvStore, MemoryStore, StoreError};

const BLOCK_SIZE: usize = 4;

/// Memory store that counts how often it is consulted.
struct CountingStore {
    inner: MemoryStore,
    lookups: AtomicUsize,
    reads: AtomicUsize,
}

impl CountingStore {
    fn new(name: &str, num_layers: usize) -> Self {
        Self {
            inner: MemoryStore::new(name, num_layers),
            lookups: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KvStore for CountingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn contains(&self, hash: BlockHash) -> bool {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.contains(hash)
    }

    async fn get(&self, hash: BlockHash, layer: LayerIndex) -> Result<Option<Bytes>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(hash, layer).await
    }

    async fn put(&self, hash: BlockHash, layer: LayerIndex, data: Bytes) -> Result<(), StoreError> {
        self.inner.put(hash, layer, data).await
    }
}

/// Store whose writes always fail.
struct OfflineStore;

#[async_trait]
impl KvStore for OfflineStore {
    fn name(&self) -> &str {
        "offline"
    }

    fn contains(&self, _hash: BlockHash) -> bool {
        false
    }

    async fn get(&self, _hash: BlockHash, _layer: LayerIndex) -> Result<Option<Bytes>, StoreError> {
        Ok(None)
    }

    async fn put(&self, _hash: BlockHash, _layer: LayerIndex, _data: Bytes) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("offline".to_string()))
    }
}

/// Scheduler plugin whose index is unreachable, so every lookup fails.
struct UnreachableScheduler;

impl SchedulerConnector for UnreachableScheduler {
    fn name(&self) -> &str {
        "Unreachable"
    }

    fn get_num_new_matched_blocks(
        &mut self,
        _request: &RequestInfo,
        _num_computed_blocks: usize,
    ) -> Result<usize> {
        Err(StoreError::Unavailable("index unreachable".to_string()).into())
    }

    fn update_state_after_alloc(
        &mut self,
        _request: &RequestInfo,
        _block_ids: &[BlockId],
        _num_external_blocks: usize,
    ) -> Result<()> {
        Ok(())
    }

    fn build_connector_meta(&mut self) -> ConnectorMetadata {
        ConnectorMetadata::default()
    }

    fn update_connector_output(&mut self, _output: &ConnectorOutput) {}

    fn request_finished(&mut self, _request_id: &str) -> bool {
        false
    }

    fn cancel_request(&mut self, _request_id: &str) -> Vec<BlockId> {
        Vec::new()
    }

    fn transfer_status(&self, _request_id: &str) -> Option<TransferStatus> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct UnreachableClass;

impl ConnectorClass for UnreachableClass {
    fn class_name(&self) -> &str {
        "Unreachable"
    }

    fn supported_versions(&self) -> &[RuntimeVersion] {
        &[RuntimeVersion::Current]
    }

    fn supports_role(&self, role: ConnectorRole) -> bool {
        role == ConnectorRole::Scheduler
    }

    fn build(&self, _ctx: &BuildContext<'_>) -> Result<ConnectorInstance> {
        Ok(ConnectorInstance::Scheduler(Box::new(UnreachableScheduler)))
    }
}

/// Registry with the built-ins plus "Unreachable" from module "plugins::remote".
fn plugin_registry() -> Arc<ConnectorRegistry> {
    let catalog = Arc::new(ModuleCatalog::with_builtins());
    catalog.add_class(
        "plugins::remote",
        "Unreachable",
        Arc::new(|| Arc::new(UnreachableClass) as Arc<dyn ConnectorClass>),
    );
    let registry = ConnectorRegistry::with_catalog(catalog);
    registry.register_builtins().unwrap();
    registry
        .register_connector("Unreachable", "plugins::remote", "Unreachable")
        .unwrap();
    Arc::new(registry)
}

/// Composite over `children`: store names, or `"!"` for the unreachable plugin.
fn composite_of(children: &[&str], num_layers: usize, kv_role: &str) -> Arc<ConnectorConfig> {
    let connectors: Vec<_> = children
        .iter()
        .map(|child| match *child {
            "!" => json!({"kv_connector": "Unreachable"}),
            store => json!({"kv_connector": "StorageConnector", "extra_config": {"store": store}}),
        })
        .collect();
    let mut config =
        ConnectorConfig::for_connector("MultiConnector").with_option("connectors", json!(connectors));
    config.kv_role = Some(kv_role.to_string());
    config.layout.num_layers = num_layers;
    config.layout.block_size = BLOCK_SIZE;
    Arc::new(config)
}

fn composite(stores: &[&str], num_layers: usize, kv_role: &str) -> Arc<ConnectorConfig> {
    composite_of(stores, num_layers, kv_role)
}

async fn store_prompt(store: &MemoryStore, request: &RequestInfo, num_layers: usize) {
    for &hash in &request.block_hashes {
        for layer in 0..num_layers {
            store.put(hash, layer, layer_bytes(hash, layer)).await.unwrap();
        }
    }
}

fn layer_bytes(hash: BlockHash, layer: LayerIndex) -> Bytes {
    Bytes::from(format!("{hash:016x}/{layer}").into_bytes())
}

fn registry() -> Arc<ConnectorRegistry> {
    Arc::new(ConnectorRegistry::with_builtins())
}

#[tokio::test]
async fn test_first_hit_loads_from_that_store_only() {
    const NUM_LAYERS: usize = 2;
    let tokens: Vec<u32> = (0..10).collect();
    let request = RequestInfo::from_tokens("r1", &tokens, BLOCK_SIZE);
    assert_eq!(request.block_hashes.len(), 2);

    let b = Arc::new(MemoryStore::new("b", NUM_LAYERS));
    for &hash in &request.block_hashes {
        for layer in 0..NUM_LAYERS {
            b.put(hash, layer, layer_bytes(hash, layer)).await.unwrap();
        }
    }
    let c = Arc::new(CountingStore::new("c", NUM_LAYERS));
    let factory = ConnectorFactory::new(registry(), RuntimeVersion::Current)
        .with_store("a", Arc::new(MemoryStore::new("a", NUM_LAYERS)))
        .with_store("b", b.clone())
        .with_store("c", c.clone());
    let config = composite(&["a", "b", "c"], NUM_LAYERS, "consumer");

    let mut scheduler = factory.create_scheduler(config.clone()).unwrap();
    let worker = factory.create_worker(config).unwrap();
    let pool = Arc::new(KvBlockPool::new(8, NUM_LAYERS));
    worker.register_kv_caches(pool.clone()).unwrap();

    assert_eq!(scheduler.get_num_new_matched_blocks(&request, 0).unwrap(), 2);
    scheduler.update_state_after_alloc(&request, &[3, 4, 5], 2).unwrap();
    {
        let multi = scheduler.as_any().downcast_ref::<MultiScheduler>().unwrap();
        assert_eq!(multi.chosen_connector("r1"), Some(1));
    }
    assert_eq!(scheduler.transfer_status("r1"), Some(TransferStatus::NeedsLoad));

    let meta = scheduler.build_connector_meta();
    assert_eq!(meta.children.len(), 3);
    assert!(meta.children[0].loads.is_empty());
    let block_ids: Vec<u64> = meta.children[1].loads[0]
        .blocks
        .iter()
        .map(|b| b.block_id)
        .collect();
    assert_eq!(block_ids, vec![3, 4]);
    assert!(meta.children[2].loads.is_empty());

    worker.bind_connector_metadata(meta).unwrap();
    worker.start_load_kv().unwrap();
    for layer in 0..NUM_LAYERS {
        let outcome = worker.wait_for_layer_load(layer, &[3, 4, 5]).await;
        assert_eq!(outcome.ready, vec![3, 4]);
        assert!(outcome.recompute.is_empty());
    }
    for layer in 0..NUM_LAYERS {
        assert_eq!(
            pool.read_layer(3, layer).unwrap(),
            layer_bytes(request.block_hashes[0], layer)
        );
        assert_eq!(
            pool.read_layer(4, layer).unwrap(),
            layer_bytes(request.block_hashes[1], layer)
        );
    }

    for _ in 0..100 {
        let output = worker.get_finished();
        scheduler.update_connector_output(&output);
        if scheduler.transfer_status("r1") == Some(TransferStatus::Loaded) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(scheduler.transfer_status("r1"), Some(TransferStatus::Loaded));

    // The lowest-priority store was never consulted.
    assert_eq!(c.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(c.reads.load(Ordering::SeqCst), 0);
    assert!(!scheduler.request_finished("r1"));
}

#[tokio::test]
async fn test_save_outcome_reported_per_store() {
    let factory = ConnectorFactory::new(registry(), RuntimeVersion::Current)
        .with_store("down", Arc::new(OfflineStore));
    let config = composite(&["up", "down"], 1, "producer");

    let mut scheduler = factory.create_scheduler(config.clone()).unwrap();
    let worker = factory.create_worker(config).unwrap();
    let pool = Arc::new(KvBlockPool::new(8, 1));
    worker.register_kv_caches(pool.clone()).unwrap();

    let request = RequestInfo::from_tokens("r1", &(0..9).collect::<Vec<_>>(), BLOCK_SIZE);
    assert_eq!(scheduler.get_num_new_matched_blocks(&request, 0).unwrap(), 0);
    scheduler.update_state_after_alloc(&request, &[0, 1, 2], 0).unwrap();
    pool.store_computed(0, 0, Bytes::from_static(b"block-0")).unwrap();
    pool.store_computed(1, 0, Bytes::from_static(b"block-1")).unwrap();

    worker.bind_connector_metadata(scheduler.build_connector_meta()).unwrap();
    worker.start_load_kv().unwrap();
    worker.save_kv_layer(0).unwrap();
    worker.wait_for_save().await;

    let output = worker.get_finished();
    assert_eq!(
        output.children[0].events,
        vec![TransferEvent::SaveFinished {
            request_id: "r1".to_string(),
            block_ids: vec![0, 1],
        }]
    );
    match &output.children[1].events[..] {
        [TransferEvent::SaveFailed {
            block_ids, error, ..
        }] => {
            assert_eq!(block_ids, &vec![0, 1]);
            match error {
                TransferError::SaveFailed { block_ids, reason, .. } => {
                    assert_eq!(block_ids, &vec![0, 1]);
                    assert!(reason.contains("offline"));
                }
                other => panic!("expected a save failure, got {other:?}"),
            }
        }
        other => panic!("expected one save failure, got {other:?}"),
    }
    scheduler.update_connector_output(&output);

    let multi = scheduler.as_any().downcast_ref::<MultiScheduler>().unwrap();
    let report = multi.save_report("r1");
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].connector, "StorageConnector[up]");
    assert_eq!(report[0].outcome, SaveOutcome::Succeeded);
    assert!(matches!(&report[1].outcome, SaveOutcome::Failed(reason) if reason.contains("offline")));

    // One failed backend does not hide the successful save.
    assert_eq!(scheduler.transfer_status("r1"), Some(TransferStatus::Saved));

    let stats = worker.backend_stats();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].health.total_failures, 0);
    assert_eq!(stats[1].health.total_failures, 2);
}

#[test]
fn test_save_fails_only_when_every_store_fails() {
    let factory = ConnectorFactory::new(registry(), RuntimeVersion::Current);
    let worker = factory.create_worker(composite(&["a", "b"], 1, "both")).unwrap();

    // No pool registered: every sub-connector rejects the save.
    match worker.save_kv_layer(0) {
        Err(ConnectorError::Transfer(TransferError::AllBackendsFailed {
            attempted,
            failures,
        })) => {
            assert_eq!(attempted, 2);
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected all backends to fail, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failing_lookup_recorded_and_next_store_serves() {
    let request = RequestInfo::from_tokens("r1", &(0..10).collect::<Vec<_>>(), BLOCK_SIZE);
    let b = Arc::new(MemoryStore::new("b", 1));
    store_prompt(&b, &request, 1).await;
    let factory =
        ConnectorFactory::new(plugin_registry(), RuntimeVersion::Current).with_store("b", b);
    let mut scheduler = factory
        .create_scheduler(composite_of(&["!", "b"], 1, "consumer"))
        .unwrap();

    assert_eq!(scheduler.get_num_new_matched_blocks(&request, 0).unwrap(), 2);
    scheduler.update_state_after_alloc(&request, &[3, 4, 5], 2).unwrap();
    assert_eq!(scheduler.transfer_status("r1"), Some(TransferStatus::NeedsLoad));

    let multi = scheduler.as_any().downcast_ref::<MultiScheduler>().unwrap();
    assert_eq!(multi.chosen_connector("r1"), Some(1));
    match multi.partial_failures("r1") {
        [(connector, error)] => {
            assert_eq!(connector, "Unreachable");
            assert!(error.contains("index unreachable"));
        }
        other => panic!("expected one partial failure, got {other:?}"),
    }
}

#[test]
fn test_lookup_miss_with_one_failing_store_is_not_an_error() {
    let factory = ConnectorFactory::new(plugin_registry(), RuntimeVersion::Current);
    let mut scheduler = factory
        .create_scheduler(composite_of(&["empty", "!"], 1, "consumer"))
        .unwrap();

    let request = RequestInfo::from_tokens("r1", &(0..10).collect::<Vec<_>>(), BLOCK_SIZE);
    assert_eq!(scheduler.get_num_new_matched_blocks(&request, 0).unwrap(), 0);
    let multi = scheduler.as_any().downcast_ref::<MultiScheduler>().unwrap();
    assert_eq!(multi.chosen_connector("r1"), None);
    assert_eq!(multi.partial_failures("r1").len(), 1);
}

#[test]
fn test_lookup_fails_when_every_store_fails() {
    let factory = ConnectorFactory::new(plugin_registry(), RuntimeVersion::Current);
    let mut scheduler = factory
        .create_scheduler(composite_of(&["!", "!"], 1, "consumer"))
        .unwrap();

    let request = RequestInfo::from_tokens("r1", &(0..10).collect::<Vec<_>>(), BLOCK_SIZE);
    match scheduler.get_num_new_matched_blocks(&request, 0) {
        Err(ConnectorError::Transfer(TransferError::AllBackendsFailed {
            attempted,
            failures,
        })) => {
            assert_eq!(attempted, 2);
            assert_eq!(failures.len(), 2);
            assert!(failures.iter().all(|(connector, _)| connector == "Unreachable"));
        }
        other => panic!("expected all backends to fail, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rejected_load_leaves_no_state_in_any_store() {
    let tokens: Vec<u32> = (0..10).collect();
    let first = RequestInfo::from_tokens("r0", &tokens, BLOCK_SIZE);
    let second = RequestInfo::from_tokens("r1", &tokens, BLOCK_SIZE);
    let b = Arc::new(MemoryStore::new("b", 1));
    store_prompt(&b, &first, 1).await;
    let factory = ConnectorFactory::new(registry(), RuntimeVersion::Current).with_store("b", b);
    let mut scheduler = factory
        .create_scheduler(composite(&["a", "b"], 1, "both"))
        .unwrap();

    assert_eq!(scheduler.get_num_new_matched_blocks(&first, 0).unwrap(), 2);
    scheduler.update_state_after_alloc(&first, &[3, 4, 5], 2).unwrap();

    // Blocks 3 and 4 are still reserved for the first request's load.
    assert_eq!(scheduler.get_num_new_matched_blocks(&second, 0).unwrap(), 2);
    let err = scheduler
        .update_state_after_alloc(&second, &[3, 4, 6], 2)
        .unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::State(StateError::AlreadyReserved { block_id: 3, .. })
    ));
    assert_eq!(scheduler.transfer_status("r1"), None);
    {
        let multi = scheduler.as_any().downcast_ref::<MultiScheduler>().unwrap();
        assert!(multi
            .children()
            .iter()
            .all(|child| child.transfer_status("r1").is_none()));
    }

    let meta = scheduler.build_connector_meta();
    for child in &meta.children {
        assert!(child.loads.iter().all(|load| load.request_id == "r0"));
        assert!(child.saves.iter().all(|save| save.request_id == "r0"));
    }
    assert_eq!(meta.children[1].loads.len(), 1);
}
