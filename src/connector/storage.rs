//! Reference connector moving blocks through a [`KvStore`].
//!
//! The scheduler half answers lookups from the store's local index and keeps
//! block reservations in a [`RequestTracker`]. The worker half loads layer by
//! layer on background tasks, so attention over early layers overlaps with
//! fetching later ones, and hands saves to a [`TransferQueue`].
//!
//! Options (`extra_config`):
//! - `backend`: `"memory"` (default) or `"disk"`
//! - `store`: name of the store both halves use (default: the connector name)
//! - `path`, `zstd_level`: disk backend only, see [`ConnectorFactory::open_stores`]
//!
//! `kv_role` selects the direction: `producer` only saves, `consumer` only
//! loads, `both` (or unset) does both.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::cache::block::{BlockId, BlockTransfer, KvBlockPool, LayerIndex};
use crate::cache::state::{LoadSpec, RequestTracker, SaveSpec, StateError, TransferStatus};
use crate::config::ConnectorConfig;
use crate::connector::base::{
    BackendStats, BuildContext, ConnectorClass, ConnectorInstance, ConnectorMetadata,
    ConnectorOutput, ConnectorRole, LayerLoadOutcome, RequestInfo, RuntimeVersion,
    SchedulerConnector, TransferEvent, WorkerConnector,
};
use crate::connector::factory::ConnectorFactory;
use crate::error::{ConfigurationError, ConnectorError, Result, TransferError};
use crate::metrics;
use crate::transfer::health::BackendHealth;
use crate::transfer::queue::{SaveCompletion, SaveJob, TransferQueue};
use crate::transfer::store::{KvStore, MemoryStore};

pub const MODULE_PATH: &str = "kv_connector::connector::storage";
pub const CLASS_NAME: &str = "StorageConnector";
pub const LEGACY_CLASS_NAME: &str = "LegacyStorageConnector";

/// `StorageConnector` for current-version runtimes.
pub fn current_class() -> Arc<dyn ConnectorClass> {
    Arc::new(StorageConnectorClass {
        name: CLASS_NAME,
        versions: &[RuntimeVersion::Current],
    })
}

/// The same implementation published for legacy runtimes.
pub fn legacy_class() -> Arc<dyn ConnectorClass> {
    Arc::new(StorageConnectorClass {
        name: LEGACY_CLASS_NAME,
        versions: &[RuntimeVersion::Legacy],
    })
}

struct StorageConnectorClass {
    name: &'static str,
    versions: &'static [RuntimeVersion],
}

impl ConnectorClass for StorageConnectorClass {
    fn class_name(&self) -> &str {
        self.name
    }

    fn supported_versions(&self) -> &[RuntimeVersion] {
        self.versions
    }

    fn supports_role(&self, _role: ConnectorRole) -> bool {
        true
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<ConnectorInstance> {
        let options = StorageOptions::parse(&ctx.config)?;
        let store = options.resolve_store(&ctx.config, ctx.factory)?;
        Ok(match ctx.role {
            ConnectorRole::Scheduler => ConnectorInstance::Scheduler(Box::new(
                StorageScheduler::new(ctx.config.clone(), options, store),
            )),
            ConnectorRole::Worker => ConnectorInstance::Worker(Box::new(StorageWorker::new(
                ctx.config.clone(),
                options,
                store,
            ))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Memory,
    Disk,
}

#[derive(Debug, Clone)]
struct StorageOptions {
    backend: Backend,
    store: String,
    load: bool,
    save: bool,
}

impl StorageOptions {
    fn parse(config: &ConnectorConfig) -> Result<Self, ConfigurationError> {
        let invalid = |message: String| ConfigurationError::InvalidOption {
            connector: config.kv_connector.clone(),
            message,
        };

        let backend = match config.get_string_option("backend").as_deref() {
            None | Some("memory") => Backend::Memory,
            Some("disk") => Backend::Disk,
            Some(other) => return Err(invalid(format!("unknown backend '{other}'"))),
        };
        let (load, save) = match config.kv_role.as_deref() {
            None | Some("both") => (true, true),
            Some("producer") => (false, true),
            Some("consumer") => (true, false),
            Some(other) => return Err(invalid(format!("unknown kv_role '{other}'"))),
        };

        Ok(Self {
            backend,
            store: config
                .get_string_option("store")
                .unwrap_or_else(|| config.kv_connector.clone()),
            load,
            save,
        })
    }

    fn resolve_store(
        &self,
        config: &ConnectorConfig,
        factory: &ConnectorFactory,
    ) -> Result<Arc<dyn KvStore>, ConfigurationError> {
        if let Some(store) = factory.store(&self.store) {
            return Ok(store);
        }
        match self.backend {
            Backend::Memory => Ok(factory.store_or_insert_with(&self.store, || {
                Arc::new(MemoryStore::new(self.store.clone(), config.layout.num_layers))
            })),
            Backend::Disk => Err(ConfigurationError::InvalidOption {
                connector: config.kv_connector.clone(),
                message: format!("disk store '{}' has not been opened", self.store),
            }),
        }
    }

    fn display_name(&self, config: &ConnectorConfig) -> String {
        if self.store == config.kv_connector {
            config.kv_connector.clone()
        } else {
            format!("{}[{}]", config.kv_connector, self.store)
        }
    }
}

pub struct StorageScheduler {
    name: String,
    config: Arc<ConnectorConfig>,
    options: StorageOptions,
    store: Arc<dyn KvStore>,
    tracker: RequestTracker,

    /// Last lookup per request: (first external block index, matched count).
    matched: HashMap<String, (usize, usize)>,

    /// Requests cancelled since the last metadata build.
    cancelled: Vec<String>,
}

impl StorageScheduler {
    fn new(config: Arc<ConnectorConfig>, options: StorageOptions, store: Arc<dyn KvStore>) -> Self {
        Self {
            name: options.display_name(&config),
            config,
            options,
            store,
            tracker: RequestTracker::new(),
            matched: HashMap::new(),
            cancelled: Vec::new(),
        }
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn check_not_cancelled(&self, request_id: &str) -> Result<()> {
        if self.cancelled.iter().any(|id| id == request_id) {
            return Err(ConnectorError::Cancelled {
                request_id: request_id.to_string(),
            });
        }
        Ok(())
    }
}

impl SchedulerConnector for StorageScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_num_new_matched_blocks(
        &mut self,
        request: &RequestInfo,
        num_computed_blocks: usize,
    ) -> Result<usize> {
        self.check_not_cancelled(&request.request_id)?;
        if !self.options.load {
            return Ok(0);
        }

        let hashes = &request.block_hashes;
        // The last prompt token is always computed locally.
        let block_size = self.config.layout.block_size.max(1);
        let limit = if hashes.len() * block_size >= request.num_prompt_tokens {
            hashes.len().saturating_sub(1)
        } else {
            hashes.len()
        };
        let start = num_computed_blocks.min(limit);
        let count = hashes[start..limit]
            .iter()
            .take_while(|&&hash| self.store.contains(hash))
            .count();

        let outcome = if count > 0 { "hit" } else { "miss" };
        metrics::LOADS_TOTAL
            .with_label_values(&[self.name.as_str(), outcome])
            .inc();
        debug!(
            connector = %self.name,
            request_id = %request.request_id,
            num_computed_blocks,
            matched = count,
            "External lookup"
        );

        self.matched
            .insert(request.request_id.clone(), (start, count));
        Ok(count)
    }

    fn update_state_after_alloc(
        &mut self,
        request: &RequestInfo,
        block_ids: &[BlockId],
        num_external_blocks: usize,
    ) -> Result<()> {
        let request_id = request.request_id.as_str();
        self.check_not_cancelled(request_id)?;
        let (start, matched) = self.matched.remove(request_id).unwrap_or((0, 0));
        if num_external_blocks > matched {
            return Err(StateError::BlockCountMismatch {
                request_id: request_id.to_string(),
                requested: num_external_blocks,
                available: matched,
            }
            .into());
        }
        let end = start + num_external_blocks;
        if end > block_ids.len() {
            return Err(StateError::BlockCountMismatch {
                request_id: request_id.to_string(),
                requested: end,
                available: block_ids.len(),
            }
            .into());
        }

        if num_external_blocks > 0 {
            let blocks: Vec<BlockTransfer> = (start..end)
                .map(|i| BlockTransfer {
                    block_id: block_ids[i],
                    hash: request.block_hashes[i],
                })
                .collect();
            debug!(
                connector = %self.name,
                request_id,
                block_ids = ?&block_ids[start..end],
                "Reserved blocks for external load"
            );
            self.tracker.reserve_for_load(request_id, blocks)?;
        } else if matches!(
            self.tracker.status(request_id),
            None | Some(TransferStatus::Pending)
        ) {
            self.tracker.mark_no_external(request_id)?;
        }

        if self.options.save {
            let saves: Vec<BlockTransfer> = block_ids
                .iter()
                .zip(&request.block_hashes)
                .filter(|(_, hash)| !self.store.contains(**hash))
                .map(|(&block_id, &hash)| BlockTransfer { block_id, hash })
                .collect();
            if !saves.is_empty() {
                self.tracker.stage_save(request_id, saves);
            }
        }
        Ok(())
    }

    fn build_connector_meta(&mut self) -> ConnectorMetadata {
        ConnectorMetadata {
            loads: self.tracker.take_load_specs(),
            saves: self.tracker.take_save_specs(),
            cancelled: std::mem::take(&mut self.cancelled),
            children: Vec::new(),
        }
    }

    fn update_connector_output(&mut self, output: &ConnectorOutput) {
        for event in &output.events {
            let request_id = event.request_id();
            let result = match event {
                TransferEvent::LoadFinished { .. } => self.tracker.complete_load(request_id),
                TransferEvent::LoadFailed {
                    block_ids, error, ..
                } => self.tracker.fail_load(request_id).map(|recompute| {
                    warn!(
                        connector = %self.name,
                        request_id,
                        block_ids = ?block_ids,
                        recompute = ?recompute,
                        error = %error,
                        "External load failed, recomputing locally"
                    );
                }),
                TransferEvent::SaveFinished { .. } => {
                    self.tracker.complete_save(request_id, true).map(|dropped| {
                        if dropped {
                            debug!(connector = %self.name, request_id, "Save finished, releasing held blocks");
                        }
                    })
                }
                TransferEvent::SaveFailed {
                    block_ids, error, ..
                } => {
                    warn!(
                        connector = %self.name,
                        request_id,
                        block_ids = ?block_ids,
                        error = %error,
                        "External save failed"
                    );
                    self.tracker.complete_save(request_id, false).map(|_| ())
                }
            };
            if let Err(e) = result {
                // Completions for cancelled requests arrive after they are gone.
                debug!(connector = %self.name, request_id, error = %e, "Ignoring transfer event");
            }
        }
    }

    fn request_finished(&mut self, request_id: &str) -> bool {
        self.matched.remove(request_id);
        self.tracker.finish(request_id)
    }

    fn cancel_request(&mut self, request_id: &str) -> Vec<BlockId> {
        self.matched.remove(request_id);
        let Some(released) = self.tracker.cancel(request_id) else {
            return Vec::new();
        };
        self.cancelled.push(request_id.to_string());
        metrics::CANCELLATIONS_TOTAL
            .with_label_values(&[self.name.as_str()])
            .inc();
        debug!(connector = %self.name, request_id, block_ids = ?released, "Request cancelled");
        released
    }

    fn transfer_status(&self, request_id: &str) -> Option<TransferStatus> {
        self.tracker.status(request_id)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Default)]
struct LoadProgress {
    /// Layers `0..layers_ready` are resident for every block of the load.
    layers_ready: usize,
    failed: Option<String>,
}

struct InflightLoad {
    request_id: String,
    block_ids: Vec<BlockId>,
    progress: watch::Receiver<LoadProgress>,
    task: Option<AbortHandle>,

    /// Finished, failed or expired; later signals for it are ignored.
    settled: bool,
}

struct SaveProgress {
    block_ids: Vec<BlockId>,
    expected: usize,
    done: usize,
    failed_blocks: BTreeSet<BlockId>,
    first_error: Option<String>,
}

#[derive(Default)]
struct WorkerState {
    bound_loads: Vec<LoadSpec>,
    bound_saves: Vec<SaveSpec>,
    next_load_id: u64,
    inflight: HashMap<u64, InflightLoad>,

    /// Load responsible for each externally sourced block.
    block_loads: HashMap<BlockId, u64>,

    saves: HashMap<String, SaveProgress>,
    events: Vec<TransferEvent>,
}

impl WorkerState {
    fn record_save(&mut self, request_id: &str, block_id: BlockId, result: Result<(), String>) {
        let Some(progress) = self.saves.get_mut(request_id) else {
            return;
        };
        progress.done += 1;
        if let Err(reason) = result {
            progress.failed_blocks.insert(block_id);
            progress.first_error.get_or_insert(reason);
        }
        if progress.done < progress.expected {
            return;
        }
        if let Some(progress) = self.saves.remove(request_id) {
            let request_id = request_id.to_string();
            self.events.push(match progress.first_error {
                None => TransferEvent::SaveFinished {
                    request_id,
                    block_ids: progress.block_ids,
                },
                Some(reason) => {
                    let block_ids: Vec<BlockId> = progress.failed_blocks.into_iter().collect();
                    TransferEvent::SaveFailed {
                        error: TransferError::SaveFailed {
                            request_id: request_id.clone(),
                            block_ids: block_ids.clone(),
                            reason,
                        },
                        request_id,
                        block_ids,
                    }
                }
            });
        }
    }
}

pub struct StorageWorker {
    name: String,
    config: Arc<ConnectorConfig>,
    store: Arc<dyn KvStore>,
    health: Arc<BackendHealth>,
    pool: OnceCell<Arc<KvBlockPool>>,
    queue: OnceCell<TransferQueue>,
    completions_tx: mpsc::UnboundedSender<SaveCompletion>,
    completions_rx: Mutex<mpsc::UnboundedReceiver<SaveCompletion>>,
    state: Arc<Mutex<WorkerState>>,
}

impl StorageWorker {
    fn new(config: Arc<ConnectorConfig>, options: StorageOptions, store: Arc<dyn KvStore>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            name: options.display_name(&config),
            health: Arc::new(BackendHealth::new(
                options.store.clone(),
                config.transfer.health_failure_threshold,
            )),
            config,
            store,
            pool: OnceCell::new(),
            queue: OnceCell::new(),
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
            state: Arc::new(Mutex::new(WorkerState::default())),
        }
    }

    pub fn health(&self) -> &BackendHealth {
        &self.health
    }

    fn pool(&self) -> Result<&Arc<KvBlockPool>, TransferError> {
        self.pool.get().ok_or(TransferError::PoolNotRegistered)
    }

    fn record_save(&self, request_id: &str, block_id: BlockId, result: Result<(), String>) {
        self.state.lock().record_save(request_id, block_id, result);
    }

    /// Give up on a load that missed the wait deadline.
    fn expire_load(&self, load_id: u64, layer: LayerIndex) {
        let mut state = self.state.lock();
        let Some(load) = state.inflight.get_mut(&load_id) else {
            return;
        };
        if load.settled {
            return;
        }
        load.settled = true;
        if let Some(task) = load.task.take() {
            task.abort();
        }
        let request_id = load.request_id.clone();
        let block_ids = load.block_ids.clone();

        if let Some(pool) = self.pool.get() {
            pool.revoke_blocks(&request_id, &block_ids);
        }
        self.health.record_failure();
        metrics::LOADS_TOTAL
            .with_label_values(&[self.name.as_str(), "timeout"])
            .inc();
        let timeout_ms = self.config.transfer.load_timeout_ms;
        warn!(
            connector = %self.name,
            request_id = %request_id,
            block_ids = ?block_ids,
            layer,
            timeout_ms,
            "External load timed out, recomputing locally"
        );
        state.events.push(TransferEvent::LoadFailed {
            error: TransferError::LoadTimeout {
                request_id: request_id.clone(),
                block_ids: block_ids.clone(),
                timeout_ms,
            },
            request_id,
            block_ids,
        });
    }
}

/// Background fetch of one load, layer-major.
struct LoadTask {
    connector: String,
    load_id: u64,
    request_id: String,
    blocks: Vec<BlockTransfer>,
    num_layers: usize,
    store: Arc<dyn KvStore>,
    pool: Arc<KvBlockPool>,
    health: Arc<BackendHealth>,
    state: Arc<Mutex<WorkerState>>,
}

impl LoadTask {
    async fn run(self, progress: watch::Sender<LoadProgress>) {
        let result = self.fetch(&progress).await;
        if let Err(reason) = &result {
            progress.send_modify(|p| p.failed = Some(reason.clone()));
        }
        self.settle(result);
    }

    async fn fetch(&self, progress: &watch::Sender<LoadProgress>) -> Result<(), String> {
        for layer in 0..self.num_layers {
            for block in &self.blocks {
                let data = match self.store.get(block.hash, layer).await {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        return Err(format!(
                            "block {:016x} layer {layer} missing from {}",
                            block.hash,
                            self.store.name()
                        ))
                    }
                    Err(e) => return Err(e.to_string()),
                };
                self.pool
                    .write_layer(&self.request_id, block.block_id, layer, data)
                    .map_err(|e| e.to_string())?;
            }
            progress.send_modify(|p| p.layers_ready = layer + 1);
        }
        Ok(())
    }

    fn settle(&self, result: Result<(), String>) {
        let mut state = self.state.lock();
        let Some(load) = state.inflight.get_mut(&self.load_id) else {
            return;
        };
        if load.settled {
            return;
        }
        load.settled = true;
        load.task = None;
        let block_ids = load.block_ids.clone();

        let event = match result {
            Ok(()) => {
                self.pool.release_blocks(&self.request_id, &block_ids);
                self.health.record_success();
                debug!(
                    connector = %self.connector,
                    request_id = %self.request_id,
                    block_ids = ?block_ids,
                    "External load finished"
                );
                TransferEvent::LoadFinished {
                    request_id: self.request_id.clone(),
                    block_ids,
                }
            }
            Err(reason) => {
                self.pool.revoke_blocks(&self.request_id, &block_ids);
                self.health.record_failure();
                metrics::LOADS_TOTAL
                    .with_label_values(&[self.connector.as_str(), "failed"])
                    .inc();
                warn!(
                    connector = %self.connector,
                    request_id = %self.request_id,
                    block_ids = ?block_ids,
                    reason = %reason,
                    "External load failed"
                );
                TransferEvent::LoadFailed {
                    error: TransferError::LoadFailed {
                        request_id: self.request_id.clone(),
                        block_ids: block_ids.clone(),
                        reason,
                    },
                    request_id: self.request_id.clone(),
                    block_ids,
                }
            }
        };
        state.events.push(event);
    }
}

#[async_trait]
impl WorkerConnector for StorageWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_kv_caches(&self, pool: Arc<KvBlockPool>) -> Result<()> {
        if pool.num_layers() != self.config.layout.num_layers {
            return Err(ConfigurationError::InvalidOption {
                connector: self.name.clone(),
                message: format!(
                    "pool has {} layers but the layout declares {}",
                    pool.num_layers(),
                    self.config.layout.num_layers
                ),
            }
            .into());
        }
        let (num_blocks, num_layers) = (pool.num_blocks(), pool.num_layers());
        if self.pool.set(pool).is_err() {
            return Err(ConfigurationError::InvalidOption {
                connector: self.name.clone(),
                message: "KV caches are already registered".to_string(),
            }
            .into());
        }
        self.queue.get_or_try_init(|| {
            TransferQueue::spawn(
                self.name.clone(),
                &self.config.transfer,
                self.store.clone(),
                self.health.clone(),
                self.completions_tx.clone(),
            )
        })?;
        info!(connector = %self.name, num_blocks, num_layers, "Registered KV caches");
        Ok(())
    }

    fn bind_connector_metadata(&self, metadata: ConnectorMetadata) -> Result<()> {
        for request_id in &metadata.cancelled {
            self.cancel_request(request_id);
        }

        let num_layers = self.config.layout.num_layers;
        let mut state = self.state.lock();
        for save in metadata.saves.iter().filter(|s| !s.blocks.is_empty()) {
            state
                .saves
                .entry(save.request_id.clone())
                .or_insert_with(|| SaveProgress {
                    block_ids: save.blocks.iter().map(|b| b.block_id).collect(),
                    expected: save.blocks.len() * num_layers,
                    done: 0,
                    failed_blocks: BTreeSet::new(),
                    first_error: None,
                });
        }
        state.bound_loads = metadata.loads;
        state.bound_saves = metadata.saves;
        Ok(())
    }

    fn start_load_kv(&self) -> Result<()> {
        let pool = self.pool()?.clone();
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| TransferError::NoRuntime)?;

        let mut state = self.state.lock();
        for spec in std::mem::take(&mut state.bound_loads) {
            let blocks: Vec<BlockTransfer> = spec
                .blocks
                .into_iter()
                .filter(|b| !state.block_loads.contains_key(&b.block_id))
                .collect();
            if blocks.is_empty() {
                debug!(connector = %self.name, request_id = %spec.request_id, "Load already issued");
                continue;
            }
            let block_ids: Vec<BlockId> = blocks.iter().map(|b| b.block_id).collect();
            let load_id = state.next_load_id;
            state.next_load_id += 1;
            for &block_id in &block_ids {
                state.block_loads.insert(block_id, load_id);
            }

            let (progress_tx, progress_rx) = watch::channel(LoadProgress::default());
            let mut load = InflightLoad {
                request_id: spec.request_id.clone(),
                block_ids: block_ids.clone(),
                progress: progress_rx,
                task: None,
                settled: false,
            };

            if let Err(e) = pool.grant(&spec.request_id, &block_ids) {
                let reason = e.to_string();
                progress_tx.send_replace(LoadProgress {
                    layers_ready: 0,
                    failed: Some(reason.clone()),
                });
                load.settled = true;
                metrics::LOADS_TOTAL
                    .with_label_values(&[self.name.as_str(), "failed"])
                    .inc();
                warn!(connector = %self.name, request_id = %spec.request_id, block_ids = ?block_ids, reason = %reason, "Cannot write reserved blocks");
                state.events.push(TransferEvent::LoadFailed {
                    error: TransferError::LoadFailed {
                        request_id: spec.request_id.clone(),
                        block_ids: block_ids.clone(),
                        reason,
                    },
                    request_id: spec.request_id,
                    block_ids,
                });
                state.inflight.insert(load_id, load);
                continue;
            }

            let task = LoadTask {
                connector: self.name.clone(),
                load_id,
                request_id: spec.request_id,
                blocks,
                num_layers: self.config.layout.num_layers,
                store: self.store.clone(),
                pool: pool.clone(),
                health: self.health.clone(),
                state: self.state.clone(),
            };
            load.task = Some(handle.spawn(task.run(progress_tx)).abort_handle());
            state.inflight.insert(load_id, load);
        }
        Ok(())
    }

    async fn wait_for_layer_load(&self, layer: LayerIndex, block_ids: &[BlockId]) -> LayerLoadOutcome {
        let waits: Vec<(u64, Vec<BlockId>, watch::Receiver<LoadProgress>)> = {
            let state = self.state.lock();
            let mut grouped: BTreeMap<u64, Vec<BlockId>> = BTreeMap::new();
            for block_id in block_ids {
                if let Some(&load_id) = state.block_loads.get(block_id) {
                    grouped.entry(load_id).or_default().push(*block_id);
                }
            }
            grouped
                .into_iter()
                .filter_map(|(load_id, ids)| {
                    state
                        .inflight
                        .get(&load_id)
                        .map(|load| (load_id, ids, load.progress.clone()))
                })
                .collect()
        };

        let mut outcome = LayerLoadOutcome::default();
        if waits.is_empty() {
            return outcome;
        }

        let deadline = tokio::time::Instant::now() + self.config.transfer.load_timeout();
        for (load_id, ids, mut progress) in waits {
            let waited = tokio::time::timeout_at(
                deadline,
                progress.wait_for(|p| p.failed.is_some() || p.layers_ready > layer),
            )
            .await
            .map(|r| r.map(|p| p.failed.is_none()));

            match waited {
                Ok(Ok(true)) => outcome.ready.extend(ids),
                Ok(Ok(false)) | Ok(Err(_)) => outcome.recompute.extend(ids),
                Err(_) => {
                    self.expire_load(load_id, layer);
                    outcome.recompute.extend(ids);
                }
            }
        }
        outcome.ready.sort_unstable();
        outcome.recompute.sort_unstable();
        outcome
    }

    fn save_kv_layer(&self, layer: LayerIndex) -> Result<()> {
        let pool = self.pool()?;
        let queue = self.queue.get().ok_or(TransferError::PoolNotRegistered)?;
        let saves = self.state.lock().bound_saves.clone();

        let mut first_error = None;
        for spec in &saves {
            for block in &spec.blocks {
                let Some(data) = pool.read_layer(block.block_id, layer) else {
                    self.record_save(
                        &spec.request_id,
                        block.block_id,
                        Err(format!("layer {layer} of block {} is not resident", block.block_id)),
                    );
                    continue;
                };
                let job = SaveJob {
                    request_id: spec.request_id.clone(),
                    block_id: block.block_id,
                    hash: block.hash,
                    layer,
                    data,
                };
                if let Err(e) = queue.submit(job) {
                    self.record_save(&spec.request_id, block.block_id, Err(e.to_string()));
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn wait_for_save(&self) {
        if let Some(queue) = self.queue.get() {
            queue.drain().await;
        }
    }

    fn get_finished(&self) -> ConnectorOutput {
        let completions: Vec<SaveCompletion> = {
            let mut rx = self.completions_rx.lock();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        let mut state = self.state.lock();
        for completion in completions {
            state.record_save(&completion.request_id, completion.block_id, completion.result);
        }
        ConnectorOutput {
            events: std::mem::take(&mut state.events),
            children: Vec::new(),
        }
    }

    fn cancel_request(&self, request_id: &str) {
        let cancelled_loads: Vec<u64> = {
            let mut state = self.state.lock();
            state.bound_loads.retain(|s| s.request_id != request_id);
            state.bound_saves.retain(|s| s.request_id != request_id);
            state.saves.remove(request_id);
            state.events.retain(|e| e.request_id() != request_id);

            let ids: Vec<u64> = state
                .inflight
                .iter()
                .filter(|(_, load)| load.request_id == request_id)
                .map(|(&id, _)| id)
                .collect();
            for id in &ids {
                if let Some(task) = state.inflight.remove(id).and_then(|load| load.task) {
                    task.abort();
                }
            }
            state.block_loads.retain(|_, id| !ids.contains(id));
            ids
        };

        if let Some(pool) = self.pool.get() {
            pool.revoke(request_id);
        }
        let dropped_saves = self.queue.get().map_or(0, |queue| queue.cancel(request_id));
        debug!(
            connector = %self.name,
            request_id,
            loads = cancelled_loads.len(),
            dropped_saves,
            "Cancelled transfers"
        );
    }

    fn clear_connector_metadata(&self) {
        let mut state = self.state.lock();
        state.bound_loads.clear();
        state.bound_saves.clear();

        let settled: Vec<u64> = state
            .inflight
            .iter()
            .filter(|(_, load)| load.settled)
            .map(|(&id, _)| id)
            .collect();
        for id in &settled {
            state.inflight.remove(id);
        }
        state.block_loads.retain(|_, id| !settled.contains(id));
    }

    fn backend_stats(&self) -> Vec<BackendStats> {
        vec![BackendStats {
            connector: self.name.clone(),
            health: self.health.snapshot(),
            queue: self.queue.get().map(TransferQueue::stats).unwrap_or_default(),
        }]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
