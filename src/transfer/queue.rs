//! Background transfer queue for saves.
//!
//! Post-attention saves are handed to a dedicated tokio task so the compute
//! path never waits on the backend. Outstanding bytes are bounded: past the
//! configured capacity a job is either parked in a FIFO backlog (throttle) or
//! rejected with a capacity error (fail fast). Jobs are never dropped except
//! when their request is cancelled.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::cache::block::{BlockHash, BlockId, LayerIndex};
use crate::config::{BackpressurePolicy, TransferConfig};
use crate::error::TransferError;
use crate::metrics;
use crate::transfer::health::BackendHealth;
use crate::transfer::store::KvStore;

/// One layer of one block to write to the backend.
#[derive(Debug, Clone)]
pub struct SaveJob {
    pub request_id: String,
    pub block_id: BlockId,
    pub hash: BlockHash,
    pub layer: LayerIndex,
    pub data: Bytes,
}

/// Outcome of a [`SaveJob`], reported back to the submitting connector.
#[derive(Debug, Clone)]
pub struct SaveCompletion {
    pub request_id: String,
    pub block_id: BlockId,
    pub layer: LayerIndex,
    pub result: Result<(), String>,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_scheduled: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_throttled: u64,
    pub total_rejected: u64,
    pub inflight_bytes: usize,
    pub backlog_len: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    inflight_bytes: usize,
    backlog: VecDeque<SaveJob>,

    /// Jobs submitted and not yet completed, per request.
    per_request: HashMap<String, usize>,

    cancelled: HashSet<String>,
    stats: QueueStats,
}

impl QueueState {
    fn outstanding(&self) -> usize {
        self.per_request.values().sum()
    }

    fn finish_job(&mut self, request_id: &str) {
        if let Some(count) = self.per_request.get_mut(request_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_request.remove(request_id);
                self.cancelled.remove(request_id);
            }
        }
    }
}

/// Bounded save queue drained by one background task.
pub struct TransferQueue {
    connector: String,
    capacity: usize,
    policy: BackpressurePolicy,
    state: Arc<Mutex<QueueState>>,
    jobs: mpsc::UnboundedSender<SaveJob>,
    outstanding: Arc<watch::Sender<usize>>,
}

impl TransferQueue {
    /// Spawn the transfer task on the current tokio runtime.
    ///
    /// Completions are delivered on `completions`.
    pub fn spawn(
        connector: impl Into<String>,
        config: &TransferConfig,
        store: Arc<dyn KvStore>,
        health: Arc<BackendHealth>,
        completions: mpsc::UnboundedSender<SaveCompletion>,
    ) -> Result<Self, TransferError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| TransferError::NoRuntime)?;
        let connector = connector.into();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (outstanding, _) = watch::channel(0usize);

        let queue = Self {
            connector: connector.clone(),
            capacity: config.max_inflight_bytes.max(1),
            policy: config.backpressure,
            state: Arc::new(Mutex::new(QueueState::default())),
            jobs: jobs_tx.clone(),
            outstanding: Arc::new(outstanding),
        };

        let worker = TransferWorker {
            connector,
            capacity: queue.capacity,
            store,
            health,
            state: queue.state.clone(),
            jobs: jobs_tx.downgrade(),
            outstanding: queue.outstanding.clone(),
            completions,
        };
        handle.spawn(worker.run(jobs_rx));
        Ok(queue)
    }

    /// Enqueue a save without blocking.
    pub fn submit(&self, job: SaveJob) -> Result<(), TransferError> {
        let size = job.data.len();
        let mut state = self.state.lock();

        if state.cancelled.contains(&job.request_id) {
            debug!(request_id = %job.request_id, block_id = job.block_id, "Skipping save for cancelled request");
            return Ok(());
        }

        let over_capacity = state.inflight_bytes > 0 && state.inflight_bytes + size > self.capacity;
        if over_capacity && self.policy == BackpressurePolicy::FailFast {
            state.stats.total_rejected += 1;
            metrics::CAPACITY_REJECTIONS_TOTAL
                .with_label_values(&[self.connector.as_str(), "fail_fast"])
                .inc();
            return Err(TransferError::CapacityExceeded {
                requested: size,
                inflight: state.inflight_bytes,
                capacity: self.capacity,
            });
        }

        *state.per_request.entry(job.request_id.clone()).or_default() += 1;
        state.stats.total_scheduled += 1;

        // Keep FIFO order: once anything is parked, later jobs park behind it.
        if over_capacity || !state.backlog.is_empty() {
            state.stats.total_throttled += 1;
            metrics::CAPACITY_REJECTIONS_TOTAL
                .with_label_values(&[self.connector.as_str(), "throttle"])
                .inc();
            state.backlog.push_back(job);
        } else {
            state.inflight_bytes += size;
            if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
                state.inflight_bytes -= size;
                state.finish_job(&job.request_id);
                return Err(TransferError::QueueClosed);
            }
        }

        let outstanding = state.outstanding();
        drop(state);
        self.outstanding.send_replace(outstanding);
        Ok(())
    }

    /// Drop parked and future jobs for a request.
    ///
    /// A job already executing still runs to completion; its result is
    /// reported but callers are expected to ignore cancelled requests.
    pub fn cancel(&self, request_id: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.backlog.len();
        state.backlog.retain(|job| job.request_id != request_id);
        let dropped = before - state.backlog.len();
        for _ in 0..dropped {
            state.finish_job(request_id);
        }
        state.stats.total_cancelled += dropped as u64;
        if state.per_request.contains_key(request_id) {
            state.cancelled.insert(request_id.to_string());
        }
        let outstanding = state.outstanding();
        drop(state);
        self.outstanding.send_replace(outstanding);
        dropped
    }

    /// Wait until every submitted job has completed or been cancelled.
    pub async fn drain(&self) {
        let mut rx = self.outstanding.subscribe();
        let _ = rx.wait_for(|&n| n == 0).await;
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            inflight_bytes: state.inflight_bytes,
            backlog_len: state.backlog.len(),
            ..state.stats.clone()
        }
    }
}

/// The dedicated task executing queued saves in submission order.
struct TransferWorker {
    connector: String,
    capacity: usize,
    store: Arc<dyn KvStore>,
    health: Arc<BackendHealth>,
    state: Arc<Mutex<QueueState>>,
    jobs: mpsc::WeakUnboundedSender<SaveJob>,
    outstanding: Arc<watch::Sender<usize>>,
    completions: mpsc::UnboundedSender<SaveCompletion>,
}

impl TransferWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<SaveJob>) {
        while let Some(job) = rx.recv().await {
            let size = job.data.len();
            let cancelled = self.state.lock().cancelled.contains(&job.request_id);

            let result = if cancelled {
                None
            } else {
                Some(
                    self.store
                        .put(job.hash, job.layer, job.data.clone())
                        .await
                        .map_err(|e| e.to_string()),
                )
            };

            match &result {
                Some(Ok(())) => {
                    self.health.record_success();
                    metrics::SAVES_TOTAL
                        .with_label_values(&[self.connector.as_str(), "ok"])
                        .inc();
                }
                Some(Err(reason)) => {
                    self.health.record_failure();
                    metrics::SAVES_TOTAL
                        .with_label_values(&[self.connector.as_str(), "failed"])
                        .inc();
                    warn!(
                        connector = %self.connector,
                        request_id = %job.request_id,
                        block_id = job.block_id,
                        layer = job.layer,
                        reason = %reason,
                        "Save failed"
                    );
                }
                None => {}
            }

            let outstanding = {
                let mut state = self.state.lock();
                state.inflight_bytes = state.inflight_bytes.saturating_sub(size);
                match &result {
                    Some(Ok(())) => state.stats.total_completed += 1,
                    Some(Err(_)) => state.stats.total_failed += 1,
                    None => state.stats.total_cancelled += 1,
                }
                state.finish_job(&job.request_id);
                self.release_backlog(&mut state);
                state.outstanding()
            };

            if let Some(result) = result {
                let _ = self.completions.send(SaveCompletion {
                    request_id: job.request_id,
                    block_id: job.block_id,
                    layer: job.layer,
                    result,
                });
            }
            self.outstanding.send_replace(outstanding);
        }
        debug!(connector = %self.connector, "Transfer worker stopped");
    }

    /// Move parked jobs onto the channel while capacity allows.
    fn release_backlog(&self, state: &mut QueueState) {
        let Some(jobs) = self.jobs.upgrade() else {
            return;
        };
        while let Some(next) = state.backlog.front() {
            let size = next.data.len();
            if state.inflight_bytes > 0 && state.inflight_bytes + size > self.capacity {
                break;
            }
            let Some(job) = state.backlog.pop_front() else {
                break;
            };
            state.inflight_bytes += size;
            if jobs.send(job).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    /// Store whose writes wait for a permit.
    struct GatedStore {
        inner: MemoryStore,
        gate: Semaphore,
    }

    #[async_trait]
    impl KvStore for GatedStore {
        fn name(&self) -> &str {
            "gated"
        }

        fn contains(&self, hash: BlockHash) -> bool {
            self.inner.contains(hash)
        }

        async fn get(&self, hash: BlockHash, layer: LayerIndex) -> Result<Option<Bytes>, StoreError> {
            self.inner.get(hash, layer).await
        }

        async fn put(&self, hash: BlockHash, layer: LayerIndex, data: Bytes) -> Result<(), StoreError> {
            self.gate
                .acquire()
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
                .forget();
            self.inner.put(hash, layer, data).await
        }
    }

    fn job(request_id: &str, block_id: BlockId, size: usize) -> SaveJob {
        SaveJob {
            request_id: request_id.to_string(),
            block_id,
            hash: block_id + 100,
            layer: 0,
            data: Bytes::from(vec![0u8; size]),
        }
    }

    fn gated_queue(
        policy: BackpressurePolicy,
    ) -> (TransferQueue, Arc<GatedStore>, mpsc::UnboundedReceiver<SaveCompletion>) {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new("mem", 1),
            gate: Semaphore::new(0),
        });
        let config = TransferConfig {
            max_inflight_bytes: 10,
            backpressure: policy,
            ..Default::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = TransferQueue::spawn(
            "test",
            &config,
            store.clone(),
            Arc::new(BackendHealth::new("gated", 3)),
            tx,
        )
        .unwrap();
        (queue, store, rx)
    }

    #[tokio::test]
    async fn test_save_completes_and_reports() {
        let store = Arc::new(MemoryStore::new("mem", 1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TransferQueue::spawn(
            "test",
            &TransferConfig::default(),
            store.clone(),
            Arc::new(BackendHealth::new("mem", 3)),
            tx,
        )
        .unwrap();

        queue.submit(job("r1", 1, 64)).unwrap();
        queue.drain().await;

        let done = rx.recv().await.unwrap();
        assert_eq!(done.request_id, "r1");
        assert!(done.result.is_ok());
        assert!(store.contains(101));
        assert_eq!(queue.stats().total_completed, 1);
    }

    #[tokio::test]
    async fn test_fail_fast_rejects_over_capacity() {
        let (queue, store, _rx) = gated_queue(BackpressurePolicy::FailFast);
        queue.submit(job("r1", 1, 8)).unwrap();

        let err = queue.submit(job("r1", 2, 8)).unwrap_err();
        assert!(matches!(err, TransferError::CapacityExceeded { requested: 8, inflight: 8, capacity: 10 }));

        store.gate.add_permits(1);
        queue.drain().await;
        assert_eq!(queue.stats().total_rejected, 1);
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_throttle_parks_and_releases() {
        let (queue, store, mut rx) = gated_queue(BackpressurePolicy::Throttle);
        queue.submit(job("r1", 1, 8)).unwrap();
        queue.submit(job("r1", 2, 8)).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.backlog_len, 1);
        assert_eq!(stats.inflight_bytes, 8);

        store.gate.add_permits(2);
        queue.drain().await;

        let mut saved = vec![rx.recv().await.unwrap().block_id, rx.recv().await.unwrap().block_id];
        saved.sort_unstable();
        assert_eq!(saved, vec![1, 2]);
        assert_eq!(queue.stats().total_throttled, 1);
    }

    #[tokio::test]
    async fn test_cancel_drops_parked_jobs() {
        let (queue, store, _rx) = gated_queue(BackpressurePolicy::Throttle);
        queue.submit(job("r1", 1, 8)).unwrap();
        queue.submit(job("r2", 2, 8)).unwrap();

        assert_eq!(queue.cancel("r2"), 1);
        store.gate.add_permits(1);
        queue.drain().await;
        assert!(!store.contains(102));
        assert_eq!(queue.stats().total_cancelled, 1);
    }
}
