//! Role contracts shared by every connector implementation.
//!
//! A connector is split into two halves that never share state:
//! - [`SchedulerConnector`] lives beside the scheduler and decides, from local
//!   metadata only, which blocks are supplied externally.
//! - [`WorkerConnector`] lives beside model execution and moves the data
//!   around each layer's attention.
//!
//! The halves communicate only through [`ConnectorMetadata`] (scheduler to
//! worker, once per step) and [`ConnectorOutput`] (worker to scheduler).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::block::{BlockHash, BlockId, KvBlockPool, LayerIndex, TokenId};
use crate::cache::state::{LoadSpec, SaveSpec, TransferStatus};
use crate::config::ConnectorConfig;
use crate::connector::factory::ConnectorFactory;
use crate::error::{Result, TransferError};
use crate::transfer::health::HealthSnapshot;
use crate::transfer::queue::QueueStats;

/// Which half of a connector an instance implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorRole {
    Scheduler,
    Worker,
}

impl fmt::Display for ConnectorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorRole::Scheduler => write!(f, "scheduler"),
            ConnectorRole::Worker => write!(f, "worker"),
        }
    }
}

/// Major-version mode of the hosting runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeVersion {
    Legacy,
    #[default]
    Current,
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeVersion::Legacy => write!(f, "legacy"),
            RuntimeVersion::Current => write!(f, "current"),
        }
    }
}

/// What the scheduler knows about a request when consulting the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub request_id: String,

    /// Prompt length in tokens.
    pub num_prompt_tokens: usize,

    /// Content hash of every full prompt block, in order.
    pub block_hashes: Vec<BlockHash>,
}

impl RequestInfo {
    pub fn from_tokens(request_id: impl Into<String>, tokens: &[TokenId], block_size: usize) -> Self {
        Self {
            request_id: request_id.into(),
            num_prompt_tokens: tokens.len(),
            block_hashes: crate::cache::block::hash_prompt_blocks(tokens, block_size),
        }
    }

    pub fn num_full_blocks(&self) -> usize {
        self.block_hashes.len()
    }
}

/// Per-step instructions from the scheduler half to the worker half.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorMetadata {
    pub loads: Vec<LoadSpec>,
    pub saves: Vec<SaveSpec>,

    /// Requests aborted since the previous step.
    pub cancelled: Vec<String>,

    /// One entry per sub-connector of a composite, in priority order.
    pub children: Vec<ConnectorMetadata>,
}

impl ConnectorMetadata {
    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
            && self.saves.is_empty()
            && self.cancelled.is_empty()
            && self.children.iter().all(ConnectorMetadata::is_empty)
    }
}

/// Completion signal raised by the worker half.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    LoadFinished {
        request_id: String,
        block_ids: Vec<BlockId>,
    },
    LoadFailed {
        request_id: String,
        block_ids: Vec<BlockId>,
        error: TransferError,
    },
    SaveFinished {
        request_id: String,
        block_ids: Vec<BlockId>,
    },
    SaveFailed {
        request_id: String,
        block_ids: Vec<BlockId>,
        error: TransferError,
    },
}

impl TransferEvent {
    pub fn request_id(&self) -> &str {
        match self {
            TransferEvent::LoadFinished { request_id, .. }
            | TransferEvent::LoadFailed { request_id, .. }
            | TransferEvent::SaveFinished { request_id, .. }
            | TransferEvent::SaveFailed { request_id, .. } => request_id,
        }
    }
}

/// Completion signals drained from the worker half.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorOutput {
    pub events: Vec<TransferEvent>,

    /// One entry per sub-connector of a composite, in priority order.
    pub children: Vec<ConnectorOutput>,
}

impl ConnectorOutput {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.children.iter().all(ConnectorOutput::is_empty)
    }
}

/// Result of a pre-attention wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerLoadOutcome {
    /// Externally sourced blocks resident for this layer.
    pub ready: Vec<BlockId>,

    /// Blocks the caller must recompute locally (failed or timed out).
    pub recompute: Vec<BlockId>,
}

impl LayerLoadOutcome {
    pub fn merge(&mut self, other: LayerLoadOutcome) {
        self.ready.extend(other.ready);
        self.recompute.extend(other.recompute);
        self.ready.sort_unstable();
        self.ready.dedup();
        self.recompute.sort_unstable();
        self.recompute.dedup();
        self.ready.retain(|id| !self.recompute.contains(id));
    }
}

/// Transfer counters of one backend, exposed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub connector: String,
    pub health: HealthSnapshot,
    pub queue: QueueStats,
}

/// Scheduler-side contract.
///
/// Called on the scheduling loop; implementations must not perform network
/// I/O or block on transfer completion.
pub trait SchedulerConnector: Send {
    fn name(&self) -> &str;

    /// Number of blocks beyond the `num_computed_blocks` locally cached prefix
    /// that can be supplied externally.
    fn get_num_new_matched_blocks(
        &mut self,
        request: &RequestInfo,
        num_computed_blocks: usize,
    ) -> Result<usize>;

    /// Record the local blocks allocated to `request`, in prompt order.
    ///
    /// The `num_external_blocks` following the computed prefix are reserved
    /// for external load so the allocator never computes into them.
    fn update_state_after_alloc(
        &mut self,
        request: &RequestInfo,
        block_ids: &[BlockId],
        num_external_blocks: usize,
    ) -> Result<()>;

    /// Build the instructions for the worker half for this step.
    fn build_connector_meta(&mut self) -> ConnectorMetadata;

    /// Fold worker completion signals into request state.
    fn update_connector_output(&mut self, output: &ConnectorOutput);

    /// The engine finished the request. Returns true if its blocks must stay
    /// allocated until an asynchronous save completes.
    fn request_finished(&mut self, request_id: &str) -> bool;

    /// Abort a request, returning the block reservations it released.
    fn cancel_request(&mut self, request_id: &str) -> Vec<BlockId>;

    fn transfer_status(&self, request_id: &str) -> Option<TransferStatus>;

    fn as_any(&self) -> &dyn Any;
}

/// Worker-side contract, driven from the execution path.
#[async_trait]
pub trait WorkerConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Bind the local block pool this worker may write into.
    fn register_kv_caches(&self, pool: Arc<KvBlockPool>) -> Result<()>;

    /// Install this step's instructions from the scheduler half.
    fn bind_connector_metadata(&self, metadata: ConnectorMetadata) -> Result<()>;

    /// Issue every bound load without waiting for completion.
    ///
    /// Re-issuing a block already in flight or resident is a no-op.
    fn start_load_kv(&self) -> Result<()>;

    /// Pre-attention hook: wait until the externally sourced blocks among
    /// `block_ids` are resident for `layer`, bounded by the load timeout.
    async fn wait_for_layer_load(&self, layer: LayerIndex, block_ids: &[BlockId])
        -> LayerLoadOutcome;

    /// Post-attention hook: hand this layer of the bound saves to the
    /// background transfer path without blocking.
    fn save_kv_layer(&self, layer: LayerIndex) -> Result<()>;

    /// Wait until every issued save has completed or failed.
    async fn wait_for_save(&self);

    /// Drain completion signals accumulated since the last call.
    fn get_finished(&self) -> ConnectorOutput;

    /// Drop pending transfers for a request and discard partial data.
    fn cancel_request(&self, request_id: &str);

    fn clear_connector_metadata(&self);

    /// Per-backend health and queue counters; empty for connectors without
    /// a background transfer path.
    fn backend_stats(&self) -> Vec<BackendStats> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;
}

/// A constructed connector bound to exactly one role.
pub enum ConnectorInstance {
    Scheduler(Box<dyn SchedulerConnector>),
    Worker(Box<dyn WorkerConnector>),
}

impl ConnectorInstance {
    pub fn role(&self) -> ConnectorRole {
        match self {
            ConnectorInstance::Scheduler(_) => ConnectorRole::Scheduler,
            ConnectorInstance::Worker(_) => ConnectorRole::Worker,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ConnectorInstance::Scheduler(c) => c.name(),
            ConnectorInstance::Worker(c) => c.name(),
        }
    }

    pub fn into_scheduler(self) -> Option<Box<dyn SchedulerConnector>> {
        match self {
            ConnectorInstance::Scheduler(c) => Some(c),
            ConnectorInstance::Worker(_) => None,
        }
    }

    pub fn into_worker(self) -> Option<Box<dyn WorkerConnector>> {
        match self {
            ConnectorInstance::Worker(c) => Some(c),
            ConnectorInstance::Scheduler(_) => None,
        }
    }
}

impl fmt::Debug for ConnectorInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorInstance")
            .field("role", &self.role())
            .field("name", &self.name())
            .finish()
    }
}

/// Inputs to [`ConnectorClass::build`].
pub struct BuildContext<'a> {
    pub config: Arc<ConnectorConfig>,
    pub role: ConnectorRole,

    /// For connectors that construct nested connectors.
    pub factory: &'a ConnectorFactory,
}

/// A resolvable connector implementation.
pub trait ConnectorClass: Send + Sync {
    fn class_name(&self) -> &str;

    /// Runtime major versions this implementation supports.
    fn supported_versions(&self) -> &[RuntimeVersion];

    fn supports_role(&self, role: ConnectorRole) -> bool;

    /// Construct an instance for `ctx.role`.
    fn build(&self, ctx: &BuildContext<'_>) -> Result<ConnectorInstance>;
}

impl fmt::Debug for dyn ConnectorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorClass")
            .field("class_name", &self.class_name())
            .field("supported_versions", &self.supported_versions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_merge_prefers_recompute() {
        let mut a = LayerLoadOutcome {
            ready: vec![1, 2],
            recompute: vec![],
        };
        a.merge(LayerLoadOutcome {
            ready: vec![2, 3],
            recompute: vec![1],
        });
        assert_eq!(a.ready, vec![2, 3]);
        assert_eq!(a.recompute, vec![1]);
    }

    #[test]
    fn test_metadata_serializes_nested_children() {
        let meta = ConnectorMetadata {
            children: vec![
                ConnectorMetadata::default(),
                ConnectorMetadata {
                    cancelled: vec!["r1".to_string()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(!meta.is_empty());
        let json = serde_json::to_string(&meta).unwrap();
        let back: ConnectorMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_request_info_from_tokens() {
        let tokens: Vec<TokenId> = (0..40).collect();
        let info = RequestInfo::from_tokens("r1", &tokens, 16);
        assert_eq!(info.num_prompt_tokens, 40);
        assert_eq!(info.num_full_blocks(), 2);
    }
}
