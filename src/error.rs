//! Connector error types.
//!
//! Configuration problems are fatal at startup. Transfer problems are
//! recoverable by policy: a failed load falls back to recomputation and a
//! failed save is best-effort. Cancellation is never reported as a fault.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::block::{BlockId, PoolError};
use crate::cache::state::StateError;
use crate::connector::base::{ConnectorRole, RuntimeVersion};
use crate::transfer::store::StoreError;

/// Startup-time misconfiguration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Connector '{0}' is already registered")]
    DuplicateName(String),

    #[error("Unsupported connector type: {0}")]
    UnsupportedConnector(String),

    #[error("Module '{module_path}' has no connector class '{class_name}'")]
    UnknownClass {
        module_path: String,
        class_name: String,
    },

    #[error(
        "Connector '{connector}' does not support the {runtime} runtime (supports: {supported:?})"
    )]
    VersionMismatch {
        connector: String,
        runtime: RuntimeVersion,
        supported: Vec<RuntimeVersion>,
    },

    #[error("Connector '{connector}' does not implement the {role} role")]
    RoleMismatch {
        connector: String,
        role: ConnectorRole,
    },

    #[error("Invalid option for connector '{connector}': {message}")]
    InvalidOption { connector: String, message: String },
}

/// Runtime data-movement failure.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferError {
    #[error("Load failed for request {request_id} blocks {block_ids:?}: {reason}")]
    LoadFailed {
        request_id: String,
        block_ids: Vec<BlockId>,
        reason: String,
    },

    #[error("Load timed out after {timeout_ms} ms for request {request_id} blocks {block_ids:?}")]
    LoadTimeout {
        request_id: String,
        block_ids: Vec<BlockId>,
        timeout_ms: u64,
    },

    #[error("Save failed for request {request_id} blocks {block_ids:?}: {reason}")]
    SaveFailed {
        request_id: String,
        block_ids: Vec<BlockId>,
        reason: String,
    },

    #[error("Transfer capacity exceeded: {requested} bytes requested, {inflight}/{capacity} in flight")]
    CapacityExceeded {
        requested: usize,
        inflight: usize,
        capacity: usize,
    },

    #[error("Transfer queue closed")]
    QueueClosed,

    #[error("No async runtime available for the transfer worker")]
    NoRuntime,

    #[error("Worker connector used before register_kv_caches")]
    PoolNotRegistered,

    #[error("All {attempted} sub-connectors failed: {failures:?}")]
    AllBackendsFailed {
        attempted: usize,
        failures: Vec<(String, String)>,
    },
}

/// Umbrella error returned by connector operations.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Request {request_id} was cancelled")]
    Cancelled { request_id: String },
}

impl ConnectorError {
    /// Whether this error is a cancellation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ConnectorError::Cancelled { .. })
    }
}

pub type Result<T, E = ConnectorError> = std::result::Result<T, E>;
