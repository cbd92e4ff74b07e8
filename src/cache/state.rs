//! Per-request transfer state tracking.
//!
//! The scheduler-side connector owns a [`RequestTracker`]. It records which
//! local blocks each request has reserved for external loads or pending saves
//! and drives the monotonic [`TransferStatus`] progression from completion
//! signals reported by the worker side.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::block::{BlockId, BlockTransfer};

/// Progress of a request's external KV transfers.
///
/// ```text
/// Pending -> NeedsLoad -> Loading -> Loaded -> Saving -> Saved
///        \-> NoExternalData ----------------/        \-> SaveFailed
///            NeedsLoad | Loading -> LoadFailed -> Saving
/// ```
///
/// `Cancelled` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    NeedsLoad,
    NoExternalData,
    Loading,
    Loaded,
    LoadFailed,
    Saving,
    Saved,
    SaveFailed,
    Cancelled,
}

impl TransferStatus {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (_, Cancelled) => !self.is_terminal(),
            (Pending, NeedsLoad | NoExternalData) => true,
            (NeedsLoad, Loading) => true,
            (NeedsLoad | Loading, LoadFailed) => true,
            (Loading, Loaded) => true,
            (NoExternalData | Loaded | LoadFailed, Saving) => true,
            (Saving, Saved | SaveFailed) => true,
            _ => false,
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Saved | TransferStatus::SaveFailed | TransferStatus::Cancelled
        )
    }

    /// The load phase is over, so the request may enter the compute batch.
    pub fn is_load_resolved(self) -> bool {
        !matches!(
            self,
            TransferStatus::Pending | TransferStatus::NeedsLoad | TransferStatus::Loading
        ) && self != TransferStatus::Cancelled
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Request {request_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        request_id: String,
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("Block {block_id} is already reserved by request {holder}")]
    AlreadyReserved { block_id: BlockId, holder: String },

    #[error("Unknown request {0}")]
    UnknownRequest(String),

    #[error("Request {request_id}: {requested} external blocks exceed the {available} available")]
    BlockCountMismatch {
        request_id: String,
        requested: usize,
        available: usize,
    },
}

/// Why a block is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationKind {
    /// Awaiting external data; the allocator must not compute into it.
    Load,
    /// Held until its contents have been saved externally.
    Save,
}

/// Transfer bookkeeping for one request.
#[derive(Debug, Clone)]
pub struct KvTransferRequest {
    pub request_id: String,

    /// Blocks to be filled from an external source.
    pub load_blocks: Vec<BlockTransfer>,

    /// Blocks to be written to an external destination.
    pub save_blocks: Vec<BlockTransfer>,

    /// Blocks whose load failed and must be recomputed locally.
    pub recompute_blocks: Vec<BlockId>,

    status: TransferStatus,

    /// The engine has finished with the request.
    finished: bool,
}

impl KvTransferRequest {
    fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            load_blocks: Vec::new(),
            save_blocks: Vec::new(),
            recompute_blocks: Vec::new(),
            status: TransferStatus::Pending,
            finished: false,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    fn advance(&mut self, next: TransferStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                request_id: self.request_id.clone(),
                from: self.status,
                to: next,
            });
        }
        debug!(request_id = %self.request_id, from = %self.status, to = %next, "Transfer status");
        self.status = next;
        Ok(())
    }
}

/// A load the worker must perform this step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSpec {
    pub request_id: String,
    pub blocks: Vec<BlockTransfer>,
}

/// A save the worker must perform this step, layer by layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSpec {
    pub request_id: String,
    pub blocks: Vec<BlockTransfer>,
}

/// Scheduler-side table of in-flight requests and block reservations.
#[derive(Debug, Default)]
pub struct RequestTracker {
    requests: HashMap<String, KvTransferRequest>,
    reservations: HashMap<BlockId, (String, ReservationKind)>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request in `Pending`; no-op if already tracked.
    pub fn admit(&mut self, request_id: &str) {
        self.requests
            .entry(request_id.to_string())
            .or_insert_with(|| KvTransferRequest::new(request_id));
    }

    pub fn get(&self, request_id: &str) -> Option<&KvTransferRequest> {
        self.requests.get(request_id)
    }

    pub fn status(&self, request_id: &str) -> Option<TransferStatus> {
        self.requests.get(request_id).map(|r| r.status)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn request_mut(&mut self, request_id: &str) -> Result<&mut KvTransferRequest, StateError> {
        self.requests
            .get_mut(request_id)
            .ok_or_else(|| StateError::UnknownRequest(request_id.to_string()))
    }

    fn reserve(
        &mut self,
        request_id: &str,
        blocks: &[BlockTransfer],
        kind: ReservationKind,
    ) -> Result<(), StateError> {
        for block in blocks {
            if let Some((holder, _)) = self.reservations.get(&block.block_id) {
                if holder != request_id {
                    return Err(StateError::AlreadyReserved {
                        block_id: block.block_id,
                        holder: holder.clone(),
                    });
                }
            }
        }
        for block in blocks {
            self.reservations
                .insert(block.block_id, (request_id.to_string(), kind));
        }
        Ok(())
    }

    fn release(&mut self, request_id: &str, kind: Option<ReservationKind>) -> Vec<BlockId> {
        let mut released: Vec<BlockId> = self
            .reservations
            .iter()
            .filter(|(_, (holder, k))| holder == request_id && kind.map_or(true, |kind| *k == kind))
            .map(|(&id, _)| id)
            .collect();
        released.sort_unstable();
        for id in &released {
            self.reservations.remove(id);
        }
        released
    }

    /// Request holding a reservation on `block_id`, if any.
    pub fn reservation(&self, block_id: BlockId) -> Option<(&str, ReservationKind)> {
        self.reservations
            .get(&block_id)
            .map(|(holder, kind)| (holder.as_str(), *kind))
    }

    /// All blocks reserved by a request, ascending.
    pub fn reserved_blocks(&self, request_id: &str) -> Vec<BlockId> {
        let blocks: BTreeSet<BlockId> = self
            .reservations
            .iter()
            .filter(|(_, (holder, _))| holder == request_id)
            .map(|(&id, _)| id)
            .collect();
        blocks.into_iter().collect()
    }

    /// The request has no externally available blocks.
    pub fn mark_no_external(&mut self, request_id: &str) -> Result<(), StateError> {
        self.admit(request_id);
        self.request_mut(request_id)?
            .advance(TransferStatus::NoExternalData)
    }

    /// Reserve local blocks for an external load and move to `NeedsLoad`.
    pub fn reserve_for_load(
        &mut self,
        request_id: &str,
        blocks: Vec<BlockTransfer>,
    ) -> Result<(), StateError> {
        let admitted = !self.requests.contains_key(request_id);
        self.admit(request_id);
        let status = self.request_mut(request_id)?.status;
        let reserved = if status.can_transition_to(TransferStatus::NeedsLoad) {
            self.reserve(request_id, &blocks, ReservationKind::Load)
        } else {
            Err(StateError::InvalidTransition {
                request_id: request_id.to_string(),
                from: status,
                to: TransferStatus::NeedsLoad,
            })
        };
        if let Err(e) = reserved {
            // A request first seen here must not outlive its failed reservation.
            if admitted {
                self.requests.remove(request_id);
            }
            return Err(e);
        }
        let request = self.request_mut(request_id)?;
        request.load_blocks = blocks;
        request.advance(TransferStatus::NeedsLoad)
    }

    /// Move every `NeedsLoad` request to `Loading` and return its load.
    pub fn take_load_specs(&mut self) -> Vec<LoadSpec> {
        let mut specs = Vec::new();
        for request in self.requests.values_mut() {
            if request.status == TransferStatus::NeedsLoad
                && request.advance(TransferStatus::Loading).is_ok()
            {
                specs.push(LoadSpec {
                    request_id: request.request_id.clone(),
                    blocks: request.load_blocks.clone(),
                });
            }
        }
        specs.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        specs
    }

    /// Record blocks to save once the request's load phase is resolved.
    pub fn stage_save(&mut self, request_id: &str, blocks: Vec<BlockTransfer>) {
        self.admit(request_id);
        if let Some(request) = self.requests.get_mut(request_id) {
            request.save_blocks = blocks;
        }
    }

    /// Reserve staged saves of load-resolved requests and move them to `Saving`.
    pub fn take_save_specs(&mut self) -> Vec<SaveSpec> {
        let ready: Vec<String> = self
            .requests
            .values()
            .filter(|r| {
                !r.save_blocks.is_empty()
                    && r.status.can_transition_to(TransferStatus::Saving)
            })
            .map(|r| r.request_id.clone())
            .collect();

        let mut specs = Vec::new();
        for request_id in ready {
            let blocks = self.requests[&request_id].save_blocks.clone();
            if let Err(e) = self.reserve(&request_id, &blocks, ReservationKind::Save) {
                warn!(request_id, error = %e, "Cannot hold blocks for save, skipping");
                continue;
            }
            if let Some(request) = self.requests.get_mut(&request_id) {
                if request.advance(TransferStatus::Saving).is_ok() {
                    specs.push(SaveSpec { request_id, blocks });
                }
            }
        }
        specs.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        specs
    }

    /// External data for the request is resident locally.
    pub fn complete_load(&mut self, request_id: &str) -> Result<(), StateError> {
        self.request_mut(request_id)?
            .advance(TransferStatus::Loaded)?;
        self.release(request_id, Some(ReservationKind::Load));
        Ok(())
    }

    /// The load failed; returns the blocks that must be recomputed.
    pub fn fail_load(&mut self, request_id: &str) -> Result<Vec<BlockId>, StateError> {
        let request = self.request_mut(request_id)?;
        request.advance(TransferStatus::LoadFailed)?;
        request.recompute_blocks = request.load_blocks.iter().map(|b| b.block_id).collect();
        let recompute = request.recompute_blocks.clone();
        self.release(request_id, Some(ReservationKind::Load));
        Ok(recompute)
    }

    /// Save finished (or failed); releases save holds.
    ///
    /// Returns true when the request was already finished and is now dropped.
    pub fn complete_save(&mut self, request_id: &str, success: bool) -> Result<bool, StateError> {
        let next = if success {
            TransferStatus::Saved
        } else {
            TransferStatus::SaveFailed
        };
        let request = self.request_mut(request_id)?;
        request.advance(next)?;
        let finished = request.finished;
        self.release(request_id, Some(ReservationKind::Save));
        if finished {
            self.requests.remove(request_id);
        }
        Ok(finished)
    }

    /// The engine is done with the request.
    ///
    /// Returns true if its blocks must stay allocated until an in-flight save
    /// completes; otherwise the request is dropped immediately.
    pub fn finish(&mut self, request_id: &str) -> bool {
        let Some(request) = self.requests.get_mut(request_id) else {
            return false;
        };
        if request.status == TransferStatus::Saving {
            request.finished = true;
            return true;
        }
        self.release(request_id, None);
        self.requests.remove(request_id);
        false
    }

    /// Abort a request, releasing every reservation it holds.
    ///
    /// Returns the released block ids, or `None` if the request was unknown
    /// or had already reached a terminal state.
    pub fn cancel(&mut self, request_id: &str) -> Option<Vec<BlockId>> {
        let request = self.requests.get_mut(request_id)?;
        if request.advance(TransferStatus::Cancelled).is_err() {
            return None;
        }
        let released = self.release(request_id, None);
        self.requests.remove(request_id);
        debug!(request_id, block_ids = ?released, "Cancelled request");
        Some(released)
    }
}
