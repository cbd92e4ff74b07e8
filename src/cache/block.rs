//! Block identifiers and the worker-local KV block pool.
//!
//! A block holds `block_size` tokens of K/V for every layer and is the unit
//! of transfer and reservation. The pool is shared between the attention path
//! and the worker connector; a connector may only write blocks that were
//! granted to it for a specific request.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Identifier of a physical block in the local pool.
pub type BlockId = u64;

/// Content key of a block (prefix-chained hash of its tokens).
pub type BlockHash = u64;

/// Index of a transformer layer.
pub type LayerIndex = usize;

/// Token identifier as produced by the tokenizer.
pub type TokenId = u32;

/// Compute the chained content hash of one block of tokens.
pub fn hash_block_tokens(parent: Option<BlockHash>, tokens: &[TokenId]) -> BlockHash {
    let mut hasher = DefaultHasher::new();
    parent.hash(&mut hasher);
    tokens.hash(&mut hasher);
    hasher.finish()
}

/// Hashes of every full block of `tokens`; a trailing partial block is skipped.
pub fn hash_prompt_blocks(tokens: &[TokenId], block_size: usize) -> Vec<BlockHash> {
    let mut parent = None;
    tokens
        .chunks_exact(block_size.max(1))
        .map(|chunk| {
            let hash = hash_block_tokens(parent, chunk);
            parent = Some(hash);
            hash
        })
        .collect()
}

/// A local block paired with the external key its contents are stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockTransfer {
    pub block_id: BlockId,
    pub hash: BlockHash,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Block {0} is outside the pool")]
    OutOfRange(BlockId),

    #[error("Layer {layer} is outside the model ({num_layers} layers)")]
    LayerOutOfRange { layer: LayerIndex, num_layers: usize },

    #[error("Block {block_id} is already granted to request {holder}")]
    AlreadyGranted { block_id: BlockId, holder: String },

    #[error("Block {block_id} is not granted to request {request_id}")]
    NotGranted { block_id: BlockId, request_id: String },
}

#[derive(Debug, Default)]
struct PoolInner {
    /// Per block, one payload slot per layer.
    slots: HashMap<BlockId, Vec<Option<Bytes>>>,

    /// Blocks a connector may write, and for which request.
    grants: HashMap<BlockId, String>,
}

/// Worker-local KV block memory.
///
/// Every layer payload is stored as a whole `Bytes` value under the pool lock,
/// so a reader sees either nothing or the complete layer of a block.
#[derive(Debug)]
pub struct KvBlockPool {
    num_blocks: usize,
    num_layers: usize,
    inner: RwLock<PoolInner>,
}

impl KvBlockPool {
    pub fn new(num_blocks: usize, num_layers: usize) -> Self {
        Self {
            num_blocks,
            num_layers,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn check(&self, block_id: BlockId, layer: LayerIndex) -> Result<(), PoolError> {
        if block_id as usize >= self.num_blocks {
            return Err(PoolError::OutOfRange(block_id));
        }
        if layer >= self.num_layers {
            return Err(PoolError::LayerOutOfRange {
                layer,
                num_layers: self.num_layers,
            });
        }
        Ok(())
    }

    /// Give `request_id` write access to `block_ids`.
    ///
    /// Re-granting a block to the request that already holds it is a no-op.
    pub fn grant(&self, request_id: &str, block_ids: &[BlockId]) -> Result<(), PoolError> {
        let mut inner = self.inner.write();
        for &block_id in block_ids {
            if block_id as usize >= self.num_blocks {
                return Err(PoolError::OutOfRange(block_id));
            }
            if let Some(holder) = inner.grants.get(&block_id) {
                if holder != request_id {
                    return Err(PoolError::AlreadyGranted {
                        block_id,
                        holder: holder.clone(),
                    });
                }
            }
        }
        for &block_id in block_ids {
            inner.grants.insert(block_id, request_id.to_string());
        }
        Ok(())
    }

    fn take_grants(&self, request_id: &str, only: Option<&[BlockId]>, discard: bool) -> Vec<BlockId> {
        let mut inner = self.inner.write();
        let mut released: Vec<BlockId> = inner
            .grants
            .iter()
            .filter(|(id, holder)| {
                holder.as_str() == request_id && only.map_or(true, |ids| ids.contains(*id))
            })
            .map(|(&id, _)| id)
            .collect();
        released.sort_unstable();
        for id in &released {
            inner.grants.remove(id);
            if discard {
                inner.slots.remove(id);
            }
        }
        released
    }

    /// End write access to some of a request's blocks, keeping their data.
    pub fn release_blocks(&self, request_id: &str, block_ids: &[BlockId]) -> Vec<BlockId> {
        self.take_grants(request_id, Some(block_ids), false)
    }

    /// End write access and discard anything written under the grant.
    pub fn revoke(&self, request_id: &str) -> Vec<BlockId> {
        let released = self.take_grants(request_id, None, true);
        if !released.is_empty() {
            debug!(request_id, block_ids = ?released, "Revoked block grants");
        }
        released
    }

    /// Revoke a subset of a request's grants, discarding partial data.
    pub fn revoke_blocks(&self, request_id: &str, block_ids: &[BlockId]) -> Vec<BlockId> {
        self.take_grants(request_id, Some(block_ids), true)
    }

    /// Write one layer of an externally sourced block.
    pub fn write_layer(
        &self,
        request_id: &str,
        block_id: BlockId,
        layer: LayerIndex,
        data: Bytes,
    ) -> Result<(), PoolError> {
        self.check(block_id, layer)?;
        let mut inner = self.inner.write();
        match inner.grants.get(&block_id) {
            Some(holder) if holder == request_id => {}
            _ => {
                return Err(PoolError::NotGranted {
                    block_id,
                    request_id: request_id.to_string(),
                })
            }
        }
        let num_layers = self.num_layers;
        inner
            .slots
            .entry(block_id)
            .or_insert_with(|| vec![None; num_layers])[layer] = Some(data);
        Ok(())
    }

    /// Write one layer produced by local attention (allocator-owned path).
    pub fn store_computed(
        &self,
        block_id: BlockId,
        layer: LayerIndex,
        data: Bytes,
    ) -> Result<(), PoolError> {
        self.check(block_id, layer)?;
        let num_layers = self.num_layers;
        self.inner
            .write()
            .slots
            .entry(block_id)
            .or_insert_with(|| vec![None; num_layers])[layer] = Some(data);
        Ok(())
    }

    /// Read one layer of a block, if resident.
    pub fn read_layer(&self, block_id: BlockId, layer: LayerIndex) -> Option<Bytes> {
        self.inner
            .read()
            .slots
            .get(&block_id)
            .and_then(|layers| layers.get(layer).cloned().flatten())
    }

    /// Request currently holding write access to a block.
    pub fn grant_holder(&self, block_id: BlockId) -> Option<String> {
        self.inner.read().grants.get(&block_id).cloned()
    }
}
