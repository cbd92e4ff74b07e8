//! External KV stores a connector moves blocks to and from.
//!
//! Every store keeps a local index of which blocks are fully stored so the
//! scheduler half can answer lookups without touching the backend.
//! - [`MemoryStore`]: in-process map, shared by reference.
//! - [`DiskStore`]: sharded files on a local or shared filesystem, with
//!   optional zstd compression.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::cache::block::{BlockHash, LayerIndex};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Layer {layer} of block {hash:016x} is corrupt: {message}")]
    Corrupt {
        hash: BlockHash,
        layer: LayerIndex,
        message: String,
    },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// A destination/source of KV block layers keyed by content hash.
#[async_trait]
pub trait KvStore: Send + Sync {
    fn name(&self) -> &str;

    /// Whether every layer of `hash` is stored. Answers from the local index.
    fn contains(&self, hash: BlockHash) -> bool;

    /// Fetch one layer; `Ok(None)` if it is not stored.
    async fn get(&self, hash: BlockHash, layer: LayerIndex) -> Result<Option<Bytes>, StoreError>;

    /// Store one layer. Storing an existing layer overwrites it.
    async fn put(&self, hash: BlockHash, layer: LayerIndex, data: Bytes) -> Result<(), StoreError>;
}

/// Read/write counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl StoreStats {
    fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Per-hash count of distinct stored layers.
#[derive(Debug)]
struct LayerIndexMap {
    num_layers: usize,
    layers: RwLock<HashMap<BlockHash, Vec<bool>>>,
}

impl LayerIndexMap {
    fn new(num_layers: usize) -> Self {
        Self {
            num_layers,
            layers: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, hash: BlockHash, layer: LayerIndex) {
        if layer >= self.num_layers {
            return;
        }
        let num_layers = self.num_layers;
        self.layers
            .write()
            .entry(hash)
            .or_insert_with(|| vec![false; num_layers])[layer] = true;
    }

    fn contains(&self, hash: BlockHash) -> bool {
        self.layers
            .read()
            .get(&hash)
            .map(|present| present.iter().all(|&p| p))
            .unwrap_or(false)
    }

    fn len(&self) -> usize {
        self.layers.read().len()
    }
}

/// In-process store.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    data: RwLock<HashMap<(BlockHash, LayerIndex), Bytes>>,
    index: LayerIndexMap,
    stats: StoreStats,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, num_layers: usize) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(HashMap::new()),
            index: LayerIndexMap::new(num_layers),
            stats: StoreStats::default(),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn contains(&self, hash: BlockHash) -> bool {
        self.index.contains(hash)
    }

    async fn get(&self, hash: BlockHash, layer: LayerIndex) -> Result<Option<Bytes>, StoreError> {
        let data = self.data.read().get(&(hash, layer)).cloned();
        if let Some(ref d) = data {
            self.stats.record_read(d.len());
        }
        Ok(data)
    }

    async fn put(&self, hash: BlockHash, layer: LayerIndex, data: Bytes) -> Result<(), StoreError> {
        self.stats.record_write(data.len());
        self.data.write().insert((hash, layer), data);
        self.index.insert(hash, layer);
        Ok(())
    }
}

/// Filesystem store.
///
/// Layout: `<root>/<hh>/<hash:016x>.L<layer>.kv`, where `hh` is the top byte
/// of the hash, so no directory grows past 1/256th of the blocks.
#[derive(Debug)]
pub struct DiskStore {
    name: String,
    root: PathBuf,
    zstd_level: Option<i32>,
    index: LayerIndexMap,
    stats: StoreStats,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `root` and index its files.
    pub async fn open(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        num_layers: usize,
        zstd_level: Option<i32>,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let index = LayerIndexMap::new(num_layers);
        let mut shards = fs::read_dir(&root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.metadata().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if let Some((hash, layer)) = parse_block_file_name(&file.path()) {
                    index.insert(hash, layer);
                }
            }
        }

        let store = Self {
            name: name.into(),
            root,
            zstd_level,
            index,
            stats: StoreStats::default(),
        };
        debug!(root = %store.root.display(), blocks = store.index.len(), "Opened disk store");
        Ok(store)
    }

    fn layer_path(&self, hash: BlockHash, layer: LayerIndex) -> PathBuf {
        self.root
            .join(format!("{:02x}", hash >> 56))
            .join(format!("{hash:016x}.L{layer}.kv"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }
}

fn parse_block_file_name(path: &Path) -> Option<(BlockHash, LayerIndex)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".kv")?;
    let (hash, layer) = stem.split_once(".L")?;
    Some((
        BlockHash::from_str_radix(hash, 16).ok()?,
        layer.parse().ok()?,
    ))
}

#[async_trait]
impl KvStore for DiskStore {
    fn name(&self) -> &str {
        &self.name
    }

    /// Answers from the index, falling back to a local `stat` of the layer
    /// files for blocks published by another process sharing the root.
    fn contains(&self, hash: BlockHash) -> bool {
        if self.index.contains(hash) {
            return true;
        }
        let num_layers = self.index.num_layers;
        if num_layers == 0 {
            return false;
        }
        let published = (0..num_layers).all(|layer| self.layer_path(hash, layer).is_file());
        if published {
            for layer in 0..num_layers {
                self.index.insert(hash, layer);
            }
            debug!(hash = %format!("{hash:016x}"), "Indexed block published by another writer");
        }
        published
    }

    async fn get(&self, hash: BlockHash, layer: LayerIndex) -> Result<Option<Bytes>, StoreError> {
        let path = self.layer_path(hash, layer);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.stats.record_read(raw.len());

        let data = match self.zstd_level {
            Some(_) => zstd::decode_all(raw.as_slice()).map_err(|e| StoreError::Corrupt {
                hash,
                layer,
                message: e.to_string(),
            })?,
            None => raw,
        };
        Ok(Some(Bytes::from(data)))
    }

    async fn put(&self, hash: BlockHash, layer: LayerIndex, data: Bytes) -> Result<(), StoreError> {
        let path = self.layer_path(hash, layer);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let encoded = match self.zstd_level {
            Some(level) => zstd::encode_all(&data[..], level)?,
            None => data.to_vec(),
        };

        // Readers must never see a half-written file.
        let tmp = path.with_extension("kv.tmp");
        fs::write(&tmp, &encoded).await?;
        fs::rename(&tmp, &path).await?;

        self.stats.record_write(encoded.len());
        self.index.insert(hash, layer);
        debug!(hash = %format!("{hash:016x}"), layer, size = encoded.len(), "Wrote block layer");
        Ok(())
    }
}
