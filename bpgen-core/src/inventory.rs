//! Index of chunks published by earlier builds, keyed by rolling hash.

use crate::manifest::{ChunkId, ChunkInfo, Manifest, MANIFEST_EXT};
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::cell::OnceCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InventoryStats {
    pub manifests_loaded: usize,
    pub manifests_skipped: usize,
    pub chunks_indexed: usize,
    /// Chunks not indexed because their rolling hash is zero.
    pub zero_hash_ignored: usize,
}

/// What [`ChunkInventory::insert`] did with a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Indexed {
    Added,
    Duplicate,
    ZeroHash,
}

/// Rolling hash to candidate chunks, plus what each chunk looks like.
#[derive(Debug, Default)]
pub struct ChunkInventory {
    by_hash: HashMap<u64, Vec<ChunkId>>,
    info: HashMap<ChunkId, ChunkInfo>,
    stats: InventoryStats,
}

impl ChunkInventory {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every manifest directly inside `cloud_dir`. Manifests that cannot
    /// be read or parsed are skipped with a warning.
    pub fn build(cloud_dir: &Path) -> Result<Self> {
        let mut inv = Self::empty();
        let paths = list_manifests(cloud_dir)?;
        // parse in parallel, merge in name order
        let loaded: Vec<(PathBuf, Result<Manifest>)> = paths
            .into_par_iter()
            .map(|p| {
                let mf = Manifest::load(&p);
                (p, mf)
            })
            .collect();
        for (path, res) in loaded {
            match res {
                Ok(mf) => {
                    for (id, info) in &mf.chunks {
                        if inv.insert(*id, info.clone()) == Indexed::ZeroHash {
                            warn!(
                                chunk = %id,
                                manifest = ?path,
                                "ignoring chunk with zero rolling hash"
                            );
                        }
                    }
                    inv.stats.manifests_loaded += 1;
                    debug!(manifest = ?path, chunks = mf.chunks.len(), "indexed manifest");
                }
                Err(e) => {
                    inv.stats.manifests_skipped += 1;
                    warn!(manifest = ?path, "skipping unreadable manifest: {:#}", e);
                }
            }
        }
        info!(
            manifests = inv.stats.manifests_loaded,
            skipped = inv.stats.manifests_skipped,
            chunks = inv.stats.chunks_indexed,
            zero_hash = inv.stats.zero_hash_ignored,
            "chunk inventory ready"
        );
        Ok(inv)
    }

    /// Add one chunk. A zero hash is never indexed; an already indexed id is
    /// ignored.
    pub fn insert(&mut self, id: ChunkId, info: ChunkInfo) -> Indexed {
        if info.rolling_hash == 0 {
            self.stats.zero_hash_ignored += 1;
            return Indexed::ZeroHash;
        }
        if self.info.contains_key(&id) {
            return Indexed::Duplicate;
        }
        self.by_hash.entry(info.rolling_hash).or_default().push(id);
        self.info.insert(id, info);
        self.stats.chunks_indexed += 1;
        Indexed::Added
    }

    /// Candidate chunks for `hash`, in insertion order.
    pub fn lookup(&self, hash: u64) -> &[ChunkId] {
        if hash == 0 {
            return &[];
        }
        self.by_hash.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn info(&self, id: &ChunkId) -> Option<&ChunkInfo> {
        self.info.get(id)
    }

    pub fn len(&self) -> usize {
        self.info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }

    pub fn stats(&self) -> InventoryStats {
        self.stats
    }
}

/// Inventory that is only built the first time it is consulted.
pub struct LazyInventory {
    cloud_dir: PathBuf,
    cell: OnceCell<ChunkInventory>,
}

impl LazyInventory {
    pub fn new(cloud_dir: impl Into<PathBuf>) -> Self {
        Self { cloud_dir: cloud_dir.into(), cell: OnceCell::new() }
    }

    /// Wrap an inventory that is already built.
    pub fn ready(inventory: ChunkInventory) -> Self {
        let cell = OnceCell::new();
        let _ = cell.set(inventory);
        Self { cloud_dir: PathBuf::new(), cell }
    }

    pub fn get(&self) -> Result<&ChunkInventory> {
        if let Some(inv) = self.cell.get() {
            return Ok(inv);
        }
        let inv = ChunkInventory::build(&self.cloud_dir)?;
        Ok(self.cell.get_or_init(|| inv))
    }

    pub fn is_built(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn stats(&self) -> InventoryStats {
        self.cell.get().map(ChunkInventory::stats).unwrap_or_default()
    }
}

/// `*.manifest` files directly inside `dir`, sorted by name. A missing
/// directory has no manifests.
pub fn list_manifests(dir: &Path) -> Result<Vec<PathBuf>> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("list {:?}", dir)),
    };
    let mut out = Vec::new();
    for ent in rd {
        let ent = ent.with_context(|| format!("list {:?}", dir))?;
        let path = ent.path();
        if path.extension().map(|e| e == MANIFEST_EXT).unwrap_or(false) && path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(hash: u64) -> ChunkInfo {
        ChunkInfo { rolling_hash: hash, size: 4, file_size: None, group: 0 }
    }

    #[test]
    fn buckets_collect_colliding_ids() {
        let mut inv = ChunkInventory::empty();
        let a = ChunkId::from_data(b"a");
        let b = ChunkId::from_data(b"b");
        assert_eq!(inv.insert(a, info(7)), Indexed::Added);
        assert_eq!(inv.insert(b, info(7)), Indexed::Added);
        assert_eq!(inv.insert(a, info(7)), Indexed::Duplicate);
        assert_eq!(inv.lookup(7), &[a, b]);
        assert_eq!(inv.len(), 2);
        assert!(inv.lookup(8).is_empty());
    }

    #[test]
    fn zero_hash_is_never_indexed() {
        let mut inv = ChunkInventory::empty();
        let id = ChunkId::from_data(b"zeros");
        assert_eq!(inv.insert(id, info(0)), Indexed::ZeroHash);
        assert!(inv.is_empty());
        assert!(inv.info(&id).is_none());
        assert!(inv.lookup(0).is_empty());
        assert_eq!(inv.stats().zero_hash_ignored, 1);
    }

    #[test]
    fn lazy_inventory_builds_once_from_missing_dir() {
        let td = tempfile::tempdir().unwrap();
        let lazy = LazyInventory::new(td.path().join("nowhere"));
        assert!(!lazy.is_built());
        assert!(lazy.get().unwrap().is_empty());
        assert!(lazy.is_built());
    }
}
