//! On-disk chunk store and the background writer that persists new chunks.

use crate::chunk_format::{encode_chunk, read_header};
use crate::manifest::ChunkId;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::thread::{Scope, ScopedJoinHandle};
use tracing::{debug, warn};

pub const CHUNKS_DIR: &str = "chunks";
pub const CHUNK_EXT: &str = "chunk";

/// Chunk files under `<cloud>/chunks/<first two hex>/<id>.chunk`.
#[derive(Clone, Debug)]
pub struct ChunkStore {
    cloud_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(u64),
    AlreadyPresent(u64),
}

impl ChunkStore {
    pub fn new(cloud_dir: impl Into<PathBuf>) -> Self {
        Self { cloud_dir: cloud_dir.into() }
    }

    pub fn cloud_dir(&self) -> &Path {
        &self.cloud_dir
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.cloud_dir.join(CHUNKS_DIR)
    }

    pub fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        let hex = id.to_hex();
        self.chunks_dir().join(&hex[..2]).join(format!("{}.{}", hex, CHUNK_EXT))
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunk_path(id).is_file()
    }

    /// Size of the stored chunk file, if present.
    pub fn chunk_file_size(&self, id: &ChunkId) -> Option<u64> {
        fs::metadata(self.chunk_path(id)).ok().map(|m| m.len())
    }

    /// Persist one chunk unless a valid file for `id` already exists. A file
    /// with a damaged header is replaced. The new file is written beside its
    /// final path and renamed into place.
    pub fn write_chunk(
        &self,
        id: &ChunkId,
        rolling_hash: u64,
        payload: &[u8],
        compression: Option<i32>,
    ) -> Result<WriteOutcome> {
        let path = self.chunk_path(id);
        if let Some(size) = self.chunk_file_size(id) {
            match read_header(&path) {
                Ok(h) if h.id == *id && h.file_len() == size => {
                    return Ok(WriteOutcome::AlreadyPresent(size));
                }
                Ok(_) => warn!(chunk = %id, "replacing chunk file with mismatched header"),
                Err(e) => warn!(chunk = %id, "replacing unreadable chunk file: {:#}", e),
            }
        }
        let dir = path.parent().ok_or_else(|| anyhow!("chunk path {:?} has no parent", path))?;
        fs::create_dir_all(dir).with_context(|| format!("create dir {:?}", dir))?;
        let bytes = encode_chunk(*id, rolling_hash, payload, compression)?;
        let tmp = path.with_extension("chunk.tmp");
        {
            let mut f = File::create(&tmp).with_context(|| format!("create {:?}", tmp))?;
            f.write_all(&bytes).with_context(|| format!("write {:?}", tmp))?;
            f.sync_all().with_context(|| format!("sync {:?}", tmp))?;
        }
        fs::rename(&tmp, &path).with_context(|| format!("publish chunk {:?}", path))?;
        Ok(WriteOutcome::Written(bytes.len() as u64))
    }
}

/// A chunk discovered during assembly that must be persisted.
pub struct WriteJob {
    pub rolling_hash: u64,
    pub payload: Vec<u8>,
    pub id: ChunkId,
}

/// Destination for newly discovered chunks.
pub trait ChunkSink {
    fn queue(&self, job: WriteJob) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct WriterReport {
    /// Stored file size per chunk handled by the writer.
    pub file_sizes: BTreeMap<ChunkId, u64>,
    pub written: u64,
    pub skipped: u64,
}

/// Single background worker draining a bounded FIFO of [`WriteJob`]s into a
/// [`ChunkStore`]. Queueing blocks while `queue_depth` jobs are waiting.
pub struct ChunkWriter<'scope> {
    tx: SyncSender<WriteJob>,
    handle: ScopedJoinHandle<'scope, Result<WriterReport>>,
}

impl<'scope> ChunkWriter<'scope> {
    pub fn spawn<'env: 'scope>(
        scope: &'scope Scope<'scope, 'env>,
        store: &'env ChunkStore,
        compression: Option<i32>,
        queue_depth: usize,
    ) -> Self {
        let (tx, rx) = sync_channel::<WriteJob>(queue_depth.max(1));
        let handle = scope.spawn(move || -> Result<WriterReport> {
            let mut report = WriterReport::default();
            for job in rx {
                let outcome = store
                    .write_chunk(&job.id, job.rolling_hash, &job.payload, compression)
                    .with_context(|| format!("persist chunk {}", job.id))?;
                let size = match outcome {
                    WriteOutcome::Written(n) => {
                        report.written += 1;
                        debug!(chunk = %job.id, bytes = n, "wrote chunk");
                        n
                    }
                    WriteOutcome::AlreadyPresent(n) => {
                        report.skipped += 1;
                        n
                    }
                };
                report.file_sizes.insert(job.id, size);
            }
            Ok(report)
        });
        Self { tx, handle }
    }

    /// Close the queue, wait for every queued chunk to reach disk and return
    /// what was written.
    pub fn drain_and_join(self) -> Result<WriterReport> {
        let ChunkWriter { tx, handle } = self;
        drop(tx);
        handle.join().map_err(|_| anyhow!("chunk writer thread panicked"))?
    }
}

impl ChunkSink for ChunkWriter<'_> {
    fn queue(&self, job: WriteJob) -> Result<()> {
        let id = job.id;
        self.tx.send(job).map_err(|_| anyhow!("chunk writer stopped before chunk {} was queued", id))
    }
}
