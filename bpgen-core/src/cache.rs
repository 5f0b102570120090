//! Read-through cache of stored chunks used to byte-verify inventory hits.
//!
//! Entries are loaded lazily and incrementally: a comparison that fails
//! early only pulls the first few blocks from disk, and a later comparison
//! against the same chunk resumes where the previous read stopped. Capacity
//! is counted in chunks; when full, the entry with the oldest access time is
//! evicted on insert.

use crate::chunk_format::{decode_payload, ChunkFormatError, ChunkHeader, StoredAs, CHUNK_HEADER_LEN};
use crate::manifest::ChunkId;
use crate::store::ChunkStore;
use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, warn};

/// Bytes compared per step; comparison stops at the first differing block.
pub const COMPARE_BLOCK: usize = 64;
/// Minimum bytes pulled from disk whenever a read needs more data.
const READ_AHEAD: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Match,
    Mismatch,
    /// The stored chunk cannot be read; treat as no match.
    Unusable,
}

enum Source {
    Unopened,
    Open { file: File, header: ChunkHeader },
    /// Fully decoded into `data`; nothing left on disk to read.
    Loaded { header: ChunkHeader },
    Unusable,
}

/// Cached handle to one stored chunk.
pub struct CachedChunk {
    id: ChunkId,
    path: PathBuf,
    source: Source,
    data: Vec<u8>,
    last_access: (Instant, u64),
}

impl CachedChunk {
    fn new(id: ChunkId, path: PathBuf) -> Self {
        Self { id, path, source: Source::Unopened, data: Vec::new(), last_access: (Instant::now(), 0) }
    }

    /// Open the chunk and validate its header. `Ok(false)` means the chunk
    /// is unusable (missing, bad header, wrong size); only unexpected I/O
    /// failures are errors.
    pub fn ensure_open(&mut self) -> Result<bool> {
        if let Source::Unopened = self.source {
            self.source = match self.open()? {
                Ok(src) => src,
                Err(reason) => {
                    warn!(chunk = %self.id, path = ?self.path, "chunk unusable: {}", reason);
                    Source::Unusable
                }
            };
        }
        Ok(!matches!(self.source, Source::Unusable))
    }

    fn open(&mut self) -> Result<std::result::Result<Source, String>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Err("chunk file missing".into())),
            Err(e) => return Err(e).with_context(|| format!("open chunk {:?}", self.path)),
        };
        let file_len = file.metadata().with_context(|| format!("stat {:?}", self.path))?.len();
        let mut raw = [0u8; CHUNK_HEADER_LEN];
        let got = read_up_to(&mut file, &mut raw).with_context(|| format!("read {:?}", self.path))?;
        let header = match ChunkHeader::decode(&raw[..got]) {
            Ok(h) => h,
            Err(e) => return Ok(Err(e.to_string())),
        };
        if header.id != self.id {
            let e = ChunkFormatError::IdMismatch { expected: self.id, found: header.id };
            return Ok(Err(e.to_string()));
        }
        if header.file_len() != file_len {
            let e = ChunkFormatError::SizeMismatch { expected: header.file_len(), actual: file_len };
            return Ok(Err(e.to_string()));
        }
        if header.header_size as usize > CHUNK_HEADER_LEN {
            let mut skip = vec![0u8; header.header_size as usize - CHUNK_HEADER_LEN];
            file.read_exact(&mut skip).with_context(|| format!("read {:?}", self.path))?;
        }
        match header.stored_as {
            StoredAs::Raw => Ok(Ok(Source::Open { file, header })),
            StoredAs::Zstd => {
                // compressed payloads cannot be compared incrementally
                let mut stored = Vec::with_capacity(header.stored_len as usize);
                file.read_to_end(&mut stored).with_context(|| format!("read {:?}", self.path))?;
                match decode_payload(&header, &stored) {
                    Ok(payload) => {
                        self.data = payload;
                        Ok(Ok(Source::Loaded { header }))
                    }
                    Err(e) => Ok(Err(e.to_string())),
                }
            }
        }
    }

    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    pub fn is_unusable(&self) -> bool {
        matches!(self.source, Source::Unusable)
    }

    /// Payload length from the header, once opened.
    pub fn payload_len(&self) -> Option<usize> {
        match &self.source {
            Source::Open { header, .. } | Source::Loaded { header } => {
                Some(header.payload_len as usize)
            }
            _ => None,
        }
    }

    /// Decoded payload bytes held in memory so far.
    pub fn bytes_loaded(&self) -> usize {
        self.data.len()
    }

    /// Payload bytes `offset..offset + len`, pulling from disk only what has
    /// not been read yet. Read failures on an open chunk are fatal.
    pub fn read_at(&mut self, offset: usize, len: usize) -> Result<&[u8]> {
        if !self.ensure_open()? {
            bail!("read from unusable chunk {}", self.id);
        }
        let total = self.payload_len().unwrap_or(0);
        let end = offset + len;
        if end > total {
            bail!("read {}..{} past end of chunk {} ({} bytes)", offset, end, self.id, total);
        }
        if end > self.data.len() {
            if let Source::Open { file, .. } = &mut self.source {
                let have = self.data.len();
                let want = (end - have).max(READ_AHEAD).min(total - have);
                self.data.resize(have + want, 0);
                if let Err(e) = file.read_exact(&mut self.data[have..]) {
                    self.data.truncate(have);
                    return Err(e).with_context(|| format!("read chunk {:?}", self.path));
                }
                if self.data.len() == total {
                    // everything is in memory; release the file handle
                    if let Source::Open { header, .. } =
                        std::mem::replace(&mut self.source, Source::Unusable)
                    {
                        self.source = Source::Loaded { header };
                    }
                }
            }
        }
        Ok(&self.data[offset..end])
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match file.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(got)
}

pub struct ChunkCache {
    store: ChunkStore,
    capacity: usize,
    entries: HashMap<ChunkId, CachedChunk>,
    unusable: HashSet<ChunkId>,
    tick: u64,
    evictions: u64,
}

impl ChunkCache {
    pub fn new(store: ChunkStore, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            unusable: HashSet::new(),
            tick: 0,
            evictions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether `id` has been found unusable during this run. This survives
    /// eviction of the cached entry.
    pub fn is_unusable(&self, id: &ChunkId) -> bool {
        self.unusable.contains(id)
    }

    /// Cached handle for `id`, inserting (and evicting the least recently
    /// accessed entry) if needed.
    pub fn get_reader(&mut self, id: &ChunkId) -> &mut CachedChunk {
        self.tick += 1;
        let stamp = (Instant::now(), self.tick);
        if !self.entries.contains_key(id) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        let store = &self.store;
        let entry = self
            .entries
            .entry(*id)
            .or_insert_with(|| CachedChunk::new(*id, store.chunk_path(id)));
        entry.last_access = stamp;
        entry
    }

    fn evict_oldest(&mut self) {
        let oldest = self.entries.iter().min_by_key(|(_, c)| c.last_access).map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.entries.remove(&id);
            self.evictions += 1;
            debug!(chunk = %id, "evicted cached chunk");
        }
    }

    /// Byte-compare `data` against stored chunk `id`, stopping at the first
    /// differing block.
    pub fn compare(&mut self, id: &ChunkId, data: &[u8]) -> Result<Comparison> {
        if self.unusable.contains(id) {
            return Ok(Comparison::Unusable);
        }
        let outcome = {
            let chunk = self.get_reader(id);
            if !chunk.ensure_open()? {
                Comparison::Unusable
            } else if chunk.payload_len() != Some(data.len()) {
                Comparison::Mismatch
            } else {
                let mut outcome = Comparison::Match;
                let mut off = 0;
                while off < data.len() {
                    let n = COMPARE_BLOCK.min(data.len() - off);
                    if chunk.read_at(off, n)? != &data[off..off + n] {
                        outcome = Comparison::Mismatch;
                        break;
                    }
                    off += n;
                }
                outcome
            }
        };
        if outcome == Comparison::Unusable {
            self.unusable.insert(*id);
        }
        Ok(outcome)
    }
}
