//! Resynchronizing chunker.
//!
//! The assembler slides a W-byte rolling window over the logical build
//! stream. Whenever the window's hash names a chunk already published and the
//! bytes compare equal, the window is attributed to that chunk and hashing
//! restarts after it. Bytes that fall out of the window unmatched become new
//! data and are accumulated into fresh W-byte chunks. Because matching is
//! attempted at every byte offset, an insertion or deletion only produces new
//! chunks around the edit; everything after it realigns to known chunks.

use crate::cache::{ChunkCache, Comparison};
use crate::inventory::{ChunkInventory, LazyInventory};
use crate::manifest::{ChunkId, ChunkInfo, ChunkPart, FileEntry};
use crate::progress::Progress;
use crate::rolling_hash::RollingHash;
use crate::store::{ChunkSink, WriteJob};
use crate::stream::{BuildStream, FileSpan};
use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Bytes between progress counter updates.
const PROGRESS_STRIDE: u64 = 1 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Window not yet full.
    Priming,
    /// Window full, no unfinished new chunk.
    Scanning,
    /// Window full while a new chunk is being accumulated.
    EmittingNewChunkPart,
    /// Stream exhausted; flushing what is left.
    Finalizing,
}

/// Which chunk a part points at. New chunks get their id only once they are
/// full, so their parts carry a sequence number until then.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Pending(u64),
    Known(ChunkId),
}

#[derive(Clone, Copy, Debug)]
struct PartDraft {
    slot: Slot,
    offset: u32,
    size: u32,
}

struct OpenFile {
    span: FileSpan,
    hasher: blake3::Hasher,
    parts: Vec<PartDraft>,
}

struct FileDraft {
    path: String,
    size: u64,
    is_executable: bool,
    file_hash: String,
    parts: Vec<PartDraft>,
}

#[derive(Debug, Default)]
pub struct AssemblyOutput {
    pub files: BTreeMap<String, FileEntry>,
    pub chunks: BTreeMap<ChunkId, ChunkInfo>,
    pub new_chunks: u64,
    pub known_chunks: u64,
    pub bytes: u64,
}

pub struct ChunkAssembler<'a> {
    label: String,
    window: usize,
    rh: RollingHash,
    inventory: &'a LazyInventory,
    cache: &'a mut ChunkCache,
    sink: &'a dyn ChunkSink,
    stream: &'a BuildStream,
    progress: &'a Progress,
    phase: Phase,
    /// Stream offset of the next byte to be attributed to a file.
    pos: u64,
    pending: Vec<u8>,
    pending_seq: u64,
    next_seq: u64,
    resolved: HashMap<u64, ChunkId>,
    current: Option<OpenFile>,
    done: Vec<FileDraft>,
    chunks: BTreeMap<ChunkId, ChunkInfo>,
    new_chunks: u64,
    known_chunks: u64,
    scratch: Vec<u8>,
    unreported: u64,
}

impl<'a> ChunkAssembler<'a> {
    pub fn new(
        label: impl Into<String>,
        chunk_size: usize,
        inventory: &'a LazyInventory,
        cache: &'a mut ChunkCache,
        sink: &'a dyn ChunkSink,
        stream: &'a BuildStream,
        progress: &'a Progress,
    ) -> Self {
        Self {
            label: label.into(),
            window: chunk_size,
            rh: RollingHash::new(chunk_size),
            inventory,
            cache,
            sink,
            stream,
            progress,
            phase: Phase::Priming,
            pos: 0,
            pending: Vec::with_capacity(chunk_size),
            pending_seq: 0,
            next_seq: 1,
            resolved: HashMap::new(),
            current: None,
            done: Vec::new(),
            chunks: BTreeMap::new(),
            new_chunks: 0,
            known_chunks: 0,
            scratch: Vec::with_capacity(chunk_size),
            unreported: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Consume the whole byte stream and produce the file and chunk tables.
    pub fn run<I: IntoIterator<Item = u8>>(mut self, bytes: I) -> Result<AssemblyOutput> {
        let mut bytes = bytes.into_iter();
        loop {
            match self.phase {
                Phase::Priming => match bytes.next() {
                    Some(b) => {
                        self.rh.consume(b);
                        if self.rh.is_full() {
                            self.phase = self.scan_phase();
                        }
                    }
                    None => self.phase = Phase::Finalizing,
                },
                Phase::Scanning | Phase::EmittingNewChunkPart => {
                    if let Some(id) = self.match_window()? {
                        self.accept_window(id)?;
                        self.phase = Phase::Priming;
                        continue;
                    }
                    match bytes.next() {
                        Some(b) => {
                            let old = self.rh.oldest();
                            self.rh.roll_forward(b);
                            self.push_new_byte(old)?;
                            self.phase = self.scan_phase();
                        }
                        None => self.phase = Phase::Finalizing,
                    }
                }
                Phase::Finalizing => return self.finish(),
            }
        }
    }

    fn scan_phase(&self) -> Phase {
        if self.pending.is_empty() {
            Phase::Scanning
        } else {
            Phase::EmittingNewChunkPart
        }
    }

    /// Published chunk equal to the current window, if any. Leaves the
    /// window contents in `scratch` when a comparison was needed.
    fn match_window(&mut self) -> Result<Option<ChunkId>> {
        let lazy = self.inventory;
        let inventory = lazy.get()?;
        let hash = self.rh.window_hash();
        if inventory.lookup(hash).is_empty() {
            return Ok(None);
        }
        self.rh.copy_window_into(&mut self.scratch);
        find_known(inventory, self.cache, hash, &self.scratch)
    }

    fn accept_window(&mut self, id: ChunkId) -> Result<()> {
        let window = std::mem::take(&mut self.scratch);
        self.attribute(Slot::Known(id), 0, &window)?;
        self.scratch = window;
        self.rh.clear();
        let info = self
            .inventory
            .get()?
            .info(&id)
            .cloned()
            .ok_or_else(|| anyhow!("matched chunk {} missing from inventory", id))?;
        self.chunks.entry(id).or_insert(info);
        self.count_known();
        Ok(())
    }

    fn push_new_byte(&mut self, byte: u8) -> Result<()> {
        let offset = self.pending.len() as u32;
        self.pending.push(byte);
        self.attribute(Slot::Pending(self.pending_seq), offset, &[byte])?;
        if self.pending.len() == self.window {
            self.finalize_pending()?;
        }
        Ok(())
    }

    /// Turn the accumulated new bytes into a chunk: reuse a published one
    /// with the same bytes, otherwise queue it for writing.
    fn finalize_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let buf = std::mem::replace(&mut self.pending, Vec::with_capacity(self.window));
        let hash = RollingHash::hash_of(&buf);
        let lazy = self.inventory;
        let inventory = lazy.get()?;
        let id = match find_known(inventory, self.cache, hash, &buf)? {
            Some(id) => {
                if let Some(info) = inventory.info(&id) {
                    self.chunks.entry(id).or_insert_with(|| info.clone());
                }
                self.count_known();
                id
            }
            None => {
                let id = ChunkId::from_data(&buf);
                let info = ChunkInfo {
                    rolling_hash: hash,
                    size: buf.len() as u32,
                    file_size: None,
                    group: id.data_group(),
                };
                if self.chunks.contains_key(&id) {
                    // same content already produced earlier in this run
                    self.count_known();
                } else if self.is_stored(&id, &buf)? {
                    // published before but not indexed, e.g. a zero rolling hash
                    self.chunks.insert(id, info);
                    self.count_known();
                } else {
                    self.chunks.insert(id, info);
                    self.new_chunks += 1;
                    self.progress.inc_new();
                    self.log_chunk();
                    self.sink.queue(WriteJob { rolling_hash: hash, payload: buf, id })?;
                }
                id
            }
        };
        self.resolved.insert(self.pending_seq, id);
        self.pending_seq = self.next_seq;
        self.next_seq += 1;
        Ok(())
    }

    /// Whether a valid stored chunk under `id` holds exactly `data`.
    fn is_stored(&mut self, id: &ChunkId, data: &[u8]) -> Result<bool> {
        if !self.cache.store().contains(id) {
            return Ok(false);
        }
        Ok(self.cache.compare(id, data)? == Comparison::Match)
    }

    fn count_known(&mut self) {
        self.known_chunks += 1;
        self.progress.inc_known();
        self.log_chunk();
    }

    fn log_chunk(&self) {
        debug!("{} [{}:{}]", self.label, self.new_chunks, self.known_chunks);
    }

    /// Assign `bytes`, which occupy `chunk_offset..` of `slot`, to the files
    /// owning the next stream positions.
    fn attribute(&mut self, slot: Slot, chunk_offset: u32, bytes: &[u8]) -> Result<()> {
        let mut off = 0usize;
        while off < bytes.len() {
            if !self.current.as_ref().is_some_and(|f| self.pos < f.span.end()) {
                self.open_next_file()?;
            }
            let Some(file) = self.current.as_mut() else {
                bail!("no file open at stream byte {}", self.pos);
            };
            let n = ((file.span.end() - self.pos) as usize).min(bytes.len() - off);
            file.hasher.update(&bytes[off..off + n]);
            let part_offset = chunk_offset + off as u32;
            match file.parts.last_mut() {
                Some(last) if last.slot == slot && last.offset + last.size == part_offset => {
                    last.size += n as u32;
                }
                _ => file.parts.push(PartDraft { slot, offset: part_offset, size: n as u32 }),
            }
            self.pos += n as u64;
            off += n;
            if self.pos == file.span.end() {
                if let Some(f) = self.current.take() {
                    self.close_file(f);
                }
            }
        }
        self.unreported += bytes.len() as u64;
        if self.unreported >= PROGRESS_STRIDE {
            self.flush_progress();
            self.progress.maybe_log(&self.label);
        }
        Ok(())
    }

    fn open_next_file(&mut self) -> Result<()> {
        let span = self
            .stream
            .file_span(self.pos)
            .ok_or_else(|| anyhow!("stream byte {} belongs to no file", self.pos))?;
        if span.start != self.pos {
            bail!("stream byte {} lands inside {} past its start", self.pos, span.path);
        }
        self.current = Some(OpenFile { span, hasher: blake3::Hasher::new(), parts: Vec::new() });
        Ok(())
    }

    fn close_file(&mut self, f: OpenFile) {
        self.progress.inc_files();
        self.done.push(FileDraft {
            path: f.span.path,
            size: f.span.size,
            is_executable: f.span.is_executable,
            file_hash: f.hasher.finalize().to_hex().to_string(),
            parts: f.parts,
        });
    }

    fn flush_progress(&mut self) {
        self.progress.add_bytes(self.unreported);
        self.unreported = 0;
    }

    fn finish(mut self) -> Result<AssemblyOutput> {
        // what is left in the window never matched; it is new data
        let mut rest = Vec::with_capacity(self.rh.len());
        self.rh.copy_window_into(&mut rest);
        self.rh.clear();
        for b in rest {
            self.push_new_byte(b)?;
        }
        self.finalize_pending()?;
        self.flush_progress();
        if let Some(f) = &self.current {
            bail!(
                "byte stream ended inside {} after {} of {} bytes",
                f.span.path,
                self.pos - f.span.start,
                f.span.size
            );
        }

        let mut files = BTreeMap::new();
        for draft in std::mem::take(&mut self.done) {
            let mut parts = Vec::with_capacity(draft.parts.len());
            for p in draft.parts {
                let chunk = match p.slot {
                    Slot::Known(id) => id,
                    Slot::Pending(seq) => *self
                        .resolved
                        .get(&seq)
                        .ok_or_else(|| anyhow!("chunk #{} of {} never finalized", seq, draft.path))?,
                };
                parts.push(ChunkPart { chunk, offset: p.offset, size: p.size });
            }
            let entry = FileEntry {
                size: draft.size,
                file_hash: draft.file_hash,
                is_executable: draft.is_executable,
                parts,
            };
            if files.insert(draft.path.clone(), entry).is_some() {
                bail!("duplicate file path {} in stream", draft.path);
            }
        }
        Ok(AssemblyOutput {
            files,
            chunks: self.chunks,
            new_chunks: self.new_chunks,
            known_chunks: self.known_chunks,
            bytes: self.pos,
        })
    }
}

/// First published chunk whose hash, length and bytes all equal `data`.
/// Unreadable chunks count as non-matches.
fn find_known(
    inventory: &ChunkInventory,
    cache: &mut ChunkCache,
    hash: u64,
    data: &[u8],
) -> Result<Option<ChunkId>> {
    for id in inventory.lookup(hash) {
        match inventory.info(id) {
            Some(info) if info.size as usize == data.len() => {}
            _ => continue,
        }
        if cache.compare(id, data)? == Comparison::Match {
            return Ok(Some(*id));
        }
    }
    Ok(None)
}
