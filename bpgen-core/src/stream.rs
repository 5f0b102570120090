//! Producer side of a generation run: enumerates the build root and feeds
//! file bytes, in path order, through a bounded queue to the assembler.

use crate::paths::{normalize_rel_path, IgnoreList};
use crate::settings::ChunkingConfig;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Mutex, MutexGuard};
use std::thread::{Scope, ScopedJoinHandle};
use tracing::{debug, info};

/// One non-empty file's place in the logical byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSpan {
    pub path: String,
    pub size: u64,
    /// Stream offset of the file's first byte.
    pub start: u64,
    pub is_executable: bool,
}

impl FileSpan {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// A zero-length file; it has no bytes in the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmptyFile {
    pub path: String,
    pub is_executable: bool,
}

/// File boundaries recorded by the streamer and read by the assembler.
/// A span is always recorded before any of its bytes are queued.
#[derive(Default)]
pub struct BuildStream {
    spans: Mutex<BTreeMap<u64, FileSpan>>,
    empty_files: Mutex<Vec<EmptyFile>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl BuildStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_file(&self, span: FileSpan) {
        lock(&self.spans).insert(span.start, span);
    }

    pub fn add_empty_file(&self, file: EmptyFile) {
        lock(&self.empty_files).push(file);
    }

    /// The span containing stream position `pos`.
    pub fn file_span(&self, pos: u64) -> Option<FileSpan> {
        lock(&self.spans)
            .range(..=pos)
            .next_back()
            .filter(|(_, s)| pos < s.end())
            .map(|(_, s)| s.clone())
    }

    pub fn spans(&self) -> Vec<FileSpan> {
        lock(&self.spans).values().cloned().collect()
    }

    pub fn empty_files(&self) -> Vec<EmptyFile> {
        lock(&self.empty_files).clone()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub files: usize,
    pub empty_files: usize,
    pub ignored: usize,
    pub bytes: u64,
    /// The consumer hung up before every byte was delivered.
    pub aborted: bool,
}

#[derive(Clone, Debug)]
pub struct SourceFile {
    pub rel: String,
    pub path: PathBuf,
    pub size: u64,
    pub is_executable: bool,
}

/// The files one run will stream, fixed before any byte is read.
#[derive(Clone, Debug, Default)]
pub struct BuildListing {
    pub files: Vec<SourceFile>,
    pub ignored: usize,
}

/// Regular files under `root`, sorted by normalized relative path, minus
/// ignored ones.
pub fn enumerate_files(root: &Path, ignore: &IgnoreList) -> Result<BuildListing> {
    let mut files = Vec::new();
    let mut ignored = 0usize;
    for ent in walkdir::WalkDir::new(root).min_depth(1) {
        let ent = ent.with_context(|| format!("walk {:?}", root))?;
        let ft = ent.file_type();
        if ft.is_symlink() {
            debug!(path = ?ent.path(), "skipping symlink");
            continue;
        }
        if !ft.is_file() {
            continue;
        }
        let path = ent.path();
        let rel_path = pathdiff::diff_paths(path, root)
            .ok_or_else(|| anyhow!("{:?} is not under {:?}", path, root))?;
        let rel = normalize_rel_path(&rel_path.to_string_lossy());
        if ignore.is_ignored(&rel) {
            ignored += 1;
            continue;
        }
        let meta = ent.metadata().with_context(|| format!("stat {:?}", path))?;
        files.push(SourceFile {
            rel,
            path: path.to_path_buf(),
            size: meta.len(),
            is_executable: is_executable(&meta),
        });
    }
    files.sort_by(|a, b| a.rel.cmp(&b.rel));
    if ignored > 0 {
        info!(ignored, "stripped files matching the ignore list");
    }
    Ok(BuildListing { files, ignored })
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

/// Start the producer thread over `listing`. The returned [`ByteSource`]
/// yields the stream in order and ends once every file has been queued (or
/// the producer failed; its error is in the join handle). A listed file that
/// can no longer be opened or read in full fails the producer.
pub fn spawn_streamer<'scope, 'env: 'scope>(
    scope: &'scope Scope<'scope, 'env>,
    listing: BuildListing,
    stream: &'env BuildStream,
    cfg: &ChunkingConfig,
) -> (ScopedJoinHandle<'scope, Result<StreamSummary>>, ByteSource) {
    let (tx, rx) = sync_channel::<Vec<u8>>(cfg.stream_buffer_blocks);
    let block = cfg.read_block_size;
    let handle = scope.spawn(move || stream_files(listing, stream, block, tx));
    (handle, ByteSource::new(rx))
}

fn stream_files(
    listing: BuildListing,
    stream: &BuildStream,
    block: usize,
    tx: SyncSender<Vec<u8>>,
) -> Result<StreamSummary> {
    let mut summary = StreamSummary { ignored: listing.ignored, ..Default::default() };
    let mut offset = 0u64;
    for f in listing.files {
        if f.size == 0 {
            stream.add_empty_file(EmptyFile { path: f.rel, is_executable: f.is_executable });
            summary.empty_files += 1;
            continue;
        }
        let mut file = File::open(&f.path).with_context(|| format!("open {:?}", f.path))?;
        stream.begin_file(FileSpan {
            path: f.rel.clone(),
            size: f.size,
            start: offset,
            is_executable: f.is_executable,
        });
        let mut remaining = f.size;
        while remaining > 0 {
            let n = remaining.min(block as u64) as usize;
            let mut buf = vec![0u8; n];
            file.read_exact(&mut buf).with_context(|| format!("read {:?}", f.path))?;
            remaining -= n as u64;
            if tx.send(buf).is_err() {
                summary.aborted = true;
                return Ok(summary);
            }
        }
        offset += f.size;
        summary.files += 1;
        summary.bytes += f.size;
    }
    Ok(summary)
}

/// Consumer end of the byte queue.
pub struct ByteSource {
    rx: Receiver<Vec<u8>>,
    block: Vec<u8>,
    at: usize,
}

impl ByteSource {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self { rx, block: Vec::new(), at: 0 }
    }
}

impl Iterator for ByteSource {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        loop {
            if let Some(&b) = self.block.get(self.at) {
                self.at += 1;
                return Some(b);
            }
            self.block = self.rx.recv().ok()?;
            self.at = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn spans_follow_sorted_paths_and_skip_empty_files() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("b/z.bin"), b"zz").unwrap();
        fs::write(root.join("a.txt"), b"aaa").unwrap();
        fs::write(root.join("empty"), b"").unwrap();
        fs::write(root.join("skip.log"), b"ignored").unwrap();
        let ignore = IgnoreList::from_lines(["skip.log"]);
        let stream = BuildStream::new();
        let cfg = ChunkingConfig { read_block_size: 2, stream_buffer_blocks: 1, ..Default::default() };

        let listing = enumerate_files(root, &ignore).unwrap();
        let (bytes, summary) = std::thread::scope(|s| {
            let (h, src) = spawn_streamer(s, listing, &stream, &cfg);
            let bytes: Vec<u8> = src.collect();
            (bytes, h.join().unwrap().unwrap())
        });
        assert_eq!(bytes, b"aaazz");
        assert_eq!(summary.files, 2);
        assert_eq!(summary.ignored, 1);
        assert_eq!(
            stream.empty_files(),
            vec![EmptyFile { path: "empty".into(), is_executable: false }]
        );
        assert_eq!(stream.file_span(3).unwrap().path, "b/z.bin");
        assert_eq!(stream.file_span(2).unwrap().path, "a.txt");
        assert!(stream.file_span(5).is_none());
    }

    fn stream_all(listing: BuildListing) -> (Vec<u8>, Result<StreamSummary>) {
        let stream = BuildStream::new();
        let cfg = ChunkingConfig { read_block_size: 4, stream_buffer_blocks: 2, ..Default::default() };
        std::thread::scope(|s| {
            let (h, src) = spawn_streamer(s, listing, &stream, &cfg);
            let bytes: Vec<u8> = src.collect();
            (bytes, h.join().unwrap())
        })
    }

    #[test]
    fn file_removed_after_listing_fails_the_producer() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("a.bin"), b"0123456789").unwrap();
        fs::write(td.path().join("b.bin"), b"abcdef").unwrap();
        let listing = enumerate_files(td.path(), &IgnoreList::default()).unwrap();
        fs::remove_file(td.path().join("b.bin")).unwrap();

        let (bytes, res) = stream_all(listing);
        assert_eq!(bytes, b"0123456789");
        let err = res.unwrap_err();
        assert!(format!("{:#}", err).contains("b.bin"), "{:#}", err);
    }

    #[test]
    fn file_shrunk_after_listing_fails_the_producer() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("a.bin"), b"0123456789").unwrap();
        let listing = enumerate_files(td.path(), &IgnoreList::default()).unwrap();
        fs::write(td.path().join("a.bin"), b"0123").unwrap();

        let (_, res) = stream_all(listing);
        let err = res.unwrap_err();
        assert!(format!("{:#}", err).contains("read"), "{:#}", err);
    }

    #[cfg(unix)]
    #[test]
    fn empty_executable_keeps_its_mode() {
        use std::os::unix::fs::PermissionsExt;
        let td = tempfile::tempdir().unwrap();
        let marker = td.path().join("run.sh");
        fs::write(&marker, b"").unwrap();
        fs::set_permissions(&marker, fs::Permissions::from_mode(0o755)).unwrap();
        let stream = BuildStream::new();
        let listing = enumerate_files(td.path(), &IgnoreList::default()).unwrap();
        let cfg = ChunkingConfig::default();
        std::thread::scope(|s| {
            let (h, src) = spawn_streamer(s, listing, &stream, &cfg);
            assert_eq!(src.count(), 0);
            h.join().unwrap().unwrap();
        });
        assert_eq!(
            stream.empty_files(),
            vec![EmptyFile { path: "run.sh".into(), is_executable: true }]
        );
    }
}
