use crate::assembler::ChunkAssembler;
use crate::cache::ChunkCache;
use crate::inventory::{InventoryStats, LazyInventory};
use crate::manifest::{manifest_filename, FileEntry, Manifest, MANIFEST_VERSION};
use crate::paths::IgnoreList;
use crate::progress::Progress;
use crate::settings::GenerationSettings;
use crate::store::{ChunkStore, ChunkWriter};
use crate::stream::{enumerate_files, spawn_streamer, BuildListing, BuildStream};
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::info;

/// Lock file serializing generation runs that share a cloud directory.
pub const LOCK_FILE: &str = ".bpgen.lock";

#[derive(Clone, Debug)]
pub struct GenerationReport {
    pub manifest_path: PathBuf,
    pub manifest: Manifest,
    pub new_chunks: u64,
    pub known_chunks: u64,
    pub bytes_processed: u64,
    /// Chunk files actually created by this run.
    pub chunks_written: u64,
    pub files: usize,
    pub empty_files: usize,
    pub ignored_files: usize,
    pub inventory: InventoryStats,
    pub elapsed: Duration,
}

/// Exclusive advisory lock held for the whole run.
struct RunLock {
    file: File,
}

impl RunLock {
    fn acquire(cloud_dir: &Path) -> Result<Self> {
        let path = cloud_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open lock {:?}", path))?;
        file.lock_exclusive().with_context(|| format!("lock {:?}", path))?;
        Ok(Self { file })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// One directory-to-manifest generation. All state of the run lives here and
/// in the scope of [`GenerationSession::run`].
pub struct GenerationSession {
    settings: GenerationSettings,
    progress: Progress,
}

impl GenerationSession {
    pub fn new(settings: GenerationSettings) -> Result<Self> {
        settings.validate()?;
        let progress = Progress::new(settings.chunking.progress_interval());
        Ok(Self { settings, progress })
    }

    /// Handle onto the live new/known chunk counters.
    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Enumerate the build root, applying the ignore list.
    pub fn list_build(&self) -> Result<BuildListing> {
        let s = &self.settings;
        let ignore = IgnoreList::load(s.ignore_list_file.as_deref())?;
        enumerate_files(&s.root_directory, &ignore)
    }

    pub fn run(&self) -> Result<GenerationReport> {
        self.run_listing(self.list_build()?)
    }

    /// Generate from an already enumerated build. Every listed file must
    /// still be readable at its listed size, or the run fails without
    /// publishing a manifest.
    pub fn run_listing(&self, listing: BuildListing) -> Result<GenerationReport> {
        let s = &self.settings;
        let cfg = &s.chunking;
        info!(
            "running chunks patch generation for {}:{} {}",
            s.app_id, s.app_name, s.build_version
        );
        fs::create_dir_all(&s.cloud_directory)
            .with_context(|| format!("create cloud dir {:?}", s.cloud_directory))?;
        let _lock = RunLock::acquire(&s.cloud_directory)?;

        let store = ChunkStore::new(&s.cloud_directory);
        let inventory = LazyInventory::new(&s.cloud_directory);
        let mut cache = ChunkCache::new(store.clone(), cfg.cache_capacity);
        let stream = BuildStream::new();
        let label = format!("{} {}", s.app_name, s.build_version);
        let progress = &self.progress;

        let (streamed, assembled, written) = thread::scope(|scope| {
            let (producer, source) = spawn_streamer(scope, listing, &stream, cfg);
            let writer =
                ChunkWriter::spawn(scope, &store, cfg.compression(), cfg.writer_queue_chunks);
            // the source is dropped when the assembler returns, which
            // unblocks the producer even if assembly failed
            let assembled = ChunkAssembler::new(
                label,
                cfg.chunk_size,
                &inventory,
                &mut cache,
                &writer,
                &stream,
                progress,
            )
            .run(source);
            let written = writer.drain_and_join();
            let streamed = producer
                .join()
                .map_err(|_| anyhow!("byte streamer thread panicked"))
                .and_then(|r| r);
            (streamed, assembled, written)
        });
        let summary = streamed.context("streaming build files")?;
        let out = assembled.context("assembling chunks")?;
        let written = written.context("writing chunks")?;

        let mut files = out.files;
        let mut empty_files = Vec::new();
        let empty_hash = blake3::hash(&[]).to_hex().to_string();
        for empty in stream.empty_files() {
            files.insert(
                empty.path.clone(),
                FileEntry {
                    size: 0,
                    file_hash: empty_hash.clone(),
                    is_executable: empty.is_executable,
                    parts: Vec::new(),
                },
            );
            empty_files.push(empty.path);
        }

        let mut chunks = out.chunks;
        for (id, info) in chunks.iter_mut() {
            if let Some(size) = written.file_sizes.get(id) {
                info.file_size = Some(*size);
            } else if info.file_size.is_none() {
                info.file_size = store.chunk_file_size(id);
            }
        }

        let manifest = Manifest {
            manifest_version: MANIFEST_VERSION,
            app_id: s.app_id,
            app_name: s.app_name.clone(),
            build_version: s.build_version.clone(),
            launch_exe: s.launch_exe.clone(),
            launch_command: s.launch_command.clone(),
            created_utc: chrono::Utc::now().to_rfc3339(),
            chunk_size: cfg.chunk_size as u32,
            files,
            chunks,
            empty_files,
            custom_fields: s.custom_fields.clone(),
        };
        manifest.check_invariants().context("generated manifest is inconsistent")?;
        let manifest_path = s.cloud_directory.join(manifest_filename(&s.app_name, &s.build_version));
        manifest.save_atomic(&manifest_path)?;

        let elapsed = self.progress.elapsed();
        info!("saved manifest to {:?}", manifest_path);
        info!(
            new = out.new_chunks,
            known = out.known_chunks,
            written = written.written,
            "generation took {:.1?}",
            elapsed
        );
        Ok(GenerationReport {
            manifest_path,
            new_chunks: out.new_chunks,
            known_chunks: out.known_chunks,
            bytes_processed: out.bytes,
            chunks_written: written.written,
            files: summary.files + summary.empty_files,
            empty_files: summary.empty_files,
            ignored_files: summary.ignored,
            inventory: inventory.stats(),
            elapsed,
            manifest,
        })
    }
}

/// Generate a manifest for `settings.root_directory` into the cloud
/// directory, reusing chunks published by earlier manifests there.
pub fn generate(settings: &GenerationSettings) -> Result<GenerationReport> {
    GenerationSession::new(settings.clone())?.run()
}
