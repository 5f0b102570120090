use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Knobs for chunking, streaming and storage. Every field has a default, so
/// a settings file only needs the ones it changes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Rolling window and maximum chunk payload, in bytes.
    pub chunk_size: usize,
    pub read_block_size: usize,
    /// Depth of the bounded queue between the streamer and the assembler.
    pub stream_buffer_blocks: usize,
    /// New chunks that may wait for the writer before assembly blocks.
    pub writer_queue_chunks: usize,
    /// Chunks held by the verification cache.
    pub cache_capacity: usize,
    pub compress: bool,
    pub compression_level: i32,
    /// Seconds between progress lines; 0 disables them.
    pub progress_interval_secs: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1 << 20,
            read_block_size: 64 * 1024,
            stream_buffer_blocks: 32,
            writer_queue_chunks: 16,
            cache_capacity: 256,
            compress: true,
            compression_level: 0,
            progress_interval_secs: 10,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if self.chunk_size > u32::MAX as usize {
            bail!("chunk_size {} does not fit the chunk header", self.chunk_size);
        }
        if self.read_block_size == 0 {
            bail!("read_block_size must be > 0");
        }
        if self.stream_buffer_blocks == 0 {
            bail!("stream_buffer_blocks must be > 0");
        }
        if self.writer_queue_chunks == 0 {
            bail!("writer_queue_chunks must be > 0");
        }
        if self.cache_capacity == 0 {
            bail!("cache_capacity must be > 0");
        }
        Ok(())
    }

    /// zstd level to store chunks with, or `None` to store them raw.
    pub fn compression(&self) -> Option<i32> {
        self.compress.then_some(self.compression_level)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

/// Everything one generation run needs from its caller.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GenerationSettings {
    pub root_directory: PathBuf,
    /// Chunk store and manifest output directory.
    pub cloud_directory: PathBuf,
    pub app_id: u32,
    pub app_name: String,
    pub build_version: String,
    #[serde(default)]
    pub launch_exe: String,
    #[serde(default)]
    pub launch_command: String,
    #[serde(default)]
    pub ignore_list_file: Option<PathBuf>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub chunking: ChunkingConfig,
}

impl GenerationSettings {
    pub fn new(
        root_directory: impl Into<PathBuf>,
        cloud_directory: impl Into<PathBuf>,
        app_id: u32,
        app_name: impl Into<String>,
        build_version: impl Into<String>,
    ) -> Self {
        Self {
            root_directory: root_directory.into(),
            cloud_directory: cloud_directory.into(),
            app_id,
            app_name: app_name.into(),
            build_version: build_version.into(),
            launch_exe: String::new(),
            launch_command: String::new(),
            ignore_list_file: None,
            custom_fields: BTreeMap::new(),
            chunking: ChunkingConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read settings {:?}", path))?;
        serde_json::from_str(&text).with_context(|| format!("parse settings {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root_directory.is_dir() {
            bail!("build root {:?} is not a directory", self.root_directory);
        }
        if self.app_name.trim().is_empty() {
            bail!("app name must not be empty");
        }
        if self.build_version.trim().is_empty() {
            bail!("build version must not be empty");
        }
        for (k, v) in &self.custom_fields {
            if !(v.is_number() || v.is_string() || v.is_boolean()) {
                bail!("custom field {:?} must be a number, string or bool", k);
            }
        }
        self.chunking.validate()
    }
}
