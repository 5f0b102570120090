pub mod assembler;
pub mod cache;
pub mod chunk_format;
pub mod generate;
pub mod inventory;
pub mod manifest;
pub mod paths;
pub mod progress;
pub mod rolling_hash;
pub mod settings;
pub mod store;
pub mod stream;
pub mod verify;

pub use generate::{generate, GenerationReport, GenerationSession};
pub use manifest::{ChunkId, Manifest};
pub use settings::{ChunkingConfig, GenerationSettings};
