use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_EXT: &str = "manifest";

/// Content-derived chunk identifier: the BLAKE3 digest of the chunk payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId([u8; 32]);

impl ChunkId {
    pub fn from_data(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Data group bucket (0..100) used by downstream distribution tooling.
    pub fn data_group(&self) -> u8 {
        (crc32fast::hash(&self.0) % 100) as u8
    }
}

impl FromStr for ChunkId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let h = blake3::Hash::from_hex(s).map_err(|e| anyhow!("bad chunk id {:?}: {}", s, e))?;
        Ok(Self(*h.as_bytes()))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", &self.to_hex()[..16])
    }
}

impl Serialize for ChunkId {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A contiguous slice of one chunk contributing to one file.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPart {
    pub chunk: ChunkId,
    pub offset: u32,
    pub size: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub size: u64,
    /// BLAKE3 of the whole file, lowercase hex.
    pub file_hash: String,
    #[serde(default)]
    pub is_executable: bool,
    pub parts: Vec<ChunkPart>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Rolling hash of the payload at discovery time.
    pub rolling_hash: u64,
    /// Payload length in bytes.
    pub size: u32,
    /// Size of the stored chunk file, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub group: u8,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Manifest {
    pub manifest_version: u32,
    pub app_id: u32,
    pub app_name: String,
    pub build_version: String,
    #[serde(default)]
    pub launch_exe: String,
    #[serde(default)]
    pub launch_command: String,
    pub created_utc: String,
    pub chunk_size: u32,
    pub files: BTreeMap<String, FileEntry>,
    pub chunks: BTreeMap<ChunkId, ChunkInfo>,
    #[serde(default)]
    pub empty_files: Vec<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open manifest {:?}", path))?;
        let mf: Manifest = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("parse manifest {:?}", path))?;
        if mf.manifest_version > MANIFEST_VERSION {
            bail!("manifest {:?} has unsupported version {}", path, mf.manifest_version);
        }
        Ok(mf)
    }

    /// Write the manifest beside `path` and rename it into place, so a
    /// failed save never leaves a partial manifest at `path`.
    pub fn save_atomic(&self, path: &Path) -> Result<()> {
        let tmp = tmp_path(path);
        let write = || -> Result<()> {
            let f = File::create(&tmp).with_context(|| format!("create {:?}", tmp))?;
            let mut w = BufWriter::new(f);
            serde_json::to_writer_pretty(&mut w, self).context("serialize manifest")?;
            w.flush()?;
            w.get_ref().sync_all().with_context(|| format!("sync {:?}", tmp))?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, path).with_context(|| format!("publish manifest {:?}", path))?;
        Ok(())
    }

    /// Chunk identifiers referenced by `path`, in reconstruction order.
    pub fn chunk_sequence(&self, path: &str) -> Option<Vec<ChunkId>> {
        self.files.get(path).map(|fe| fe.parts.iter().map(|p| p.chunk).collect())
    }

    /// Check that every part resolves to a known chunk and stays inside it,
    /// and that each file's parts add up to its size.
    pub fn check_invariants(&self) -> Result<()> {
        for (path, fe) in &self.files {
            let mut total = 0u64;
            for part in &fe.parts {
                let Some(info) = self.chunks.get(&part.chunk) else {
                    bail!("{}: part references unknown chunk {}", path, part.chunk);
                };
                if part.size == 0 {
                    bail!("{}: zero-length part in chunk {}", path, part.chunk);
                }
                if part.offset as u64 + part.size as u64 > info.size as u64 {
                    bail!(
                        "{}: part {}+{} overruns chunk {} of {} bytes",
                        path,
                        part.offset,
                        part.size,
                        part.chunk,
                        info.size
                    );
                }
                total += part.size as u64;
            }
            if total != fe.size {
                bail!("{}: parts cover {} bytes, file is {}", path, total, fe.size);
            }
        }
        for empty in &self.empty_files {
            match self.files.get(empty) {
                Some(fe) if fe.size == 0 => {}
                _ => bail!("empty file {} missing from file list", empty),
            }
        }
        Ok(())
    }
}

/// Deterministic manifest name: app name and version with all whitespace
/// removed, plus the `.manifest` extension.
pub fn manifest_filename(app_name: &str, build_version: &str) -> String {
    let stem: String =
        app_name.chars().chain(build_version.chars()).filter(|c| !c.is_whitespace()).collect();
    format!("{}.{}", stem, MANIFEST_EXT)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_strips_whitespace() {
        assert_eq!(manifest_filename("My Game", " 1.0 beta\t2"), "MyGame1.0beta2.manifest");
    }

    #[test]
    fn chunk_id_hex_parses_back() {
        let id = ChunkId::from_data(b"payload");
        let parsed: ChunkId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(id.data_group() < 100);
        assert!("not-hex".parse::<ChunkId>().is_err());
    }

    #[test]
    fn invariants_catch_short_parts() {
        let id = ChunkId::from_data(b"abc");
        let mut mf = Manifest {
            manifest_version: MANIFEST_VERSION,
            app_id: 1,
            app_name: "app".into(),
            build_version: "v1".into(),
            launch_exe: String::new(),
            launch_command: String::new(),
            created_utc: String::new(),
            chunk_size: 3,
            files: BTreeMap::new(),
            chunks: BTreeMap::new(),
            empty_files: Vec::new(),
            custom_fields: BTreeMap::new(),
        };
        mf.chunks.insert(id, ChunkInfo { rolling_hash: 1, size: 3, file_size: None, group: 0 });
        mf.files.insert(
            "a".into(),
            FileEntry {
                size: 3,
                file_hash: String::new(),
                is_executable: false,
                parts: vec![ChunkPart { chunk: id, offset: 0, size: 2 }],
            },
        );
        assert!(mf.check_invariants().is_err());
        mf.files.get_mut("a").unwrap().parts[0].size = 3;
        mf.check_invariants().unwrap();
    }
}
