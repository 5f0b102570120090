use crate::cache::ChunkCache;
use crate::manifest::{ChunkId, FileEntry, Manifest};
use crate::paths::{resolve_under, PathPolicy};
use crate::store::ChunkStore;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use tracing::warn;

const VERIFY_CACHE_CHUNKS: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub files_ok: u64,
    pub files_bad: u64,
    /// Distinct chunks that are missing from the store or unreadable.
    pub chunks_missing: u64,
    pub bad_files: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.files_bad == 0 && self.chunks_missing == 0
    }
}

/// Rebuild every file of a manifest from the chunk store and compare it with
/// the copy under `root`.
pub fn verify_manifest(manifest_path: &Path, cloud_dir: &Path, root: &Path) -> Result<VerifyReport> {
    verify_with_policy(manifest_path, cloud_dir, root, PathPolicy::default())
}

pub fn verify_with_policy(
    manifest_path: &Path,
    cloud_dir: &Path,
    root: &Path,
    policy: PathPolicy,
) -> Result<VerifyReport> {
    let mf = Manifest::load(manifest_path)?;
    mf.check_invariants().with_context(|| format!("manifest {:?}", manifest_path))?;
    let mut cache = ChunkCache::new(ChunkStore::new(cloud_dir), VERIFY_CACHE_CHUNKS);
    let mut missing: BTreeSet<ChunkId> = BTreeSet::new();
    let mut rep = VerifyReport::default();
    for (rel, fe) in &mf.files {
        let path = resolve_under(root, rel, policy)?;
        let ok = verify_file(&path, fe, &mut cache, &mut missing)
            .with_context(|| format!("verify {}", rel))?;
        if ok {
            rep.files_ok += 1;
        } else {
            warn!(file = %rel, "file does not match its manifest entry");
            rep.files_bad += 1;
            rep.bad_files.push(rel.clone());
        }
    }
    rep.chunks_missing = missing.len() as u64;
    Ok(rep)
}

fn verify_file(
    path: &Path,
    fe: &FileEntry,
    cache: &mut ChunkCache,
    missing: &mut BTreeSet<ChunkId>,
) -> Result<bool> {
    let f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("open {:?}", path)),
    };
    let mut reader = BufReader::new(f);
    let mut hasher = blake3::Hasher::new();
    let mut disk = Vec::new();
    let mut ok = true;
    for part in &fe.parts {
        disk.resize(part.size as usize, 0);
        if let Err(e) = reader.read_exact(&mut disk) {
            if e.kind() == ErrorKind::UnexpectedEof {
                return Ok(false);
            }
            return Err(e).with_context(|| format!("read {:?}", path));
        }
        hasher.update(&disk);
        let chunk = cache.get_reader(&part.chunk);
        if !chunk.ensure_open()? {
            missing.insert(part.chunk);
            ok = false;
            continue;
        }
        if chunk.read_at(part.offset as usize, part.size as usize)? != disk.as_slice() {
            ok = false;
        }
    }
    let mut extra = [0u8; 1];
    if reader.read(&mut extra).with_context(|| format!("read {:?}", path))? != 0 {
        return Ok(false);
    }
    Ok(ok && hasher.finalize().to_hex().as_str() == fe.file_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::generate;
    use crate::settings::GenerationSettings;
    use std::fs;

    #[test]
    fn detects_modified_and_missing_files() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path().join("build");
        fs::create_dir_all(&root).unwrap();
        let body: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 251) as u8).collect();
        fs::write(root.join("a.bin"), &body).unwrap();
        fs::write(root.join("b.bin"), &body[..1234]).unwrap();
        let mut s = GenerationSettings::new(&root, td.path().join("cloud"), 1, "App", "1");
        s.chunking.chunk_size = 1024;
        let report = generate(&s).unwrap();

        let cloud = td.path().join("cloud");
        let rep = verify_manifest(&report.manifest_path, &cloud, &root).unwrap();
        assert!(rep.is_ok(), "{:?}", rep);
        assert_eq!(rep.files_ok, 2);

        let mut changed = body.clone();
        changed[4000] ^= 0x55;
        fs::write(root.join("a.bin"), &changed).unwrap();
        fs::remove_file(root.join("b.bin")).unwrap();
        let rep = verify_manifest(&report.manifest_path, &cloud, &root).unwrap();
        assert_eq!(rep.files_bad, 2);
        assert_eq!(rep.bad_files, vec!["a.bin".to_string(), "b.bin".to_string()]);
    }
}
