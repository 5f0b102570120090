use bpgen_core::rolling_hash::RollingHash;
use bpgen_core::verify::verify_manifest;
use bpgen_core::{generate, GenerationSettings};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fs;
use std::path::Path;

const MIB: usize = 1 << 20;

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut v = vec![0u8; len];
    rng.fill(&mut v[..]);
    v
}

fn settings(root: &Path, cloud: &Path, version: &str, chunk_size: usize) -> GenerationSettings {
    let mut s = GenerationSettings::new(root, cloud, 77, "Resync", version);
    s.chunking.chunk_size = chunk_size;
    s.chunking.progress_interval_secs = 0;
    s
}

#[test]
fn insertion_near_start_only_renews_chunks_around_the_edit() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("build");
    let cloud = td.path().join("cloud");
    fs::create_dir_all(&root).unwrap();
    let original = random_bytes(10 * MIB, 2024);
    fs::write(root.join("big.pak"), &original).unwrap();

    let first = generate(&settings(&root, &cloud, "1", MIB)).unwrap();
    assert_eq!((first.new_chunks, first.known_chunks), (10, 0));

    let mut edited = Vec::with_capacity(original.len() + 37);
    edited.extend_from_slice(&original[..1000]);
    edited.extend_from_slice(&random_bytes(37, 7));
    edited.extend_from_slice(&original[1000..]);
    fs::write(root.join("big.pak"), &edited).unwrap();

    let second = generate(&settings(&root, &cloud, "2", MIB)).unwrap();
    // the first chunk now holds the insertion and the 37 displaced bytes form
    // a short tail chunk; chunks 1..10 are found again at their shifted offsets
    assert_eq!((second.new_chunks, second.known_chunks), (2, 9));
    assert_eq!(second.chunks_written, 2);

    let old_seq = first.manifest.chunk_sequence("big.pak").unwrap();
    let new_seq = second.manifest.chunk_sequence("big.pak").unwrap();
    assert!(new_seq.windows(9).any(|w| w == &old_seq[1..]));
    assert!(!new_seq.contains(&old_seq[0]));

    let rep = verify_manifest(&second.manifest_path, &cloud, &root).unwrap();
    assert!(rep.is_ok(), "{:?}", rep);
}

#[test]
fn deletion_near_start_keeps_every_later_chunk_known() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("build");
    let cloud = td.path().join("cloud");
    fs::create_dir_all(&root).unwrap();
    let original = random_bytes(10 * MIB, 4048);
    fs::write(root.join("big.pak"), &original).unwrap();

    let first = generate(&settings(&root, &cloud, "1", MIB)).unwrap();
    assert_eq!((first.new_chunks, first.known_chunks), (10, 0));

    let mut edited = original.clone();
    edited.drain(1000..1037);
    fs::write(root.join("big.pak"), &edited).unwrap();

    let second = generate(&settings(&root, &cloud, "2", MIB)).unwrap();
    // the bytes before the old second chunk shrink into one short new chunk
    assert_eq!((second.new_chunks, second.known_chunks), (1, 9));
    assert_eq!(second.chunks_written, 1);

    let old_seq = first.manifest.chunk_sequence("big.pak").unwrap();
    let new_seq = second.manifest.chunk_sequence("big.pak").unwrap();
    assert_eq!(&new_seq[1..], &old_seq[1..]);
    let head = &second.manifest.chunks[&new_seq[0]];
    assert_eq!(head.size as usize, MIB - 37);

    let rep = verify_manifest(&second.manifest_path, &cloud, &root).unwrap();
    assert!(rep.is_ok(), "{:?}", rep);
}

#[test]
fn colliding_window_is_rejected_by_byte_comparison() {
    // with a window that is a multiple of 64 bytes, swapping two bytes 64
    // apart keeps the rolling hash but changes the content
    const W: usize = 256;
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("build");
    let cloud = td.path().join("cloud");
    fs::create_dir_all(&root).unwrap();

    let mut original = random_bytes(W, 99);
    if original[10] == original[74] {
        original[74] = original[10].wrapping_add(1);
    }
    let mut forged = original.clone();
    forged.swap(10, 74);
    assert_ne!(original, forged);
    assert_eq!(RollingHash::hash_of(&original), RollingHash::hash_of(&forged));

    fs::write(root.join("asset.bin"), &original).unwrap();
    let first = generate(&settings(&root, &cloud, "1", W)).unwrap();
    assert_eq!(first.new_chunks, 1);

    fs::write(root.join("asset.bin"), &forged).unwrap();
    let second = generate(&settings(&root, &cloud, "2", W)).unwrap();
    assert_eq!((second.new_chunks, second.known_chunks), (1, 0));
    let old_id = first.manifest.chunk_sequence("asset.bin").unwrap()[0];
    let new_id = second.manifest.chunk_sequence("asset.bin").unwrap()[0];
    assert_ne!(old_id, new_id);

    let rep = verify_manifest(&second.manifest_path, &cloud, &root).unwrap();
    assert!(rep.is_ok(), "{:?}", rep);
}
