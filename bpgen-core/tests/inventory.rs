use bpgen_core::inventory::{list_manifests, ChunkInventory};
use bpgen_core::manifest::{manifest_filename, ChunkId, ChunkInfo, Manifest, MANIFEST_VERSION};
use std::collections::BTreeMap;
use std::fs;

fn manifest(version: &str, chunks: &[(ChunkId, u64)]) -> Manifest {
    Manifest {
        manifest_version: MANIFEST_VERSION,
        app_id: 5,
        app_name: "Inv".into(),
        build_version: version.into(),
        launch_exe: String::new(),
        launch_command: String::new(),
        created_utc: "2024-01-01T00:00:00+00:00".into(),
        chunk_size: 16,
        files: BTreeMap::new(),
        chunks: chunks
            .iter()
            .map(|(id, hash)| {
                (*id, ChunkInfo { rolling_hash: *hash, size: 16, file_size: None, group: id.data_group() })
            })
            .collect(),
        empty_files: Vec::new(),
        custom_fields: BTreeMap::new(),
    }
}

#[test]
fn unreadable_manifests_are_skipped_and_zero_hashes_ignored() {
    let td = tempfile::tempdir().unwrap();
    let cloud = td.path();
    let a = ChunkId::from_data(b"a");
    let b = ChunkId::from_data(b"b");
    let z = ChunkId::from_data(b"z");
    manifest("1", &[(a, 11), (z, 0)]).save_atomic(&cloud.join(manifest_filename("Inv", "1"))).unwrap();
    manifest("2", &[(a, 11), (b, 11)]).save_atomic(&cloud.join(manifest_filename("Inv", "2"))).unwrap();
    fs::write(cloud.join("Broken.manifest"), b"{ not json").unwrap();
    fs::write(cloud.join("notes.txt"), b"ignored").unwrap();

    assert_eq!(list_manifests(cloud).unwrap().len(), 3);
    let inv = ChunkInventory::build(cloud).unwrap();
    let stats = inv.stats();
    assert_eq!(stats.manifests_loaded, 2);
    assert_eq!(stats.manifests_skipped, 1);
    assert_eq!(stats.zero_hash_ignored, 1);
    assert_eq!(stats.chunks_indexed, 2);

    // colliding ids share a bucket in manifest name order
    assert_eq!(inv.lookup(11), &[a, b]);
    assert!(inv.info(&z).is_none());
    assert!(inv.lookup(0).is_empty());
}

#[test]
fn manifests_from_a_newer_format_are_skipped() {
    let td = tempfile::tempdir().unwrap();
    let mut mf = manifest("9", &[(ChunkId::from_data(b"x"), 3)]);
    mf.manifest_version = MANIFEST_VERSION + 1;
    mf.save_atomic(&td.path().join("Future.manifest")).unwrap();
    let inv = ChunkInventory::build(td.path()).unwrap();
    assert!(inv.is_empty());
    assert_eq!(inv.stats().manifests_skipped, 1);
}
