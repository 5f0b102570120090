#![cfg(target_family = "unix")]

use bpgen_core::manifest::Manifest;
use bpgen_core::paths::PathPolicy;
use bpgen_core::verify::{verify_manifest, verify_with_policy};
use bpgen_core::{generate, GenerationSettings};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

fn symlink_dir<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

/// Generate a manifest for a root holding `target/file.txt`, then re-key that
/// file to `new_key` in the saved manifest.
fn manifest_with_key(root: &Path, cloud: &Path, new_key: &str) -> PathBuf {
    fs::create_dir_all(root.join("target")).unwrap();
    let mut f = File::create(root.join("target/file.txt")).unwrap();
    writeln!(f, "hello").unwrap();

    let mut s = GenerationSettings::new(root, cloud, 9, "Sym", "1");
    s.chunking.chunk_size = 1 << 10;
    let report = generate(&s).unwrap();

    let mut mf = Manifest::load(&report.manifest_path).unwrap();
    assert_eq!(mf.files.len(), 1);
    let entry = mf.files.remove("target/file.txt").unwrap();
    mf.files.insert(new_key.to_string(), entry);
    mf.save_atomic(&report.manifest_path).unwrap();
    report.manifest_path
}

#[test]
fn verify_rejects_symlink_by_default_allows_with_flag_when_contained() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    let cloud = tmp.path().join("cloud");
    let mpath = manifest_with_key(&root, &cloud, "safe/file.txt");
    symlink_dir(root.join("target"), root.join("safe")).unwrap();

    let err = verify_manifest(&mpath, &cloud, &root).expect_err("expected error");
    let msg = format!("{:#}", err);
    assert!(msg.contains("symlink"), "unexpected error: {}", msg);

    let policy = PathPolicy { follow_symlinks: true };
    let rep = verify_with_policy(&mpath, &cloud, &root, policy).unwrap();
    assert!(rep.is_ok(), "{:?}", rep);
}

#[test]
fn verify_blocks_symlink_escape_even_when_following() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    let cloud = tmp.path().join("cloud");
    let mpath = manifest_with_key(&root, &cloud, "evil/outside.txt");

    // root/evil -> the parent tempdir, with a real file there so
    // canonicalization succeeds and containment is what fails
    let parent = root.parent().unwrap();
    symlink_dir(parent, root.join("evil")).unwrap();
    let mut of = File::create(parent.join("outside.txt")).unwrap();
    writeln!(of, "outside").unwrap();

    let policy = PathPolicy { follow_symlinks: true };
    let err = verify_with_policy(&mpath, &cloud, &root, policy).expect_err("expected escape error");
    assert!(format!("{:#}", err).contains("escapes root"));
}

#[test]
fn manifest_paths_with_traversal_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    let cloud = tmp.path().join("cloud");
    let mpath = manifest_with_key(&root, &cloud, "../target/file.txt");
    let err = verify_manifest(&mpath, &cloud, &root).expect_err("expected traversal error");
    assert!(format!("{:#}", err).contains("parent traversal"));
}
