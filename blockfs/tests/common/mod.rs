//! Shared scratch-disk helpers for the integration tests: one host file
//! per test under `tests/disks/`, so parallel `cargo test` runs don't
//! collide.

use std::path::{Path, PathBuf};

pub fn disk_prep_path(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("disks");
    std::fs::create_dir_all(&path).unwrap();
    path.push(name);
    if path.exists() {
        std::fs::remove_file(&path).unwrap();
    }
    path
}

pub fn disk_unprep_path(path: &Path) {
    if path.exists() {
        std::fs::remove_file(path).unwrap();
    }
}
