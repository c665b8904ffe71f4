//! Shared repository fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use git_fastcdc::Git;
use tempfile::TempDir;

/// Create a throwaway repository and open a gateway on it.
pub fn init_repo() -> (TempDir, Git) {
    let dir = TempDir::new().unwrap();
    let status = Command::new("git")
        .args(["init", "-q"])
        .current_dir(dir.path())
        .status()
        .unwrap();
    assert!(status.success(), "git init failed");
    let git = Git::open(dir.path()).unwrap();
    (dir, git)
}

/// Run git in `dir` and return trimmed stdout, asserting success.
pub fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8(out.stdout).unwrap().trim().to_string()
}

/// Set a config key in `dir`'s repository.
pub fn git_config(dir: &Path, key: &str, value: &str) {
    git_stdout(dir, &["config", "--local", key, value]);
}

/// Deterministic byte soup with enough entropy to produce chunk
/// boundaries.
pub fn noise(seed: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let x = (i as u32).wrapping_add(seed.wrapping_mul(31));
            (x.wrapping_mul(2_654_435_761) >> 24) as u8
        })
        .collect()
}
