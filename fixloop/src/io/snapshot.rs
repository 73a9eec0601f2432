//! Deterministic content hash of the working tree, used for convergence detection.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use crate::io::layout::STATE_DIR_NAME;

/// Directories never hashed or searched: VCS metadata, loop state, and build output.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    STATE_DIR_NAME,
    "target",
    "node_modules",
    "bin",
    "obj",
    "dist",
    "build",
];

fn is_excluded(entry: &DirEntry, extra: &[String]) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    EXCLUDED_DIRS.contains(&name.as_ref()) || extra.iter().any(|e| e == name.as_ref())
}

/// Repository files (relative paths, sorted) outside the excluded directories.
pub fn source_files(root: &Path, extra_excludes: &[String]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_excluded(e, extra_excludes))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}

/// SHA-256 (hex) over every source file's relative path and bytes, in sorted order.
pub fn content_hash(root: &Path, extra_excludes: &[String]) -> Result<String> {
    let mut hasher = Sha256::new();
    for rel in source_files(root, extra_excludes) {
        let bytes = fs::read(root.join(&rel)).with_context(|| format!("read {}", rel.display()))?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tracks_sources_but_not_excluded_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("src")).expect("mkdir");
        fs::write(root.join("src/lib.rs"), "fn a() {}\n").expect("write");
        let before = content_hash(root, &[]).expect("hash");

        for dir in ["target", ".fixloop", "node_modules", "vendor"] {
            fs::create_dir_all(root.join(dir)).expect("mkdir");
            fs::write(root.join(dir).join("noise.txt"), "noise").expect("write");
        }
        let vendor = vec!["vendor".to_string()];
        assert_eq!(content_hash(root, &vendor).expect("hash"), before);
        assert_ne!(content_hash(root, &[]).expect("hash"), before);

        fs::write(root.join("src/lib.rs"), "fn b() {}\n").expect("write");
        assert_ne!(content_hash(root, &vendor).expect("hash"), before);
    }

    #[test]
    fn renames_change_the_hash() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "same").expect("write");
        let before = content_hash(temp.path(), &[]).expect("hash");
        fs::rename(temp.path().join("a.txt"), temp.path().join("b.txt")).expect("rename");
        assert_ne!(content_hash(temp.path(), &[]).expect("hash"), before);
    }

    #[test]
    fn source_files_are_sorted_and_relative() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("b")).expect("mkdir");
        fs::write(temp.path().join("b/z.rs"), "").expect("write");
        fs::write(temp.path().join("a.rs"), "").expect("write");
        assert_eq!(
            source_files(temp.path(), &[]),
            vec![PathBuf::from("a.rs"), PathBuf::from("b/z.rs")]
        );
    }
}
