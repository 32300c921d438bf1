use super::SYNC_MARKER;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Walk a cache directory and return all content files, sorted by path
/// for OS-independent determinism. The sync marker is bookkeeping, not
/// content.
pub fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().to_path_buf())
        .filter(|path| path.file_name().map(|n| n != SYNC_MARKER).unwrap_or(true))
        .collect();
    files.sort();
    files
}

/// Compute the newline-delimited `<md5> <relative-path>` manifest over a
/// cache directory. Empty on first fetch. Relative paths use forward
/// slashes regardless of platform.
pub fn compute_manifest(root: &Path) -> Result<String> {
    if !root.exists() {
        return Ok(String::new());
    }

    let mut manifest = String::new();
    for path in walk_files(root) {
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to hash cached file {}", path.display()))?;
        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        manifest.push_str(&format!("{:x} {}\n", md5::compute(&bytes), relative));
    }
    Ok(manifest)
}

/// Copy a cache tree into a task work directory, skipping the sync
/// marker. Returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut copied = 0;
    for path in walk_files(src) {
        let relative = path.strip_prefix(src).unwrap_or(&path);
        let target = dst.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(&path, &target).with_context(|| {
            format!("failed to copy {} to {}", path.display(), target.display())
        })?;
        copied += 1;
    }
    Ok(copied)
}
