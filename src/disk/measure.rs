//! Content measurement for the geometry calculator.

use anyhow::{Context, Result};
use std::path::Path;
use walkdir::WalkDir;

/// Total byte size of all regular files and symlinks under `path`.
///
/// This is the apparent size of the tree, not the space the filesystem
/// allocated for it. A missing path measures as zero.
pub fn tree_size(path: &Path) -> Result<u64> {
    tree_size_excluding(path, &[])
}

/// Like [`tree_size`], skipping the top-level entries named in `skip`.
pub fn tree_size_excluding(path: &Path, skip: &[&str]) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let walker = WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || !skip.iter().any(|name| e.file_name() == *name));

    let mut total = 0;
    for entry in walker {
        let entry = entry.with_context(|| format!("walking '{}'", path.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("reading metadata '{}'", entry.path().display()))?;
        total += metadata.len();
    }
    Ok(total)
}
