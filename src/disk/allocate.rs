//! Destination image creation.

use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing::{info, warn};

/// Copy `original` to `output` byte for byte, then grow it sparsely to
/// `size_bytes`.
///
/// Refuses to run when the destination filesystem cannot hold the copy.
pub fn create_destination(original: &Path, output: &Path, size_bytes: u64) -> Result<()> {
    if !original.is_file() {
        bail!("original image '{}' does not exist", original.display());
    }
    if original.canonicalize().ok() == output.canonicalize().ok() && output.exists() {
        bail!(
            "output '{}' must differ from the original image",
            output.display()
        );
    }

    let original_len = fs::metadata(original)
        .with_context(|| format!("reading metadata '{}'", original.display()))?
        .len();

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("creating output directory '{}'", parent.display()))?;

    let available = fs2::available_space(parent)
        .with_context(|| format!("querying free space on '{}'", parent.display()))?;
    if available < original_len {
        bail!(
            "not enough space in '{}': need {} bytes, {} available",
            parent.display(),
            original_len,
            available
        );
    }

    if output.exists() {
        warn!("replacing existing output '{}'", output.display());
        fs::remove_file(output)
            .with_context(|| format!("removing existing output '{}'", output.display()))?;
    }

    info!(
        "copying '{}' -> '{}' ({} MiB)",
        original.display(),
        output.display(),
        original_len / 1024 / 1024
    );
    fs::copy(original, output).with_context(|| {
        format!(
            "copying image '{}' -> '{}'",
            original.display(),
            output.display()
        )
    })?;

    let file = OpenOptions::new()
        .write(true)
        .open(output)
        .with_context(|| format!("opening '{}'", output.display()))?;
    file.set_len(size_bytes)
        .with_context(|| format!("resizing '{}' to {} bytes", output.display(), size_bytes))?;

    Ok(())
}
