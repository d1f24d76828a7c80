//! Detached SHA-256 sidecar for the produced image.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::info;

/// Separator used by `sha256sum` between hash and file name.
const CHECKSUM_SEPARATOR: &str = "  ";

pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `<image>.sha256` in `sha256sum -c` format, using only the file
/// name so the pair can be moved together.
pub fn write_digest(image: &Path) -> Result<PathBuf> {
    let hash = sha256_file(image)?;
    let filename = image
        .file_name()
        .context("Could not get image filename")?
        .to_string_lossy();

    let mut sidecar = image.as_os_str().to_owned();
    sidecar.push(".sha256");
    let sidecar = PathBuf::from(sidecar);

    fs::write(&sidecar, format!("{hash}{CHECKSUM_SEPARATOR}{filename}\n"))
        .with_context(|| format!("writing digest '{}'", sidecar.display()))?;

    info!("SHA256: {}...{}", &hash[..8], &hash[hash.len() - 8..]);
    Ok(sidecar)
}
