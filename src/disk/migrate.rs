//! Content migration from the original partitions into slot A and home.
//!
//! The bulk copies are delegated to rsync (root, archive mode) and cp (boot,
//! flat FAT tree). Everything after that runs in-process: critical boot file
//! comparison, materializing boot symlinks that cannot live on FAT, and the
//! kernel-module ownership fix-up.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::lchown;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::check_cancel;
use super::digest::sha256_file;
use crate::process::Cmd;

/// Boot firmware stages and kernels compared after the boot copy.
pub const CRITICAL_BOOT_FILES: &[&str] = &[
    "bootcode.bin",
    "start.elf",
    "start4.elf",
    "fixup.dat",
    "fixup4.dat",
    "kernel.img",
    "kernel7.img",
    "kernel7l.img",
    "kernel8.img",
    "kernel_2712.img",
];

/// A link with this name pointing into the firmware tree stands in for the
/// overlays directory itself.
const OVERLAYS_LINK: &str = "overlays";
const FIRMWARE_OVERLAYS_MARKER: &str = "firmware/overlays";
const FIRMWARE_MARKER: &str = "firmware/";

/// Kernel modules, relative to the destination root.
const MODULES_DIR: &str = "lib/modules";

/// Where the original partitions are mounted.
#[derive(Debug, Clone)]
pub struct SourceTree {
    pub boot: PathBuf,
    pub root: PathBuf,
}

/// Where slot A and home of the destination are mounted.
#[derive(Debug, Clone)]
pub struct DestinationTree {
    pub root: PathBuf,
    pub boot: PathBuf,
    pub home: PathBuf,
    pub tryboot: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub checked: Vec<String>,
    /// Files that mismatched and were copied a second time.
    pub recopied: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SymlinkReport {
    /// Destination paths that now hold real content.
    pub materialized: Vec<PathBuf>,
    /// Links (relative to the boot subtree) left out.
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct MigrationReport {
    pub integrity: IntegrityReport,
    pub symlinks: SymlinkReport,
}

/// Copy everything from the original into the mounted destination tree.
pub fn migrate(
    source: &SourceTree,
    dest: &DestinationTree,
    cancel: &AtomicBool,
) -> Result<MigrationReport> {
    info!("copying root filesystem");
    copy_root(&source.root, &dest.root)?;
    check_cancel(cancel)?;

    info!("copying boot partition");
    copy_boot(&source.boot, &dest.boot)?;
    check_cancel(cancel)?;

    let integrity = verify_critical_files(&source.boot, &dest.boot)?;
    let symlinks = resolve_boot_symlinks(&source.root.join("boot"), &source.boot, &dest.boot)?;
    chown_tree(&dest.root.join(MODULES_DIR), 0, 0)?;

    Ok(MigrationReport {
        integrity,
        symlinks,
    })
}

/// Archive copy of the root tree, leaving out the boot subtree.
pub fn copy_root(src: &Path, dst: &Path) -> Result<()> {
    Cmd::new("rsync")
        .args(["-aHAX", "--numeric-ids", "--exclude=/boot"])
        .arg(dir_contents(src))
        .arg(dir_contents(dst))
        .error_msg(format!(
            "copying root '{}' -> '{}' failed",
            src.display(),
            dst.display()
        ))
        .run()?;
    Ok(())
}

/// Flat copy of the boot partition; FAT keeps only modes and timestamps.
pub fn copy_boot(src: &Path, dst: &Path) -> Result<()> {
    Cmd::new("cp")
        .args(["-r", "--preserve=mode,timestamps"])
        .arg_path(&src.join("."))
        .arg(dir_contents(dst))
        .error_msg(format!(
            "copying boot '{}' -> '{}' failed",
            src.display(),
            dst.display()
        ))
        .run()?;
    Ok(())
}

/// `dir/` as rsync and cp expect for "contents of".
fn dir_contents(dir: &Path) -> String {
    let mut s = dir.display().to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

/// Compare each critical file present in `src_boot` with its copy.
///
/// A mismatch triggers one direct re-copy and a warning. The re-copied file
/// is not compared again.
pub fn verify_critical_files(src_boot: &Path, dst_boot: &Path) -> Result<IntegrityReport> {
    let mut report = IntegrityReport::default();

    for name in CRITICAL_BOOT_FILES {
        let src = src_boot.join(name);
        if !src.is_file() {
            continue;
        }
        let dst = dst_boot.join(name);
        report.checked.push((*name).to_string());

        let expected = sha256_file(&src)?;
        let matches = dst.is_file() && sha256_file(&dst)? == expected;
        if matches {
            debug!("{name}: ok");
            continue;
        }

        warn!("{name} differs after copy; copying it again");
        fs::copy(&src, &dst)
            .with_context(|| format!("re-copying '{}' -> '{}'", src.display(), dst.display()))?;
        report.recopied.push((*name).to_string());
    }

    info!(
        "checked {} critical boot files, {} re-copied",
        report.checked.len(),
        report.recopied.len()
    );
    Ok(report)
}

/// Replace symlinks found under the original root's boot directory with real
/// content in the destination boot partition.
pub fn resolve_boot_symlinks(
    src_links: &Path,
    src_boot: &Path,
    dst_boot: &Path,
) -> Result<SymlinkReport> {
    let mut report = SymlinkReport::default();
    if !src_links.is_dir() {
        return Ok(report);
    }

    for entry in WalkDir::new(src_links)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.path_is_symlink() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src_links)
            .unwrap_or(entry.path())
            .to_path_buf();
        let target = fs::read_link(entry.path())
            .with_context(|| format!("reading link '{}'", entry.path().display()))?;
        let target_str = target.to_string_lossy();
        let dest = dst_boot.join(&rel);

        if entry.file_name() == OVERLAYS_LINK && target_str.contains(FIRMWARE_OVERLAYS_MARKER) {
            let overlays = src_boot.join(OVERLAYS_LINK);
            if !overlays.is_dir() {
                warn!(
                    "overlays link '{}' has no overlays directory to copy",
                    rel.display()
                );
                report.skipped.push(rel);
                continue;
            }
            info!("materializing overlays directory at '{}'", dest.display());
            copy_dir_contents(&overlays, &dest)?;
            report.materialized.push(dest);
            continue;
        }

        if target_str.contains(FIRMWARE_MARKER) {
            warn!(
                "skipping boot link '{}' -> '{}' (firmware content)",
                rel.display(),
                target_str
            );
            report.skipped.push(rel);
            continue;
        }

        let Some(resolved) = resolve_in_boot(dst_boot, &rel, &target) else {
            warn!(
                "skipping boot link '{}' -> '{}' (escapes the boot partition)",
                rel.display(),
                target_str
            );
            report.skipped.push(rel);
            continue;
        };
        if !resolved.exists() {
            warn!(
                "skipping boot link '{}' -> '{}' (target missing)",
                rel.display(),
                target_str
            );
            report.skipped.push(rel);
            continue;
        }
        if resolved == dest {
            debug!("'{}' already holds real content", dest.display());
            continue;
        }

        if resolved.is_dir() {
            copy_dir_contents(&resolved, &dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating '{}'", parent.display()))?;
            }
            fs::copy(&resolved, &dest).with_context(|| {
                format!("copying '{}' -> '{}'", resolved.display(), dest.display())
            })?;
        }
        debug!("materialized '{}' from '{}'", dest.display(), resolved.display());
        report.materialized.push(dest);
    }

    Ok(report)
}

/// Where `target` (a link found at `rel` in the boot subtree) points inside
/// `dst_boot`, or `None` if it leaves the partition.
fn resolve_in_boot(dst_boot: &Path, rel: &Path, target: &Path) -> Option<PathBuf> {
    let base = if target.is_absolute() {
        let inner = target.strip_prefix("/boot").ok()?;
        PathBuf::from(inner)
    } else {
        rel.parent().unwrap_or(Path::new("")).join(target)
    };

    let mut normalized = PathBuf::new();
    for component in base.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(dst_boot.join(normalized))
}

/// Copy the contents of `src` into `dst`, dereferencing links since FAT
/// cannot hold them.
fn copy_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("creating '{}'", dst.display()))?;

    for entry in WalkDir::new(src).follow_links(true).min_depth(1) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out).with_context(|| format!("creating '{}'", out.display()))?;
        } else {
            fs::copy(entry.path(), &out).with_context(|| {
                format!("copying '{}' -> '{}'", entry.path().display(), out.display())
            })?;
        }
    }
    Ok(())
}

/// Set owner and group on every entry below `path`, without following links.
///
/// A missing `path` is not an error.
pub fn chown_tree(path: &Path, uid: u32, gid: u32) -> Result<()> {
    if !path.exists() {
        debug!("'{}' not present; nothing to chown", path.display());
        return Ok(());
    }
    if !path.is_dir() {
        bail!("'{}' is not a directory", path.display());
    }

    let mut count = 0usize;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", path.display()))?;
        lchown(entry.path(), Some(uid), Some(gid))
            .with_context(|| format!("changing owner of '{}'", entry.path().display()))?;
        count += 1;
    }
    info!("set owner {uid}:{gid} on {count} entries under '{}'", path.display());
    Ok(())
}
