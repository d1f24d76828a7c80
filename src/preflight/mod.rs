//! Preflight checks run before any image is touched.
//!
//! Validates that the host has the external tools the pipeline drives and
//! that the process has the privileges loop devices and mounts require.
//!
//! Missing tools are reported together, each with the package that ships it:
//!
//! ```rust
//! use ab_image_builder::preflight::missing_tools;
//!
//! let missing = missing_tools(&[("sh", "dash"), ("no-such-mkfs", "fakefs-progs")]);
//! assert_eq!(missing, vec![("no-such-mkfs", "fakefs-progs")]);
//! ```

use anyhow::Result;
use tracing::error;

use crate::error::ConvertError;
use crate::process;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Host tools the conversion pipeline invokes.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("parted", "parted"),
    ("partprobe", "parted"),
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("mkfs.vfat", "dosfstools"),
    ("mkfs.ext4", "e2fsprogs"),
    ("rsync", "rsync"),
    ("cp", "coreutils"),
    ("sync", "coreutils"),
];

/// The `(command, package)` pairs of `tools` that are not on `PATH`.
pub fn missing_tools<'a>(tools: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .copied()
        .collect()
}

/// Fail with [`ConvertError::MissingTools`] unless every tool is present.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing = missing_tools(tools);
    if missing.is_empty() {
        return Ok(());
    }
    for (tool, package) in &missing {
        error!("host tool '{tool}' not found (package: {package})");
    }
    Err(ConvertError::MissingTools(
        missing
            .iter()
            .map(|(tool, package)| format!("{tool} ({package})"))
            .collect(),
    )
    .into())
}

/// Fail fast unless running with an effective uid of 0.
pub fn check_privileges() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(ConvertError::NotRoot.into());
    }
    Ok(())
}
