//! Filesystem creation on the destination partitions.

use anyhow::{bail, Result};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use tracing::info;

use super::check_cancel;
use super::geometry::{FsKind, PartitionPlan, PartitionSpec};
use super::loopdev::DeviceMapping;
use crate::process::Cmd;

/// The mkfs program and arguments that create `spec`'s filesystem on `node`.
pub fn mkfs_command(spec: &PartitionSpec, node: &Path) -> Result<(&'static str, Vec<String>)> {
    let Some(label) = spec.label() else {
        bail!("{} carries no filesystem", spec.role);
    };
    let node = node.display().to_string();
    let command = match spec.fs {
        FsKind::Fat16 => (
            "mkfs.vfat",
            vec!["-I".into(), "-n".into(), label.into(), node],
        ),
        FsKind::Fat32 => (
            "mkfs.vfat",
            vec![
                "-I".into(),
                "-F".into(),
                "32".into(),
                "-n".into(),
                label.into(),
                node,
            ],
        ),
        FsKind::Ext4 => (
            "mkfs.ext4",
            vec![
                "-F".into(),
                "-L".into(),
                label.into(),
                "-O".into(),
                "^huge_file".into(),
                node,
            ],
        ),
        FsKind::None => bail!("{} carries no filesystem", spec.role),
    };
    Ok(command)
}

/// Format every partition of `plan` that carries a filesystem.
pub fn format_all(plan: &PartitionPlan, devices: &DeviceMapping, cancel: &AtomicBool) -> Result<()> {
    for spec in plan.formattable() {
        check_cancel(cancel)?;
        let node = devices.node(spec.role)?;
        let (program, args) = mkfs_command(spec, node)?;
        info!(
            "formatting {} ({}) as {:?} with label {}",
            spec.role,
            node.display(),
            spec.fs,
            spec.label().unwrap_or_default()
        );
        Cmd::new(program)
            .args(&args)
            .error_msg(format!("{program} failed for {}", spec.role))
            .run()?;
    }
    Ok(())
}
