//! Last checks on the mounted destination before teardown.

use anyhow::Result;
use std::fs;
use std::path::Path;
use tracing::info;

use super::bootconfig::{
    SlotIdentities, CMDLINE, CMDLINE_SECONDARY, FIRMWARE_CONFIG, KERNEL_IMAGES,
};
use crate::error::ConvertError;

/// Boot A must hold both command lines, the firmware config and a kernel,
/// and each command line must select its own root.
pub fn verify_boot_partition(boot: &Path, ids: &SlotIdentities) -> Result<()> {
    let mut problems = Vec::new();

    for name in [CMDLINE, CMDLINE_SECONDARY, FIRMWARE_CONFIG] {
        if !boot.join(name).is_file() {
            problems.push(format!("{name} is missing"));
        }
    }
    if !has_kernel(boot) {
        problems.push("no kernel image present".to_string());
    }

    for (name, identity) in [
        (CMDLINE, &ids.root_primary),
        (CMDLINE_SECONDARY, &ids.root_secondary),
    ] {
        let Ok(text) = fs::read_to_string(boot.join(name)) else {
            continue;
        };
        let token = format!("root={identity}");
        if !text.split_whitespace().any(|t| t == token) {
            problems.push(format!("{name} does not contain {token}"));
        }
    }

    if !problems.is_empty() {
        return Err(ConvertError::Verification(problems.join("; ")).into());
    }
    info!("boot partition verified");
    Ok(())
}

fn has_kernel(boot: &Path) -> bool {
    if KERNEL_IMAGES.iter().any(|k| boot.join(k).is_file()) {
        return true;
    }
    let Ok(entries) = fs::read_dir(boot) else {
        return false;
    };
    entries.flatten().any(|e| {
        let name = e.file_name();
        let name = name.to_string_lossy();
        name.starts_with("kernel") && name.ends_with(".img")
    })
}
