//! First-boot home expansion: a shell script plus a one-shot systemd unit
//! installed into root A.
//!
//! On a device larger than the provisioned image, the script grows the
//! extended container to the end of the disk, then home to the last usable
//! aligned sector, then the ext4 filesystem. Growth below the threshold is
//! not worth a resize and only records the sentinel.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use tracing::info;

use super::geometry::{PartitionPlan, Role, ALIGNMENT_SECTORS};

pub const SCRIPT_PATH: &str = "usr/local/sbin/ab-expand-home";
pub const UNIT_NAME: &str = "ab-expand-home.service";
pub const UNIT_DIR: &str = "etc/systemd/system";
pub const SENTINEL: &str = "/var/lib/ab-expand-home/done";

/// Home must be able to grow by more than this many percent.
pub const GROWTH_PERCENT: u32 = 20;

const SCRIPT_TEMPLATE: &str = r#"#!/bin/sh
# Grow the home partition into unused disk space, once.
set -eu

SENTINEL="${AB_EXPAND_SENTINEL:-@SENTINEL@}"
SYSFS="${AB_EXPAND_SYSFS:-/sys}"
ALIGN=@ALIGN@
GROWTH_PERCENT=@GROWTH@
EXTENDED_NUMBER=@EXTENDED@
HOME_NUMBER=@HOME@

mark_done() {
    mkdir -p "$(dirname "$SENTINEL")"
    : > "$SENTINEL"
}

if [ -e "$SENTINEL" ]; then
    exit 0
fi

HOME_DEV="${AB_EXPAND_HOME_DEV:-$(findmnt -n -o SOURCE /home)}"
HOME_NAME="$(basename "$HOME_DEV")"
DISK_NAME="${AB_EXPAND_DISK:-$(lsblk -n -o PKNAME "$HOME_DEV" | head -n 1 | tr -d ' ')}"
DISK="/dev/$DISK_NAME"

DISK_SECTORS="$(cat "$SYSFS/class/block/$DISK_NAME/size")"
HOME_START="$(cat "$SYSFS/class/block/$HOME_NAME/start")"
HOME_SECTORS="$(cat "$SYSFS/class/block/$HOME_NAME/size")"

LAST_USABLE=$((DISK_SECTORS - 1 - ALIGN))
AVAILABLE=$((LAST_USABLE - HOME_START + 1))
WANTED=$((HOME_SECTORS + HOME_SECTORS * GROWTH_PERCENT / 100))

if [ "$AVAILABLE" -le "$WANTED" ]; then
    echo "ab-expand-home: $AVAILABLE sectors available, $WANTED needed; not resizing"
    mark_done
    exit 0
fi

echo "ab-expand-home: growing $HOME_DEV to sector $LAST_USABLE"
printf 'Yes\n' | parted ---pretend-input-tty "$DISK" unit s resizepart "$EXTENDED_NUMBER" "$((DISK_SECTORS - 1))s"
printf 'Yes\n' | parted ---pretend-input-tty "$DISK" unit s resizepart "$HOME_NUMBER" "${LAST_USABLE}s"
partx -u "$DISK"
resize2fs "$HOME_DEV"
mark_done
"#;

/// Script body for `plan`'s extended and home partition numbers.
pub fn render_script(plan: &PartitionPlan) -> Result<String> {
    let extended = plan.require(Role::Extended)?.number;
    let home = plan.require(Role::Home)?.number;
    Ok(SCRIPT_TEMPLATE
        .replace("@SENTINEL@", SENTINEL)
        .replace("@ALIGN@", &ALIGNMENT_SECTORS.to_string())
        .replace("@GROWTH@", &GROWTH_PERCENT.to_string())
        .replace("@EXTENDED@", &extended.to_string())
        .replace("@HOME@", &home.to_string()))
}

pub fn render_unit() -> String {
    format!(
        "[Unit]
Description=Grow the home partition into unused disk space
After=local-fs.target
ConditionPathExists=!{SENTINEL}

[Service]
Type=oneshot
ExecStart=/{SCRIPT_PATH}

[Install]
WantedBy=multi-user.target
"
    )
}

/// Install the script and unit under `root` and enable the unit for
/// multi-user.target.
pub fn install_expansion(root: &Path, plan: &PartitionPlan) -> Result<()> {
    let script = root.join(SCRIPT_PATH);
    write_file(&script, &render_script(plan)?)?;
    let mut perms = fs::metadata(&script)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms)
        .with_context(|| format!("setting mode of '{}'", script.display()))?;

    let unit_dir = root.join(UNIT_DIR);
    write_file(&unit_dir.join(UNIT_NAME), &render_unit())?;
    enable_unit(root, UNIT_NAME, "multi-user.target")?;

    info!("installed first-boot home expansion ({UNIT_NAME})");
    Ok(())
}

/// Creates `etc/systemd/system/<target>.wants/<unit>` -> `/etc/systemd/system/<unit>`.
pub fn enable_unit(root: &Path, unit: &str, target: &str) -> Result<()> {
    let wants_dir = root.join(UNIT_DIR).join(format!("{target}.wants"));
    fs::create_dir_all(&wants_dir)
        .with_context(|| format!("creating '{}'", wants_dir.display()))?;

    let link = wants_dir.join(unit);
    let link_target = format!("/{UNIT_DIR}/{unit}");
    if link.symlink_metadata().is_ok() {
        fs::remove_file(&link).with_context(|| format!("removing '{}'", link.display()))?;
    }
    symlink(&link_target, &link)
        .with_context(|| format!("linking '{}' -> '{}'", link.display(), link_target))?;
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))
}
