//! Boot-time configuration for both slots.
//!
//! Rewrites the kernel command lines, writes the slot descriptors the
//! firmware reads (`autoboot.txt`, and `tryboot.txt` in the compact layout),
//! and replaces the root filesystem's fstab.

use anyhow::{Context, Result};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info};

use super::geometry::{PartitionPlan, PartitionSpec, Role};
use super::migrate::DestinationTree;
use crate::config::{LayoutVariant, RootSelector};

pub const CMDLINE: &str = "cmdline.txt";
pub const CMDLINE_SECONDARY: &str = "cmdline_b.txt";
pub const AUTOBOOT: &str = "autoboot.txt";
pub const TRYBOOT: &str = "tryboot.txt";
pub const FIRMWARE_CONFIG: &str = "config.txt";

/// Byte offset of the MBR disk signature.
const DISK_SIGNATURE_OFFSET: u64 = 440;

/// Kernel images in the order a trial boot should prefer them.
pub const KERNEL_IMAGES: &[&str] = &[
    "kernel_2712.img",
    "kernel8.img",
    "kernel7l.img",
    "kernel7.img",
    "kernel.img",
];

/// How a partition is referred to from cmdline.txt and fstab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootIdentity {
    PartUuid(String),
    Label(String),
}

impl RootIdentity {
    pub fn for_partition(selector: RootSelector, signature: u32, spec: &PartitionSpec) -> Self {
        match (selector, spec.label()) {
            (RootSelector::Label, Some(label)) => RootIdentity::Label(label.to_string()),
            _ => RootIdentity::PartUuid(format!("{signature:08x}-{:02x}", spec.number)),
        }
    }
}

impl fmt::Display for RootIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootIdentity::PartUuid(id) => write!(f, "PARTUUID={id}"),
            RootIdentity::Label(label) => write!(f, "LABEL={label}"),
        }
    }
}

/// Identities of every mounted region of the new image.
#[derive(Debug, Clone)]
pub struct SlotIdentities {
    pub root_primary: RootIdentity,
    pub root_secondary: RootIdentity,
    pub boot_primary: RootIdentity,
    pub home: RootIdentity,
    pub tryboot: Option<RootIdentity>,
}

impl SlotIdentities {
    pub fn new(plan: &PartitionPlan, selector: RootSelector, signature: u32) -> Result<Self> {
        let id = |role| -> Result<RootIdentity> {
            Ok(RootIdentity::for_partition(
                selector,
                signature,
                plan.require(role)?,
            ))
        };
        Ok(Self {
            root_primary: id(Role::RootPrimary)?,
            root_secondary: id(Role::RootSecondary)?,
            boot_primary: id(Role::BootPrimary)?,
            home: id(Role::Home)?,
            tryboot: plan
                .get(Role::Tryboot)
                .map(|spec| RootIdentity::for_partition(selector, signature, spec)),
        })
    }
}

/// Read the little-endian MBR disk signature from `device`.
pub fn read_disk_signature(device: &Path) -> Result<u32> {
    let mut f = File::open(device).with_context(|| format!("opening '{}'", device.display()))?;
    f.seek(SeekFrom::Start(DISK_SIGNATURE_OFFSET))?;
    let mut buf = [0u8; 4];
    f.read_exact(&mut buf)
        .with_context(|| format!("reading disk signature of '{}'", device.display()))?;
    Ok(u32::from_le_bytes(buf))
}

/// Replace the `root=` token of `cmdline` with `root=<identity>`, appending
/// one when absent. The result is a single line.
pub fn rewrite_root_selector(cmdline: &str, identity: &RootIdentity) -> String {
    let replacement = format!("root={identity}");
    let mut replaced = false;
    let mut tokens: Vec<String> = cmdline
        .split_whitespace()
        .map(|token| {
            if token.starts_with("root=") {
                replaced = true;
                replacement.clone()
            } else {
                token.to_string()
            }
        })
        .collect();
    if !replaced {
        tokens.push(replacement);
    }
    let mut line = tokens.join(" ");
    line.push('\n');
    line
}

/// `autoboot.txt`: normal boot from slot A, trial boot from slot B.
pub fn autoboot_txt(plan: &PartitionPlan) -> Result<String> {
    let boot_a = plan.require(Role::BootPrimary)?.number;
    let text = match plan.variant() {
        LayoutVariant::TrybootPartition => {
            let boot_b = plan.require(Role::BootSecondary)?.number;
            format!(
                "[all]\ntryboot_a_b=1\nboot_partition={boot_a}\n[tryboot]\nboot_partition={boot_b}\n"
            )
        }
        LayoutVariant::Compact => format!("[all]\nboot_partition={boot_a}\n"),
    };
    Ok(text)
}

/// `tryboot.txt`: what the firmware loads for a one-time boot of slot B.
pub fn tryboot_txt(plan: &PartitionPlan, kernel: &str) -> Result<String> {
    let boot_b = plan.require(Role::BootSecondary)?.number;
    Ok(format!(
        "[all]\ninclude {FIRMWARE_CONFIG}\nboot_partition={boot_b}\nkernel={kernel}\ncmdline={CMDLINE_SECONDARY}\n"
    ))
}

/// The kernel the firmware would load from `boot`: an explicit `kernel=` in
/// config.txt wins, then the first image present on the partition.
pub fn detect_kernel(boot: &Path) -> Option<String> {
    if let Ok(config) = fs::read_to_string(boot.join(FIRMWARE_CONFIG)) {
        let explicit = config
            .lines()
            .map(str::trim)
            .filter(|l| !l.starts_with('#'))
            .filter_map(|l| l.strip_prefix("kernel="))
            .map(str::trim)
            .find(|k| !k.is_empty());
        if let Some(kernel) = explicit {
            return Some(kernel.to_string());
        }
    }
    KERNEL_IMAGES
        .iter()
        .find(|k| boot.join(k).is_file())
        .map(|k| (*k).to_string())
}

/// fstab for root A, in mount order.
pub fn fstab(plan: &PartitionPlan, ids: &SlotIdentities) -> Result<String> {
    let mut out = String::from("proc            /proc           proc    defaults          0       0\n");
    let mut line = |id: &RootIdentity, mount: &str, spec: &PartitionSpec, opts: &str, pass: u8| {
        let fstype = spec.fs.fstab_type().unwrap_or("auto");
        out.push_str(&format!("{id}  {mount}  {fstype}  {opts}  0  {pass}\n"));
    };

    line(&ids.root_primary, "/", plan.require(Role::RootPrimary)?, "defaults,noatime", 1);
    line(&ids.boot_primary, "/boot", plan.require(Role::BootPrimary)?, "defaults", 2);
    if let (Some(id), Some(spec)) = (&ids.tryboot, plan.get(Role::Tryboot)) {
        line(id, "/tryboot", spec, "defaults", 2);
    }
    line(&ids.home, "/home", plan.require(Role::Home)?, "defaults,noatime", 2);
    Ok(out)
}

/// Write command lines, slot descriptors and fstab into the mounted tree.
pub fn write_boot_config(
    plan: &PartitionPlan,
    ids: &SlotIdentities,
    dest: &DestinationTree,
) -> Result<()> {
    let cmdline_path = dest.boot.join(CMDLINE);
    let original = fs::read_to_string(&cmdline_path)
        .with_context(|| format!("reading '{}'", cmdline_path.display()))?;

    let primary = rewrite_root_selector(&original, &ids.root_primary);
    write(&dest.boot.join(CMDLINE), &primary)?;
    let secondary = rewrite_root_selector(&original, &ids.root_secondary);
    write(&dest.boot.join(CMDLINE_SECONDARY), &secondary)?;
    info!(
        "command lines use root={} (A) and root={} (B)",
        ids.root_primary, ids.root_secondary
    );

    let autoboot = autoboot_txt(plan)?;
    match (plan.variant(), &dest.tryboot) {
        (LayoutVariant::TrybootPartition, Some(tryboot_dir)) => {
            write(&tryboot_dir.join(AUTOBOOT), &autoboot)?;
        }
        (LayoutVariant::TrybootPartition, None) => {
            anyhow::bail!("try-boot partition is not mounted");
        }
        (LayoutVariant::Compact, _) => {
            write(&dest.boot.join(AUTOBOOT), &autoboot)?;
            let kernel = detect_kernel(&dest.boot)
                .with_context(|| format!("no kernel image found in '{}'", dest.boot.display()))?;
            write(&dest.boot.join(TRYBOOT), &tryboot_txt(plan, &kernel)?)?;
        }
    }

    write(&dest.root.join("etc/fstab"), &fstab(plan, ids)?)?;
    Ok(())
}

fn write(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))?;
    debug!("wrote '{}'", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::disk::geometry::{compute_plan, Measurements, MIB};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn plan(variant: LayoutVariant) -> PartitionPlan {
        let m = Measurements {
            image_bytes: 2048 * MIB,
            boot_content: 40 * MIB,
            root_content: 1000 * MIB,
            home_content: 0,
        };
        compute_plan(
            &m,
            &Config {
                variant,
                ..Config::default()
            },
        )
        .unwrap()
    }

    fn dest(temp: &TempDir, tryboot: bool) -> DestinationTree {
        let root = temp.path().join("root");
        let boot = root.join("boot");
        let home = root.join("home");
        fs::create_dir_all(&boot).unwrap();
        fs::create_dir_all(&home).unwrap();
        let tryboot = tryboot.then(|| {
            let dir = root.join("tryboot");
            fs::create_dir_all(&dir).unwrap();
            dir
        });
        DestinationTree {
            root,
            boot,
            home,
            tryboot,
        }
    }

    #[test]
    fn partuuid_identity_format() {
        let plan = plan(LayoutVariant::Compact);
        let ids = SlotIdentities::new(&plan, RootSelector::Partuuid, 0x1a2b3c4d).unwrap();
        assert_eq!(ids.root_primary.to_string(), "PARTUUID=1a2b3c4d-02");
        assert_eq!(ids.root_secondary.to_string(), "PARTUUID=1a2b3c4d-06");
        assert_eq!(ids.home.to_string(), "PARTUUID=1a2b3c4d-07");
        assert!(ids.tryboot.is_none());
    }

    #[test]
    fn label_identity_format() {
        let plan = plan(LayoutVariant::TrybootPartition);
        let ids = SlotIdentities::new(&plan, RootSelector::Label, 0).unwrap();
        assert_eq!(ids.root_primary.to_string(), "LABEL=rootA");
        assert_eq!(ids.root_secondary.to_string(), "LABEL=rootB");
        assert_eq!(ids.tryboot, Some(RootIdentity::Label("TRYBOOT".into())));
    }

    #[test]
    fn rewrites_existing_root_token() {
        let id = RootIdentity::PartUuid("deadbeef-06".into());
        let out = rewrite_root_selector(
            "console=serial0,115200 root=PARTUUID=abcd-02 rootfstype=ext4 rootwait\n",
            &id,
        );
        assert_eq!(
            out,
            "console=serial0,115200 root=PARTUUID=deadbeef-06 rootfstype=ext4 rootwait\n"
        );
    }

    #[test]
    fn appends_missing_root_token() {
        let id = RootIdentity::Label("rootA".into());
        assert_eq!(
            rewrite_root_selector("quiet splash", &id),
            "quiet splash root=LABEL=rootA\n"
        );
        assert_eq!(rewrite_root_selector("", &id), "root=LABEL=rootA\n");
    }

    #[test]
    fn tryboot_partition_descriptor() {
        let plan = plan(LayoutVariant::TrybootPartition);
        assert_eq!(
            autoboot_txt(&plan).unwrap(),
            "[all]\ntryboot_a_b=1\nboot_partition=2\n[tryboot]\nboot_partition=5\n"
        );
    }

    #[test]
    fn compact_descriptors() {
        let plan = plan(LayoutVariant::Compact);
        assert_eq!(autoboot_txt(&plan).unwrap(), "[all]\nboot_partition=1\n");
        let tryboot = tryboot_txt(&plan, "kernel8.img").unwrap();
        assert!(tryboot.contains("boot_partition=5\n"));
        assert!(tryboot.contains("kernel=kernel8.img\n"));
        assert!(tryboot.contains("cmdline=cmdline_b.txt\n"));
        assert!(tryboot.contains("include config.txt\n"));
    }

    #[test]
    fn kernel_detection_prefers_config() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("kernel8.img"), b"k").unwrap();
        assert_eq!(detect_kernel(temp.path()).as_deref(), Some("kernel8.img"));

        fs::write(
            temp.path().join("config.txt"),
            "# kernel=ignored.img\n[pi4]\nkernel=vmlinuz-6.6\n",
        )
        .unwrap();
        assert_eq!(detect_kernel(temp.path()).as_deref(), Some("vmlinuz-6.6"));
    }

    #[test]
    fn fstab_order_and_options() {
        let plan = plan(LayoutVariant::TrybootPartition);
        let ids = SlotIdentities::new(&plan, RootSelector::Partuuid, 0xcafe0001).unwrap();
        let text = fstab(&plan, &ids).unwrap();
        let mounts: Vec<&str> = text
            .lines()
            .map(|l| l.split_whitespace().nth(1).unwrap())
            .collect();
        assert_eq!(mounts, ["/proc", "/", "/boot", "/tryboot", "/home"]);
        assert!(text.contains("PARTUUID=cafe0001-03  /  ext4  defaults,noatime  0  1\n"));
        assert!(text.contains("PARTUUID=cafe0001-02  /boot  vfat  defaults  0  2\n"));
        assert!(text.contains("PARTUUID=cafe0001-07  /home  ext4  defaults,noatime  0  2\n"));
    }

    #[test]
    fn compact_fstab_has_no_tryboot() {
        let plan = plan(LayoutVariant::Compact);
        let ids = SlotIdentities::new(&plan, RootSelector::Label, 0).unwrap();
        let text = fstab(&plan, &ids).unwrap();
        assert!(!text.contains("/tryboot"));
        assert!(text.contains("LABEL=BOOTA  /boot  vfat"));
    }

    #[test]
    fn writes_compact_boot_files() {
        let temp = TempDir::new().unwrap();
        let dest = dest(&temp, false);
        fs::write(dest.boot.join(CMDLINE), "console=tty1 root=/dev/mmcblk0p2 rootwait\n").unwrap();
        fs::write(dest.boot.join("kernel8.img"), b"k").unwrap();

        let plan = plan(LayoutVariant::Compact);
        let ids = SlotIdentities::new(&plan, RootSelector::Partuuid, 0x11223344).unwrap();
        write_boot_config(&plan, &ids, &dest).unwrap();

        let a = fs::read_to_string(dest.boot.join(CMDLINE)).unwrap();
        let b = fs::read_to_string(dest.boot.join(CMDLINE_SECONDARY)).unwrap();
        assert!(a.contains("root=PARTUUID=11223344-02 "));
        assert!(b.contains("root=PARTUUID=11223344-06 "));
        assert!(dest.boot.join(AUTOBOOT).is_file());
        assert!(dest.boot.join(TRYBOOT).is_file());
        assert!(fs::read_to_string(dest.root.join("etc/fstab"))
            .unwrap()
            .contains("/home"));
    }

    #[test]
    fn tryboot_variant_writes_descriptor_on_tryboot_partition() {
        let temp = TempDir::new().unwrap();
        let dest = dest(&temp, true);
        fs::write(dest.boot.join(CMDLINE), "root=LABEL=x\n").unwrap();

        let plan = plan(LayoutVariant::TrybootPartition);
        let ids = SlotIdentities::new(&plan, RootSelector::Label, 0).unwrap();
        write_boot_config(&plan, &ids, &dest).unwrap();

        let tryboot_dir: &PathBuf = dest.tryboot.as_ref().unwrap();
        assert!(tryboot_dir.join(AUTOBOOT).is_file());
        assert!(!dest.boot.join(AUTOBOOT).exists());
        assert!(!dest.boot.join(TRYBOOT).exists());
        assert!(dest.boot.join(CMDLINE_SECONDARY).is_file());
    }

    #[test]
    fn disk_signature_is_little_endian() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("disk.img");
        let mut mbr = vec![0u8; 512];
        mbr[440..444].copy_from_slice(&[0x44, 0x33, 0x22, 0x11]);
        fs::write(&image, &mbr).unwrap();
        assert_eq!(read_disk_signature(&image).unwrap(), 0x11223344);
    }
}
