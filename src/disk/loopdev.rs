//! Loop device attachment and partition-node enumeration.
//!
//! Partition nodes are discovered from sysfs (each child directory of the
//! disk that has a `partition` file) rather than by appending suffixes to the
//! device path, and collected into a [`DeviceMapping`] keyed by role.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::geometry::{PartitionPlan, Role};
use crate::process::Cmd;

pub const SYS_CLASS_BLOCK: &str = "/sys/class/block";
pub const DEV_DIR: &str = "/dev";

/// Partition numbers of the original single-slot image.
pub const SOURCE_BOOT_NUMBER: u32 = 1;
pub const SOURCE_ROOT_NUMBER: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    path: PathBuf,
    name: String,
}

impl BlockDevice {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("block device path '{}' has no name", path.display()))?
            .to_string();
        Ok(Self { path, name })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Attach `image` to a free loop device with partition scanning enabled.
pub fn attach(image: &Path) -> Result<BlockDevice> {
    let result = Cmd::new("losetup")
        .args(["--show", "-f", "-P"])
        .arg_path(image)
        .error_msg(format!("losetup failed to attach '{}'", image.display()))
        .run()?;
    let path = result.stdout.trim();
    if path.is_empty() {
        bail!("losetup printed no device for '{}'", image.display());
    }
    info!("attached '{}' at {}", image.display(), path);
    BlockDevice::from_path(path)
}

/// Whether sysfs still reports `name` as a bound loop device.
pub fn is_attached(sysfs: &Path, name: &str) -> bool {
    sysfs.join(name).join("loop/backing_file").is_file()
}

/// Detach a loop device. Detaching an unbound device is a no-op.
pub fn detach(device: &BlockDevice) -> Result<()> {
    if !is_attached(Path::new(SYS_CLASS_BLOCK), device.name()) {
        debug!("{} already detached", device.path().display());
        return Ok(());
    }
    Cmd::new("losetup")
        .arg("-d")
        .arg_path(device.path())
        .error_msg(format!("losetup failed to detach {}", device.path().display()))
        .run()?;
    info!("detached {}", device.path().display());
    Ok(())
}

/// Partition number -> device node for every child partition of `disk` that
/// sysfs reports and whose node exists under `dev_dir`.
pub fn enumerate_partitions(
    sysfs: &Path,
    dev_dir: &Path,
    disk: &BlockDevice,
) -> Result<BTreeMap<u32, PathBuf>> {
    let disk_dir = sysfs.join(disk.name());
    let mut found = BTreeMap::new();
    if !disk_dir.is_dir() {
        return Ok(found);
    }

    for entry in fs::read_dir(&disk_dir)
        .with_context(|| format!("reading sysfs directory '{}'", disk_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(disk.name()) || name == disk.name() {
            continue;
        }
        let number_file = entry.path().join("partition");
        if !number_file.is_file() {
            continue;
        }
        let raw = fs::read_to_string(&number_file)
            .with_context(|| format!("reading '{}'", number_file.display()))?;
        let number: u32 = raw
            .trim()
            .parse()
            .with_context(|| format!("parsing partition number in '{}'", number_file.display()))?;
        let node = dev_dir.join(name);
        if node.exists() {
            found.insert(number, node);
        }
    }
    Ok(found)
}

/// Device nodes of the original image's boot and root partitions.
#[derive(Debug, Clone)]
pub struct SourceDevices {
    pub disk: BlockDevice,
    pub boot: PathBuf,
    pub root: PathBuf,
}

impl SourceDevices {
    pub fn from_found(disk: BlockDevice, found: &BTreeMap<u32, PathBuf>) -> Result<Self> {
        let get = |number: u32| {
            found.get(&number).cloned().with_context(|| {
                format!(
                    "original image {} has no partition {}",
                    disk.path().display(),
                    number
                )
            })
        };
        let boot = get(SOURCE_BOOT_NUMBER)?;
        let root = get(SOURCE_ROOT_NUMBER)?;
        Ok(Self { disk, boot, root })
    }
}

/// Role -> concrete partition node on the attached destination.
#[derive(Debug, Clone)]
pub struct DeviceMapping {
    disk: BlockDevice,
    nodes: BTreeMap<Role, PathBuf>,
}

impl DeviceMapping {
    pub fn build(
        disk: BlockDevice,
        plan: &PartitionPlan,
        found: &BTreeMap<u32, PathBuf>,
    ) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for spec in plan.formattable() {
            let node = found.get(&spec.number).with_context(|| {
                format!(
                    "no device node for {} (partition {}) on {}",
                    spec.role,
                    spec.number,
                    disk.path().display()
                )
            })?;
            nodes.insert(spec.role, node.clone());
        }
        Ok(Self { disk, nodes })
    }

    pub fn disk(&self) -> &BlockDevice {
        &self.disk
    }

    pub fn node(&self, role: Role) -> Result<&Path> {
        self.nodes
            .get(&role)
            .map(PathBuf::as_path)
            .with_context(|| format!("no device node mapped for {role}"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::disk::geometry::{compute_plan, Measurements, MIB};
    use tempfile::TempDir;

    /// Fake `/sys/class/block` and `/dev` with the given partitions.
    pub(crate) fn fake_block_tree(root: &Path, disk: &str, numbers: &[u32]) -> (PathBuf, PathBuf) {
        let sysfs = root.join("sys");
        let dev = root.join("dev");
        fs::create_dir_all(sysfs.join(disk)).unwrap();
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join(disk), b"").unwrap();
        for n in numbers {
            let child = format!("{disk}p{n}");
            fs::create_dir_all(sysfs.join(disk).join(&child)).unwrap();
            fs::write(sysfs.join(disk).join(&child).join("partition"), format!("{n}\n")).unwrap();
            fs::write(dev.join(&child), b"").unwrap();
        }
        (sysfs, dev)
    }

    #[test]
    fn enumerates_partitions_from_sysfs() {
        let temp = TempDir::new().unwrap();
        let (sysfs, dev) = fake_block_tree(temp.path(), "loop7", &[1, 2, 3, 5]);
        fs::create_dir_all(sysfs.join("loop7/queue")).unwrap();

        let disk = BlockDevice::from_path(dev.join("loop7")).unwrap();
        let found = enumerate_partitions(&sysfs, &dev, &disk).unwrap();

        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 5]);
        assert_eq!(found[&5], dev.join("loop7p5"));
    }

    #[test]
    fn skips_partitions_without_nodes() {
        let temp = TempDir::new().unwrap();
        let (sysfs, dev) = fake_block_tree(temp.path(), "loop1", &[1, 2]);
        fs::remove_file(dev.join("loop1p2")).unwrap();

        let disk = BlockDevice::from_path(dev.join("loop1")).unwrap();
        let found = enumerate_partitions(&sysfs, &dev, &disk).unwrap();
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn missing_disk_enumerates_nothing() {
        let temp = TempDir::new().unwrap();
        let disk = BlockDevice::from_path("/dev/loop99").unwrap();
        assert!(enumerate_partitions(temp.path(), temp.path(), &disk)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn mapping_covers_formattable_roles() {
        let temp = TempDir::new().unwrap();
        let (sysfs, dev) = fake_block_tree(temp.path(), "loop2", &[1, 2, 3, 5, 6, 7]);
        let disk = BlockDevice::from_path(dev.join("loop2")).unwrap();
        let found = enumerate_partitions(&sysfs, &dev, &disk).unwrap();

        let m = Measurements {
            image_bytes: 2048 * MIB,
            boot_content: 50 * MIB,
            root_content: 900 * MIB,
            home_content: 0,
        };
        let plan = compute_plan(&m, &Config::default()).unwrap();
        let mapping = DeviceMapping::build(disk, &plan, &found).unwrap();

        assert_eq!(mapping.node(Role::Home).unwrap(), dev.join("loop2p7"));
        assert_eq!(mapping.node(Role::BootPrimary).unwrap(), dev.join("loop2p1"));
        assert!(mapping.node(Role::Extended).is_err());
    }

    #[test]
    fn mapping_fails_when_logical_missing() {
        let temp = TempDir::new().unwrap();
        let (sysfs, dev) = fake_block_tree(temp.path(), "loop3", &[1, 2, 3, 5, 6]);
        let disk = BlockDevice::from_path(dev.join("loop3")).unwrap();
        let found = enumerate_partitions(&sysfs, &dev, &disk).unwrap();

        let m = Measurements {
            image_bytes: 2048 * MIB,
            boot_content: 50 * MIB,
            root_content: 900 * MIB,
            home_content: 0,
        };
        let plan = compute_plan(&m, &Config::default()).unwrap();
        assert!(DeviceMapping::build(disk, &plan, &found).is_err());
    }

    #[test]
    fn source_devices_need_boot_and_root() {
        let temp = TempDir::new().unwrap();
        let (sysfs, dev) = fake_block_tree(temp.path(), "loop4", &[1]);
        let disk = BlockDevice::from_path(dev.join("loop4")).unwrap();
        let found = enumerate_partitions(&sysfs, &dev, &disk).unwrap();
        assert!(SourceDevices::from_found(disk, &found).is_err());
    }

    #[test]
    fn unbound_loop_is_not_attached() {
        let temp = TempDir::new().unwrap();
        assert!(!is_attached(temp.path(), "loop0"));
        fs::create_dir_all(temp.path().join("loop0/loop")).unwrap();
        fs::write(temp.path().join("loop0/loop/backing_file"), "/tmp/x.img\n").unwrap();
        assert!(is_attached(temp.path(), "loop0"));
    }
}
