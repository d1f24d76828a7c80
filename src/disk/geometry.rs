//! Partition geometry planning.
//!
//! Pure arithmetic: from the original image measurements and the size policy,
//! produce an immutable [`PartitionPlan`] with sector-exact boundaries. Nothing
//! here touches a device; the plan is validated before any destructive step.
//!
//! Layout (compact variant, no try-boot partition):
//!
//! ```text
//! | 1 MiB | p1 boot A | p2 root A | p3 extended ...................................... |
//!                                 | gap | p5 boot B | gap | p6 root B | gap | p7 home | slack |
//! ```

use anyhow::{anyhow, Result};
use std::fmt;
use tracing::{debug, warn};

use crate::config::{Config, LayoutVariant};
use crate::error::ConvertError;

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

pub const MIB: u64 = 1024 * 1024;

/// Every partition boundary is a multiple of this.
pub const ALIGNMENT_BYTES: u64 = MIB;

pub const ALIGNMENT_SECTORS: u64 = ALIGNMENT_BYTES / SECTOR_SIZE;

/// FAT partitions larger than this get FAT32; smaller ones let mkfs.vfat
/// pick FAT12/16.
pub const FAT32_THRESHOLD_BYTES: u64 = 128 * MIB;

/// Logical partitions are numbered from 5 in the msdos scheme.
pub const FIRST_LOGICAL_NUMBER: u32 = 5;

/// Round `value` up to a multiple of `unit`.
pub fn align_up(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit) * unit
}

/// Round `value` down to a multiple of `unit`.
pub fn align_down(value: u64, unit: u64) -> u64 {
    value / unit * unit
}

pub fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Tryboot,
    BootPrimary,
    RootPrimary,
    Extended,
    BootSecondary,
    RootSecondary,
    Home,
}

impl Role {
    /// Volume label written by the filesystem builder.
    pub fn label(self) -> Option<&'static str> {
        match self {
            Role::Tryboot => Some("TRYBOOT"),
            Role::BootPrimary => Some("BOOTA"),
            Role::RootPrimary => Some("rootA"),
            Role::Extended => None,
            Role::BootSecondary => Some("BOOTB"),
            Role::RootSecondary => Some("rootB"),
            Role::Home => Some("home"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Tryboot => "tryboot",
            Role::BootPrimary => "boot-primary",
            Role::RootPrimary => "root-primary",
            Role::Extended => "extended-container",
            Role::BootSecondary => "boot-secondary",
            Role::RootSecondary => "root-secondary",
            Role::Home => "home",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStyle {
    Primary,
    Extended,
    Logical,
}

impl PartitionStyle {
    /// Partition type keyword understood by `parted mkpart`.
    pub fn parted_name(self) -> &'static str {
        match self {
            PartitionStyle::Primary => "primary",
            PartitionStyle::Extended => "extended",
            PartitionStyle::Logical => "logical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    /// Small FAT; mkfs.vfat chooses 12 or 16 bit.
    Fat16,
    Fat32,
    Ext4,
    /// Extended container, never formatted.
    None,
}

impl FsKind {
    pub fn fat_for_size(bytes: u64) -> Self {
        if bytes > FAT32_THRESHOLD_BYTES {
            FsKind::Fat32
        } else {
            FsKind::Fat16
        }
    }

    /// File-system hint passed to `parted mkpart`.
    pub fn parted_hint(self) -> Option<&'static str> {
        match self {
            FsKind::Fat16 => Some("fat16"),
            FsKind::Fat32 => Some("fat32"),
            FsKind::Ext4 => Some("ext4"),
            FsKind::None => None,
        }
    }

    /// Type column in fstab.
    pub fn fstab_type(self) -> Option<&'static str> {
        match self {
            FsKind::Fat16 | FsKind::Fat32 => Some("vfat"),
            FsKind::Ext4 => Some("ext4"),
            FsKind::None => None,
        }
    }
}

/// One planned partition. `end` is inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub role: Role,
    pub style: PartitionStyle,
    pub fs: FsKind,
    pub number: u32,
    pub start: u64,
    pub end: u64,
}

impl PartitionSpec {
    pub fn sectors(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn size_bytes(&self) -> u64 {
        self.sectors() * SECTOR_SIZE
    }

    pub fn label(&self) -> Option<&'static str> {
        self.role.label()
    }

    fn overlaps(&self, other: &PartitionSpec) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Measured properties of the original image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurements {
    /// Size of the original image file.
    pub image_bytes: u64,
    /// Byte-accurate size of the original boot tree.
    pub boot_content: u64,
    /// Root tree without `boot/` and `home/`, which land elsewhere.
    pub root_content: u64,
    /// The original `home/` tree.
    pub home_content: u64,
}

/// Per-role sizes in bytes, each a multiple of the alignment unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeBudget {
    /// Zero when the variant has no try-boot partition.
    pub tryboot: u64,
    pub boot: u64,
    /// Fixed allowance; independent of the measured root content.
    pub root: u64,
    pub home: u64,
    pub home_floor: u64,
    /// Smallest home that still holds the original `home/` plus the buffer.
    /// Zero when the original home is empty.
    pub home_needed: u64,
    pub buffer: u64,
}

/// `mib` as aligned bytes, or [`ConvertError::InvalidPlan`] on overflow.
fn mib_bytes(name: &str, mib: u64) -> Result<u64> {
    mib.checked_mul(MIB).ok_or_else(|| overflow(name))
}

/// `value` rounded up to the alignment unit without wrapping.
fn checked_align_up(value: u64) -> Option<u64> {
    value
        .checked_add(ALIGNMENT_BYTES - 1)
        .map(|v| align_down(v, ALIGNMENT_BYTES))
}

fn overflow(name: &str) -> anyhow::Error {
    ConvertError::InvalidPlan(format!("{name} does not fit in 64-bit byte arithmetic")).into()
}

impl SizeBudget {
    pub fn new(measured: &Measurements, config: &Config) -> Result<Self> {
        let sizes = &config.sizes;

        let boot_wanted = measured
            .boot_content
            .checked_add(mib_bytes("boot_margin_mib", sizes.boot_margin_mib)?)
            .and_then(checked_align_up)
            .ok_or_else(|| overflow("boot size"))?;
        let boot = boot_wanted.max(mib_bytes("boot_min_mib", sizes.boot_min_mib)?);
        let root = mib_bytes("root_mib", sizes.root_mib)?;

        if measured.root_content > root {
            return Err(ConvertError::RootContentTooLarge {
                content: measured.root_content,
                partition: root,
            }
            .into());
        }

        let tryboot = if config.variant.has_tryboot_partition() {
            mib_bytes("tryboot_mib", sizes.tryboot_mib)?
        } else {
            0
        };

        let buffer = mib_bytes("buffer_mib", sizes.buffer_mib)?;
        let home_needed = if measured.home_content == 0 {
            0
        } else {
            measured
                .home_content
                .checked_add(buffer)
                .and_then(checked_align_up)
                .ok_or_else(|| overflow("home size"))?
        };

        let budget = Self {
            tryboot,
            boot,
            root,
            home: mib_bytes("home_min_mib", sizes.home_min_mib)?.max(home_needed),
            home_floor: mib_bytes("home_floor_mib", sizes.home_floor_mib)?,
            home_needed,
            buffer,
        };
        budget.checked_required().ok_or_else(|| overflow("total image size"))?;
        Ok(budget)
    }

    fn checked_fixed(&self) -> Option<u64> {
        [self.tryboot, self.boot, self.boot, self.root, self.root, self.buffer]
            .into_iter()
            .try_fold(ALIGNMENT_BYTES, u64::checked_add)
    }

    fn checked_required(&self) -> Option<u64> {
        self.checked_fixed()?
            .checked_add(self.home)
            .and_then(checked_align_up)
    }

    /// Everything except home: leading alignment, both slots, buffer.
    pub fn fixed_bytes(&self) -> u64 {
        self.checked_fixed().unwrap_or(u64::MAX)
    }

    pub fn required_bytes(&self) -> u64 {
        self.checked_required().unwrap_or(u64::MAX)
    }
}

/// Immutable, validated partition layout for the destination image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    entries: Vec<PartitionSpec>,
    disk_sectors: u64,
    budget: SizeBudget,
    variant: LayoutVariant,
}

impl PartitionPlan {
    pub fn entries(&self) -> &[PartitionSpec] {
        &self.entries
    }

    pub fn get(&self, role: Role) -> Option<&PartitionSpec> {
        self.entries.iter().find(|e| e.role == role)
    }

    pub fn require(&self, role: Role) -> Result<&PartitionSpec> {
        self.get(role)
            .ok_or_else(|| anyhow!("partition plan has no {role} partition"))
    }

    /// Entries that carry a filesystem.
    pub fn formattable(&self) -> impl Iterator<Item = &PartitionSpec> {
        self.entries.iter().filter(|e| e.fs != FsKind::None)
    }

    pub fn disk_sectors(&self) -> u64 {
        self.disk_sectors
    }

    pub fn last_sector(&self) -> u64 {
        self.disk_sectors - 1
    }

    pub fn image_bytes(&self) -> u64 {
        self.disk_sectors * SECTOR_SIZE
    }

    pub fn budget(&self) -> &SizeBudget {
        &self.budget
    }

    pub fn variant(&self) -> LayoutVariant {
        self.variant
    }

    /// Check every structural invariant of the layout.
    pub fn validate(&self) -> std::result::Result<(), ConvertError> {
        let invalid = |msg: String| Err(ConvertError::InvalidPlan(msg));

        if self.entries.is_empty() {
            return invalid("plan has no entries".into());
        }

        for pair in self.entries.windows(2) {
            if pair[0].start >= pair[1].start {
                return invalid(format!(
                    "{} (start {}) is not ordered before {} (start {})",
                    pair[0].role, pair[0].start, pair[1].role, pair[1].start
                ));
            }
        }

        for e in &self.entries {
            if e.end < e.start {
                return invalid(format!("{} ends before it starts", e.role));
            }
            if e.start % ALIGNMENT_SECTORS != 0 {
                return invalid(format!("{} start {} is not aligned", e.role, e.start));
            }
            if e.end > self.last_sector() {
                return invalid(format!(
                    "{} ends at {} past last sector {}",
                    e.role,
                    e.end,
                    self.last_sector()
                ));
            }
        }

        let extended: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.style == PartitionStyle::Extended)
            .collect();
        let [extended] = extended.as_slice() else {
            return invalid(format!(
                "expected one extended container, found {}",
                extended.len()
            ));
        };

        let outer: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.style != PartitionStyle::Logical)
            .collect();
        if outer.len() > 4 {
            return invalid(format!("{} primary slots used, at most 4 allowed", outer.len()));
        }
        let logical: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.style == PartitionStyle::Logical)
            .collect();

        for group in [&outer, &logical] {
            for (i, a) in group.iter().enumerate() {
                for b in &group[i + 1..] {
                    if a.overlaps(b) {
                        return invalid(format!("{} overlaps {}", a.role, b.role));
                    }
                }
            }
        }

        for (offset, l) in logical.iter().enumerate() {
            if l.start <= extended.start || l.end > extended.end {
                return invalid(format!("{} lies outside the extended container", l.role));
            }
            if l.number != FIRST_LOGICAL_NUMBER + offset as u32 {
                return invalid(format!("{} has number {}", l.role, l.number));
            }
        }

        match logical.last() {
            Some(last) if last.end < self.last_sector() => {}
            Some(last) => {
                return invalid(format!(
                    "last logical partition ends at {} which is not before last sector {}",
                    last.end,
                    self.last_sector()
                ))
            }
            None => return invalid("plan has no logical partitions".into()),
        }

        for (a, b) in [
            (Role::BootPrimary, Role::BootSecondary),
            (Role::RootPrimary, Role::RootSecondary),
        ] {
            match (self.get(a), self.get(b)) {
                (Some(x), Some(y)) if x.sectors() == y.sectors() => {}
                (Some(_), Some(_)) => return invalid(format!("{a} and {b} differ in size")),
                _ => return invalid(format!("plan is missing {a} or {b}")),
            }
        }

        Ok(())
    }
}

struct LayoutCursor {
    entries: Vec<PartitionSpec>,
    next_sector: u64,
    next_primary: u32,
    next_logical: u32,
}

impl LayoutCursor {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_sector: ALIGNMENT_SECTORS,
            next_primary: 1,
            next_logical: FIRST_LOGICAL_NUMBER,
        }
    }

    fn primary(&mut self, role: Role, fs: FsKind, bytes: u64) {
        let start = align_up(self.next_sector, ALIGNMENT_SECTORS);
        let end = start + bytes_to_sectors(bytes) - 1;
        self.entries.push(PartitionSpec {
            role,
            style: PartitionStyle::Primary,
            fs,
            number: self.next_primary,
            start,
            end,
        });
        self.next_primary += 1;
        self.next_sector = end + 1;
    }

    fn extended(&mut self, last_sector: u64) {
        let start = align_up(self.next_sector, ALIGNMENT_SECTORS);
        self.entries.push(PartitionSpec {
            role: Role::Extended,
            style: PartitionStyle::Extended,
            fs: FsKind::None,
            number: self.next_primary,
            start,
            end: last_sector,
        });
        self.next_primary += 1;
        self.next_sector = start;
    }

    /// Place a logical partition one alignment unit past the cursor, ending
    /// no later than `limit`.
    fn logical(&mut self, role: Role, fs: FsKind, bytes: u64, limit: u64) -> (u64, u64) {
        let start = align_up(self.next_sector, ALIGNMENT_SECTORS) + ALIGNMENT_SECTORS;
        let nominal_end = start + bytes_to_sectors(bytes) - 1;
        let end = nominal_end.min(limit);
        self.entries.push(PartitionSpec {
            role,
            style: PartitionStyle::Logical,
            fs,
            number: self.next_logical,
            start,
            end,
        });
        self.next_logical += 1;
        self.next_sector = end + 1;
        (start, nominal_end)
    }
}

/// Compute the destination layout.
///
/// Fails with [`ConvertError::Capacity`] when the fixed regions, or home
/// sized for the original `home/` content, do not fit, and with
/// [`ConvertError::HomeBelowFloor`] when home would have to shrink below its
/// floor.
pub fn compute_plan(measured: &Measurements, config: &Config) -> Result<PartitionPlan> {
    let budget = SizeBudget::new(measured, config)?;
    let required = budget.required_bytes();

    let image_bytes = match config.sizes.image_mib {
        Some(mib) => mib_bytes("image_mib", mib)?,
        None => required.max(align_up(measured.image_bytes, ALIGNMENT_BYTES)),
    };

    let fixed = budget.fixed_bytes();
    if fixed >= image_bytes {
        return Err(ConvertError::Capacity {
            required,
            available: image_bytes,
        }
        .into());
    }

    let home_room = align_down(image_bytes - fixed, ALIGNMENT_BYTES);
    let home = budget.home.min(home_room);
    if home < budget.home_floor {
        return Err(ConvertError::HomeBelowFloor {
            available: home_room,
            floor: budget.home_floor,
        }
        .into());
    }
    if home < budget.home_needed {
        return Err(ConvertError::Capacity {
            required: fixed.saturating_add(budget.home_needed),
            available: image_bytes,
        }
        .into());
    }
    if home < budget.home {
        warn!(
            "destination holds {} MiB; shrinking home from {} MiB to {} MiB",
            image_bytes / MIB,
            budget.home / MIB,
            home / MIB
        );
    }

    let disk_sectors = image_bytes / SECTOR_SIZE;
    let last_sector = disk_sectors - 1;
    let boot_fs = FsKind::fat_for_size(budget.boot);

    let mut cursor = LayoutCursor::new();
    if config.variant.has_tryboot_partition() {
        cursor.primary(Role::Tryboot, FsKind::fat_for_size(budget.tryboot), budget.tryboot);
    }
    cursor.primary(Role::BootPrimary, boot_fs, budget.boot);
    cursor.primary(Role::RootPrimary, FsKind::Ext4, budget.root);
    cursor.extended(last_sector);

    let slack_limit = last_sector - ALIGNMENT_SECTORS;
    cursor.logical(Role::BootSecondary, boot_fs, budget.boot, last_sector);
    cursor.logical(Role::RootSecondary, FsKind::Ext4, budget.root, last_sector);
    let (home_start, home_nominal_end) = cursor.logical(Role::Home, FsKind::Ext4, home, slack_limit);

    if home_nominal_end > slack_limit {
        let kept = (slack_limit + 1).saturating_sub(home_start) * SECTOR_SIZE;
        debug!("home end clamped to sector {slack_limit} ({kept} bytes)");
        if slack_limit < home_start || kept < budget.home_floor {
            return Err(ConvertError::HomeBelowFloor {
                available: kept,
                floor: budget.home_floor,
            }
            .into());
        }
        if kept < budget.home_needed {
            return Err(ConvertError::Capacity {
                required: fixed.saturating_add(budget.home_needed),
                available: image_bytes,
            }
            .into());
        }
    }

    let plan = PartitionPlan {
        entries: cursor.entries,
        disk_sectors,
        budget,
        variant: config.variant,
    };
    plan.validate()?;
    Ok(plan)
}
