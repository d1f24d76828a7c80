//! Single-slot to A/B image conversion.
//!
//! [`convert_image`] drives the whole pipeline: measure the original, plan
//! the layout, build and partition the destination, format, migrate content,
//! write boot configuration, install first-boot expansion, verify. Every
//! device and mount it acquires goes through a [`Teardown`] and is released
//! on every exit path.

pub mod allocate;
pub mod bootconfig;
pub mod digest;
pub mod expand;
pub mod filesystems;
pub mod geometry;
pub mod loopdev;
pub mod measure;
pub mod migrate;
pub mod partitions;
pub mod verify;

pub use geometry::{compute_plan, Measurements, PartitionPlan, PartitionSpec, Role};
pub use loopdev::{BlockDevice, DeviceMapping};

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::config::Config;
use crate::error::ConvertError;
use crate::preflight;
use crate::teardown::Teardown;
use geometry::MIB;
use loopdev::{SourceDevices, DEV_DIR, SOURCE_BOOT_NUMBER, SOURCE_ROOT_NUMBER, SYS_CLASS_BLOCK};
use migrate::{DestinationTree, MigrationReport, SourceTree};
use partitions::RetryPolicy;

/// Fail with [`ConvertError::Interrupted`] once a stop was requested.
pub fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        return Err(ConvertError::Interrupted.into());
    }
    Ok(())
}

/// What a finished conversion produced.
#[derive(Debug)]
pub struct ConversionReport {
    pub output: PathBuf,
    pub plan: PartitionPlan,
    pub migration: MigrationReport,
    pub digest: Option<PathBuf>,
}

/// Convert the single-slot image at `input` into an A/B image at `output`.
///
/// On failure the output file is left in place for inspection; devices and
/// mounts are always released.
pub fn convert_image(
    input: &Path,
    output: &Path,
    config: &Config,
    cancel: &AtomicBool,
) -> Result<ConversionReport> {
    let mut teardown = Teardown::new();
    let result = build(&mut teardown, input, output, config, cancel);
    let released = teardown.release();

    let (plan, migration) = result?;
    released.context("releasing devices and mounts")?;

    let digest = if config.digest {
        Some(digest::write_digest(output)?)
    } else {
        None
    };

    Ok(ConversionReport {
        output: output.to_path_buf(),
        plan,
        migration,
        digest,
    })
}

/// Run the host checks for `tools` and privileges, then [`convert_image`].
///
/// A failed check returns before any file, loop device or mount exists.
pub fn convert_with_preflight(
    input: &Path,
    output: &Path,
    config: &Config,
    tools: &[(&str, &str)],
    cancel: &AtomicBool,
) -> Result<ConversionReport> {
    preflight::check_required_tools(tools)?;
    preflight::check_privileges()?;
    convert_image(input, output, config, cancel)
}

fn build(
    teardown: &mut Teardown,
    input: &Path,
    output: &Path,
    config: &Config,
    cancel: &AtomicBool,
) -> Result<(PartitionPlan, MigrationReport)> {
    let sysfs = Path::new(SYS_CLASS_BLOCK);
    let dev_dir = Path::new(DEV_DIR);
    let policy = RetryPolicy::default();

    check_cancel(cancel)?;
    if !input.is_file() {
        bail!("original image '{}' does not exist", input.display());
    }

    // Step 1: Work directories
    let work = teardown.temp_root("ab-image-")?;
    let source = SourceTree {
        boot: work.join("src-boot"),
        root: work.join("src-root"),
    };
    let dst_root = work.join("dst-root");
    for dir in [&source.boot, &source.root, &dst_root] {
        teardown.create_dir(dir)?;
    }

    // Step 2: Mount the original
    info!("attaching original image '{}'", input.display());
    let src_disk = teardown.attach_loop(input)?;
    let found = partitions::wait_for_partitions(
        &src_disk,
        &[SOURCE_BOOT_NUMBER, SOURCE_ROOT_NUMBER],
        sysfs,
        dev_dir,
        policy,
        cancel,
    )?;
    let src = SourceDevices::from_found(src_disk, &found)?;
    teardown.mount(&src.boot, &source.boot)?;
    teardown.mount(&src.root, &source.root)?;
    check_cancel(cancel)?;

    // Step 3: Measure and plan
    let measured = Measurements {
        image_bytes: fs::metadata(input)
            .with_context(|| format!("reading metadata '{}'", input.display()))?
            .len(),
        boot_content: measure::tree_size(&source.boot)?,
        root_content: measure::tree_size_excluding(&source.root, &["boot", "home"])?,
        home_content: measure::tree_size(&source.root.join("home"))?,
    };
    info!(
        "original: image {} MiB, boot content {} MiB, root content {} MiB, home content {} MiB",
        measured.image_bytes / MIB,
        measured.boot_content / MIB,
        measured.root_content / MIB,
        measured.home_content / MIB
    );
    let plan = compute_plan(&measured, config)?;
    log_plan(&plan);
    check_cancel(cancel)?;

    // Step 4: Destination image
    allocate::create_destination(input, output, plan.image_bytes())?;
    check_cancel(cancel)?;

    // Step 5: Partition table
    let dst_disk = teardown.attach_loop(output)?;
    partitions::write_partition_table(&dst_disk, &plan)?;
    let expected: Vec<u32> = plan.formattable().map(|spec| spec.number).collect();
    let found =
        partitions::wait_for_partitions(&dst_disk, &expected, sysfs, dev_dir, policy, cancel)?;
    let devices = DeviceMapping::build(dst_disk, &plan, &found)?;

    // Step 6: Filesystems
    filesystems::format_all(&plan, &devices, cancel)?;
    check_cancel(cancel)?;

    // Step 7: Mount slot A, home and try-boot
    teardown.mount(devices.node(Role::RootPrimary)?, &dst_root)?;
    let dest = DestinationTree {
        boot: dst_root.join("boot"),
        home: dst_root.join("home"),
        tryboot: plan.get(Role::Tryboot).map(|_| dst_root.join("tryboot")),
        root: dst_root.clone(),
    };
    // Mount points belong to the new root filesystem and stay in the image.
    for dir in [Some(&dest.boot), Some(&dest.home), dest.tryboot.as_ref()]
        .into_iter()
        .flatten()
    {
        fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))?;
    }
    teardown.mount(devices.node(Role::BootPrimary)?, &dest.boot)?;
    teardown.mount(devices.node(Role::Home)?, &dest.home)?;
    if let Some(tryboot) = &dest.tryboot {
        teardown.mount(devices.node(Role::Tryboot)?, tryboot)?;
    }
    check_cancel(cancel)?;

    // Step 8: Content
    let migration = migrate::migrate(&source, &dest, cancel)?;
    check_cancel(cancel)?;

    // Step 9: Boot configuration
    let signature = bootconfig::read_disk_signature(devices.disk().path())?;
    let ids = bootconfig::SlotIdentities::new(&plan, config.root_selector, signature)?;
    bootconfig::write_boot_config(&plan, &ids, &dest)?;

    // Step 10: First-boot expansion
    expand::install_expansion(&dest.root, &plan)?;

    // Step 11: Final checks
    verify::verify_boot_partition(&dest.boot, &ids)?;

    Ok((plan, migration))
}

fn log_plan(plan: &PartitionPlan) {
    info!(
        "partition plan: {} MiB image, {:?} layout",
        plan.image_bytes() / MIB,
        plan.variant()
    );
    for spec in plan.entries() {
        info!(
            "  p{:<2} {:<18} {:>10}s..{:>10}s {:>6} MiB {}",
            spec.number,
            spec.role.name(),
            spec.start,
            spec.end,
            spec.size_bytes() / MIB,
            spec.label().unwrap_or("-")
        );
    }
}
