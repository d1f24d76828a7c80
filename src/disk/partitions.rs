//! Partition table writing via parted, and waiting for the kernel to expose
//! the resulting nodes.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use super::check_cancel;
use super::geometry::{PartitionPlan, PartitionStyle, Role};
use super::loopdev::{self, BlockDevice};
use crate::error::ConvertError;
use crate::process::Cmd;

/// One parted invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartedOp {
    MkLabel,
    MkPart {
        style: PartitionStyle,
        fs_hint: Option<&'static str>,
        start: u64,
        end: u64,
    },
    SetBoot {
        number: u32,
    },
}

impl PartedOp {
    pub fn args(&self) -> Vec<String> {
        match self {
            PartedOp::MkLabel => vec!["mklabel".into(), "msdos".into()],
            PartedOp::MkPart {
                style,
                fs_hint,
                start,
                end,
            } => {
                let mut args = vec!["unit".into(), "s".into(), "mkpart".into()];
                args.push(style.parted_name().into());
                if let Some(hint) = fs_hint {
                    args.push((*hint).into());
                }
                args.push(format!("{start}s"));
                args.push(format!("{end}s"));
                args
            }
            PartedOp::SetBoot { number } => {
                vec!["set".into(), number.to_string(), "boot".into(), "on".into()]
            }
        }
    }
}

/// The parted operations that realize `plan`, in order.
pub fn parted_ops(plan: &PartitionPlan) -> Vec<PartedOp> {
    let mut ops = vec![PartedOp::MkLabel];
    for spec in plan.entries() {
        ops.push(PartedOp::MkPart {
            style: spec.style,
            fs_hint: spec.fs.parted_hint(),
            start: spec.start,
            end: spec.end,
        });
    }
    // With a try-boot partition in front, the firmware finds it first anyway.
    if plan.get(Role::Tryboot).is_none() {
        if let Some(boot) = plan.get(Role::BootPrimary) {
            ops.push(PartedOp::SetBoot {
                number: boot.number,
            });
        }
    }
    ops
}

/// Write the msdos table described by `plan` to `disk` and ask the kernel to
/// re-read it.
pub fn write_partition_table(disk: &BlockDevice, plan: &PartitionPlan) -> Result<()> {
    info!(
        "writing msdos partition table to {} ({} entries)",
        disk.path().display(),
        plan.entries().len()
    );
    for op in parted_ops(plan) {
        Cmd::new("parted")
            .arg("-s")
            .arg_path(disk.path())
            .args(op.args())
            .error_msg(format!("parted failed on {}", disk.path().display()))
            .run()?;
    }
    rescan(disk)
}

pub fn rescan(disk: &BlockDevice) -> Result<()> {
    Cmd::new("partprobe")
        .arg_path(disk.path())
        .error_msg(format!("partprobe failed on {}", disk.path().display()))
        .run()?;
    Ok(())
}

/// Fixed-count, fixed-delay retry budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

/// Call `probe` until it yields a value or the budget runs out.
///
/// Returns `Ok(None)` on exhaustion; errors from `probe` and a raised cancel
/// flag end the poll early.
pub fn poll<T>(
    policy: RetryPolicy,
    cancel: &AtomicBool,
    mut probe: impl FnMut(u32) -> Result<Option<T>>,
) -> Result<Option<T>> {
    for attempt in 1..=policy.attempts {
        check_cancel(cancel)?;
        if let Some(value) = probe(attempt)? {
            return Ok(Some(value));
        }
        if attempt < policy.attempts {
            thread::sleep(policy.delay);
        }
    }
    Ok(None)
}

/// Wait until every partition in `expected` has a node under `dev_dir`.
pub fn wait_for_partitions(
    disk: &BlockDevice,
    expected: &[u32],
    sysfs: &Path,
    dev_dir: &Path,
    policy: RetryPolicy,
    cancel: &AtomicBool,
) -> Result<BTreeMap<u32, PathBuf>> {
    let mut missing_last = None;
    let found = poll(policy, cancel, |attempt| {
        let found = loopdev::enumerate_partitions(sysfs, dev_dir, disk)?;
        match expected.iter().find(|n| !found.contains_key(n)) {
            None => Ok(Some(found)),
            Some(&n) => {
                debug!(
                    "attempt {attempt}/{}: partition {n} of {} not present yet",
                    policy.attempts,
                    disk.path().display()
                );
                missing_last = Some(n);
                Ok(None)
            }
        }
    })?;

    found.ok_or_else(|| {
        ConvertError::DeviceNodeTimeout {
            disk: disk.path().to_path_buf(),
            number: missing_last.unwrap_or_default(),
            attempts: policy.attempts,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LayoutVariant};
    use crate::disk::geometry::{compute_plan, Measurements, ALIGNMENT_SECTORS, MIB};
    use crate::disk::loopdev::tests::fake_block_tree;
    use std::cell::Cell;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn plan(variant: LayoutVariant) -> PartitionPlan {
        let m = Measurements {
            image_bytes: 2048 * MIB,
            boot_content: 200 * MIB,
            root_content: 1800 * MIB,
            home_content: 0,
        };
        let config = Config {
            variant,
            ..Config::default()
        };
        compute_plan(&m, &config).unwrap()
    }

    fn instant() -> RetryPolicy {
        RetryPolicy {
            attempts: 4,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn compact_ops_mark_boot_a() {
        let ops = parted_ops(&plan(LayoutVariant::Compact));
        assert_eq!(ops.first(), Some(&PartedOp::MkLabel));
        assert_eq!(ops.last(), Some(&PartedOp::SetBoot { number: 1 }));
        // label + 6 entries + boot flag
        assert_eq!(ops.len(), 8);
        assert_eq!(
            ops[1].args(),
            vec![
                "unit".to_string(),
                "s".into(),
                "mkpart".into(),
                "primary".into(),
                "fat32".into(),
                format!("{}s", ALIGNMENT_SECTORS),
                format!("{}s", ALIGNMENT_SECTORS + 264 * 2048 - 1),
            ]
        );
    }

    #[test]
    fn extended_op_has_no_fs_hint() {
        let ops = parted_ops(&plan(LayoutVariant::Compact));
        let args = ops[3].args();
        assert_eq!(args[3], "extended");
        assert!(args[4].ends_with('s'));
        assert_eq!(args.len(), 6);
    }

    #[test]
    fn tryboot_ops_have_no_boot_flag() {
        let ops = parted_ops(&plan(LayoutVariant::TrybootPartition));
        assert!(!ops.iter().any(|op| matches!(op, PartedOp::SetBoot { .. })));
        assert_eq!(ops.len(), 8);
        assert_eq!(ops[1].args()[4], "fat16");
    }

    #[test]
    fn poll_returns_first_success() {
        let calls = Cell::new(0);
        let cancel = AtomicBool::new(false);
        let got = poll(instant(), &cancel, |attempt| {
            calls.set(calls.get() + 1);
            Ok((attempt == 3).then_some(attempt))
        })
        .unwrap();
        assert_eq!(got, Some(3));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn poll_gives_up_after_budget() {
        let calls = Cell::new(0);
        let cancel = AtomicBool::new(false);
        let got: Option<()> = poll(instant(), &cancel, |_| {
            calls.set(calls.get() + 1);
            Ok(None)
        })
        .unwrap();
        assert_eq!(got, None);
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn poll_stops_on_cancel() {
        let cancel = AtomicBool::new(false);
        cancel.store(true, Ordering::SeqCst);
        let err = poll(instant(), &cancel, |_| Ok(Some(()))).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::Interrupted)
        ));
    }

    #[test]
    fn wait_reports_typed_timeout() {
        let temp = TempDir::new().unwrap();
        let (sysfs, dev) = fake_block_tree(temp.path(), "loop5", &[1, 2, 3]);
        let disk = BlockDevice::from_path(dev.join("loop5")).unwrap();
        let cancel = AtomicBool::new(false);

        let err = wait_for_partitions(&disk, &[1, 2, 3, 5, 6, 7], &sysfs, &dev, instant(), &cancel)
            .unwrap_err();
        match err.downcast_ref::<ConvertError>() {
            Some(ConvertError::DeviceNodeTimeout {
                number, attempts, ..
            }) => {
                assert_eq!(*number, 5);
                assert_eq!(*attempts, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn wait_succeeds_when_nodes_present() {
        let temp = TempDir::new().unwrap();
        let (sysfs, dev) = fake_block_tree(temp.path(), "loop6", &[1, 2, 3, 5, 6, 7]);
        let disk = BlockDevice::from_path(dev.join("loop6")).unwrap();
        let cancel = AtomicBool::new(false);

        let found =
            wait_for_partitions(&disk, &[5, 6, 7], &sysfs, &dev, instant(), &cancel).unwrap();
        assert_eq!(found.len(), 6);
    }
}
