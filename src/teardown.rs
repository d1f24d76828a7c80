//! Scoped resource tracking for a conversion run.
//!
//! Every directory, loop attachment and mount the pipeline acquires is
//! recorded here in acquisition order. [`Teardown::release`] undoes them in
//! reverse, exactly once, whether the run succeeded, failed or was
//! interrupted. Releasing something already gone is not an error.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::disk::loopdev::{self, BlockDevice};
use crate::process::Cmd;

#[derive(Debug)]
enum Resource {
    Dir(PathBuf),
    Loop(BlockDevice),
    Mount(PathBuf),
}

#[derive(Debug, Default)]
pub struct Teardown {
    resources: Vec<Resource>,
    released: bool,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh temporary directory owned by this run.
    pub fn temp_root(&mut self, prefix: &str) -> Result<PathBuf> {
        let path = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .context("creating temporary work directory")?
            .keep();
        self.resources.push(Resource::Dir(path.clone()));
        Ok(path)
    }

    /// Create `path` (which must not exist) and remove it on release.
    pub fn create_dir(&mut self, path: &Path) -> Result<()> {
        fs::create_dir(path).with_context(|| format!("creating '{}'", path.display()))?;
        self.resources.push(Resource::Dir(path.to_path_buf()));
        Ok(())
    }

    pub fn attach_loop(&mut self, image: &Path) -> Result<BlockDevice> {
        let device = loopdev::attach(image)?;
        self.resources.push(Resource::Loop(device.clone()));
        Ok(device)
    }

    pub fn mount(&mut self, source: &Path, target: &Path) -> Result<()> {
        Cmd::new("mount")
            .arg_path(source)
            .arg_path(target)
            .error_msg(format!(
                "mounting {} on '{}' failed",
                source.display(),
                target.display()
            ))
            .run()?;
        debug!("mounted {} on '{}'", source.display(), target.display());
        self.resources.push(Resource::Mount(target.to_path_buf()));
        Ok(())
    }

    /// Release everything in reverse acquisition order.
    ///
    /// Runs once; later calls return `Ok(())`. Every resource is attempted
    /// even if an earlier one fails, and the first failure is returned.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if self.resources.is_empty() {
            return Ok(());
        }
        info!("releasing {} resources", self.resources.len());
        if self
            .resources
            .iter()
            .any(|r| matches!(r, Resource::Mount(_)))
        {
            let _ = Cmd::new("sync").allow_fail().run();
        }

        let mut first_err = None;
        while let Some(resource) = self.resources.pop() {
            let result = match &resource {
                Resource::Mount(target) => unmount(target),
                Resource::Loop(device) => loopdev::detach(device),
                Resource::Dir(path) => remove_empty_dir(path),
            };
            if let Err(e) = result {
                warn!("release of {resource:?} failed: {e:#}");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("cleanup incomplete: {e:#}");
        }
    }
}

/// `path` sits on a different device than its parent, or is `/`.
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return true;
    };
    let Ok(parent_meta) = fs::metadata(parent) else {
        return false;
    };
    meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino()
}

/// Unmount `target`, falling back to a lazy unmount when it is busy.
fn unmount(target: &Path) -> Result<()> {
    if !is_mount_point(target) {
        debug!("'{}' is not mounted", target.display());
        return Ok(());
    }
    let first = Cmd::new("umount").arg_path(target).allow_fail().run()?;
    if first.success() {
        debug!("unmounted '{}'", target.display());
        return Ok(());
    }

    warn!(
        "umount '{}' failed ({}); retrying lazily",
        target.display(),
        first.stderr.trim()
    );
    Cmd::new("umount")
        .arg("-l")
        .arg_path(target)
        .error_msg(format!("lazy unmount of '{}' failed", target.display()))
        .run()?;
    Ok(())
}

/// Non-recursive on purpose: a directory still holding a mount is left alone.
fn remove_empty_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if is_mount_point(path) {
        return Err(anyhow!(
            "'{}' is still a mount point; leaving it in place",
            path.display()
        ));
    }
    fs::remove_dir(path).with_context(|| format!("removing '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn releases_dirs_in_reverse_order() {
        let mut teardown = Teardown::new();
        let root = teardown.temp_root("ab-test-").unwrap();
        let child = root.join("src-boot");
        teardown.create_dir(&child).unwrap();
        assert!(child.is_dir());

        teardown.release().unwrap();
        assert!(!child.exists());
        assert!(!root.exists());
    }

    #[test]
    fn release_runs_once() {
        let mut teardown = Teardown::new();
        let root = teardown.temp_root("ab-test-").unwrap();
        teardown.release().unwrap();
        // Something recreated at the same path must survive a second release.
        fs::create_dir(&root).unwrap();
        teardown.release().unwrap();
        drop(teardown);
        assert!(root.is_dir());
        fs::remove_dir(&root).unwrap();
    }

    #[test]
    fn drop_releases() {
        let root;
        {
            let mut teardown = Teardown::new();
            root = teardown.temp_root("ab-test-").unwrap();
            assert!(root.is_dir());
        }
        assert!(!root.exists());
    }

    #[test]
    fn non_empty_dir_is_kept_and_reported() {
        let mut teardown = Teardown::new();
        let root = teardown.temp_root("ab-test-").unwrap();
        fs::write(root.join("leftover"), b"x").unwrap();
        assert!(teardown.release().is_err());
        assert!(root.join("leftover").exists());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn unmounting_plain_dir_is_noop() {
        let temp = TempDir::new().unwrap();
        assert!(!is_mount_point(temp.path()));
        unmount(temp.path()).unwrap();
        unmount(&temp.path().join("missing")).unwrap();
    }

    #[test]
    fn detaching_unbound_loop_is_noop() {
        let device = BlockDevice::from_path("/dev/loop-never-attached").unwrap();
        loopdev::detach(&device).unwrap();
    }

    #[test]
    fn root_is_mount_point() {
        assert!(is_mount_point(Path::new("/")));
    }
}
