//! `OverlayFS` mounts for image-backed container rootfs.
//!
//! An image layer is the read-only lower directory; each container gets
//! its own upper and work directories so the image stays untouched.

use std::path::{Path, PathBuf};

use capsule_common::error::{CapsuleError, Result};
use nix::mount::{MntFlags, MsFlags};

/// Directories of one overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers, topmost first.
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer.
    pub upper_dir: PathBuf,
    /// Scratch directory on the same filesystem as `upper_dir`.
    pub work_dir: PathBuf,
    /// Mount point of the merged view.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Mount data string for `mount(2)`.
    #[must_use]
    pub fn options(&self) -> String {
        let lowers = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "lowerdir={lowers},upperdir={},workdir={}",
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// Creates the upper, work and merged directories and mounts the overlay.
///
/// # Errors
///
/// Returns `Io` if a directory cannot be created or `Mount` if the mount
/// fails.
pub fn mount_overlay(config: &OverlayConfig) -> Result<()> {
    for dir in [&config.upper_dir, &config.work_dir, &config.merged_dir] {
        std::fs::create_dir_all(dir).map_err(|e| CapsuleError::io(dir, e))?;
    }
    let options = config.options();
    nix::mount::mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| CapsuleError::Mount {
        message: format!("overlay on {}: {e}", config.merged_dir.display()),
    })?;
    tracing::info!(merged = %config.merged_dir.display(), "overlayfs mounted");
    Ok(())
}

/// Lazily unmounts an overlay. A path that is not mounted is fine.
///
/// # Errors
///
/// Returns `Mount` if the unmount fails for another reason.
pub fn unmount_overlay(merged_dir: &Path) -> Result<()> {
    match nix::mount::umount2(merged_dir, MntFlags::MNT_DETACH) {
        Ok(()) | Err(nix::Error::EINVAL | nix::Error::ENOENT) => {}
        Err(e) => {
            return Err(CapsuleError::Mount {
                message: format!("unmount overlay {}: {e}", merged_dir.display()),
            });
        }
    }
    tracing::info!(path = %merged_dir.display(), "overlayfs unmounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_list_lowers_in_order() {
        let config = OverlayConfig {
            lower_dirs: vec![PathBuf::from("/l/top"), PathBuf::from("/l/base")],
            upper_dir: PathBuf::from("/c/upper"),
            work_dir: PathBuf::from("/c/work"),
            merged_dir: PathBuf::from("/c/merged"),
        };
        assert_eq!(
            config.options(),
            "lowerdir=/l/top:/l/base,upperdir=/c/upper,workdir=/c/work"
        );
    }

    #[test]
    fn unmounting_a_plain_directory_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = unmount_overlay(dir.path());
        // Unprivileged callers get EPERM instead of EINVAL.
        if let Err(e) = result {
            assert_eq!(e.kind(), capsule_common::error::ErrorKind::Mount);
        }
    }
}
