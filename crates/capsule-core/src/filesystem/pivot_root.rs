//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::path::Path;

use capsule_common::error::{CapsuleError, Result};
use nix::mount::MntFlags;

const PIVOT_DIR: &str = ".pivot_root";

/// Makes `rootfs` the new `/` and detaches the old root.
///
/// The old root is parked in `<rootfs>/.pivot_root`, lazily unmounted and
/// the directory removed.
///
/// # Errors
///
/// Returns `PrepareRoot` if any step fails.
pub fn pivot_root(rootfs: &Path) -> Result<()> {
    let err = |what: &str, e: &dyn std::fmt::Display| CapsuleError::PrepareRoot {
        message: format!("{what}: {e}"),
    };

    let put_old = rootfs.join(PIVOT_DIR);
    match std::fs::create_dir(&put_old) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(CapsuleError::io(&put_old, e)),
    }

    nix::unistd::pivot_root(rootfs, &put_old).map_err(|e| err("pivot_root", &e))?;
    nix::unistd::chdir("/").map_err(|e| err("chdir /", &e))?;

    let old_root = Path::new("/").join(PIVOT_DIR);
    nix::mount::umount2(&old_root, MntFlags::MNT_DETACH)
        .map_err(|e| err("unmount old root", &e))?;
    std::fs::remove_dir(&old_root).map_err(|e| err("remove old root", &e))?;

    tracing::info!(rootfs = %rootfs.display(), "pivot_root complete");
    Ok(())
}

/// Confines the process to `rootfs` with `chroot(2)`, used when the
/// container has no mount namespace of its own.
///
/// # Errors
///
/// Returns `PrepareRoot` if `chroot` or `chdir` fails.
pub fn chroot(rootfs: &Path) -> Result<()> {
    nix::unistd::chroot(rootfs).map_err(|e| CapsuleError::PrepareRoot {
        message: format!("chroot {}: {e}", rootfs.display()),
    })?;
    nix::unistd::chdir("/").map_err(|e| CapsuleError::PrepareRoot {
        message: format!("chdir /: {e}"),
    })?;
    tracing::info!(rootfs = %rootfs.display(), "chroot complete");
    Ok(())
}
