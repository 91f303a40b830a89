//! Container root filesystem preparation.
//!
//! Runs inside the container's namespaces before the user command is
//! executed: propagation, rootfs bind, configured mounts, device nodes,
//! the root switch, the read-only remounts that follow it, and the
//! read-only and masked path policies.

use std::path::{Path, PathBuf};

use capsule_common::config::{ContainerConfig, Device};
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::NamespaceType;
use nix::mount::MsFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};

use super::mount::{clean_path, in_rootfs, mount_to_rootfs, remount_readonly, set_rootfs_readonly};
use super::pivot_root;

const PROC_SYS: &str = "/proc/sys";
const DEV_NULL: &str = "/dev/null";

/// Sets up mounts and devices, then switches root to `config.rootfs`.
///
/// With a mount namespace `/` is made a recursive slave first, so no mount
/// event crosses back to the host, and the rootfs is bind-mounted onto
/// itself so it can later be remounted read-only and pivoted into.
/// Without one the rootfs is entered with `chroot`.
///
/// # Errors
///
/// Returns `PrepareRoot`, `Mount` or `Io` for the step that failed.
pub fn prepare_root(config: &ContainerConfig) -> Result<()> {
    let rootfs = &config.rootfs;
    let own_mount_ns = config.has_namespace(NamespaceType::Mnt);

    if own_mount_ns {
        nix::mount::mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| CapsuleError::PrepareRoot {
            message: format!("make / rslave: {e}"),
        })?;
        nix::mount::mount(
            Some(rootfs.as_path()),
            rootfs.as_path(),
            Some("bind"),
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| CapsuleError::PrepareRoot {
            message: format!("bind {} onto itself: {e}", rootfs.display()),
        })?;
    }

    for m in &config.mounts {
        mount_to_rootfs(m, rootfs)?;
    }
    for device in &config.devices {
        create_device_node(rootfs, device)?;
    }

    if own_mount_ns {
        pivot_root::pivot_root(rootfs)?;
    } else {
        pivot_root::chroot(rootfs)?;
    }
    tracing::info!(rootfs = %rootfs.display(), "rootfs prepared");
    Ok(())
}

/// Applies read-only remounts after the root switch: `/dev` when its
/// configured mount is read-only, and `/` when `readonly_fs` is set.
///
/// # Errors
///
/// Returns `Mount` if a remount fails.
pub fn finalize_root(config: &ContainerConfig) -> Result<()> {
    let dev = config
        .mounts
        .iter()
        .find(|m| clean_path(&m.destination) == Path::new("/dev"));
    if let Some(m) = dev {
        if m.flags & u64::from(libc::MS_RDONLY) != 0 {
            remount_readonly(Path::new("/dev"), m.flags)?;
        }
    }
    if config.readonly_fs {
        set_rootfs_readonly()?;
    }
    Ok(())
}

/// How a masked path is hidden from the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskTarget {
    /// `/dev/null` is bind-mounted over it.
    File,
    /// A read-only empty tmpfs is mounted over it.
    Directory,
    /// Nothing to hide.
    Missing,
}

/// Picks how `path` is masked. Symlinks are followed.
#[must_use]
pub fn mask_target(path: &Path) -> MaskTarget {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => MaskTarget::Directory,
        Ok(_) => MaskTarget::File,
        Err(_) => MaskTarget::Missing,
    }
}

/// Makes `path` read-only by binding it onto itself and remounting the
/// bind read-only. A missing path is skipped.
///
/// # Errors
///
/// Returns `Mount` if either mount fails.
pub fn readonly_path(path: &Path) -> Result<()> {
    if mask_target(path) == MaskTarget::Missing {
        return Ok(());
    }
    nix::mount::mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| CapsuleError::Mount {
        message: format!("bind {} onto itself: {e}", path.display()),
    })?;
    remount_readonly(path, u64::from(libc::MS_REC))
}

/// Hides `path`: a file is covered with `/dev/null`, a directory with a
/// read-only tmpfs. A missing path is skipped.
///
/// # Errors
///
/// Returns `Mount` if the covering mount fails.
pub fn mask_path(path: &Path) -> Result<()> {
    let mounted = match mask_target(path) {
        MaskTarget::Missing => return Ok(()),
        MaskTarget::File => nix::mount::mount(
            Some(DEV_NULL),
            path,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ),
        MaskTarget::Directory => nix::mount::mount(
            Some("tmpfs"),
            path,
            Some("tmpfs"),
            MsFlags::MS_RDONLY,
            None::<&str>,
        ),
    };
    mounted.map_err(|e| CapsuleError::Mount {
        message: format!("mask {}: {e}", path.display()),
    })?;
    tracing::debug!(path = %path.display(), "path masked");
    Ok(())
}

/// Applies the read-only and masked path lists after the root switch.
///
/// # Errors
///
/// Returns `Mount` for the first path that cannot be handled.
pub fn apply_path_policies(config: &ContainerConfig) -> Result<()> {
    for path in &config.readonly_paths {
        readonly_path(&clean_path(path))?;
    }
    for path in &config.masked_paths {
        mask_path(&clean_path(path))?;
    }
    Ok(())
}

/// File type bits for a device type character.
///
/// # Errors
///
/// Returns `ConfigInvalid` for an unknown type.
pub fn device_kind(dev_type: char) -> Result<SFlag> {
    match dev_type {
        'c' | 'u' => Ok(SFlag::S_IFCHR),
        'b' => Ok(SFlag::S_IFBLK),
        'p' => Ok(SFlag::S_IFIFO),
        other => Err(CapsuleError::ConfigInvalid {
            message: format!("{other} is not a valid device type"),
        }),
    }
}

/// Creates one device node under `rootfs` and hands it to its owner.
/// An existing node is left alone.
///
/// # Errors
///
/// Returns `PrepareRoot` if `mknod` or `chown` fails.
pub fn create_device_node(rootfs: &Path, device: &Device) -> Result<()> {
    let dest = in_rootfs(rootfs, &device.path);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CapsuleError::io(parent, e))?;
    }
    let kind = device_kind(device.dev_type)?;
    match nix::sys::stat::mknod(
        &dest,
        kind,
        Mode::from_bits_truncate(device.file_mode),
        device.mkdev(),
    ) {
        Ok(()) => {}
        Err(nix::Error::EEXIST) => return Ok(()),
        Err(e) => {
            return Err(CapsuleError::PrepareRoot {
                message: format!("mknod {}: {e}", dest.display()),
            });
        }
    }
    nix::unistd::chown(
        &dest,
        Some(Uid::from_raw(device.uid)),
        Some(Gid::from_raw(device.gid)),
    )
    .map_err(|e| CapsuleError::PrepareRoot {
        message: format!("chown {}: {e}", dest.display()),
    })?;
    tracing::debug!(path = %dest.display(), major = device.major, minor = device.minor, "device created");
    Ok(())
}

/// Sets the hostname of the current UTS namespace.
///
/// # Errors
///
/// Returns `Hostname` if `sethostname(2)` fails.
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| CapsuleError::Hostname {
        message: format!("sethostname {hostname}: {e}"),
    })?;
    tracing::debug!(hostname, "hostname set");
    Ok(())
}

/// `/proc/sys` path of a dotted sysctl key, relative to `base`.
#[must_use]
pub fn sysctl_path(base: &Path, key: &str) -> PathBuf {
    key.split('.')
        .filter(|part| !part.is_empty() && *part != "..")
        .fold(base.to_path_buf(), |path, part| path.join(part))
}

/// Writes one kernel parameter under `base` (normally `/proc/sys`).
///
/// # Errors
///
/// Returns `Sysctl` if the write fails.
pub fn write_sysctl_at(base: &Path, key: &str, value: &str) -> Result<()> {
    let path = sysctl_path(base, key);
    std::fs::write(&path, value).map_err(|e| CapsuleError::Sysctl {
        message: format!("write {key} ({}): {e}", path.display()),
    })?;
    tracing::debug!(key, value, "sysctl written");
    Ok(())
}

/// Writes one kernel parameter under `/proc/sys`.
///
/// # Errors
///
/// Returns `Sysctl` if the write fails.
pub fn write_sysctl(key: &str, value: &str) -> Result<()> {
    write_sysctl_at(Path::new(PROC_SYS), key, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysctl_key_maps_to_proc_path() {
        assert_eq!(
            sysctl_path(Path::new("/proc/sys"), "net.ipv4.ip_forward"),
            PathBuf::from("/proc/sys/net/ipv4/ip_forward")
        );
        assert_eq!(
            sysctl_path(Path::new("/proc/sys"), "kernel..shmmax"),
            PathBuf::from("/proc/sys/kernel/shmmax")
        );
    }

    #[test]
    fn sysctl_write_lands_in_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("kernel")).unwrap();
        write_sysctl_at(dir.path(), "kernel.msgmax", "8192").expect("write");
        let written = std::fs::read_to_string(dir.path().join("kernel/msgmax")).unwrap();
        assert_eq!(written, "8192");
    }

    #[test]
    fn sysctl_failure_is_reported_as_sysctl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = write_sysctl_at(dir.path(), "no.such.key", "1").unwrap_err();
        assert_eq!(err.kind(), capsule_common::error::ErrorKind::Sysctl);
    }

    #[test]
    fn mask_target_follows_path_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("kcore");
        std::fs::write(&file, "").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(dir.path(), &link).unwrap();

        assert_eq!(mask_target(&file), MaskTarget::File);
        assert_eq!(mask_target(dir.path()), MaskTarget::Directory);
        assert_eq!(mask_target(&link), MaskTarget::Directory);
        assert_eq!(mask_target(&dir.path().join("absent")), MaskTarget::Missing);
    }

    #[test]
    fn missing_policy_paths_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let absent = dir.path().join("absent");
        readonly_path(&absent).expect("missing read-only path");
        mask_path(&absent).expect("missing masked path");
        let config = ContainerConfig {
            readonly_paths: vec![absent.clone()],
            masked_paths: vec![absent],
            ..ContainerConfig::default()
        };
        apply_path_policies(&config).expect("nothing to apply");
    }

    #[test]
    fn device_kinds() {
        assert_eq!(device_kind('u').unwrap(), SFlag::S_IFCHR);
        assert_eq!(device_kind('b').unwrap(), SFlag::S_IFBLK);
        assert_eq!(device_kind('p').unwrap(), SFlag::S_IFIFO);
        assert!(device_kind('x').is_err());
    }

    #[test]
    fn fifo_node_is_created_unprivileged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let device = Device {
            dev_type: 'p',
            path: PathBuf::from("/run/fifo"),
            major: 0,
            minor: 0,
            permissions: String::new(),
            file_mode: 0o600,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        };
        create_device_node(dir.path(), &device).expect("mkfifo");
        assert!(dir.path().join("run/fifo").exists());
        create_device_node(dir.path(), &device).expect("existing node is fine");
    }
}
