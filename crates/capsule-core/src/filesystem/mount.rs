//! Mount utilities for container filesystem setup.
//!
//! Translates OCI mount option strings into `MS_*` flags and performs the
//! configured mounts relative to the container rootfs.

use std::path::{Component, Path, PathBuf};

use capsule_common::config::Mount;
use capsule_common::error::{CapsuleError, Result};
use nix::mount::MsFlags;

/// Option name, whether it clears the flag, and the flag bits.
const MOUNT_OPTIONS: &[(&str, bool, libc::c_ulong)] = &[
    ("acl", false, libc::MS_POSIXACL),
    ("async", true, libc::MS_SYNCHRONOUS),
    ("atime", true, libc::MS_NOATIME),
    ("bind", false, libc::MS_BIND),
    ("defaults", false, 0),
    ("dev", true, libc::MS_NODEV),
    ("diratime", true, libc::MS_NODIRATIME),
    ("dirsync", false, libc::MS_DIRSYNC),
    ("exec", true, libc::MS_NOEXEC),
    ("iversion", false, libc::MS_I_VERSION),
    ("lazytime", false, libc::MS_LAZYTIME),
    ("loud", true, libc::MS_SILENT),
    ("mand", false, libc::MS_MANDLOCK),
    ("noacl", true, libc::MS_POSIXACL),
    ("noatime", false, libc::MS_NOATIME),
    ("nodev", false, libc::MS_NODEV),
    ("nodiratime", false, libc::MS_NODIRATIME),
    ("noexec", false, libc::MS_NOEXEC),
    ("noiversion", true, libc::MS_I_VERSION),
    ("nolazytime", true, libc::MS_LAZYTIME),
    ("nomand", true, libc::MS_MANDLOCK),
    ("norelatime", true, libc::MS_RELATIME),
    ("nostrictatime", true, libc::MS_STRICTATIME),
    ("nosuid", false, libc::MS_NOSUID),
    ("rbind", false, libc::MS_BIND | libc::MS_REC),
    ("relatime", false, libc::MS_RELATIME),
    ("remount", false, libc::MS_REMOUNT),
    ("ro", false, libc::MS_RDONLY),
    ("rw", true, libc::MS_RDONLY),
    ("silent", false, libc::MS_SILENT),
    ("strictatime", false, libc::MS_STRICTATIME),
    ("suid", true, libc::MS_NOSUID),
    ("sync", false, libc::MS_SYNCHRONOUS),
];

/// Destinations under `/proc` that may still be mounted over.
const PROC_ALLOWED: &[&str] = &[
    "/proc/cpuinfo",
    "/proc/diskstats",
    "/proc/meminfo",
    "/proc/stat",
    "/proc/swaps",
    "/proc/uptime",
    "/proc/loadavg",
    "/proc/net/dev",
];

/// Converts raw flag bits into `MsFlags`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::unnecessary_cast)]
pub fn ms_flags(bits: u64) -> MsFlags {
    MsFlags::from_bits_truncate(bits as libc::c_ulong)
}

/// Splits OCI mount options into flag bits and filesystem data.
///
/// Unknown options are passed through as data, joined by `,`.
#[must_use]
pub fn parse_mount_options(options: &[String]) -> (u64, String) {
    let mut flags: u64 = 0;
    let mut data = Vec::new();
    for option in options {
        match MOUNT_OPTIONS.iter().find(|(name, _, _)| *name == option) {
            Some((_, clear, bits)) => {
                if *clear {
                    flags &= !u64::from(*bits);
                } else {
                    flags |= u64::from(*bits);
                }
            }
            None => data.push(option.as_str()),
        }
    }
    (flags, data.join(","))
}

/// Normalizes a path lexically, dropping `.` and resolving `..` without
/// touching the filesystem. The result is always absolute.
#[must_use]
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                let _ = out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Joins a container path onto the rootfs without escaping it.
#[must_use]
pub fn in_rootfs(rootfs: &Path, container_path: &Path) -> PathBuf {
    let cleaned = clean_path(container_path);
    match cleaned.strip_prefix("/") {
        Ok(relative) => rootfs.join(relative),
        Err(_) => rootfs.join(cleaned),
    }
}

/// Rejects destinations inside `/proc` other than the allowed files.
///
/// # Errors
///
/// Returns `Mount` for a forbidden destination.
pub fn check_mount_destination(destination: &Path) -> Result<()> {
    let dest = clean_path(destination);
    if PROC_ALLOWED.iter().any(|allowed| dest == Path::new(allowed)) {
        return Ok(());
    }
    if dest != Path::new("/proc") && dest.starts_with("/proc") {
        return Err(CapsuleError::Mount {
            message: format!("{} cannot be mounted inside /proc", dest.display()),
        });
    }
    Ok(())
}

fn mount_err(what: &str, target: &Path, e: nix::Error) -> CapsuleError {
    CapsuleError::Mount {
        message: format!("{what} {}: {e}", target.display()),
    }
}

/// Mounts one configured mount into the rootfs.
///
/// `MS_RDONLY` is stripped for `/dev` so device nodes can be created; the
/// read-only state is restored later by [`remount_readonly`].
///
/// # Errors
///
/// Returns `Mount` if the destination is forbidden or `mount(2)` fails.
pub fn mount_to_rootfs(m: &Mount, rootfs: &Path) -> Result<()> {
    check_mount_destination(&m.destination)?;
    let dest = in_rootfs(rootfs, &m.destination);

    let mut flags = ms_flags(m.flags);
    let source_is_file = flags.contains(MsFlags::MS_BIND) && Path::new(&m.source).is_file();
    if source_is_file {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CapsuleError::io(parent, e))?;
        }
        if !dest.exists() {
            let _ = std::fs::File::create(&dest).map_err(|e| CapsuleError::io(&dest, e))?;
        }
    } else {
        std::fs::create_dir_all(&dest).map_err(|e| CapsuleError::io(&dest, e))?;
    }

    if clean_path(&m.destination) == Path::new("/dev") {
        flags.remove(MsFlags::MS_RDONLY);
    }
    let data = (!m.data.is_empty()).then_some(m.data.as_str());
    nix::mount::mount(
        Some(m.source.as_str()),
        &dest,
        Some(m.device.as_str()),
        flags,
        data,
    )
    .map_err(|e| mount_err("mount", &dest, e))?;

    // A bind mount ignores MS_RDONLY on the first call.
    if flags.contains(MsFlags::MS_BIND) && flags.contains(MsFlags::MS_RDONLY) {
        nix::mount::mount(
            None::<&str>,
            &dest,
            None::<&str>,
            flags | MsFlags::MS_REMOUNT,
            None::<&str>,
        )
        .map_err(|e| mount_err("remount bind", &dest, e))?;
    }

    tracing::debug!(
        source = %m.source,
        destination = %dest.display(),
        device = %m.device,
        "mounted"
    );
    Ok(())
}

/// Remounts an existing mount point read-only.
///
/// # Errors
///
/// Returns `Mount` if `mount(2)` fails.
pub fn remount_readonly(dest: &Path, flags: u64) -> Result<()> {
    let flags = ms_flags(flags) | MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
    nix::mount::mount(None::<&str>, dest, None::<&str>, flags, None::<&str>)
        .map_err(|e| mount_err("remount read-only", dest, e))?;
    tracing::debug!(path = %dest.display(), "remounted read-only");
    Ok(())
}

/// Remounts the container root read-only.
///
/// # Errors
///
/// Returns `Mount` if `mount(2)` fails.
pub fn set_rootfs_readonly() -> Result<()> {
    nix::mount::mount(
        Some("/"),
        "/",
        Some("bind"),
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err("remount read-only", Path::new("/"), e))?;
    tracing::debug!("rootfs remounted read-only");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn flags_and_data_are_separated() {
        let (flags, data) = parse_mount_options(&opts(&["nosuid", "strictatime", "mode=755", "size=65536k"]));
        assert_eq!(flags, u64::from(libc::MS_NOSUID | libc::MS_STRICTATIME));
        assert_eq!(data, "mode=755,size=65536k");
    }

    #[test]
    fn clearing_options_undo_earlier_ones() {
        let (flags, _) = parse_mount_options(&opts(&["ro", "nodev", "rw"]));
        assert_eq!(flags, u64::from(libc::MS_NODEV));
    }

    #[test]
    fn rbind_sets_recursive_bind() {
        let (flags, data) = parse_mount_options(&opts(&["rbind", "defaults"]));
        assert!(ms_flags(flags).contains(MsFlags::MS_BIND | MsFlags::MS_REC));
        assert!(data.is_empty());
    }

    #[test]
    fn clean_path_cannot_escape_root() {
        assert_eq!(clean_path(Path::new("/dev/../../etc")), PathBuf::from("/etc"));
        assert_eq!(clean_path(Path::new("dev/./pts")), PathBuf::from("/dev/pts"));
        assert_eq!(
            in_rootfs(Path::new("/tmp/r"), Path::new("/../../etc/passwd")),
            PathBuf::from("/tmp/r/etc/passwd")
        );
    }

    #[test]
    fn proc_subpaths_are_restricted() {
        assert!(check_mount_destination(Path::new("/proc")).is_ok());
        assert!(check_mount_destination(Path::new("/proc/meminfo")).is_ok());
        assert!(check_mount_destination(Path::new("/proc/sys")).is_err());
        assert!(check_mount_destination(Path::new("/procfs")).is_ok());
    }
}
