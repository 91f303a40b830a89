//! Linux namespace management for container isolation.
//!
//! Namespaces without a path are created by `clone(2)` in the early
//! `nsenter` shim; namespaces with a path are joined with `setns(2)`
//! before that clone.

pub mod network;

use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use capsule_common::config::Namespace;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::NamespaceType;
use nix::sched::CloneFlags;

/// Clone flag creating a new namespace of the given type.
#[must_use]
pub const fn clone_flag(ns_type: NamespaceType) -> CloneFlags {
    match ns_type {
        NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
        NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
        NamespaceType::Net => CloneFlags::CLONE_NEWNET,
        NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
        NamespaceType::Mnt => CloneFlags::CLONE_NEWNS,
    }
}

/// ORs the clone flags of every namespace that has to be created.
#[must_use]
pub fn clone_flags(namespaces: &[Namespace]) -> CloneFlags {
    namespaces
        .iter()
        .filter(|ns| ns.path.is_none())
        .fold(CloneFlags::empty(), |acc, ns| acc | clone_flag(ns.ns_type))
}

/// Paths of namespaces to join, ordered so the mount namespace comes last.
#[must_use]
pub fn join_paths(namespaces: &[Namespace]) -> Vec<PathBuf> {
    NamespaceType::ALL
        .iter()
        .filter_map(|ty| {
            namespaces
                .iter()
                .find(|ns| ns.ns_type == *ty)
                .and_then(|ns| ns.path.clone())
        })
        .collect()
}

/// `/proc/<pid>/ns/<name>` for a namespace type.
#[must_use]
pub fn namespace_path(pid: i32, ns_type: NamespaceType) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/{}", ns_type.ns_name()))
}

/// Namespace paths of a live process for every configured type.
#[must_use]
pub fn namespace_paths_of(pid: i32, namespaces: &[Namespace]) -> Vec<(NamespaceType, PathBuf)> {
    NamespaceType::ALL
        .iter()
        .filter(|ty| namespaces.iter().any(|ns| ns.ns_type == **ty))
        .map(|ty| (*ty, namespace_path(pid, *ty)))
        .collect()
}

/// Moves the calling thread into the namespace at `path`.
///
/// # Errors
///
/// Returns `System` if the file cannot be opened or `setns(2)` fails.
pub fn join(path: &Path) -> Result<()> {
    let file = std::fs::File::open(path).map_err(|e| CapsuleError::io(path, e))?;
    nix::sched::setns(file.as_fd(), CloneFlags::empty())
        .map_err(|e| CapsuleError::system(format!("setns {}", path.display()), e))?;
    tracing::debug!(path = %path.display(), "joined namespace");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(ty: NamespaceType, path: Option<&str>) -> Namespace {
        Namespace {
            ns_type: ty,
            path: path.map(PathBuf::from),
        }
    }

    #[test]
    fn flags_only_cover_created_namespaces() {
        let set = [
            ns(NamespaceType::Pid, None),
            ns(NamespaceType::Net, Some("/proc/1/ns/net")),
            ns(NamespaceType::Mnt, None),
        ];
        let flags = clone_flags(&set);
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn join_paths_put_mount_last() {
        let set = [
            ns(NamespaceType::Mnt, Some("/proc/9/ns/mnt")),
            ns(NamespaceType::Uts, Some("/proc/9/ns/uts")),
            ns(NamespaceType::Ipc, None),
        ];
        let paths = join_paths(&set);
        assert_eq!(
            paths,
            vec![PathBuf::from("/proc/9/ns/uts"), PathBuf::from("/proc/9/ns/mnt")]
        );
    }

    #[test]
    fn namespace_path_uses_proc_name() {
        assert_eq!(
            namespace_path(7, NamespaceType::Mnt),
            PathBuf::from("/proc/7/ns/mnt")
        );
    }
}
