//! # capsule-core
//!
//! Linux isolation primitives for the capsule runtime.
//!
//! - **Namespaces**: clone flags, joining by path, and work inside another
//!   process's network namespace.
//! - **Cgroups v1**: cpu, memory, cpuset and freezer subsystems behind one
//!   manager.
//! - **Filesystem**: mount option parsing, rootfs preparation, `pivot_root`
//!   and `OverlayFS`.
//! - **Launch plumbing**: the sync-channel codec and the namespace-entry
//!   shim that runs first in a re-executed `init` process.
//! - **Networking**: bridge driver and IPv4 address management.
//!
//! Unsafe system calls are wrapped with `// SAFETY:` notes.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(not(target_os = "linux"))]
compile_error!("capsule-core only supports Linux");

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod network;
pub mod nsenter;
pub mod proc;
pub mod sync;
