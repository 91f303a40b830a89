//! Filesystem management for container isolation.
//!
//! Provides rootfs preparation inside the container's mount namespace,
//! `pivot_root`, mount utilities, and `OverlayFS` for image-backed rootfs.

pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
pub mod rootfs;
