//! # capsule-image
//!
//! Rootfs images for the capsule runtime.
//!
//! An image is a tarball unpacked once into a read-only layer. Containers
//! started from an image get an overlay whose lower directory is that layer.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod hash;
pub mod layer;
pub mod store;
