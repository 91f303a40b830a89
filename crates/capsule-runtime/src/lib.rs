//! Container lifecycle management for the capsule runtime.
//!
//! A [`factory::Factory`] registers and reloads [`container::Container`]s.
//! Launching a container re-executes this binary as `init`; the parent side
//! lives in [`parent`], the container side in [`initializer`].

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bundle;
pub mod container;
pub mod factory;
pub mod initializer;
pub mod logs;
pub mod parent;
pub mod state;
pub mod status;
