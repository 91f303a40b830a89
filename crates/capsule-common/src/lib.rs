//! # capsule-common
//!
//! Shared error taxonomy, domain types, runtime configuration, and constants
//! used across the capsule workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and holds the container and process configuration model
//! that the launcher serializes over the sync channel.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
