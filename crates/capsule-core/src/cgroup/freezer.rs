//! Task freezing via `freezer.state`.

use std::path::Path;

use capsule_common::config::CgroupConfig;
use capsule_common::error::Result;
use capsule_common::types::FreezerState;

use super::{Subsystem, write_config_entry};

/// The `freezer` hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreezerSubsystem;

/// Writes the freezer state of a cgroup.
///
/// # Errors
///
/// Returns `Io` if the write fails.
pub fn set_state(path: &Path, state: FreezerState) -> Result<()> {
    write_config_entry(path, "freezer.state", state.as_str())
}

impl Subsystem for FreezerSubsystem {
    fn name(&self) -> &'static str {
        "freezer"
    }

    fn set_config(&self, path: &Path, config: &CgroupConfig) -> Result<()> {
        match config.freezer {
            Some(state) => set_state(path, state),
            None => Ok(()),
        }
    }
}
