//! Memory limit control via `memory.limit_in_bytes`.

use std::path::Path;

use capsule_common::config::CgroupConfig;
use capsule_common::error::Result;

use super::{Subsystem, write_config_entry};

/// The `memory` hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySubsystem;

impl Subsystem for MemorySubsystem {
    fn name(&self) -> &'static str {
        "memory"
    }

    /// A limit of 0 means "unset", not "zero bytes": nothing is written.
    fn set_config(&self, path: &Path, config: &CgroupConfig) -> Result<()> {
        if config.memory == 0 {
            return Ok(());
        }
        write_config_entry(path, "memory.limit_in_bytes", &config.memory.to_string())?;
        tracing::debug!(bytes = config.memory, "memory limit set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        MemorySubsystem
            .set_config(dir.path(), &CgroupConfig::default())
            .expect("set");
        assert!(!dir.path().join("memory.limit_in_bytes").exists());
    }

    #[test]
    fn writes_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CgroupConfig {
            memory: 100 * 1024 * 1024,
            ..CgroupConfig::default()
        };
        MemorySubsystem.set_config(dir.path(), &config).expect("set");
        let written = std::fs::read_to_string(dir.path().join("memory.limit_in_bytes")).unwrap();
        assert_eq!(written, "104857600");
    }
}
