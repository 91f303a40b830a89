//! CPU weight control via `cpu.shares`.

use std::path::Path;

use capsule_common::config::CgroupConfig;
use capsule_common::error::Result;

use super::{Subsystem, write_config_entry};

/// The `cpu` hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuSubsystem;

impl Subsystem for CpuSubsystem {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn set_config(&self, path: &Path, config: &CgroupConfig) -> Result<()> {
        if config.cpu_shares == 0 {
            return Ok(());
        }
        write_config_entry(path, "cpu.shares", &config.cpu_shares.to_string())?;
        tracing::debug!(shares = config.cpu_shares, "CPU shares set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_shares() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CgroupConfig {
            cpu_shares: 10,
            ..CgroupConfig::default()
        };
        CpuSubsystem.set_config(dir.path(), &config).expect("set");
        let written = std::fs::read_to_string(dir.path().join("cpu.shares")).unwrap();
        assert_eq!(written, "10");
    }
}
