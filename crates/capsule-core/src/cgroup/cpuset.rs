//! CPU pinning via `cpuset.cpus`.
//!
//! A cpuset cgroup refuses tasks until both `cpuset.cpus` and
//! `cpuset.mems` are populated, so every newly created level inherits the
//! values of its parent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use capsule_common::config::CgroupConfig;
use capsule_common::error::{CapsuleError, Result};

use super::{Subsystem, add_pid, write_config_entry};

const CPUS_FILE: &str = "cpuset.cpus";
const MEMS_FILE: &str = "cpuset.mems";

/// The `cpuset` hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpusetSubsystem;

fn read_trimmed(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s.trim().to_owned()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(CapsuleError::io(path, e)),
    }
}

fn inherit_from_parent(parent: &Path, dir: &Path) -> Result<()> {
    for file in [CPUS_FILE, MEMS_FILE] {
        if read_trimmed(&dir.join(file))?.is_empty() {
            let value = read_trimmed(&parent.join(file))?;
            if !value.is_empty() {
                write_config_entry(dir, file, &value)?;
            }
        }
    }
    Ok(())
}

/// Creates `root/cgroup_name` level by level, seeding each new level's
/// cpus and mems from its parent.
///
/// # Errors
///
/// Returns `Io` on directory or file failures.
pub fn create_cpuset_dir(root: &Path, cgroup_name: &str) -> Result<PathBuf> {
    let mut current = root.to_path_buf();
    for component in Path::new(cgroup_name).components() {
        let next = current.join(component);
        match std::fs::create_dir(&next) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(CapsuleError::io(&next, e)),
        }
        inherit_from_parent(&current, &next)?;
        current = next;
    }
    Ok(current)
}

impl Subsystem for CpusetSubsystem {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn join(&self, root: &Path, cgroup_name: &str, pid: i32) -> Result<PathBuf> {
        let path = create_cpuset_dir(root, cgroup_name)?;
        add_pid(&path, pid)?;
        Ok(path)
    }

    fn set_config(&self, path: &Path, config: &CgroupConfig) -> Result<()> {
        if config.cpuset_cpus.is_empty() {
            return Ok(());
        }
        write_config_entry(path, CPUS_FILE, &config.cpuset_cpus)?;
        tracing::debug!(cpus = %config.cpuset_cpus, "cpuset set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_levels_inherit_parent_values() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::write(root.path().join(CPUS_FILE), "0-7\n").unwrap();
        std::fs::write(root.path().join(MEMS_FILE), "0\n").unwrap();

        let path = create_cpuset_dir(root.path(), "capsule/web").expect("create");
        assert_eq!(read_trimmed(&path.join(CPUS_FILE)).unwrap(), "0-7");
        assert_eq!(read_trimmed(&path.join(MEMS_FILE)).unwrap(), "0");
        assert_eq!(
            read_trimmed(&root.path().join("capsule").join(MEMS_FILE)).unwrap(),
            "0"
        );
    }

    #[test]
    fn configured_cpus_override_inherited() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CgroupConfig {
            cpuset_cpus: "1,3".into(),
            ..CgroupConfig::default()
        };
        CpusetSubsystem.set_config(dir.path(), &config).expect("set");
        assert_eq!(read_trimmed(&dir.path().join(CPUS_FILE)).unwrap(), "1,3");
    }
}
