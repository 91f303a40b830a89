//! Cgroups v1 resource management.
//!
//! Each subsystem (cpu, memory, cpuset, freezer) is mounted as its own
//! hierarchy. A container gets one directory named `<parent>/<id>` under
//! every hierarchy; [`CgroupManager`] keeps the resulting paths.

pub mod cpu;
pub mod cpuset;
pub mod freezer;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use capsule_common::config::CgroupConfig;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::FreezerState;

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";
const PROCS_FILE: &str = "cgroup.procs";

/// One resource facet of a cgroup.
///
/// Generic directory and membership handling lives in the free functions
/// of this module; implementations only decide which control files to
/// write.
pub trait Subsystem: Send + Sync {
    /// Hierarchy name as it appears in the mount options.
    fn name(&self) -> &'static str;

    /// Creates (if needed) the cgroup directory under `root` and adds `pid`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory or `cgroup.procs` cannot be written.
    fn join(&self, root: &Path, cgroup_name: &str, pid: i32) -> Result<PathBuf> {
        join_cgroup(root, cgroup_name, pid)
    }

    /// Removes the cgroup directory.
    ///
    /// # Errors
    ///
    /// Returns `Cgroups` if the directory still has tasks.
    fn remove(&self, path: &Path) -> Result<()> {
        remove_cgroup(path)
    }

    /// Writes this subsystem's settings from `config` into `path`.
    /// Unset values are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a control file cannot be written.
    fn set_config(&self, path: &Path, config: &CgroupConfig) -> Result<()>;
}

/// All subsystems managed for a container.
#[must_use]
pub fn subsystems() -> Vec<Box<dyn Subsystem>> {
    vec![
        Box::new(cpu::CpuSubsystem),
        Box::new(memory::MemorySubsystem),
        Box::new(cpuset::CpusetSubsystem),
        Box::new(freezer::FreezerSubsystem),
    ]
}

/// Finds the mount point of a v1 hierarchy in mountinfo contents.
///
/// Matches the first entry whose super options (the last field) list
/// `subsystem`. The mount point is the fifth field.
#[must_use]
pub fn parse_mountpoint(mountinfo: &str, subsystem: &str) -> Option<PathBuf> {
    mountinfo.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let options = fields.last()?;
        if options.split(',').any(|opt| opt == subsystem) {
            fields.get(4).map(PathBuf::from)
        } else {
            None
        }
    })
}

/// Looks up the mount point of a hierarchy in `/proc/self/mountinfo`.
///
/// # Errors
///
/// Returns `Cgroups` if the hierarchy is not mounted.
pub fn subsystem_root(subsystem: &str) -> Result<PathBuf> {
    let contents = std::fs::read_to_string(MOUNTINFO_PATH)
        .map_err(|e| CapsuleError::io(MOUNTINFO_PATH, e))?;
    parse_mountpoint(&contents, subsystem).ok_or_else(|| CapsuleError::Cgroups {
        message: format!("mount point of subsystem {subsystem} not found"),
    })
}

/// Creates `root/cgroup_name` and all missing parents.
///
/// # Errors
///
/// Returns `Io` if the directory cannot be created.
pub fn create_cgroup_dir(root: &Path, cgroup_name: &str) -> Result<PathBuf> {
    let path = root.join(cgroup_name);
    std::fs::create_dir_all(&path).map_err(|e| CapsuleError::io(&path, e))?;
    Ok(path)
}

/// Writes `pid` into the cgroup's `cgroup.procs`.
///
/// # Errors
///
/// Returns `Io` if the write fails.
pub fn add_pid(path: &Path, pid: i32) -> Result<()> {
    write_config_entry(path, PROCS_FILE, &pid.to_string())
}

/// Creates the cgroup directory and moves `pid` into it.
///
/// # Errors
///
/// Returns `Io` if the directory or `cgroup.procs` cannot be written.
pub fn join_cgroup(root: &Path, cgroup_name: &str, pid: i32) -> Result<PathBuf> {
    let path = create_cgroup_dir(root, cgroup_name)?;
    add_pid(&path, pid)?;
    Ok(path)
}

/// Removes a cgroup directory. A directory that is already gone is fine.
///
/// # Errors
///
/// Returns `Cgroups` if `rmdir` fails, typically because tasks remain.
pub fn remove_cgroup(path: &Path) -> Result<()> {
    match std::fs::remove_dir(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "cgroup removed");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CapsuleError::Cgroups {
            message: format!("remove {}: {e}", path.display()),
        }),
    }
}

/// Writes one control file of a cgroup.
///
/// # Errors
///
/// Returns `Io` if the write fails.
pub fn write_config_entry(path: &Path, file: &str, value: &str) -> Result<()> {
    let target = path.join(file);
    std::fs::write(&target, value).map_err(|e| CapsuleError::io(&target, e))?;
    tracing::debug!(path = %target.display(), value, "cgroup entry written");
    Ok(())
}

/// Reads one control file of a cgroup, trimmed.
///
/// # Errors
///
/// Returns `Io` if the read fails.
pub fn read_config_entry(path: &Path, file: &str) -> Result<String> {
    let target = path.join(file);
    std::fs::read_to_string(&target)
        .map(|s| s.trim().to_owned())
        .map_err(|e| CapsuleError::io(&target, e))
}

/// Owns the cgroup directories of one container.
pub struct CgroupManager {
    cgroup_name: String,
    config: CgroupConfig,
    paths: BTreeMap<String, PathBuf>,
    mount_root: Option<PathBuf>,
    subsystems: Vec<Box<dyn Subsystem>>,
}

impl std::fmt::Debug for CgroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgroupManager")
            .field("cgroup_name", &self.cgroup_name)
            .field("config", &self.config)
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl CgroupManager {
    /// Creates a manager for `cgroup_name` (relative to each hierarchy
    /// root). No directory is touched until [`apply`](Self::apply).
    #[must_use]
    pub fn new(cgroup_name: impl Into<String>, config: CgroupConfig) -> Self {
        Self {
            cgroup_name: cgroup_name.into(),
            config,
            paths: BTreeMap::new(),
            mount_root: None,
            subsystems: subsystems(),
        }
    }

    /// Rebuilds a manager from persisted subsystem paths.
    #[must_use]
    pub fn from_paths(
        cgroup_name: impl Into<String>,
        config: CgroupConfig,
        paths: BTreeMap<String, PathBuf>,
    ) -> Self {
        Self {
            paths,
            ..Self::new(cgroup_name, config)
        }
    }

    /// Resolves hierarchies as `<root>/<subsystem>` instead of reading
    /// mountinfo.
    #[must_use]
    pub fn with_mount_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.mount_root = Some(root.into());
        self
    }

    fn hierarchy_root(&self, subsystem: &str) -> Result<PathBuf> {
        match &self.mount_root {
            Some(root) => Ok(root.join(subsystem)),
            None => subsystem_root(subsystem),
        }
    }

    /// Name of the container's cgroup relative to each hierarchy root.
    #[must_use]
    pub fn cgroup_name(&self) -> &str {
        &self.cgroup_name
    }

    /// Resource settings last applied.
    #[must_use]
    pub const fn config(&self) -> &CgroupConfig {
        &self.config
    }

    /// Subsystem name to absolute cgroup directory.
    #[must_use]
    pub const fn paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.paths
    }

    /// Creates the cgroup in every hierarchy and moves `pid` into it.
    ///
    /// # Errors
    ///
    /// Returns the first subsystem failure. Paths joined before the failure
    /// are kept so [`destroy`](Self::destroy) can remove them.
    pub fn apply(&mut self, pid: i32) -> Result<()> {
        for subsystem in &self.subsystems {
            let root = self.hierarchy_root(subsystem.name())?;
            let path = subsystem.join(&root, &self.cgroup_name, pid)?;
            let _ = self.paths.insert(subsystem.name().to_owned(), path);
        }
        tracing::info!(cgroup = %self.cgroup_name, pid, "cgroups applied");
        Ok(())
    }

    /// Writes resource settings into every joined subsystem.
    ///
    /// Writes are not transactional: on error some limits may already be in
    /// place and the container must be torn down.
    ///
    /// # Errors
    ///
    /// Returns the first subsystem failure.
    pub fn set(&mut self, config: &CgroupConfig) -> Result<()> {
        for subsystem in &self.subsystems {
            if let Some(path) = self.paths.get(subsystem.name()) {
                subsystem.set_config(path, config)?;
            }
        }
        self.config = config.clone();
        tracing::info!(cgroup = %self.cgroup_name, "cgroup config set");
        Ok(())
    }

    /// Pids of every task in the container's cgroups, sorted.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a `cgroup.procs` file cannot be read.
    pub fn get_all_pids(&self) -> Result<Vec<i32>> {
        let mut pids = BTreeSet::new();
        for path in self.paths.values() {
            match read_config_entry(path, PROCS_FILE) {
                Ok(contents) => {
                    pids.extend(contents.lines().filter_map(|l| l.trim().parse::<i32>().ok()));
                }
                Err(CapsuleError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(pids.into_iter().collect())
    }

    /// Freezes or thaws every task of the container.
    ///
    /// # Errors
    ///
    /// Returns `Cgroups` if the freezer hierarchy was never joined, or `Io`
    /// if the write fails.
    pub fn freeze(&mut self, state: FreezerState) -> Result<()> {
        let path = self
            .paths
            .get(freezer::FreezerSubsystem.name())
            .ok_or_else(|| CapsuleError::Cgroups {
                message: format!("cgroup {} has no freezer path", self.cgroup_name),
            })?;
        freezer::set_state(path, state)?;
        self.config.freezer = Some(state);
        tracing::info!(cgroup = %self.cgroup_name, state = state.as_str(), "freezer state changed");
        Ok(())
    }

    /// Removes every cgroup directory of the container.
    ///
    /// # Errors
    ///
    /// Returns the first removal failure; remaining paths are kept.
    pub fn destroy(&mut self) -> Result<()> {
        for subsystem in &self.subsystems {
            if let Some(path) = self.paths.get(subsystem.name()) {
                subsystem.remove(path)?;
                let _ = self.paths.remove(subsystem.name());
            }
        }
        // Paths from a subsystem this build no longer manages.
        let leftover: Vec<PathBuf> = self.paths.values().cloned().collect();
        for path in leftover {
            remove_cgroup(&path)?;
        }
        self.paths.clear();
        tracing::info!(cgroup = %self.cgroup_name, "cgroups destroyed");
        Ok(())
    }
}
