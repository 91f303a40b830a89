//! Persistent container state.
//!
//! Each container keeps one JSON record at
//! `<root>/containers/<id>/state.json`. It holds only what a later
//! invocation needs to find the container's processes and resources again;
//! the status itself is always re-derived.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use capsule_common::config::ContainerConfig;
use capsule_common::constants::STATE_FILENAME;
use capsule_common::error::{CapsuleError, Result};
use capsule_core::network::Endpoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a container written after `create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateStorage {
    /// Container identifier.
    pub id: String,
    /// Host pid of the init process.
    pub init_process_pid: i32,
    /// Start time of the init process in clock ticks since boot.
    pub init_process_start_time: u64,
    /// When the container was created.
    pub create_time: DateTime<Utc>,
    /// Configuration the container was created with.
    pub config: ContainerConfig,
    /// Cgroup directory per subsystem.
    #[serde(default)]
    pub cgroup_paths: BTreeMap<String, PathBuf>,
    /// `/proc/<pid>/ns/*` path per namespace name.
    #[serde(default)]
    pub namespace_paths: BTreeMap<String, PathBuf>,
    /// Network endpoints attached to the container.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// Location of the state file inside a container root.
#[must_use]
pub fn state_path(container_root: &Path) -> PathBuf {
    container_root.join(STATE_FILENAME)
}

impl StateStorage {
    /// Writes the record atomically through a temporary file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn save(&self, container_root: &Path) -> Result<()> {
        let path = state_path(container_root);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, json).map_err(|e| CapsuleError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CapsuleError::io(&path, e))?;
        tracing::debug!(id = %self.id, path = %path.display(), "state saved");
        Ok(())
    }

    /// Reads the record of the container rooted at `container_root`.
    ///
    /// # Errors
    ///
    /// Returns `ContainerNotExists` if there is no state file, or an error
    /// if it cannot be read or parsed.
    pub fn load(id: &str, container_root: &Path) -> Result<Self> {
        let path = state_path(container_root);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CapsuleError::ContainerNotExists { id: id.to_owned() });
            }
            Err(e) => return Err(CapsuleError::io(&path, e)),
        };
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use capsule_common::error::ErrorKind;

    use super::*;

    fn sample() -> StateStorage {
        StateStorage {
            id: "web".into(),
            init_process_pid: 4242,
            init_process_start_time: 987_654,
            create_time: Utc::now(),
            config: ContainerConfig {
                rootfs: PathBuf::from("/tmp/rootfs"),
                hostname: "web".into(),
                ..ContainerConfig::default()
            },
            cgroup_paths: BTreeMap::from([(
                "memory".to_owned(),
                PathBuf::from("/sys/fs/cgroup/memory/capsule/web"),
            )]),
            namespace_paths: BTreeMap::from([(
                "net".to_owned(),
                PathBuf::from("/proc/4242/ns/net"),
            )]),
            endpoints: vec![Endpoint {
                id: "web-eth0".into(),
                network: "testbridge".into(),
                ip: Ipv4Addr::new(10, 20, 0, 2),
                mac: "02:42:0a:14:00:02".into(),
                host_veth: "cap-web-h".into(),
                container_veth: "cap-web-c".into(),
                port_mappings: vec!["8080:80".into()],
            }],
        }
    }

    #[test]
    fn save_then_load_restores_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = sample();
        state.save(dir.path()).expect("save");
        assert!(!dir.path().join("state.json.tmp").exists());

        let loaded = StateStorage::load("web", dir.path()).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_state_means_missing_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = StateStorage::load("ghost", dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerNotExists);
    }

    #[test]
    fn corrupt_state_is_a_serialization_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(state_path(dir.path()), "{not json").expect("write");
        let err = StateStorage::load("web", dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn save_overwrites_previous_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = sample();
        state.save(dir.path()).expect("first save");
        state.init_process_pid = 7;
        state.save(dir.path()).expect("second save");
        let loaded = StateStorage::load("web", dir.path()).expect("load");
        assert_eq!(loaded.init_process_pid, 7);
    }
}
