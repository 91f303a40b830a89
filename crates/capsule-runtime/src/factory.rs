//! Builds and reloads containers under one runtime root.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use capsule_common::config::{ContainerConfig, RuntimeConfig};
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::ContainerId;
use capsule_core::cgroup::CgroupManager;
use capsule_core::network::NetworkDriver;
use capsule_core::network::ipam::Ipam;

use crate::container::Container;
use crate::initializer::Initializer;
use crate::parent::Networking;
use crate::state::StateStorage;

/// Entry point for container management.
///
/// The IPAM allocator is loaded once here and shared with every container
/// and network driver handed out.
#[derive(Debug)]
pub struct Factory {
    runtime: RuntimeConfig,
    ipam: Arc<Ipam>,
    cgroup_root: Option<PathBuf>,
}

impl Factory {
    /// Opens the runtime root, creating the containers directory.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be created, or the allocator
    /// load failure.
    pub fn new(runtime: RuntimeConfig) -> Result<Self> {
        let containers = runtime.containers_dir();
        std::fs::create_dir_all(&containers).map_err(|e| CapsuleError::io(&containers, e))?;
        let ipam = Arc::new(Ipam::load(runtime.ipam_path())?);
        tracing::debug!(root = %runtime.root.display(), "factory initialized");
        Ok(Self {
            runtime,
            ipam,
            cgroup_root: None,
        })
    }

    /// Resolves cgroup hierarchies under `root` instead of the host's
    /// mount table.
    #[must_use]
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = Some(root.into());
        self
    }

    /// Runtime configuration in use.
    #[must_use]
    pub const fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Shared address allocator.
    #[must_use]
    pub fn ipam(&self) -> Arc<Ipam> {
        Arc::clone(&self.ipam)
    }

    fn networking(&self) -> Networking {
        Networking::new(self.runtime.networks_dir(), Arc::clone(&self.ipam))
    }

    /// Bridge driver wired to this runtime's network records.
    ///
    /// # Errors
    ///
    /// Returns `Network` if the driver is unavailable.
    pub fn network_driver(&self) -> Result<Box<dyn NetworkDriver>> {
        self.networking().driver()
    }

    fn cgroup_manager(&self, id: &ContainerId, config: &ContainerConfig) -> CgroupManager {
        let name = format!("{}/{id}", self.runtime.cgroup_parent);
        let manager = CgroupManager::new(name, config.cgroup.clone());
        match &self.cgroup_root {
            Some(root) => manager.with_mount_root(root),
            None => manager,
        }
    }

    /// Registers a new container. Nothing is launched; the container
    /// starts out Stopped.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for a bad id or configuration,
    /// `ContainerIdExists` if the id is taken, or `Io` if the container
    /// root cannot be created.
    pub fn create(&self, id: &str, config: ContainerConfig) -> Result<Container> {
        let id = ContainerId::parse(id)?;
        config.validate()?;
        let root = self.runtime.container_root(id.as_str());
        if root.exists() {
            return Err(CapsuleError::ContainerIdExists { id: id.to_string() });
        }
        std::fs::create_dir_all(&root).map_err(|e| CapsuleError::io(&root, e))?;
        let cgroup = self.cgroup_manager(&id, &config);
        tracing::info!(id = %id, root = %root.display(), "container registered");
        Ok(Container::new(id, root, config, self.networking(), cgroup))
    }

    /// Loads a container created by any runtime invocation.
    ///
    /// # Errors
    ///
    /// Returns `ContainerNotExists` if the container has no root or no
    /// state file.
    pub fn load(&self, id: &str) -> Result<Container> {
        let id = ContainerId::parse(id)?;
        let root = self.runtime.container_root(id.as_str());
        if !root.exists() {
            return Err(CapsuleError::ContainerNotExists { id: id.to_string() });
        }
        let state = StateStorage::load(id.as_str(), &root)?;
        let cgroup = CgroupManager::from_paths(
            format!("{}/{id}", self.runtime.cgroup_parent),
            state.config.cgroup.clone(),
            state.cgroup_paths.clone(),
        );
        Container::from_state(state, root, self.networking(), cgroup)
    }

    /// Whether a container root exists for `id`.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        ContainerId::parse(id).is_ok() && self.runtime.container_root(id).exists()
    }

    /// Ids of every container root, sorted.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the containers directory cannot be listed.
    pub fn ids(&self) -> Result<Vec<String>> {
        let dir = self.runtime.containers_dir();
        let entries = std::fs::read_dir(&dir).map_err(|e| CapsuleError::io(&dir, e))?;
        let mut ids: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Child side of a launch: sets up the container process and execs
    /// the user command. Only returns on failure.
    ///
    /// # Errors
    ///
    /// Returns the setup failure, which has already been reported to the
    /// parent when the channel was still open.
    pub fn start_initialization() -> Result<Infallible> {
        Initializer::from_env()?.run()
    }
}

#[cfg(test)]
mod tests {
    use capsule_common::error::ErrorKind;
    use capsule_common::types::Status;

    use super::*;

    fn factory(dir: &tempfile::TempDir) -> Factory {
        let runtime = RuntimeConfig::with_root(dir.path());
        Factory::new(runtime)
            .expect("factory")
            .with_cgroup_root(dir.path().join("cgroup"))
    }

    fn config(dir: &tempfile::TempDir) -> ContainerConfig {
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).expect("rootfs");
        ContainerConfig {
            rootfs,
            ..ContainerConfig::default()
        }
    }

    #[test]
    fn create_registers_a_stopped_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = factory(&dir);
        let container = factory.create("web", config(&dir)).expect("create");
        assert_eq!(container.id().as_str(), "web");
        assert_eq!(container.status().unwrap(), Status::Stopped);
        assert!(factory.exists("web"));
        assert_eq!(factory.ids().unwrap(), vec!["web"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = factory(&dir);
        let _ = factory.create("web", config(&dir)).expect("create");
        let err = factory.create("web", config(&dir)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerIdExists);
    }

    #[test]
    fn invalid_id_or_config_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = factory(&dir);
        let err = factory.create("../escape", config(&dir)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        let err = factory.create("web", ContainerConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(!factory.exists("web"));
    }

    #[test]
    fn load_of_unknown_container_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = factory(&dir);
        let err = factory.load("ghost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerNotExists);

        // A root without state is not a loadable container either.
        let _ = factory.create("half", config(&dir)).expect("create");
        let err = factory.load("half").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerNotExists);
    }

    #[test]
    fn load_restores_persisted_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = factory(&dir);
        let container = factory.create("web", config(&dir)).expect("create");
        let mut state = container.state().expect("state");
        state.init_process_pid = i32::MAX;
        state.init_process_start_time = 1;
        state.save(container.root()).expect("save");

        let loaded = factory.load("web").expect("load");
        assert_eq!(loaded.config(), container.config());
        assert_eq!(loaded.status().unwrap(), Status::Stopped);
        loaded.destroy().expect("destroy");
        assert!(!factory.exists("web"));
    }
}
