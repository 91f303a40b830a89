//! A container and its lifecycle operations.
//!
//! Mutable state (cached status, parent handle, attached endpoints) lives
//! behind one per-container lock. Every operation refreshes the cached
//! status from the init process and the not-exec marker before acting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use capsule_common::config::{ContainerConfig, ProcessConfig};
use capsule_common::constants::{DESTROY_POLL_ATTEMPTS, NOT_EXEC_FLAG_FILENAME, POLL_INTERVAL};
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::{ContainerId, FreezerState, Status};
use capsule_core::cgroup::CgroupManager;
use capsule_core::namespace;
use capsule_core::network::Endpoint;
use chrono::{DateTime, Utc};
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;

use crate::initializer::InitializerKind;
use crate::logs;
use crate::parent::launcher::Launcher;
use crate::parent::{
    ExecParentProcess, InitBootstrap, InitParentProcess, Networking, NoChildParentProcess,
    ParentProcess, lock_cgroup,
};
use crate::state::StateStorage;
use crate::status::{Liveness, detect_status, transition};

/// Pid and start time of a container's init process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InitRecord {
    pid: i32,
    start_time: u64,
}

#[derive(Debug)]
struct ContainerInner {
    status: Status,
    parent: Option<Box<dyn ParentProcess>>,
    init: Option<InitRecord>,
    cgroup: Arc<Mutex<CgroupManager>>,
    endpoints: Vec<Endpoint>,
}

/// One container on this host.
#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    root: PathBuf,
    config: ContainerConfig,
    created: DateTime<Utc>,
    networking: Networking,
    inner: Mutex<ContainerInner>,
}

impl Container {
    /// A container that has not been launched yet; its status is Stopped.
    pub(crate) fn new(
        id: ContainerId,
        root: PathBuf,
        config: ContainerConfig,
        networking: Networking,
        cgroup: CgroupManager,
    ) -> Self {
        Self {
            id,
            root,
            config,
            created: Utc::now(),
            networking,
            inner: Mutex::new(ContainerInner {
                status: Status::Stopped,
                parent: None,
                init: None,
                cgroup: Arc::new(Mutex::new(cgroup)),
                endpoints: Vec::new(),
            }),
        }
    }

    /// Rebuilds a container persisted by an earlier invocation. The init
    /// process is tracked through a lookup-only handle.
    pub(crate) fn from_state(
        state: StateStorage,
        root: PathBuf,
        networking: Networking,
        cgroup: CgroupManager,
    ) -> Result<Self> {
        let id = ContainerId::parse(&state.id)?;
        let handle = NoChildParentProcess::new(state.init_process_pid, state.init_process_start_time);
        let status = detect_status(handle.liveness()?, marker_path(&root).exists());
        let parent: Option<Box<dyn ParentProcess>> = match status {
            Status::Stopped => None,
            Status::Created | Status::Running => Some(Box::new(handle)),
        };
        tracing::debug!(id = %id, %status, "container loaded");
        Ok(Self {
            id,
            root,
            config: state.config,
            created: state.create_time,
            networking,
            inner: Mutex::new(ContainerInner {
                status,
                parent,
                init: Some(InitRecord {
                    pid: state.init_process_pid,
                    start_time: state.init_process_start_time,
                }),
                cgroup: Arc::new(Mutex::new(cgroup)),
                endpoints: state.endpoints,
            }),
        })
    }

    /// Container identifier.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Configuration the container was created with.
    #[must_use]
    pub const fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Per-container state directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, ContainerInner>> {
        self.inner.lock().map_err(|_| CapsuleError::System {
            context: format!("lock container {}", self.id),
            source: std::io::Error::other("container state lock poisoned"),
        })
    }

    fn detect(&self, inner: &ContainerInner) -> Result<Status> {
        let Some(parent) = &inner.parent else {
            return Ok(Status::Stopped);
        };
        let (Some(pid), Some(start_time)) = (parent.pid(), parent.start_time()) else {
            return Ok(Status::Stopped);
        };
        let liveness = Liveness::check(pid, start_time)?;
        Ok(detect_status(liveness, marker_path(&self.root).exists()))
    }

    /// Re-derives the status and moves the cache along the table. A
    /// container found Stopped has its exited init process reaped.
    fn refresh(&self, inner: &mut ContainerInner) -> Result<Status> {
        let detected = self.detect(inner)?;
        if detected != inner.status {
            inner.status = transition(self.id.as_str(), inner.status, detected, detected)?;
            tracing::debug!(id = %self.id, status = %inner.status, "status refreshed");
        }
        if inner.status == Status::Stopped {
            if let Some(mut parent) = inner.parent.take() {
                if let Err(e) = parent.wait() {
                    tracing::warn!(id = %self.id, error = %e, "failed to reap init process");
                }
            }
        }
        Ok(inner.status)
    }

    /// Current status, recomputed from the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the init process cannot be inspected.
    pub fn status(&self) -> Result<Status> {
        let mut inner = self.lock_inner()?;
        self.refresh(&mut inner)
    }

    /// Host pid of the init process, while it is alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the init process cannot be inspected.
    pub fn init_pid(&self) -> Result<Option<i32>> {
        let mut inner = self.lock_inner()?;
        let _ = self.refresh(&mut inner)?;
        Ok(inner.parent.as_ref().and_then(|p| p.pid()))
    }

    /// Snapshot of the persistable state.
    ///
    /// # Errors
    ///
    /// Returns an error if the container lock is poisoned.
    pub fn state(&self) -> Result<StateStorage> {
        let inner = self.lock_inner()?;
        self.snapshot(&inner)
    }

    fn snapshot(&self, inner: &ContainerInner) -> Result<StateStorage> {
        let (pid, start_time) = inner.init.map_or((0, 0), |r| (r.pid, r.start_time));
        let namespace_paths: BTreeMap<String, PathBuf> = if pid > 0 {
            namespace::namespace_paths_of(pid, &self.config.namespaces)
                .into_iter()
                .map(|(ty, path)| (ty.ns_name().to_owned(), path))
                .collect()
        } else {
            BTreeMap::new()
        };
        let cgroup_paths = lock_cgroup(&inner.cgroup)?.paths().clone();
        Ok(StateStorage {
            id: self.id.to_string(),
            init_process_pid: pid,
            init_process_start_time: start_time,
            create_time: self.created,
            config: self.config.clone(),
            cgroup_paths,
            namespace_paths,
            endpoints: inner.endpoints.clone(),
        })
    }

    /// Launches the init process and leaves it blocked before the user
    /// command. The container ends up Created.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` unless the container is Stopped
    /// and never launched, or the launch failure after everything it set
    /// up has been torn down.
    pub fn create(&self, mut process: ProcessConfig) -> Result<()> {
        let mut inner = self.lock_inner()?;
        let status = self.refresh(&mut inner)?;
        if status != Status::Stopped || inner.init.is_some() {
            return Err(CapsuleError::InvalidStateTransition {
                from: status.to_string(),
                to: Status::Created.to_string(),
            });
        }
        process.init = true;

        let log_path = process.detach.then(|| logs::init_log_path(&self.root));
        let launcher = Launcher::new(
            InitializerKind::Init,
            self.id.as_str(),
            self.config.clone(),
            process,
            namespace::join_paths(&self.config.namespaces),
            namespace::clone_flags(&self.config.namespaces),
            log_path,
        );
        let bootstrap = InitBootstrap::new(
            Arc::clone(&inner.cgroup),
            self.config.cgroup.clone(),
            self.networking.clone(),
            self.config.endpoints.clone(),
        );
        let mut parent = InitParentProcess::new(launcher, bootstrap);
        parent.start()?;

        let (Some(pid), Some(start_time)) = (parent.pid(), parent.start_time()) else {
            return Err(CapsuleError::System {
                context: format!("create container {}", self.id),
                source: std::io::Error::other("launch finished without a pid"),
            });
        };
        inner.endpoints = parent.endpoints().to_vec();
        inner.init = Some(InitRecord { pid, start_time });
        inner.parent = Some(Box::new(parent));

        if let Err(e) = self.persist_created(&inner) {
            self.teardown(&mut inner);
            inner.init = None;
            return Err(e);
        }
        inner.status = Status::Created;
        tracing::info!(id = %self.id, pid, "container created");
        Ok(())
    }

    fn persist_created(&self, inner: &ContainerInner) -> Result<()> {
        let marker = marker_path(&self.root);
        let _ = std::fs::File::create(&marker).map_err(|e| CapsuleError::io(&marker, e))?;
        self.snapshot(inner)?.save(&self.root)
    }

    /// Releases a Created container's init process into the user command.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` if the container is not Created,
    /// `Io` if the not-exec marker cannot be removed, or `Signal` if the
    /// continue signal cannot be delivered.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        let status = self.refresh(&mut inner)?;
        if status != Status::Created {
            return Err(CapsuleError::InvalidStateTransition {
                from: status.to_string(),
                to: Status::Running.to_string(),
            });
        }
        let parent = inner.parent.as_ref().ok_or_else(|| not_running(&self.id))?;

        // The marker goes first: once signalled, the process must not be
        // reported as Created.
        let marker = marker_path(&self.root);
        match std::fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CapsuleError::io(&marker, e)),
        }
        if let Err(e) = parent.signal(Signal::SIGUSR2) {
            if let Err(restore) = std::fs::File::create(&marker) {
                tracing::warn!(id = %self.id, error = %restore, "failed to restore not-exec marker");
            }
            return Err(e);
        }
        inner.status = transition(self.id.as_str(), status, Status::Running, Status::Running)?;
        tracing::info!(id = %self.id, "container started");
        Ok(())
    }

    /// Runs `process`: an init process is created and started, anything
    /// else is executed in the running container. A foreground process is
    /// waited for and its exit code returned.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub fn run(&self, process: ProcessConfig) -> Result<Option<i32>> {
        if !process.init {
            return self.exec(process);
        }
        let detach = process.detach;
        self.create(process)?;
        self.start()?;
        if detach {
            return Ok(None);
        }
        self.wait()
    }

    /// Waits for the init process to exit and returns its exit code. A
    /// container loaded from disk is polled until the process is gone and
    /// has no code to report.
    ///
    /// # Errors
    ///
    /// Returns `System` if waiting fails.
    pub fn wait(&self) -> Result<Option<i32>> {
        let mut inner = self.lock_inner()?;
        let code = match inner.parent.as_mut() {
            Some(parent) => parent.wait()?,
            None => None,
        };
        let status = self.refresh(&mut inner)?;
        tracing::info!(id = %self.id, ?code, %status, "init process exited");
        Ok(code)
    }

    /// Executes an additional process inside every namespace of the
    /// running init process.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the container is not running, or the
    /// launch failure.
    pub fn exec(&self, mut process: ProcessConfig) -> Result<Option<i32>> {
        let mut parent = {
            let mut inner = self.lock_inner()?;
            if self.refresh(&mut inner)? != Status::Running {
                return Err(not_running(&self.id));
            }
            let pid = inner
                .parent
                .as_ref()
                .and_then(|p| p.pid())
                .ok_or_else(|| not_running(&self.id))?;

            process.init = false;
            if process.id.is_empty() {
                process.id = ContainerId::generate().to_string();
            }
            let join_paths: Vec<PathBuf> =
                namespace::namespace_paths_of(pid, &self.config.namespaces)
                    .into_iter()
                    .map(|(_, path)| path)
                    .collect();
            let log_path = process
                .detach
                .then(|| logs::exec_log_path(&self.root, &process.id));
            let exec_id = process.id.clone();
            let launcher = Launcher::new(
                InitializerKind::Exec,
                self.id.as_str(),
                self.config.clone(),
                process,
                join_paths,
                CloneFlags::empty(),
                log_path,
            );
            let mut parent = ExecParentProcess::new(launcher);
            parent.start()?;
            parent.signal(Signal::SIGUSR2)?;
            tracing::info!(id = %self.id, exec = %exec_id, pid = ?parent.pid(), "exec process started");
            parent
        };

        if parent.detach() {
            return Ok(None);
        }
        parent.wait()
    }

    /// Sends `signal` to the init process.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if there is no live init process, or
    /// `Signal` if delivery fails.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let mut inner = self.lock_inner()?;
        let _ = self.refresh(&mut inner)?;
        let parent = inner.parent.as_ref().ok_or_else(|| not_running(&self.id))?;
        parent.signal(signal)?;
        tracing::info!(id = %self.id, %signal, "signal delivered");
        Ok(())
    }

    /// Destroys the container and releases every resource it holds.
    ///
    /// A Created container is killed first and polled until its init
    /// process is gone.
    ///
    /// # Errors
    ///
    /// Returns `ContainerStillRunning` for a Running container, a
    /// `System` error if a killed init process does not go away in time,
    /// or the failure to remove the container root.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        match self.refresh(&mut inner)? {
            Status::Running => {
                return Err(CapsuleError::ContainerStillRunning {
                    id: self.id.to_string(),
                });
            }
            Status::Created => self.kill_created(&mut inner)?,
            Status::Stopped => {}
        }
        self.teardown(&mut inner);
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CapsuleError::io(&self.root, e)),
        }
        inner.status = Status::Stopped;
        tracing::info!(id = %self.id, "container destroyed");
        Ok(())
    }

    fn kill_created(&self, inner: &mut ContainerInner) -> Result<()> {
        if let Some(parent) = &inner.parent {
            if let Err(e) = parent.signal(Signal::SIGKILL) {
                tracing::debug!(id = %self.id, error = %e, "SIGKILL not delivered");
            }
        }
        for attempt in 0..DESTROY_POLL_ATTEMPTS {
            std::thread::sleep(POLL_INTERVAL);
            if self.refresh(inner)? == Status::Stopped {
                tracing::debug!(id = %self.id, attempt, "init process gone");
                return Ok(());
            }
        }
        Err(CapsuleError::System {
            context: format!("destroy container {}", self.id),
            source: std::io::Error::other("container init still running"),
        })
    }

    /// Best-effort release of the process, endpoints and cgroups.
    fn teardown(&self, inner: &mut ContainerInner) {
        if let Some(mut parent) = inner.parent.take() {
            if let Err(e) = parent.terminate() {
                tracing::debug!(id = %self.id, error = %e, "init process not terminated");
            }
        }
        self.networking.disconnect_all(&inner.endpoints);
        inner.endpoints.clear();
        match lock_cgroup(&inner.cgroup) {
            Ok(mut cgroup) => {
                if let Err(e) = cgroup.destroy() {
                    tracing::warn!(id = %self.id, error = %e, "failed to remove cgroups");
                }
            }
            Err(e) => tracing::warn!(id = %self.id, error = %e, "cgroups left behind"),
        }
    }

    /// Pids of every task in the container's cgroups.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup task lists cannot be read.
    pub fn processes(&self) -> Result<Vec<i32>> {
        let inner = self.lock_inner()?;
        let cgroup = lock_cgroup(&inner.cgroup)?;
        cgroup.get_all_pids()
    }

    /// Freezes every task of a running container.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the container is not running, or the
    /// freezer failure.
    pub fn pause(&self) -> Result<()> {
        self.set_freezer(FreezerState::Frozen)
    }

    /// Thaws a paused container.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the container is not running, or the
    /// freezer failure.
    pub fn resume(&self) -> Result<()> {
        self.set_freezer(FreezerState::Thawed)
    }

    fn set_freezer(&self, state: FreezerState) -> Result<()> {
        let mut inner = self.lock_inner()?;
        if self.refresh(&mut inner)? != Status::Running {
            return Err(not_running(&self.id));
        }
        let mut cgroup = lock_cgroup(&inner.cgroup)?;
        cgroup.freeze(state)
    }
}

fn marker_path(root: &Path) -> PathBuf {
    root.join(NOT_EXEC_FLAG_FILENAME)
}

fn not_running(id: &ContainerId) -> CapsuleError {
    CapsuleError::ConfigInvalid {
        message: format!("container {id} is not running"),
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command};

    use capsule_common::error::ErrorKind;
    use capsule_core::network::ipam::Ipam;
    use capsule_core::proc::ProcessStat;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        networking: Networking,
        cgroup_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("containers").join("c1");
        std::fs::create_dir_all(&root).expect("container root");
        let ipam = Ipam::load(dir.path().join("ipam.json")).expect("ipam");
        let networking = Networking::new(dir.path().join("networks"), Arc::new(ipam));
        let cgroup_root = dir.path().join("cgroup");
        Fixture {
            root,
            networking,
            cgroup_root,
            _dir: dir,
        }
    }

    fn cgroup(fx: &Fixture) -> CgroupManager {
        CgroupManager::new("capsule/c1", capsule_common::config::CgroupConfig::default())
            .with_mount_root(&fx.cgroup_root)
    }

    fn spawn_sleeper() -> (Child, StateStorage) {
        let child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = i32::try_from(child.id()).unwrap();
        let start_time = ProcessStat::read(pid).unwrap().unwrap().start_time;
        let state = StateStorage {
            id: "c1".into(),
            init_process_pid: pid,
            init_process_start_time: start_time,
            create_time: Utc::now(),
            config: ContainerConfig::default(),
            cgroup_paths: BTreeMap::new(),
            namespace_paths: BTreeMap::new(),
            endpoints: Vec::new(),
        };
        (child, state)
    }

    #[test]
    fn new_container_is_stopped_with_empty_state() {
        let fx = fixture();
        let container = Container::new(
            ContainerId::new("c1"),
            fx.root.clone(),
            ContainerConfig::default(),
            fx.networking.clone(),
            cgroup(&fx),
        );
        assert_eq!(container.status().unwrap(), Status::Stopped);
        let state = container.state().unwrap();
        assert_eq!(state.init_process_pid, 0);
        assert!(state.namespace_paths.is_empty());
    }

    #[test]
    fn stopped_container_refuses_start_signal_and_exec() {
        let fx = fixture();
        let container = Container::new(
            ContainerId::new("c1"),
            fx.root.clone(),
            ContainerConfig::default(),
            fx.networking.clone(),
            cgroup(&fx),
        );
        let err = container.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
        let err = container.signal(Signal::SIGTERM).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        let err = container.exec(ProcessConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn loaded_status_follows_marker() {
        let fx = fixture();
        let (mut child, state) = spawn_sleeper();

        std::fs::write(marker_path(&fx.root), "").unwrap();
        let created =
            Container::from_state(state.clone(), fx.root.clone(), fx.networking.clone(), cgroup(&fx))
                .unwrap();
        assert_eq!(created.status().unwrap(), Status::Created);
        // Refreshing again without host changes gives the same answer.
        assert_eq!(created.status().unwrap(), Status::Created);

        std::fs::remove_file(marker_path(&fx.root)).unwrap();
        let running =
            Container::from_state(state, fx.root.clone(), fx.networking.clone(), cgroup(&fx))
                .unwrap();
        assert_eq!(running.status().unwrap(), Status::Running);
        assert_eq!(running.init_pid().unwrap(), Some(i32::try_from(child.id()).unwrap()));

        let err = running.destroy().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerStillRunning);
        assert!(fx.root.exists());

        child.kill().unwrap();
        let _ = child.wait().unwrap();
        assert_eq!(running.status().unwrap(), Status::Stopped);
    }

    #[test]
    fn start_keeps_created_when_marker_cannot_be_removed() {
        let fx = fixture();
        let (mut child, state) = spawn_sleeper();
        let marker = marker_path(&fx.root);
        std::fs::create_dir_all(marker.join("pinned")).unwrap();
        let container =
            Container::from_state(state, fx.root.clone(), fx.networking.clone(), cgroup(&fx))
                .unwrap();
        assert_eq!(container.status().unwrap(), Status::Created);

        let err = container.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(container.status().unwrap(), Status::Created);
        assert!(child.try_wait().unwrap().is_none());

        child.kill().unwrap();
        let _ = child.wait().unwrap();
    }

    #[test]
    fn start_clears_marker_and_releases_process() {
        let fx = fixture();
        let (mut child, state) = spawn_sleeper();
        std::fs::write(marker_path(&fx.root), "").unwrap();
        let container =
            Container::from_state(state, fx.root.clone(), fx.networking.clone(), cgroup(&fx))
                .unwrap();

        container.start().expect("start");
        assert!(!marker_path(&fx.root).exists());
        // `sleep` has no SIGUSR2 handler, so the continue signal ends it.
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn destroying_created_container_kills_and_removes_root() {
        let fx = fixture();
        let (mut child, state) = spawn_sleeper();
        std::fs::write(marker_path(&fx.root), "").unwrap();
        std::fs::create_dir_all(fx.cgroup_root.join("memory/capsule/c1")).unwrap();

        let manager = CgroupManager::from_paths(
            "capsule/c1",
            capsule_common::config::CgroupConfig::default(),
            BTreeMap::from([(
                "memory".to_owned(),
                fx.cgroup_root.join("memory/capsule/c1"),
            )]),
        );
        let container =
            Container::from_state(state, fx.root.clone(), fx.networking.clone(), manager).unwrap();
        assert_eq!(container.status().unwrap(), Status::Created);

        container.destroy().expect("destroy");
        assert!(!fx.root.exists());
        assert!(!fx.cgroup_root.join("memory/capsule/c1").exists());
        assert_eq!(container.status().unwrap(), Status::Stopped);
        let _ = child.wait().unwrap();
    }

    #[test]
    fn stale_pid_loads_as_stopped() {
        let fx = fixture();
        let (mut child, mut state) = spawn_sleeper();
        state.init_process_start_time += 1;
        let container =
            Container::from_state(state, fx.root.clone(), fx.networking.clone(), cgroup(&fx))
                .unwrap();
        assert_eq!(container.status().unwrap(), Status::Stopped);
        assert_eq!(container.init_pid().unwrap(), None);

        container.destroy().expect("destroy stopped");
        assert!(!fx.root.exists());
        child.kill().unwrap();
        let _ = child.wait().unwrap();
    }
}
