//! The container's first process.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use capsule_common::config::{CgroupConfig, EndpointConfig};
use capsule_common::constants::BRIDGE_DRIVER;
use capsule_common::error::{CapsuleError, Result};
use capsule_core::cgroup::CgroupManager;
use capsule_core::network::ipam::Ipam;
use capsule_core::network::{Endpoint, NetworkDriver, driver_by_name};
use nix::sys::signal::Signal;

use super::launcher::Launcher;
use super::{Bootstrap, ParentProcess, kill_and_reap, send_signal, wait_child};

/// Network state shared by every container of a runtime invocation.
#[derive(Debug, Clone)]
pub struct Networking {
    networks_dir: PathBuf,
    ipam: Arc<Ipam>,
}

impl Networking {
    /// Bundles the network record directory with the shared allocator.
    #[must_use]
    pub const fn new(networks_dir: PathBuf, ipam: Arc<Ipam>) -> Self {
        Self { networks_dir, ipam }
    }

    /// Driver handling container endpoints.
    ///
    /// # Errors
    ///
    /// Returns `Network` for an unknown driver.
    pub fn driver(&self) -> Result<Box<dyn NetworkDriver>> {
        driver_by_name(BRIDGE_DRIVER, self.networks_dir.clone(), Arc::clone(&self.ipam))
    }

    /// Detaches endpoints, logging failures instead of stopping at them.
    pub fn disconnect_all(&self, endpoints: &[Endpoint]) {
        if endpoints.is_empty() {
            return;
        }
        let driver = match self.driver() {
            Ok(driver) => driver,
            Err(e) => {
                tracing::warn!(error = %e, "no network driver for endpoint cleanup");
                return;
            }
        };
        for endpoint in endpoints {
            if let Err(e) = driver.disconnect(endpoint) {
                tracing::warn!(endpoint = %endpoint.id, error = %e, "failed to disconnect endpoint");
            }
        }
    }
}

/// Locks a shared cgroup manager.
///
/// # Errors
///
/// Returns `Cgroups` if the lock is poisoned.
pub fn lock_cgroup(cgroup: &Mutex<CgroupManager>) -> Result<MutexGuard<'_, CgroupManager>> {
    cgroup.lock().map_err(|_| CapsuleError::Cgroups {
        message: "cgroup manager lock poisoned".into(),
    })
}

/// Places the new process in its cgroups and attaches its networks.
#[derive(Debug)]
pub struct InitBootstrap {
    cgroup: Arc<Mutex<CgroupManager>>,
    resources: CgroupConfig,
    networking: Networking,
    endpoint_configs: Vec<EndpointConfig>,
    connected: Vec<Endpoint>,
}

impl InitBootstrap {
    /// Bootstrap for a container with the given resources and endpoints.
    #[must_use]
    pub const fn new(
        cgroup: Arc<Mutex<CgroupManager>>,
        resources: CgroupConfig,
        networking: Networking,
        endpoint_configs: Vec<EndpointConfig>,
    ) -> Self {
        Self {
            cgroup,
            resources,
            networking,
            endpoint_configs,
            connected: Vec::new(),
        }
    }
}

impl Bootstrap for InitBootstrap {
    fn bootstrap(&mut self, pid: i32) -> Result<()> {
        {
            let mut cgroup = lock_cgroup(&self.cgroup)?;
            cgroup.apply(pid)?;
            cgroup.set(&self.resources)?;
        }
        if self.endpoint_configs.is_empty() {
            return Ok(());
        }
        let driver = self.networking.driver()?;
        for config in &self.endpoint_configs {
            let endpoint = driver.connect(config, pid)?;
            self.connected.push(endpoint);
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.networking.disconnect_all(&self.connected);
        self.connected.clear();
        match lock_cgroup(&self.cgroup) {
            Ok(mut cgroup) => {
                if let Err(e) = cgroup.destroy() {
                    tracing::warn!(error = %e, "failed to remove cgroups of failed launch");
                }
            }
            Err(e) => tracing::warn!(error = %e, "cgroups of failed launch left behind"),
        }
    }
}

/// Handle on a container's init process, a direct child of this runtime.
#[derive(Debug)]
pub struct InitParentProcess {
    launcher: Launcher,
    bootstrap: InitBootstrap,
    exit_code: Option<Option<i32>>,
}

impl InitParentProcess {
    /// Wraps a launcher and the bootstrap run during its handshake.
    #[must_use]
    pub const fn new(launcher: Launcher, bootstrap: InitBootstrap) -> Self {
        Self {
            launcher,
            bootstrap,
            exit_code: None,
        }
    }

    /// Endpoints attached during the launch.
    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.bootstrap.connected
    }

    fn require_pid(&self) -> Result<i32> {
        self.launcher.pid().ok_or_else(|| CapsuleError::Signal {
            message: "init process has not been started".into(),
        })
    }
}

impl ParentProcess for InitParentProcess {
    fn pid(&self) -> Option<i32> {
        self.launcher.pid()
    }

    fn start(&mut self) -> Result<()> {
        self.launcher.launch(&mut self.bootstrap)
    }

    fn wait(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let code = wait_child(self.require_pid()?)?;
        self.exit_code = Some(code);
        Ok(code)
    }

    fn terminate(&mut self) -> Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        kill_and_reap(self.require_pid()?)
    }

    fn start_time(&self) -> Option<u64> {
        self.launcher.start_time()
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        send_signal(self.require_pid()?, signal)
    }

    fn detach(&self) -> bool {
        self.launcher.detach()
    }
}
