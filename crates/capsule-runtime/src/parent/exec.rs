//! Additional processes joined into a running container.

use capsule_common::error::{CapsuleError, Result};
use nix::sys::signal::Signal;

use super::launcher::Launcher;
use super::{NoBootstrap, ParentProcess, kill_and_reap, send_signal, wait_child};

/// Handle on an exec process. It joins every namespace of the init
/// process and touches neither cgroups nor networks.
#[derive(Debug)]
pub struct ExecParentProcess {
    launcher: Launcher,
    exit_code: Option<Option<i32>>,
}

impl ExecParentProcess {
    /// Wraps a launcher whose join paths point at the init process.
    #[must_use]
    pub const fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            exit_code: None,
        }
    }

    fn require_pid(&self) -> Result<i32> {
        self.launcher.pid().ok_or_else(|| CapsuleError::Signal {
            message: "exec process has not been started".into(),
        })
    }
}

impl ParentProcess for ExecParentProcess {
    fn pid(&self) -> Option<i32> {
        self.launcher.pid()
    }

    fn start(&mut self) -> Result<()> {
        self.launcher.launch(&mut NoBootstrap)
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
