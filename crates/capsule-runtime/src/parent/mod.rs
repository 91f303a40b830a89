//! Parent-side handles of container processes.
//!
//! [`InitParentProcess`] and [`ExecParentProcess`] launch a real child of
//! this runtime through the shared [`launcher::Launcher`]. They differ by
//! the [`Bootstrap`] run while the child waits for its configuration.
//! [`NoChildParentProcess`] stands in for a process started by an earlier
//! runtime invocation.

pub mod exec;
pub mod init;
pub mod launcher;
pub mod nochild;

use std::fmt;

use capsule_common::config::{ContainerConfig, ProcessConfig};
use capsule_common::error::{CapsuleError, Result};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

pub use exec::ExecParentProcess;
pub use init::{InitBootstrap, InitParentProcess, Networking, lock_cgroup};
pub use nochild::NoChildParentProcess;

/// Everything the container process needs, pushed over the sync channel
/// after the bootstrap window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPayload {
    /// Container id.
    pub id: String,
    /// Container configuration.
    pub config: ContainerConfig,
    /// Process to execute.
    pub process: ProcessConfig,
}

/// Work done between the pid handback and the configuration push.
pub trait Bootstrap: Send {
    /// Prepares host-side resources for `pid`.
    ///
    /// # Errors
    ///
    /// Any error aborts the launch.
    fn bootstrap(&mut self, pid: i32) -> Result<()>;

    /// Undoes whatever [`bootstrap`](Self::bootstrap) managed to set up.
    /// Runs after the child has been terminated.
    fn rollback(&mut self);
}

/// Bootstrap that prepares nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBootstrap;

impl Bootstrap for NoBootstrap {
    fn bootstrap(&mut self, _pid: i32) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) {}
}

/// Handle on one container process.
pub trait ParentProcess: Send + fmt::Debug {
    /// Host pid of the process, once known.
    fn pid(&self) -> Option<i32>;

    /// Launches the process and waits until it reports readiness.
    ///
    /// # Errors
    ///
    /// Returns the launch failure after the child and any bootstrapped
    /// resources have been torn down.
    fn start(&mut self) -> Result<()>;

    /// Waits for the process to exit. Returns its exit code when it can be
    /// observed.
    ///
    /// # Errors
    ///
    /// Returns `System` if waiting fails.
    fn wait(&mut self) -> Result<Option<i32>>;

    /// Kills the process and reaps it. A process that already exited or
    /// was already reaped is not an error.
    ///
    /// # Errors
    ///
    /// Returns `Signal` or `System` for other failures.
    fn terminate(&mut self) -> Result<()>;

    /// Start time of the process in clock ticks since boot.
    fn start_time(&self) -> Option<u64>;

    /// Sends `signal` to the process.
    ///
    /// # Errors
    ///
    /// Returns `Signal` if delivery fails.
    fn signal(&self, signal: Signal) -> Result<()>;

    /// Whether output goes to a log file instead of the terminal.
    fn detach(&self) -> bool;
}

/// Sends a signal to `pid`, mapping failures to `Signal` errors.
///
/// # Errors
///
/// Returns `Signal` if `kill(2)` fails.
pub fn send_signal(pid: i32, signal: Signal) -> Result<()> {
    nix::sys::signal::kill(Pid::from_raw(pid), signal).map_err(|e| CapsuleError::Signal {
        message: format!("send {signal} to {pid}: {e}"),
    })?;
    tracing::debug!(pid, %signal, "signal sent");
    Ok(())
}

/// Exit code of a wait status; a signal death maps to `128 + signo`.
#[must_use]
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// Blocks until `pid` exits and returns its exit code.
///
/// # Errors
///
/// Returns `System` if `waitpid(2)` fails.
pub fn wait_child(pid: i32) -> Result<Option<i32>> {
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                return Ok(exit_code(status));
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(CapsuleError::system(format!("wait for {pid}"), e)),
        }
    }
}

/// `SIGKILL` followed by a reap. A process that already exited or was
/// already waited for is fine.
///
/// # Errors
///
/// Returns `Signal` or `System` for any other failure.
pub fn kill_and_reap(pid: i32) -> Result<()> {
    match nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            return Err(CapsuleError::Signal {
                message: format!("kill {pid}: {e}"),
            });
        }
    }
    match wait_child(pid) {
        Ok(_) => Ok(()),
        Err(CapsuleError::System { source, .. })
            if source.raw_os_error() == Some(libc::ECHILD) =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}
