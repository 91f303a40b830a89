//! The launch handshake shared by init and exec processes.
//!
//! 1. create a socket pair and re-execute this binary as `init` with the
//!    child end at fd 3,
//! 2. send the namespace join paths, then the clone flags,
//! 3. read back the host pid of the cloned container process,
//! 4. run the [`Bootstrap`] hook,
//! 5. send the [`LaunchPayload`] and half-close the channel,
//! 6. wait for the child's readiness report.
//!
//! The child then blocks until it receives `SIGUSR2`.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;

use capsule_common::config::{ContainerConfig, ProcessConfig};
use capsule_common::constants::{
    CONTAINER_INIT_ARG, CONTAINER_INIT_CMD, DEFAULT_STD_FD_COUNT, ENV_INITIALIZER_TYPE,
    ENV_SYNC_PIPE, LAUNCH_TIMEOUT,
};
use capsule_common::error::{CapsuleError, Result};
use capsule_core::proc::ProcessStat;
use capsule_core::sync::{self, SyncMessage};
use nix::sched::CloneFlags;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use super::{Bootstrap, LaunchPayload, kill_and_reap};
use crate::initializer::InitializerKind;

/// A process waiting to be launched, and the state learned while doing so.
#[derive(Debug)]
pub struct Launcher {
    kind: InitializerKind,
    payload: LaunchPayload,
    join_paths: Vec<PathBuf>,
    clone_flags: CloneFlags,
    work_dir: PathBuf,
    log_path: Option<PathBuf>,
    pid: Option<i32>,
    start_time: Option<u64>,
}

impl Launcher {
    /// Describes a launch. `log_path` receives stdout and stderr of a
    /// detached process; `None` inherits the runtime's terminal.
    #[must_use]
    pub fn new(
        kind: InitializerKind,
        id: &str,
        config: ContainerConfig,
        process: ProcessConfig,
        join_paths: Vec<PathBuf>,
        clone_flags: CloneFlags,
        log_path: Option<PathBuf>,
    ) -> Self {
        let work_dir = config.rootfs.clone();
        Self {
            kind,
            payload: LaunchPayload {
                id: id.to_owned(),
                config,
                process,
            },
            join_paths,
            clone_flags,
            work_dir,
            log_path,
            pid: None,
            start_time: None,
        }
    }

    /// Host pid of the container process once the handshake got it.
    #[must_use]
    pub const fn pid(&self) -> Option<i32> {
        self.pid
    }

    /// Start time recorded after a successful launch.
    #[must_use]
    pub const fn start_time(&self) -> Option<u64> {
        self.start_time
    }

    /// Whether output goes to a log file.
    #[must_use]
    pub const fn detach(&self) -> bool {
        self.log_path.is_some()
    }

    /// Process being launched.
    #[must_use]
    pub const fn process(&self) -> &ProcessConfig {
        &self.payload.process
    }

    fn open_log(&self) -> Result<Option<File>> {
        let Some(path) = &self.log_path else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CapsuleError::io(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Some)
            .map_err(|e| CapsuleError::io(path, e))
    }

    fn command(&self, child_end: &OwnedFd) -> Result<Command> {
        let mut cmd = Command::new(CONTAINER_INIT_CMD);
        let _ = cmd
            .arg(CONTAINER_INIT_ARG)
            .env(ENV_SYNC_PIPE, DEFAULT_STD_FD_COUNT.to_string())
            .env(ENV_INITIALIZER_TYPE, self.kind.as_str())
            .current_dir(&self.work_dir);

        if let Some(log) = self.open_log()? {
            let err = log.try_clone().map_err(|e| CapsuleError::system("clone log handle", e))?;
            let _ = cmd
                .stdin(Stdio::null())
                .stdout(Stdio::from(log))
                .stderr(Stdio::from(err));
        }

        let raw = child_end.as_raw_fd();
        let target = DEFAULT_STD_FD_COUNT;
        // SAFETY: only async-signal-safe calls (dup2, fcntl) run between
        // fork and exec. dup2 clears FD_CLOEXEC on the new descriptor; when
        // the socket already sits at the target number the flag is cleared
        // explicitly.
        unsafe {
            let _ = cmd.pre_exec(move || {
                let ret = if raw == target {
                    libc::fcntl(target, libc::F_SETFD, 0)
                } else {
                    libc::dup2(raw, target)
                };
                if ret < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        Ok(cmd)
    }

    /// Runs the whole handshake.
    ///
    /// On failure after the pid is known the container process is killed
    /// and `bootstrap` is rolled back before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `System` if the process cannot be spawned, `Pipe` for
    /// channel failures and timeouts, or the bootstrap's own error.
    pub fn launch(&mut self, bootstrap: &mut dyn Bootstrap) -> Result<()> {
        let (parent_end, child_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| CapsuleError::system("create sync socket pair", e))?;
        let mut channel = UnixStream::from(parent_end);

        let mut cmd = self.command(&child_end)?;
        let mut shim = cmd
            .spawn()
            .map_err(|e| CapsuleError::system(format!("spawn {CONTAINER_INIT_CMD}"), e))?;
        drop(child_end);
        tracing::debug!(
            id = %self.payload.id,
            kind = self.kind.as_str(),
            shim = shim.id(),
            "launcher spawned"
        );

        let handback = sync::write_namespaces(&mut channel, &self.join_paths)
            .and_then(|()| sync::write_i32(&mut channel, self.clone_flags.bits()))
            .and_then(|()| sync::read_i32(&mut channel));
        // The shim exits as soon as it has cloned; reap it either way.
        let shim_status = shim
            .wait()
            .map_err(|e| CapsuleError::system("wait for nsenter shim", e))?;
        let pid = handback?;
        if !shim_status.success() {
            return Err(CapsuleError::System {
                context: "nsenter shim".into(),
                source: std::io::Error::other(format!("exited with {shim_status}")),
            });
        }
        self.pid = Some(pid);
        tracing::debug!(id = %self.payload.id, pid, "container pid received");

        if let Err(e) = self.finish(&mut channel, pid, bootstrap) {
            if let Err(kill) = kill_and_reap(pid) {
                tracing::warn!(pid, error = %kill, "failed to terminate failed launch");
            }
            bootstrap.rollback();
            self.pid = None;
            return Err(e);
        }
        Ok(())
    }

    fn finish(
        &mut self,
        channel: &mut UnixStream,
        pid: i32,
        bootstrap: &mut dyn Bootstrap,
    ) -> Result<()> {
        bootstrap.bootstrap(pid)?;

        sync::write_config(channel, &self.payload)?;
        channel
            .shutdown(std::net::Shutdown::Write)
            .map_err(|e| CapsuleError::Pipe {
                message: format!("close write side: {e}"),
            })?;

        channel
            .set_read_timeout(Some(LAUNCH_TIMEOUT))
            .map_err(|e| CapsuleError::Pipe {
                message: format!("set readiness timeout: {e}"),
            })?;
        let waited = Instant::now();
        let message = sync::read_message(channel).map_err(|e| {
            if waited.elapsed() >= LAUNCH_TIMEOUT {
                CapsuleError::Pipe {
                    message: format!(
                        "container process not ready within {}s",
                        LAUNCH_TIMEOUT.as_secs()
                    ),
                }
            } else {
                e
            }
        })?;
        match message {
            Some(SyncMessage::Ready) => {}
            Some(SyncMessage::Error { message }) => {
                return Err(CapsuleError::System {
                    context: "container setup".into(),
                    source: std::io::Error::other(message),
                });
            }
            None => {
                return Err(CapsuleError::System {
                    context: "container setup".into(),
                    source: std::io::Error::other("process exited before reporting readiness"),
                });
            }
        }

        let stat = ProcessStat::read(pid)?.ok_or_else(|| CapsuleError::System {
            context: "read container start time".into(),
            source: std::io::Error::other(format!("process {pid} vanished")),
        })?;
        self.start_time = Some(stat.start_time);
        tracing::info!(id = %self.payload.id, pid, "container process ready");
        Ok(())
    }
}
