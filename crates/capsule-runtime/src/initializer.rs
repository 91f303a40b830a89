//! Container-side setup, run in the cloned process after the nsenter shim.
//!
//! The initializer reads the launch payload until the parent half-closes
//! the channel, prepares the environment, reports readiness, then blocks
//! `SIGUSR2` until the runtime releases it and replaces itself with the
//! user command.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use capsule_common::config::{ContainerConfig, ProcessConfig, Rlimit};
use capsule_common::constants::{DEFAULT_PATH, ENV_INITIALIZER_TYPE};
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::NamespaceType;
use capsule_core::filesystem::{pivot_root, rootfs};
use capsule_core::nsenter::sync_fd_from_env;
use capsule_core::sync::{self, SyncMessage};
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask};
use nix::unistd::{Gid, Uid};

use crate::parent::LaunchPayload;

/// Which setup the container process performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializerKind {
    /// First process: builds the root filesystem and host identity.
    Init,
    /// Additional process joining an existing container.
    Exec,
}

impl InitializerKind {
    /// Value carried in the initializer-mode environment variable.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Exec => "setns",
        }
    }

    /// Parses the initializer-mode value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for an unknown mode.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "init" => Ok(Self::Init),
            "setns" => Ok(Self::Exec),
            other => Err(CapsuleError::ConfigInvalid {
                message: format!("unknown initializer type: {other}"),
            }),
        }
    }

    /// Reads the mode from the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the variable is missing or unknown.
    pub fn from_env() -> Result<Self> {
        let value = std::env::var(ENV_INITIALIZER_TYPE).map_err(|_| CapsuleError::ConfigInvalid {
            message: format!("{ENV_INITIALIZER_TYPE} is not set"),
        })?;
        Self::parse(&value)
    }
}

/// Container-side state between the payload read and the final exec.
#[derive(Debug)]
pub struct Initializer {
    kind: InitializerKind,
    channel: Option<UnixStream>,
}

impl Initializer {
    /// Takes ownership of the inherited sync descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Pipe` if the descriptor variable is missing or invalid.
    pub fn from_env() -> Result<Self> {
        let kind = InitializerKind::from_env()?;
        let fd: RawFd = sync_fd_from_env()?.ok_or_else(|| CapsuleError::Pipe {
            message: "no sync descriptor inherited".into(),
        })?;
        // SAFETY: the runtime placed the channel at this descriptor before
        // exec, and nothing else in this process owns it.
        let channel = unsafe { UnixStream::from_raw_fd(fd) };
        Ok(Self {
            kind,
            channel: Some(channel),
        })
    }

    /// Runs the setup and execs the user command. Only returns on failure;
    /// failures before readiness are also reported to the parent.
    pub fn run(mut self) -> Result<Infallible> {
        let result = self.prepare();
        match result {
            Ok((path, process)) => self.release_and_exec(&path, &process),
            Err(e) => {
                self.report(&SyncMessage::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn channel(&mut self) -> Result<&mut UnixStream> {
        self.channel.as_mut().ok_or_else(|| CapsuleError::Pipe {
            message: "sync channel already closed".into(),
        })
    }

    fn report(&mut self, message: &SyncMessage) {
        if let Ok(channel) = self.channel() {
            if let Err(e) = sync::write_message(channel, message) {
                tracing::warn!(error = %e, "failed to report to parent");
            }
        }
    }

    fn prepare(&mut self) -> Result<(PathBuf, ProcessConfig)> {
        let payload: LaunchPayload = sync::read_config(self.channel()?)?;
        tracing::debug!(id = %payload.id, kind = self.kind.as_str(), "launch payload received");
        let LaunchPayload {
            config, process, ..
        } = payload;

        match self.kind {
            InitializerKind::Init => setup_container(&config)?,
            InitializerKind::Exec => {
                if !config.has_namespace(NamespaceType::Mnt) {
                    pivot_root::chroot(&config.rootfs)?;
                }
            }
        }

        apply_rlimits(&process.rlimits)?;
        let cwd = process.cwd_or_root();
        std::env::set_current_dir(cwd).map_err(|e| CapsuleError::io(cwd, e))?;
        let path = look_path(&process)?;
        switch_user(&process.user)?;
        Ok((path, process))
    }

    fn release_and_exec(&mut self, path: &Path, process: &ProcessConfig) -> Result<Infallible> {
        let mut continue_set = SigSet::empty();
        continue_set.add(Signal::SIGUSR2);
        let mut previous = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&continue_set), Some(&mut previous))
            .map_err(|e| CapsuleError::Signal {
                message: format!("block SIGUSR2: {e}"),
            })?;

        let channel = self.channel()?;
        sync::write_message(channel, &SyncMessage::Ready)?;
        drop(self.channel.take());

        let received = continue_set.wait().map_err(|e| CapsuleError::Signal {
            message: format!("wait for SIGUSR2: {e}"),
        })?;
        tracing::debug!(signal = %received, "continue signal received");
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&previous), None).map_err(|e| {
            CapsuleError::Signal {
                message: format!("restore signal mask: {e}"),
            }
        })?;

        exec_process(path, process)
    }
}

/// Filesystem, path policies, hostname and kernel parameters of a new
/// container.
fn setup_container(config: &ContainerConfig) -> Result<()> {
    rootfs::prepare_root(config)?;
    rootfs::finalize_root(config)?;
    if !config.hostname.is_empty() {
        rootfs::set_hostname(&config.hostname)?;
    }
    for (key, value) in &config.sysctls {
        rootfs::write_sysctl(key, value)?;
    }
    // After the sysctls: `/proc/sys` is usually one of the read-only paths.
    rootfs::apply_path_policies(config)
}

/// Maps an OCI rlimit name to the kernel resource.
///
/// # Errors
///
/// Returns `ConfigInvalid` for an unknown name.
pub fn rlimit_resource(name: &str) -> Result<Resource> {
    let resource = match name.trim_start_matches("RLIMIT_") {
        "AS" => Resource::RLIMIT_AS,
        "CORE" => Resource::RLIMIT_CORE,
        "CPU" => Resource::RLIMIT_CPU,
        "DATA" => Resource::RLIMIT_DATA,
        "FSIZE" => Resource::RLIMIT_FSIZE,
        "LOCKS" => Resource::RLIMIT_LOCKS,
        "MEMLOCK" => Resource::RLIMIT_MEMLOCK,
        "MSGQUEUE" => Resource::RLIMIT_MSGQUEUE,
        "NICE" => Resource::RLIMIT_NICE,
        "NOFILE" => Resource::RLIMIT_NOFILE,
        "NPROC" => Resource::RLIMIT_NPROC,
        "RSS" => Resource::RLIMIT_RSS,
        "RTPRIO" => Resource::RLIMIT_RTPRIO,
        "RTTIME" => Resource::RLIMIT_RTTIME,
        "SIGPENDING" => Resource::RLIMIT_SIGPENDING,
        "STACK" => Resource::RLIMIT_STACK,
        _ => {
            return Err(CapsuleError::ConfigInvalid {
                message: format!("unknown rlimit: {name}"),
            });
        }
    };
    Ok(resource)
}

fn apply_rlimits(rlimits: &[Rlimit]) -> Result<()> {
    for limit in rlimits {
        let resource = rlimit_resource(&limit.kind)?;
        setrlimit(resource, limit.soft, limit.hard)
            .map_err(|e| CapsuleError::system(format!("setrlimit {}", limit.kind), e))?;
    }
    Ok(())
}

/// Parses `uid[:gid]`. The gid defaults to the uid.
///
/// # Errors
///
/// Returns `ConfigInvalid` for non-numeric ids.
pub fn parse_user(user: &str) -> Result<(Uid, Gid)> {
    let invalid = || CapsuleError::ConfigInvalid {
        message: format!("user must be uid[:gid]: {user}"),
    };
    let (uid, gid) = user.split_once(':').unwrap_or((user, user));
    let uid = uid.parse::<u32>().map_err(|_| invalid())?;
    let gid = gid.parse::<u32>().map_err(|_| invalid())?;
    Ok((Uid::from_raw(uid), Gid::from_raw(gid)))
}

fn switch_user(user: &str) -> Result<()> {
    if user.is_empty() {
        return Ok(());
    }
    let (uid, gid) = parse_user(user)?;
    nix::unistd::setgid(gid).map_err(|e| CapsuleError::system(format!("setgid {gid}"), e))?;
    nix::unistd::setuid(uid).map_err(|e| CapsuleError::system(format!("setuid {uid}"), e))?;
    Ok(())
}

/// Resolves the executable of `process` against its own `PATH`.
///
/// # Errors
///
/// Returns `ConfigInvalid` for an empty command or `LookPath` if nothing
/// executable is found.
pub fn look_path(process: &ProcessConfig) -> Result<PathBuf> {
    let program = process.args.first().ok_or_else(|| CapsuleError::ConfigInvalid {
        message: "process args are empty".into(),
    })?;
    let search = process.search_path().unwrap_or(DEFAULT_PATH);
    which::which_in(program, Some(search), process.cwd_or_root()).map_err(|e| {
        CapsuleError::LookPath {
            message: format!("{program}: {e}"),
        }
    })
}

fn cstrings<'a>(items: impl IntoIterator<Item = &'a str>) -> Result<Vec<CString>> {
    items
        .into_iter()
        .map(|s| {
            CString::new(s).map_err(|_| CapsuleError::Exec {
                message: format!("argument contains a NUL byte: {s:?}"),
            })
        })
        .collect()
}

fn exec_process(path: &Path, process: &ProcessConfig) -> Result<Infallible> {
    let program = cstrings([path.to_string_lossy().as_ref()])?
        .into_iter()
        .next()
        .ok_or_else(|| CapsuleError::Exec {
            message: "empty program path".into(),
        })?;
    let args = cstrings(process.args.iter().map(String::as_str))?;
    let env = cstrings(process.env.iter().map(String::as_str))?;
    nix::unistd::execve(&program, &args, &env).map_err(|e| CapsuleError::Exec {
        message: format!("execve {}: {e}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_env_value() {
        for kind in [InitializerKind::Init, InitializerKind::Exec] {
            assert_eq!(InitializerKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(InitializerKind::parse("exec").is_err());
    }

    #[test]
    fn user_parsing() {
        assert_eq!(
            parse_user("1000:100").unwrap(),
            (Uid::from_raw(1000), Gid::from_raw(100))
        );
        assert_eq!(parse_user("0").unwrap(), (Uid::from_raw(0), Gid::from_raw(0)));
        assert!(parse_user("root").is_err());
    }

    #[test]
    fn rlimit_names_accept_oci_prefix() {
        assert_eq!(rlimit_resource("RLIMIT_NOFILE").unwrap(), Resource::RLIMIT_NOFILE);
        assert_eq!(rlimit_resource("NPROC").unwrap(), Resource::RLIMIT_NPROC);
        assert!(rlimit_resource("RLIMIT_BOGUS").is_err());
    }

    #[test]
    fn look_path_uses_process_path() {
        let process = ProcessConfig {
            args: vec!["sh".into()],
            env: vec!["PATH=/bin:/usr/bin".into()],
            ..ProcessConfig::default()
        };
        let found = look_path(&process).unwrap();
        assert!(found.ends_with("sh"));

        let missing = ProcessConfig {
            args: vec!["capsule-no-such-binary".into()],
            ..ProcessConfig::default()
        };
        let err = look_path(&missing).unwrap_err();
        assert_eq!(err.kind(), capsule_common::error::ErrorKind::LookPath);
    }

    #[test]
    fn empty_args_are_rejected() {
        let err = look_path(&ProcessConfig::default()).unwrap_err();
        assert_eq!(err.kind(), capsule_common::error::ErrorKind::ConfigInvalid);
    }
}
