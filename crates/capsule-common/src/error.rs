//! Error taxonomy for the capsule workspace.
//!
//! Low-level failures are wrapped once, where they are detected, into the
//! variant naming the operation that failed. Callers propagate them with `?`.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// A file operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A generic syscall or process-level failure.
    #[error("system error ({context}): {source}")]
    System {
        /// Operation that failed.
        context: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A cgroup operation failed.
    #[error("cgroups error: {message}")]
    Cgroups {
        /// Description of the failure.
        message: String,
    },

    /// A network driver or endpoint operation failed.
    #[error("network error: {message}")]
    Network {
        /// Description of the failure.
        message: String,
    },

    /// Address allocation bookkeeping failed.
    #[error("ipam error: {message}")]
    Ipam {
        /// Description of the failure.
        message: String,
    },

    /// The parent/child sync channel failed or carried malformed data.
    #[error("sync pipe error: {message}")]
    Pipe {
        /// Description of the failure.
        message: String,
    },

    /// A mount or unmount failed.
    #[error("mount error: {message}")]
    Mount {
        /// Description of the failure.
        message: String,
    },

    /// Preparing the container root filesystem failed.
    #[error("prepare root error: {message}")]
    PrepareRoot {
        /// Description of the failure.
        message: String,
    },

    /// Setting the container hostname failed.
    #[error("hostname error: {message}")]
    Hostname {
        /// Description of the failure.
        message: String,
    },

    /// Writing a sysctl failed.
    #[error("sysctl error: {message}")]
    Sysctl {
        /// Description of the failure.
        message: String,
    },

    /// Sending or waiting for a signal failed.
    #[error("signal error: {message}")]
    Signal {
        /// Description of the failure.
        message: String,
    },

    /// The executable could not be found on the search path.
    #[error("look path error: {message}")]
    LookPath {
        /// Description of the failure.
        message: String,
    },

    /// Replacing the process image with the user command failed.
    #[error("exec error: {message}")]
    Exec {
        /// Description of the failure.
        message: String,
    },

    /// No container with this id exists under the runtime root.
    #[error("container does not exist: {id}")]
    ContainerNotExists {
        /// Requested container id.
        id: String,
    },

    /// A container with this id already exists.
    #[error("container already exists: {id}")]
    ContainerIdExists {
        /// Requested container id.
        id: String,
    },

    /// The container process is still alive.
    #[error("container still running: {id}")]
    ContainerStillRunning {
        /// Container id.
        id: String,
    },

    /// The requested status change is not in the transition table.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    ConfigInvalid {
        /// Description of the invalid configuration.
        message: String,
    },

    /// No image with this id exists in the store.
    #[error("image does not exist: {id}")]
    ImageNotExists {
        /// Requested image id.
        id: String,
    },

    /// An image store operation failed.
    #[error("image error: {message}")]
    Image {
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Fieldless discriminant of [`CapsuleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`CapsuleError::Io`].
    Io,
    /// See [`CapsuleError::System`].
    System,
    /// See [`CapsuleError::Cgroups`].
    Cgroups,
    /// See [`CapsuleError::Network`].
    Network,
    /// See [`CapsuleError::Ipam`].
    Ipam,
    /// See [`CapsuleError::Pipe`].
    Pipe,
    /// See [`CapsuleError::Mount`].
    Mount,
    /// See [`CapsuleError::PrepareRoot`].
    PrepareRoot,
    /// See [`CapsuleError::Hostname`].
    Hostname,
    /// See [`CapsuleError::Sysctl`].
    Sysctl,
    /// See [`CapsuleError::Signal`].
    Signal,
    /// See [`CapsuleError::LookPath`].
    LookPath,
    /// See [`CapsuleError::Exec`].
    Exec,
    /// See [`CapsuleError::ContainerNotExists`].
    ContainerNotExists,
    /// See [`CapsuleError::ContainerIdExists`].
    ContainerIdExists,
    /// See [`CapsuleError::ContainerStillRunning`].
    ContainerStillRunning,
    /// See [`CapsuleError::InvalidStateTransition`].
    InvalidStateTransition,
    /// See [`CapsuleError::ConfigInvalid`].
    ConfigInvalid,
    /// See [`CapsuleError::ImageNotExists`].
    ImageNotExists,
    /// See [`CapsuleError::Image`].
    Image,
    /// See [`CapsuleError::Serialization`].
    Serialization,
}

impl CapsuleError {
    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::System { .. } => ErrorKind::System,
            Self::Cgroups { .. } => ErrorKind::Cgroups,
            Self::Network { .. } => ErrorKind::Network,
            Self::Ipam { .. } => ErrorKind::Ipam,
            Self::Pipe { .. } => ErrorKind::Pipe,
            Self::Mount { .. } => ErrorKind::Mount,
            Self::PrepareRoot { .. } => ErrorKind::PrepareRoot,
            Self::Hostname { .. } => ErrorKind::Hostname,
            Self::Sysctl { .. } => ErrorKind::Sysctl,
            Self::Signal { .. } => ErrorKind::Signal,
            Self::LookPath { .. } => ErrorKind::LookPath,
            Self::Exec { .. } => ErrorKind::Exec,
            Self::ContainerNotExists { .. } => ErrorKind::ContainerNotExists,
            Self::ContainerIdExists { .. } => ErrorKind::ContainerIdExists,
            Self::ContainerStillRunning { .. } => ErrorKind::ContainerStillRunning,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            Self::ImageNotExists { .. } => ErrorKind::ImageNotExists,
            Self::Image { .. } => ErrorKind::Image,
            Self::Serialization { .. } => ErrorKind::Serialization,
        }
    }

    /// Wraps an OS error with the operation that produced it.
    pub fn system(context: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::System {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Builds an [`CapsuleError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CapsuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let err = CapsuleError::ContainerStillRunning { id: "c1".into() };
        assert_eq!(err.kind(), ErrorKind::ContainerStillRunning);

        let err = CapsuleError::system("kill", std::io::Error::from_raw_os_error(3));
        assert_eq!(err.kind(), ErrorKind::System);
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = CapsuleError::InvalidStateTransition {
            from: "stopped".into(),
            to: "created".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition from stopped to created"
        );
    }
}
