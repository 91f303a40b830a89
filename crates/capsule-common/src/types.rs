//! Domain primitive types used across the capsule workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CapsuleError, Result};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value without validation.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses a user-supplied container ID.
    ///
    /// IDs become directory names and cgroup names, so only ASCII
    /// alphanumerics, `-`, `_` and `.` are accepted.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the ID is empty or contains other characters.
    pub fn parse(id: &str) -> Result<Self> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(CapsuleError::ConfigInvalid {
                message: format!("invalid container id: {id:?}"),
            });
        }
        Ok(Self(id.to_owned()))
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a container.
///
/// Never persisted as ground truth: it is derived from process liveness and
/// the not-exec marker each time it is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The init process is set up and waits for `start`.
    Created,
    /// The user command is executing.
    Running,
    /// No live init process.
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Kernel namespace kinds the runtime can create or join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NamespaceType {
    /// System V IPC and POSIX message queues.
    #[serde(rename = "NEWIPC")]
    Ipc,
    /// Hostname and domain name.
    #[serde(rename = "NEWUTS")]
    Uts,
    /// Network stack.
    #[serde(rename = "NEWNET")]
    Net,
    /// Process IDs.
    #[serde(rename = "NEWPID")]
    Pid,
    /// Mount table.
    #[serde(rename = "NEWNS")]
    Mnt,
}

impl NamespaceType {
    /// Every namespace type, in join order. Mount comes last: once a new
    /// mount namespace is entered the other `/proc/<pid>/ns` paths may no
    /// longer resolve.
    pub const ALL: [Self; 5] = [Self::Ipc, Self::Uts, Self::Net, Self::Pid, Self::Mnt];

    /// Entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn ns_name(self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Net => "net",
            Self::Pid => "pid",
            Self::Mnt => "mnt",
        }
    }
}

impl fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ns_name())
    }
}

impl FromStr for NamespaceType {
    type Err = CapsuleError;

    /// Accepts both OCI names (`network`, `mount`) and `/proc` names.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ipc" => Ok(Self::Ipc),
            "uts" => Ok(Self::Uts),
            "net" | "network" => Ok(Self::Net),
            "pid" => Ok(Self::Pid),
            "mnt" | "mount" => Ok(Self::Mnt),
            other => Err(CapsuleError::ConfigInvalid {
                message: format!("unsupported namespace type: {other}"),
            }),
        }
    }
}

/// Target state of the freezer cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezerState {
    /// Tasks run normally.
    Thawed,
    /// Tasks are stopped.
    Frozen,
}

impl FreezerState {
    /// Value written to `freezer.state`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Thawed => "THAWED",
            Self::Frozen => "FROZEN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_rejects_path_characters() {
        assert!(ContainerId::parse("web-1").is_ok());
        assert!(ContainerId::parse("").is_err());
        assert!(ContainerId::parse("..").is_err());
        assert!(ContainerId::parse("a/b").is_err());
        assert!(ContainerId::parse("a b").is_err());
    }

    #[test]
    fn generated_ids_are_valid() {
        let id = ContainerId::generate();
        assert!(ContainerId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn namespace_order_puts_mount_last() {
        assert_eq!(NamespaceType::ALL.last(), Some(&NamespaceType::Mnt));
    }

    #[test]
    fn namespace_type_parses_oci_names() {
        assert_eq!("network".parse::<NamespaceType>().unwrap(), NamespaceType::Net);
        assert_eq!("mount".parse::<NamespaceType>().unwrap(), NamespaceType::Mnt);
        assert!("user".parse::<NamespaceType>().is_err());
    }

    #[test]
    fn namespace_type_serializes_as_clone_name() {
        let json = serde_json::to_string(&NamespaceType::Mnt).unwrap();
        assert_eq!(json, "\"NEWNS\"");
    }

    #[test]
    fn status_displays_lowercase() {
        assert_eq!(Status::Created.to_string(), "created");
        assert_eq!(Status::Stopped.to_string(), "stopped");
    }
}
