//! Configuration models: the runtime itself, containers, and processes.
//!
//! `ContainerConfig` and `ProcessConfig` travel to the container process as
//! JSON over the sync channel, so every field here is part of that contract.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CapsuleError, Result};
use crate::types::{FreezerState, NamespaceType};

/// Root configuration for the capsule runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Base directory for container, image, and network state.
    pub root: PathBuf,
    /// Cgroup directory, under every subsystem root, that holds container cgroups.
    pub cgroup_parent: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(constants::DEFAULT_RUNTIME_ROOT),
            cgroup_parent: constants::DEFAULT_CGROUP_PARENT.to_owned(),
        }
    }
}

impl RuntimeConfig {
    /// Returns a configuration rooted at `root` with default settings otherwise.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Directory holding one state directory per container.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.root.join(constants::CONTAINERS_DIR)
    }

    /// State directory of one container.
    #[must_use]
    pub fn container_root(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    /// Image store directory.
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(constants::IMAGES_DIR)
    }

    /// IPAM subnet map file.
    #[must_use]
    pub fn ipam_path(&self) -> PathBuf {
        self.root.join(constants::IPAM_SUBNET_FILE)
    }

    /// Directory of persisted network records.
    #[must_use]
    pub fn networks_dir(&self) -> PathBuf {
        self.root.join(constants::NETWORKS_DIR)
    }
}

/// One namespace the container creates (`path == None`) or joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace kind.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Existing namespace to join instead of creating a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Namespace {
    /// A namespace that will be newly created.
    #[must_use]
    pub const fn new(ns_type: NamespaceType) -> Self {
        Self {
            ns_type,
            path: None,
        }
    }
}

/// A mount performed inside the container before `pivot_root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount source (device, directory, or pseudo-filesystem name).
    pub source: String,
    /// Absolute destination inside the container.
    pub destination: PathBuf,
    /// Filesystem type (`proc`, `tmpfs`, `bind`, ...).
    pub device: String,
    /// `MS_*` flag bits.
    #[serde(default)]
    pub flags: u64,
    /// Filesystem-specific data (`mode=755,size=65536k`).
    #[serde(default)]
    pub data: String,
}

/// A device node created inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// `c` or `u` for character, `b` for block, `p` for FIFO.
    #[serde(rename = "type")]
    pub dev_type: char,
    /// Absolute path inside the container.
    pub path: PathBuf,
    /// Major number.
    pub major: i64,
    /// Minor number.
    pub minor: i64,
    /// Cgroup permissions, `rwm` style.
    #[serde(default)]
    pub permissions: String,
    /// Permission bits of the node.
    pub file_mode: u32,
    /// Owner uid.
    #[serde(default)]
    pub uid: u32,
    /// Owner gid.
    #[serde(default)]
    pub gid: u32,
}

impl Device {
    /// Encodes major and minor the way the kernel's `new_encode_dev` does.
    #[must_use]
    pub const fn mkdev(&self) -> u64 {
        ((self.major << 8) | (self.minor & 0xff) | ((self.minor & 0xfff00) << 12)) as u64
    }

    /// Character devices every container gets.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        [
            ("/dev/null", 1, 3),
            ("/dev/random", 1, 8),
            ("/dev/full", 1, 7),
            ("/dev/tty", 5, 0),
            ("/dev/zero", 1, 5),
            ("/dev/urandom", 1, 9),
        ]
        .into_iter()
        .map(|(path, major, minor)| Self {
            dev_type: 'c',
            path: PathBuf::from(path),
            major,
            minor,
            permissions: "rwm".to_owned(),
            file_mode: 0o666,
            uid: 0,
            gid: 0,
        })
        .collect()
    }
}

/// Cgroup resource settings. Zero or empty values mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Memory limit in bytes.
    #[serde(default)]
    pub memory: i64,
    /// Relative CPU weight.
    #[serde(default)]
    pub cpu_shares: u64,
    /// CPUs the container may run on (`0-3,5`).
    #[serde(default)]
    pub cpuset_cpus: String,
    /// Initial freezer state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freezer: Option<FreezerState>,
}

/// Attachment of the container to a named network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint id, unique per host (the veth names derive from it).
    pub id: String,
    /// Network name.
    pub network: String,
    /// `hostPort:containerPort` pairs.
    #[serde(default)]
    pub port_mappings: Vec<String>,
}

/// Immutable description of a container, fixed at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Absolute path of the root filesystem on the host.
    pub rootfs: PathBuf,
    /// Remount the root filesystem read-only after setup.
    #[serde(default)]
    pub readonly_fs: bool,
    /// Hostname set inside a new UTS namespace.
    #[serde(default)]
    pub hostname: String,
    /// Mounts, in order.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Device nodes to create.
    #[serde(default)]
    pub devices: Vec<Device>,
    /// Namespaces to create or join.
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    /// Cgroup resource settings.
    #[serde(default)]
    pub cgroup: CgroupConfig,
    /// Kernel parameters written under `/proc/sys`.
    #[serde(default)]
    pub sysctls: BTreeMap<String, String>,
    /// Network attachments.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Free-form annotations.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Container paths remounted read-only after the root switch.
    #[serde(default)]
    pub readonly_paths: Vec<PathBuf>,
    /// Container paths hidden after the root switch.
    #[serde(default)]
    pub masked_paths: Vec<PathBuf>,
}

impl ContainerConfig {
    /// Returns whether the namespace type is configured (created or joined).
    #[must_use]
    pub fn has_namespace(&self, ns_type: NamespaceType) -> bool {
        self.namespaces.iter().any(|ns| ns.ns_type == ns_type)
    }

    /// Checks internal consistency of the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if !self.rootfs.is_absolute() {
            return Err(invalid(format!(
                "rootfs must be an absolute path: {}",
                self.rootfs.display()
            )));
        }
        if !self.rootfs.is_dir() {
            return Err(invalid(format!(
                "rootfs is not a directory: {}",
                self.rootfs.display()
            )));
        }

        let mut seen = HashSet::new();
        for ns in &self.namespaces {
            if !seen.insert(ns.ns_type) {
                return Err(invalid(format!("duplicate namespace: {}", ns.ns_type)));
            }
        }

        if !self.hostname.is_empty() && !self.has_namespace(NamespaceType::Uts) {
            return Err(invalid("hostname requires a UTS namespace"));
        }
        if !self.endpoints.is_empty() && !self.has_namespace(NamespaceType::Net) {
            return Err(invalid("network endpoints require a network namespace"));
        }
        for key in self.sysctls.keys() {
            if key.starts_with("net.") && !self.has_namespace(NamespaceType::Net) {
                return Err(invalid(format!(
                    "sysctl {key} requires a network namespace"
                )));
            }
        }
        for mount in &self.mounts {
            if !mount.destination.is_absolute() {
                return Err(invalid(format!(
                    "mount destination must be absolute: {}",
                    mount.destination.display()
                )));
            }
        }
        for path in self.readonly_paths.iter().chain(&self.masked_paths) {
            if !path.is_absolute() {
                return Err(invalid(format!(
                    "read-only and masked paths must be absolute: {}",
                    path.display()
                )));
            }
        }
        for endpoint in &self.endpoints {
            for mapping in &endpoint.port_mappings {
                parse_port_mapping(mapping)?;
            }
        }
        Ok(())
    }
}

/// Parses a `hostPort:containerPort` mapping.
///
/// # Errors
///
/// Returns `ConfigInvalid` if the mapping is not two port numbers.
pub fn parse_port_mapping(mapping: &str) -> Result<(u16, u16)> {
    let (host, container) = mapping
        .split_once(':')
        .ok_or_else(|| invalid(format!("port mapping must be host:container: {mapping}")))?;
    let host = host
        .parse::<u16>()
        .map_err(|_| invalid(format!("invalid host port in {mapping}")))?;
    let container = container
        .parse::<u16>()
        .map_err(|_| invalid(format!("invalid container port in {mapping}")))?;
    Ok((host, container))
}

/// A resource limit applied with `setrlimit` before exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limit name as in OCI bundles (`RLIMIT_NOFILE`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Hard limit.
    pub hard: u64,
    /// Soft limit.
    pub soft: u64,
}

/// One process launched inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Exec identifier; only meaningful when `init` is false.
    #[serde(default)]
    pub id: String,
    /// Command and arguments.
    pub args: Vec<String>,
    /// `KEY=value` environment entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory inside the container.
    #[serde(default)]
    pub cwd: PathBuf,
    /// `uid[:gid]`; empty keeps the launching identity.
    #[serde(default)]
    pub user: String,
    /// Resource limits.
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    /// True for the container's first process.
    #[serde(default)]
    pub init: bool,
    /// Run in the background with output sent to a log file.
    #[serde(default)]
    pub detach: bool,
}

impl ProcessConfig {
    /// Returns the `PATH` entry of the process environment, if any.
    #[must_use]
    pub fn search_path(&self) -> Option<&str> {
        self.env.iter().find_map(|e| e.strip_prefix("PATH="))
    }

    /// Returns the working directory, defaulting to `/`.
    #[must_use]
    pub fn cwd_or_root(&self) -> &Path {
        if self.cwd.as_os_str().is_empty() {
            Path::new("/")
        } else {
            &self.cwd
        }
    }
}

fn invalid(message: impl Into<String>) -> CapsuleError {
    CapsuleError::ConfigInvalid {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(rootfs: &Path) -> ContainerConfig {
        ContainerConfig {
            rootfs: rootfs.to_path_buf(),
            namespaces: NamespaceType::ALL.iter().copied().map(Namespace::new).collect(),
            ..ContainerConfig::default()
        }
    }

    #[test]
    fn runtime_paths_derive_from_root() {
        let cfg = RuntimeConfig::with_root("/tmp/capsule");
        assert_eq!(cfg.container_root("c1"), PathBuf::from("/tmp/capsule/containers/c1"));
        assert_eq!(cfg.ipam_path(), PathBuf::from("/tmp/capsule/network/ipam/subnet.json"));
    }

    #[test]
    fn mkdev_matches_kernel_encoding() {
        let dev = Device::defaults().remove(0);
        assert_eq!(dev.mkdev(), (1 << 8) | 3);

        let big = Device {
            minor: 0x1_0001,
            ..dev
        };
        assert_eq!(big.mkdev(), (1 << 8) | 0x01 | (0x1_0000 << 12));
    }

    #[test]
    fn validate_accepts_full_namespace_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = base_config(dir.path());
        cfg.hostname = "box".into();
        cfg.sysctls.insert("net.ipv4.ip_forward".into(), "1".into());
        cfg.validate().expect("valid config");
    }

    #[test]
    fn validate_rejects_relative_rootfs() {
        let cfg = base_config(Path::new("rootfs"));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn validate_rejects_hostname_without_uts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = base_config(dir.path());
        cfg.namespaces.retain(|ns| ns.ns_type != NamespaceType::Uts);
        cfg.hostname = "box".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_namespace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = base_config(dir.path());
        cfg.namespaces.push(Namespace::new(NamespaceType::Pid));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_masked_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = base_config(dir.path());
        cfg.readonly_paths = vec![PathBuf::from("/proc/sys")];
        cfg.validate().expect("absolute read-only path");
        cfg.masked_paths = vec![PathBuf::from("proc/kcore")];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn port_mapping_parses_two_ports() {
        assert_eq!(parse_port_mapping("8080:80").unwrap(), (8080, 80));
        assert!(parse_port_mapping("8080").is_err());
        assert!(parse_port_mapping("x:80").is_err());
        assert!(parse_port_mapping("8080:99999").is_err());
    }

    #[test]
    fn process_search_path_reads_env() {
        let process = ProcessConfig {
            args: vec!["sh".into()],
            env: vec!["TERM=xterm".into(), "PATH=/bin".into()],
            ..ProcessConfig::default()
        };
        assert_eq!(process.search_path(), Some("/bin"));
        assert_eq!(process.cwd_or_root(), Path::new("/"));
    }
}
