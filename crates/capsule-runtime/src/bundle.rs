//! OCI bundle loading.
//!
//! Only the subset of `config.json` the runtime acts on is modelled;
//! unknown fields are ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use capsule_common::config::{
    CgroupConfig, ContainerConfig, Device, EndpointConfig, Mount, Namespace, ProcessConfig, Rlimit,
};
use capsule_common::constants::{BUNDLE_CONFIG_FILENAME, DEFAULT_PATH};
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::{ContainerId, NamespaceType};
use capsule_core::filesystem::mount::parse_mount_options;
use serde::{Deserialize, Serialize};

/// OCI version written into generated bundles.
pub const OCI_VERSION: &str = "1.0.2";

/// Top-level `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// OCI runtime-spec version.
    #[serde(default)]
    pub oci_version: String,
    /// Root filesystem.
    pub root: Option<Root>,
    /// Container's first process.
    pub process: Option<Process>,
    /// Hostname inside the UTS namespace.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// Additional mounts, in order.
    #[serde(default)]
    pub mounts: Vec<SpecMount>,
    /// Linux-specific settings.
    pub linux: Option<Linux>,
    /// Free-form annotations, stored as container labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// `root` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// Rootfs path, absolute or relative to the bundle.
    pub path: PathBuf,
    /// Mount the rootfs read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// `process` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Allocate a terminal. Accepted for compatibility; stdio is inherited.
    #[serde(default)]
    pub terminal: bool,
    /// Identity the process runs as.
    #[serde(default)]
    pub user: User,
    /// Command and arguments.
    pub args: Vec<String>,
    /// `KEY=value` environment entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Absolute working directory.
    pub cwd: PathBuf,
    /// POSIX resource limits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<SpecRlimit>,
}

/// `process.user`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id.
    #[serde(default)]
    pub uid: u32,
    /// Group id.
    #[serde(default)]
    pub gid: u32,
}

/// One `process.rlimits` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecRlimit {
    /// `RLIMIT_*` name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Hard limit.
    pub hard: u64,
    /// Soft limit.
    pub soft: u64,
}

/// One `mounts` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecMount {
    /// Absolute path inside the container.
    pub destination: PathBuf,
    /// Filesystem type.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Mount source.
    #[serde(default)]
    pub source: String,
    /// `mount(8)` style options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// `linux` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Linux {
    /// Namespaces to create or join.
    #[serde(default)]
    pub namespaces: Vec<LinuxNamespace>,
    /// Cgroup resources.
    pub resources: Option<Resources>,
    /// Kernel parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctl: BTreeMap<String, String>,
    /// Device nodes beyond the default set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<LinuxDevice>,
    /// Paths made read-only inside the container.
    #[serde(default, rename = "readonlyPaths", skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<PathBuf>,
    /// Paths hidden inside the container.
    #[serde(default, rename = "maskedPaths", skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<PathBuf>,
}

/// One `linux.namespaces` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxNamespace {
    /// OCI namespace name (`pid`, `network`, `mount`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Existing namespace to join instead of creating one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// `linux.resources`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory controller settings.
    pub memory: Option<Memory>,
    /// CPU controller settings.
    pub cpu: Option<Cpu>,
}

/// `linux.resources.memory`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    /// Limit in bytes.
    pub limit: Option<i64>,
}

/// `linux.resources.cpu`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    /// Relative CPU weight.
    pub shares: Option<u64>,
    /// CPU list for the cpuset controller.
    pub cpus: Option<String>,
}

/// One `linux.devices` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxDevice {
    /// Absolute path inside the container.
    pub path: PathBuf,
    /// `c`, `b`, `u` or `p`.
    #[serde(rename = "type")]
    pub kind: char,
    /// Major number.
    #[serde(default)]
    pub major: i64,
    /// Minor number.
    #[serde(default)]
    pub minor: i64,
    /// Permission bits.
    pub file_mode: Option<u32>,
    /// Owner uid.
    pub uid: Option<u32>,
    /// Owner gid.
    pub gid: Option<u32>,
}

impl Spec {
    /// Reads `config.json` from a bundle directory.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the file is missing, or a
    /// `Serialization` error if it is malformed.
    pub fn load(bundle: &Path) -> Result<Self> {
        let path = bundle.join(BUNDLE_CONFIG_FILENAME);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CapsuleError::ConfigInvalid {
                    message: format!("{} not found", path.display()),
                });
            }
            Err(e) => return Err(CapsuleError::io(&path, e)),
        };
        let spec = serde_json::from_slice(&data)?;
        tracing::debug!(path = %path.display(), "bundle configuration loaded");
        Ok(spec)
    }

    /// Writes `config.json` into a bundle directory. An existing file is
    /// never overwritten.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the file exists, or `Io` on write
    /// failure.
    pub fn write(&self, bundle: &Path) -> Result<PathBuf> {
        let path = bundle.join(BUNDLE_CONFIG_FILENAME);
        if path.exists() {
            return Err(CapsuleError::ConfigInvalid {
                message: format!("{} already exists", path.display()),
            });
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| CapsuleError::io(&path, e))?;
        Ok(path)
    }

    /// A starter configuration: `sh` in a read-only `rootfs` with every
    /// supported namespace.
    #[must_use]
    pub fn example() -> Self {
        let mount = |destination: &str, kind: &str, source: &str, options: &[&str]| SpecMount {
            destination: PathBuf::from(destination),
            kind: kind.to_owned(),
            source: source.to_owned(),
            options: options.iter().map(|o| (*o).to_owned()).collect(),
        };
        Self {
            oci_version: OCI_VERSION.to_owned(),
            root: Some(Root {
                path: PathBuf::from("rootfs"),
                readonly: true,
            }),
            process: Some(Process {
                terminal: false,
                user: User::default(),
                args: vec!["sh".to_owned()],
                env: vec![format!("PATH={DEFAULT_PATH}"), "TERM=xterm".to_owned()],
                cwd: PathBuf::from("/"),
                rlimits: vec![SpecRlimit {
                    kind: "RLIMIT_NOFILE".to_owned(),
                    hard: 1024,
                    soft: 1024,
                }],
            }),
            hostname: "capsule".to_owned(),
            mounts: vec![
                mount("/proc", "proc", "proc", &[]),
                mount("/dev", "tmpfs", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"]),
                mount(
                    "/dev/pts",
                    "devpts",
                    "devpts",
                    &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
                ),
                mount("/dev/shm", "tmpfs", "shm", &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
                mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
                mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
            ],
            linux: Some(Linux {
                namespaces: ["pid", "network", "ipc", "uts", "mount"]
                    .into_iter()
                    .map(|kind| LinuxNamespace {
                        kind: kind.to_owned(),
                        path: None,
                    })
                    .collect(),
                resources: Some(Resources {
                    memory: Some(Memory {
                        limit: Some(100 * 1024 * 1024),
                    }),
                    cpu: Some(Cpu {
                        shares: Some(10),
                        cpus: None,
                    }),
                }),
                sysctl: BTreeMap::new(),
                devices: Vec::new(),
                readonly_paths: ["/proc/bus", "/proc/fs", "/proc/irq", "/proc/sys", "/proc/sysrq-trigger"]
                    .into_iter()
                    .map(PathBuf::from)
                    .collect(),
                masked_paths: ["/proc/kcore", "/proc/keys", "/proc/timer_list", "/sys/firmware"]
                    .into_iter()
                    .map(PathBuf::from)
                    .collect(),
            }),
            annotations: BTreeMap::new(),
        }
    }

    /// Converts the bundle into runtime configuration. Relative paths are
    /// resolved against `bundle`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if `root` or `process` is missing, the
    /// process is malformed, or a namespace is unsupported.
    pub fn to_configs(&self, bundle: &Path) -> Result<(ContainerConfig, ProcessConfig)> {
        let root = self.root.as_ref().ok_or_else(|| invalid("root must be specified"))?;
        let process = self
            .process
            .as_ref()
            .ok_or_else(|| invalid("process must be specified"))?;
        let process = convert_process(process)?;

        let bundle = std::path::absolute(bundle).map_err(|e| CapsuleError::io(bundle, e))?;
        let rootfs = if root.path.is_absolute() {
            root.path.clone()
        } else {
            bundle.join(&root.path)
        };

        let mut labels = self.annotations.clone();
        let _ = labels.insert("bundle".to_owned(), bundle.display().to_string());

        let linux = self.linux.clone().unwrap_or_default();
        let namespaces = linux
            .namespaces
            .iter()
            .map(|ns| {
                Ok(Namespace {
                    ns_type: ns.kind.parse::<NamespaceType>()?,
                    path: ns.path.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let config = ContainerConfig {
            rootfs,
            readonly_fs: root.readonly,
            hostname: self.hostname.clone(),
            mounts: self.mounts.iter().map(|m| convert_mount(&bundle, m)).collect(),
            devices: merge_devices(&linux.devices),
            namespaces,
            cgroup: convert_resources(linux.resources.as_ref()),
            sysctls: linux.sysctl,
            endpoints: Vec::new(),
            labels,
            readonly_paths: linux.readonly_paths,
            masked_paths: linux.masked_paths,
        };
        Ok((config, process))
    }
}

fn invalid(message: impl Into<String>) -> CapsuleError {
    CapsuleError::ConfigInvalid {
        message: message.into(),
    }
}

fn convert_process(process: &Process) -> Result<ProcessConfig> {
    if !process.cwd.is_absolute() {
        return Err(invalid("process.cwd must be an absolute path"));
    }
    if process.args.is_empty() {
        return Err(invalid("process.args must not be empty"));
    }
    Ok(ProcessConfig {
        id: String::new(),
        args: process.args.clone(),
        env: process.env.clone(),
        cwd: process.cwd.clone(),
        user: format!("{}:{}", process.user.uid, process.user.gid),
        rlimits: process
            .rlimits
            .iter()
            .map(|r| Rlimit {
                kind: r.kind.clone(),
                hard: r.hard,
                soft: r.soft,
            })
            .collect(),
        init: true,
        detach: false,
    })
}

/// Bind mounts default to the `bind` type and resolve relative sources
/// against the bundle.
fn convert_mount(bundle: &Path, mount: &SpecMount) -> Mount {
    let (flags, data) = parse_mount_options(&mount.options);
    let mut device = mount.kind.clone();
    let mut source = mount.source.clone();
    if flags & u64::from(libc::MS_BIND) != 0 {
        if device.is_empty() {
            device = "bind".to_owned();
        }
        if !Path::new(&source).is_absolute() {
            source = bundle.join(&source).display().to_string();
        }
    }
    Mount {
        source,
        destination: mount.destination.clone(),
        device,
        flags,
        data,
    }
}

/// Default devices overlaid with the configured ones; a configured device
/// replaces a default at the same path.
fn merge_devices(configured: &[LinuxDevice]) -> Vec<Device> {
    let mut devices: Vec<Device> = Device::defaults()
        .into_iter()
        .filter(|d| !configured.iter().any(|c| c.path == d.path))
        .collect();
    devices.extend(configured.iter().map(|d| Device {
        dev_type: d.kind,
        path: d.path.clone(),
        major: d.major,
        minor: d.minor,
        permissions: "rwm".to_owned(),
        file_mode: d.file_mode.unwrap_or(0o666),
        uid: d.uid.unwrap_or(0),
        gid: d.gid.unwrap_or(0),
    }));
    devices
}

fn convert_resources(resources: Option<&Resources>) -> CgroupConfig {
    let Some(resources) = resources else {
        return CgroupConfig::default();
    };
    let cpu = resources.cpu.clone().unwrap_or_default();
    CgroupConfig {
        memory: resources.memory.and_then(|m| m.limit).unwrap_or(0),
        cpu_shares: cpu.shares.unwrap_or(0),
        cpuset_cpus: cpu.cpus.unwrap_or_default(),
        freezer: None,
    }
}

/// Endpoint attaching a container to `network`, with a fresh id.
#[must_use]
pub fn endpoint_config(network: &str, port_mappings: Vec<String>) -> EndpointConfig {
    EndpointConfig {
        id: ContainerId::generate().to_string(),
        network: network.to_owned(),
        port_mappings,
    }
}
