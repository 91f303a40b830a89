//! System-wide constants and default paths.

use std::time::Duration;

/// Default runtime root holding container, image, and network state.
pub const DEFAULT_RUNTIME_ROOT: &str = "/var/run/capsule";

/// Environment variable overriding the runtime root.
pub const RUNTIME_ROOT_ENV: &str = "CAPSULE_ROOT";

/// Directory under the runtime root holding one directory per container.
pub const CONTAINERS_DIR: &str = "containers";

/// Directory under the runtime root holding the image store.
pub const IMAGES_DIR: &str = "images";

/// Directory under the runtime root holding network state.
pub const NETWORK_DIR: &str = "network";

/// IPAM subnet map, relative to the runtime root.
pub const IPAM_SUBNET_FILE: &str = "network/ipam/subnet.json";

/// Directory of persisted network records, relative to the runtime root.
pub const NETWORKS_DIR: &str = "network/networks";

/// Per-container persisted state.
pub const STATE_FILENAME: &str = "state.json";

/// Marker present between `create` and `start`.
pub const NOT_EXEC_FLAG_FILENAME: &str = "not-exec.flag";

/// Log of a detached init process.
pub const CONTAINER_INIT_LOG_FILENAME: &str = "container.log";

/// Prefix of a detached exec process log (`exec-<id>.log`).
pub const CONTAINER_EXEC_LOG_PREFIX: &str = "exec-";

/// Suffix of a detached exec process log.
pub const CONTAINER_EXEC_LOG_SUFFIX: &str = ".log";

/// Bundle configuration file name.
pub const BUNDLE_CONFIG_FILENAME: &str = "config.json";

/// Binary re-executed to become the container process.
pub const CONTAINER_INIT_CMD: &str = "/proc/self/exe";

/// Argument selecting the internal `init` command.
pub const CONTAINER_INIT_ARG: &str = "init";

/// Environment variable carrying the inherited sync descriptor number.
pub const ENV_SYNC_PIPE: &str = "_CAPSULE_SYNC_PIPE";

/// Environment variable carrying the initializer mode (`init` or `setns`).
pub const ENV_INITIALIZER_TYPE: &str = "_CAPSULE_INITIALIZER_TYPE";

/// Number of standard descriptors preceding inherited extra files.
pub const DEFAULT_STD_FD_COUNT: i32 = 3;

/// Cgroup directory under each subsystem root that holds container cgroups.
pub const DEFAULT_CGROUP_PARENT: &str = "capsule";

/// Search path used when the process environment has no `PATH`.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// `/proc/<pid>/stat` polls, `POLL_INTERVAL` apart, while waiting for a
/// killed init process to exit.
pub const DESTROY_POLL_ATTEMPTS: u32 = 100;

/// Interval between destroy polls and `/proc` liveness polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on the parent's wait for the child's readiness report.
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Name of the only network driver.
pub const BRIDGE_DRIVER: &str = "bridge";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_budget_is_ten_seconds() {
        assert_eq!(POLL_INTERVAL * DESTROY_POLL_ATTEMPTS, Duration::from_secs(10));
    }

    #[test]
    fn exec_log_name_wraps_the_id() {
        let name = format!("{CONTAINER_EXEC_LOG_PREFIX}e1{CONTAINER_EXEC_LOG_SUFFIX}");
        assert_eq!(name, "exec-e1.log");
    }
}
