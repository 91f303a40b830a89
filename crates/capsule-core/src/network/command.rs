//! Thin wrappers around the `ip` and `iptables` tools.

use std::path::PathBuf;
use std::process::Command;

use capsule_common::error::{CapsuleError, Result};

/// Locates `binary` on the host search path.
fn find_tool(binary: &str) -> Result<PathBuf> {
    which::which(binary).map_err(|_| CapsuleError::Network {
        message: format!("{binary} not found (install iproute2 and iptables)"),
    })
}

fn run(binary: &str, args: &[&str]) -> Result<String> {
    let tool = find_tool(binary)?;
    let output = Command::new(&tool)
        .args(args)
        .output()
        .map_err(|e| CapsuleError::Network {
            message: format!("failed to run {binary}: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CapsuleError::Network {
            message: format!("{binary} {} failed: {}", args.join(" "), stderr.trim()),
        });
    }
    tracing::trace!(binary, args = %args.join(" "), "network command ok");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs `ip` with `args` and returns its stdout.
///
/// # Errors
///
/// Returns `Network` if `ip` is missing or exits non-zero.
pub fn run_ip(args: &[&str]) -> Result<String> {
    run("ip", args)
}

/// Runs `iptables` with `args`.
///
/// # Errors
///
/// Returns `Network` if `iptables` is missing or exits non-zero.
pub fn run_iptables(args: &[&str]) -> Result<()> {
    run("iptables", args).map(drop)
}

/// Returns whether a link called `name` exists in the current network
/// namespace.
#[must_use]
pub fn link_exists(name: &str) -> bool {
    std::path::Path::new("/sys/class/net").join(name).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_link_exists() {
        assert!(link_exists("lo"));
        assert!(!link_exists("capsule-no-such-link"));
    }

    #[test]
    fn missing_tool_is_a_network_error() {
        let err = run("capsule-no-such-tool", &[]).unwrap_err();
        assert_eq!(err.kind(), capsule_common::error::ErrorKind::Network);
    }
}
