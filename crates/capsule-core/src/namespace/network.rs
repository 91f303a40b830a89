//! Running work inside another process's network namespace.
//!
//! `setns(2)` acts on the calling thread only, so the closure runs on a
//! dedicated thread. Commands spawned from that thread inherit its
//! namespace.

use std::fs::File;
use std::os::fd::AsFd;

use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::NamespaceType;
use nix::sched::CloneFlags;

use super::namespace_path;

/// Restores the thread's original network namespace when dropped.
struct NetnsGuard {
    original: File,
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = nix::sched::setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET) {
            tracing::warn!(error = %e, "failed to restore original network namespace");
        }
    }
}

/// Runs `f` inside the network namespace of `pid`.
///
/// # Errors
///
/// Returns `System` if the namespace cannot be entered, or whatever `f`
/// returns.
pub fn run_in_netns<F, T>(pid: i32, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    let target_path = namespace_path(pid, NamespaceType::Net);
    std::thread::scope(|scope| {
        scope
            .spawn(move || {
                let original = File::open("/proc/thread-self/ns/net")
                    .map_err(|e| CapsuleError::io("/proc/thread-self/ns/net", e))?;
                let target =
                    File::open(&target_path).map_err(|e| CapsuleError::io(&target_path, e))?;
                nix::sched::setns(target.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
                    CapsuleError::system(format!("setns {}", target_path.display()), e)
                })?;
                let _guard = NetnsGuard { original };
                tracing::debug!(pid, "entered network namespace");
                f()
            })
            .join()
            .map_err(|_| CapsuleError::Network {
                message: format!("network namespace worker for pid {pid} panicked"),
            })?
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_process_is_reported() {
        let err = run_in_netns(i32::MAX, || Ok(())).unwrap_err();
        assert_eq!(err.kind(), capsule_common::error::ErrorKind::Io);
    }
}
