//! Handle on a process launched by an earlier runtime invocation.
//!
//! The process is no longer our child, so it cannot be waited for; its
//! liveness is polled through `/proc/<pid>/stat`.

use capsule_common::constants::POLL_INTERVAL;
use capsule_common::error::{CapsuleError, Result};
use nix::sys::signal::Signal;

use super::{ParentProcess, send_signal};
use crate::status::Liveness;

/// Lookup-only proxy rebuilt from persisted pid and start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoChildParentProcess {
    pid: i32,
    start_time: u64,
    detach: bool,
}

impl NoChildParentProcess {
    /// Rebuilds a handle from persisted values.
    #[must_use]
    pub const fn new(pid: i32, start_time: u64) -> Self {
        Self {
            pid,
            start_time,
            detach: true,
        }
    }

    /// Whether the recorded process is still alive.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc/<pid>/stat` cannot be parsed.
    pub fn liveness(&self) -> Result<Liveness> {
        Liveness::check(self.pid, self.start_time)
    }
}

impl ParentProcess for NoChildParentProcess {
    fn pid(&self) -> Option<i32> {
        Some(self.pid)
    }

    fn start(&mut self) -> Result<()> {
        Err(CapsuleError::System {
            context: format!("start process {}", self.pid),
            source: std::io::Error::other("process was launched by another runtime invocation"),
        })
    }

    fn wait(&mut self) -> Result<Option<i32>> {
        while self.liveness()? == Liveness::Alive {
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(None)
    }

    fn terminate(&mut self) -> Result<()> {
        Err(CapsuleError::System {
            context: format!("terminate process {}", self.pid),
            source: std::io::Error::other("process is not a child of this runtime"),
        })
    }

    fn start_time(&self) -> Option<u64> {
        Some(self.start_time)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        send_signal(self.pid, signal)
    }

    fn detach(&self) -> bool {
        self.detach
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use capsule_core::proc::ProcessStat;

    use super::*;

    #[test]
    fn start_and_terminate_are_refused() {
        let mut handle = NoChildParentProcess::new(1, 0);
        assert!(handle.start().is_err());
        assert!(handle.terminate().is_err());
        assert_eq!(handle.pid(), Some(1));
    }

    #[test]
    fn wait_returns_once_process_is_gone() {
        let mut child = Command::new("sleep").arg("0.3").spawn().expect("spawn");
        let pid = i32::try_from(child.id()).unwrap();
        let start_time = ProcessStat::read(pid).unwrap().unwrap().start_time;
        let waiter = std::thread::spawn(move || {
            let mut handle = NoChildParentProcess::new(pid, start_time);
            handle.wait()
        });
        // A zombie counts as gone, so reaping here is not required for the
        // poll to finish, but keeps the test tidy.
        let _ = child.wait().expect("wait sleep");
        assert_eq!(waiter.join().unwrap().unwrap(), None);
    }

    #[test]
    fn recycled_pid_is_not_alive() {
        let pid = i32::try_from(std::process::id()).unwrap();
        let start_time = ProcessStat::read(pid).unwrap().unwrap().start_time;
        let handle = NoChildParentProcess::new(pid, start_time + 10);
        assert_eq!(handle.liveness().unwrap(), Liveness::Gone);
    }
}
