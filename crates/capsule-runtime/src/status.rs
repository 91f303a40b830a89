//! Container status derivation and the transition table.
//!
//! Status is never stored as truth. It is recomputed from the init
//! process (alive, same start time, not a zombie) and the not-exec marker,
//! and a cached value only moves along [`transition`].

use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::Status;
use capsule_core::proc::ProcessStat;

/// Whether the process recorded for a container is still the live init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Same pid, same start time, not defunct.
    Alive,
    /// Missing, recycled by another process, zombie or dead.
    Gone,
}

impl Liveness {
    /// Classifies a stat snapshot against the recorded start time.
    #[must_use]
    pub fn from_stat(stat: Option<&ProcessStat>, start_time: u64) -> Self {
        match stat {
            Some(stat) if stat.start_time == start_time && !stat.state.is_defunct() => {
                Self::Alive
            }
            _ => Self::Gone,
        }
    }

    /// Reads `/proc/<pid>/stat` and classifies it.
    ///
    /// # Errors
    ///
    /// Returns an error if the stat file exists but cannot be parsed.
    pub fn check(pid: i32, start_time: u64) -> Result<Self> {
        let stat = ProcessStat::read(pid)?;
        Ok(Self::from_stat(stat.as_ref(), start_time))
    }
}

/// Status implied by the init process and the not-exec marker.
#[must_use]
pub const fn detect_status(liveness: Liveness, marker_present: bool) -> Status {
    match (liveness, marker_present) {
        (Liveness::Gone, _) => Status::Stopped,
        (Liveness::Alive, true) => Status::Created,
        (Liveness::Alive, false) => Status::Running,
    }
}

/// Applies one step of the status table.
///
/// `detected` is the freshly recomputed status; it only matters for
/// `Running -> Stopped`, which is refused while the process still runs.
///
/// # Errors
///
/// Returns `ContainerStillRunning` for a stop request on a live container
/// and `InvalidStateTransition` for any pair outside the table.
pub fn transition(id: &str, current: Status, requested: Status, detected: Status) -> Result<Status> {
    use Status::{Created, Running, Stopped};
    match (current, requested) {
        (Stopped, Running | Stopped)
        | (Created, Running | Stopped | Created)
        | (Running, Running) => Ok(requested),
        (Running, Stopped) => {
            if detected == Running {
                Err(CapsuleError::ContainerStillRunning { id: id.to_owned() })
            } else {
                Ok(Stopped)
            }
        }
        (from, to) => Err(CapsuleError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }),
    }
}
