//! Process inspection through `/proc/<pid>/stat`.

use std::path::PathBuf;

use capsule_common::error::{CapsuleError, Result};

/// Scheduler state reported in the third field of `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// `R`
    Running,
    /// `S`
    Sleeping,
    /// `D`
    DiskSleep,
    /// `Z`
    Zombie,
    /// `X` or `x`
    Dead,
    /// `T` or `t`
    Stopped,
    /// Any other code.
    Other(char),
}

impl ProcessState {
    fn from_code(code: char) -> Self {
        match code {
            'R' => Self::Running,
            'S' => Self::Sleeping,
            'D' => Self::DiskSleep,
            'Z' => Self::Zombie,
            'X' | 'x' => Self::Dead,
            'T' | 't' => Self::Stopped,
            other => Self::Other(other),
        }
    }

    /// Returns true for states that can no longer run user code.
    #[must_use]
    pub const fn is_defunct(self) -> bool {
        matches!(self, Self::Zombie | Self::Dead)
    }
}

/// The subset of `/proc/<pid>/stat` the runtime relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStat {
    /// Process id.
    pub pid: i32,
    /// Scheduler state.
    pub state: ProcessState,
    /// Start time in clock ticks since boot (field 22).
    pub start_time: u64,
}

impl ProcessStat {
    /// Reads the stat file of `pid`. Returns `Ok(None)` when the process
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read(pid: i32) -> Result<Option<Self>> {
        let path = PathBuf::from(format!("/proc/{pid}/stat"));
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            // ESRCH shows up when the process exits between open and read.
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(None),
            Err(e) => Err(CapsuleError::io(path, e)),
        }
    }

    /// Parses the contents of a stat file.
    ///
    /// The command name may contain spaces and parentheses, so the fields
    /// after it are located from the last `)`.
    ///
    /// # Errors
    ///
    /// Returns `System` if the line is truncated or malformed.
    pub fn parse(contents: &str) -> Result<Self> {
        let malformed = || {
            CapsuleError::system(
                "parse /proc stat",
                std::io::Error::new(std::io::ErrorKind::InvalidData, contents.trim().to_owned()),
            )
        };

        let open = contents.find('(').ok_or_else(malformed)?;
        let close = contents.rfind(')').ok_or_else(malformed)?;
        let pid = contents[..open]
            .trim()
            .parse::<i32>()
            .map_err(|_| malformed())?;

        // Fields after the command start at field 3 (state).
        let rest: Vec<&str> = contents[close + 1..].split_whitespace().collect();
        let state = rest
            .first()
            .and_then(|s| s.chars().next())
            .map(ProcessState::from_code)
            .ok_or_else(malformed)?;
        let start_time = rest
            .get(22 - 3)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(malformed)?;

        Ok(Self {
            pid,
            state,
            start_time,
        })
    }
}
