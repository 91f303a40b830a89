//! Log files of detached container processes.
//!
//! The init process writes to `<container root>/container.log`; each
//! detached exec writes to `<container root>/exec-<exec id>.log`.

use std::path::{Path, PathBuf};

use capsule_common::constants::{
    CONTAINER_EXEC_LOG_PREFIX, CONTAINER_EXEC_LOG_SUFFIX, CONTAINER_INIT_LOG_FILENAME,
};
use capsule_common::error::{CapsuleError, Result};

/// Log file of the init process.
#[must_use]
pub fn init_log_path(container_root: &Path) -> PathBuf {
    container_root.join(CONTAINER_INIT_LOG_FILENAME)
}

/// Log file of a detached exec process.
#[must_use]
pub fn exec_log_path(container_root: &Path, exec_id: &str) -> PathBuf {
    container_root.join(format!(
        "{CONTAINER_EXEC_LOG_PREFIX}{exec_id}{CONTAINER_EXEC_LOG_SUFFIX}"
    ))
}

/// Reads a log file.
///
/// Returns an empty string if the file does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    std::fs::read_to_string(path).map_err(|e| CapsuleError::io(path, e))
}

/// Ids of the exec processes that left a log under `container_root`,
/// sorted.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be listed.
pub fn exec_log_ids(container_root: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(container_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CapsuleError::io(container_root, e)),
    };
    let mut ids: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            name.strip_prefix(CONTAINER_EXEC_LOG_PREFIX)?
                .strip_suffix(CONTAINER_EXEC_LOG_SUFFIX)
                .map(str::to_owned)
        })
        .collect();
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_paths_are_constructed_correctly() {
        let root = Path::new("/var/run/capsule/containers/web");
        assert_eq!(
            init_log_path(root).to_str().unwrap(),
            "/var/run/capsule/containers/web/container.log"
        );
        assert_eq!(
            exec_log_path(root, "e1").to_str().unwrap(),
            "/var/run/capsule/containers/web/exec-e1.log"
        );
    }

    #[test]
    fn read_logs_missing_file_returns_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = read_logs(&init_log_path(dir.path())).expect("should succeed");
        assert!(content.is_empty());
    }

    #[test]
    fn read_logs_returns_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = init_log_path(dir.path());
        std::fs::write(&path, "hello\nworld\n").expect("write");
        assert_eq!(read_logs(&path).expect("read"), "hello\nworld\n");
    }

    #[test]
    fn exec_logs_are_listed_by_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(exec_log_path(dir.path(), "b"), "").expect("write b");
        std::fs::write(exec_log_path(dir.path(), "a"), "").expect("write a");
        std::fs::write(init_log_path(dir.path()), "").expect("write init");
        std::fs::write(dir.path().join("state.json"), "{}").expect("write state");

        assert_eq!(exec_log_ids(dir.path()).expect("list"), vec!["a", "b"]);
    }

    #[test]
    fn missing_container_root_has_no_exec_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(exec_log_ids(&dir.path().join("gone")).expect("list").is_empty());
    }
}
