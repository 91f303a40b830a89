//! Wire codec for the parent/child sync channel.
//!
//! The channel is a stream socket pair. Messages on it, in order:
//!
//! 1. parent -> child: namespace join paths (`i32` length, then the paths
//!    joined by `,`),
//! 2. parent -> child: clone flags (`i32`),
//! 3. child -> parent: pid of the cloned container process (`i32`),
//! 4. parent -> child: JSON launch payload, terminated by EOF,
//! 5. child -> parent: one framed [`SyncMessage`].
//!
//! Integers are 4-byte big-endian.

use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

use capsule_common::error::{CapsuleError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Separator between namespace paths.
pub const NS_DELIMITER: char = ',';

/// Upper bound on a single framed payload.
const MAX_FRAME_LEN: i32 = 16 * 1024 * 1024;

/// Readiness report sent by the container process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Setup finished; the process is waiting for the continue signal.
    Ready,
    /// Setup failed.
    Error {
        /// Failure description.
        message: String,
    },
}

fn pipe_err(what: &str, e: &std::io::Error) -> CapsuleError {
    CapsuleError::Pipe {
        message: format!("{what}: {e}"),
    }
}

/// Writes a big-endian `i32`.
///
/// # Errors
///
/// Returns `Pipe` on write failure.
pub fn write_i32<W: Write>(w: &mut W, value: i32) -> Result<()> {
    w.write_all(&value.to_be_bytes())
        .map_err(|e| pipe_err("write int", &e))
}

/// Reads a big-endian `i32`.
///
/// # Errors
///
/// Returns `Pipe` if fewer than four bytes arrive.
pub fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0_u8; 4];
    r.read_exact(&mut buf).map_err(|e| pipe_err("read int", &e))?;
    Ok(i32::from_be_bytes(buf))
}

fn read_len<R: Read>(r: &mut R) -> Result<usize> {
    let len = read_i32(r)?;
    if !(0..=MAX_FRAME_LEN).contains(&len) {
        return Err(CapsuleError::Pipe {
            message: format!("invalid frame length {len}"),
        });
    }
    usize::try_from(len).map_err(|_| CapsuleError::Pipe {
        message: format!("invalid frame length {len}"),
    })
}

fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<()> {
    let len = i32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| CapsuleError::Pipe {
            message: format!("frame too large: {} bytes", payload.len()),
        })?;
    write_i32(w, len)?;
    w.write_all(payload).map_err(|e| pipe_err("write frame", &e))
}

fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_len(r)?;
    let mut buf = vec![0_u8; len];
    r.read_exact(&mut buf).map_err(|e| pipe_err("read frame", &e))?;
    Ok(buf)
}

/// Writes the namespace join paths.
///
/// # Errors
///
/// Returns `Pipe` on write failure or if a path contains the delimiter.
pub fn write_namespaces<W: Write>(w: &mut W, paths: &[PathBuf]) -> Result<()> {
    let mut joined = Vec::with_capacity(paths.len());
    for path in paths {
        let s = path.to_str().ok_or_else(|| CapsuleError::Pipe {
            message: format!("namespace path is not UTF-8: {}", path.display()),
        })?;
        if s.contains(NS_DELIMITER) {
            return Err(CapsuleError::Pipe {
                message: format!("namespace path contains '{NS_DELIMITER}': {s}"),
            });
        }
        joined.push(s);
    }
    write_frame(w, joined.join(",").as_bytes())
}

/// Reads the namespace join paths.
///
/// # Errors
///
/// Returns `Pipe` on short reads or invalid UTF-8.
pub fn read_namespaces<R: Read>(r: &mut R) -> Result<Vec<PathBuf>> {
    let buf = read_frame(r)?;
    let joined = String::from_utf8(buf).map_err(|e| CapsuleError::Pipe {
        message: format!("namespace paths are not UTF-8: {e}"),
    })?;
    Ok(joined
        .split(NS_DELIMITER)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect())
}

/// Writes a JSON payload. The caller signals its end by closing the
/// write side.
///
/// # Errors
///
/// Returns `Serialization` or `Pipe`.
pub fn write_config<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *w, value)?;
    w.flush().map_err(|e| pipe_err("flush config", &e))
}

/// Reads a JSON payload until EOF.
///
/// # Errors
///
/// Returns `Pipe` on read failure or `Serialization` on malformed JSON.
pub fn read_config<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    let mut buf = Vec::new();
    let _ = r
        .read_to_end(&mut buf)
        .map_err(|e| pipe_err("read config", &e))?;
    if buf.is_empty() {
        return Err(CapsuleError::Pipe {
            message: "config channel closed before any data arrived".into(),
        });
    }
    Ok(serde_json::from_slice(&buf)?)
}

/// Writes a framed readiness report.
///
/// # Errors
///
/// Returns `Serialization` or `Pipe`.
pub fn write_message<W: Write>(w: &mut W, message: &SyncMessage) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    write_frame(w, &payload)
}

/// Reads a framed readiness report. Returns `Ok(None)` on a clean EOF,
/// meaning the child exited without reporting.
///
/// # Errors
///
/// Returns `Pipe` on a truncated frame or `Serialization` on bad JSON.
pub fn read_message<R: Read>(r: &mut R) -> Result<Option<SyncMessage>> {
    let mut first = [0_u8; 1];
    loop {
        match r.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(pipe_err("read message", &e)),
        }
    }
    let mut rest = [0_u8; 3];
    r.read_exact(&mut rest)
        .map_err(|e| pipe_err("read message length", &e))?;
    let len = i32::from_be_bytes([first[0], rest[0], rest[1], rest[2]]);
    let mut chained = std::io::Cursor::new(len.to_be_bytes()).chain(r);
    let payload = read_frame(&mut chained)?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn namespaces_and_flags_share_one_stream() {
        let mut buf = Vec::new();
        let paths = vec![
            PathBuf::from("/proc/10/ns/ipc"),
            PathBuf::from("/proc/10/ns/mnt"),
        ];
        write_namespaces(&mut buf, &paths).unwrap();
        write_i32(&mut buf, 0x2000_0000).unwrap();

        let mut r = Cursor::new(buf);
        assert_eq!(read_namespaces(&mut r).unwrap(), paths);
        assert_eq!(read_i32(&mut r).unwrap(), 0x2000_0000);
    }

    #[test]
    fn empty_namespace_list_is_zero_length() {
        let mut buf = Vec::new();
        write_namespaces(&mut buf, &[]).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);
        assert!(read_namespaces(&mut Cursor::new(buf)).unwrap().is_empty());
    }

    #[test]
    fn integers_are_big_endian() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 258).unwrap();
        assert_eq!(buf, vec![0, 0, 1, 2]);
    }

    #[test]
    fn truncated_stream_is_a_pipe_error() {
        let mut buf = Vec::new();
        write_namespaces(&mut buf, &[PathBuf::from("/proc/1/ns/net")]).unwrap();
        buf.truncate(buf.len() - 2);
        let err = read_namespaces(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), capsule_common::error::ErrorKind::Pipe);
    }

    #[test]
    fn negative_length_is_rejected() {
        let buf = (-5_i32).to_be_bytes().to_vec();
        assert!(read_namespaces(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn delimiter_in_path_is_rejected() {
        let mut buf = Vec::new();
        assert!(write_namespaces(&mut buf, &[PathBuf::from("/a,b")]).is_err());
    }

    #[test]
    fn config_reads_to_eof() {
        let mut buf = Vec::new();
        write_config(&mut buf, &vec!["a".to_owned(), "b".to_owned()]).unwrap();
        let back: Vec<String> = read_config(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back, vec!["a", "b"]);
    }

    #[test]
    fn empty_config_stream_fails() {
        let err = read_config::<_, Vec<String>>(&mut Cursor::new(Vec::new())).unwrap_err();
        assert_eq!(err.kind(), capsule_common::error::ErrorKind::Pipe);
    }

    #[test]
    fn messages_are_framed() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &SyncMessage::Error {
                message: "mount /proc failed".into(),
            },
        )
        .unwrap();
        write_message(&mut buf, &SyncMessage::Ready).unwrap();

        let mut r = Cursor::new(buf);
        assert!(matches!(
            read_message(&mut r).unwrap(),
            Some(SyncMessage::Error { message }) if message.contains("/proc")
        ));
        assert_eq!(read_message(&mut r).unwrap(), Some(SyncMessage::Ready));
        assert_eq!(read_message(&mut r).unwrap(), None);
    }

    #[test]
    fn half_written_message_is_an_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &SyncMessage::Ready).unwrap();
        buf.truncate(6);
        assert!(read_message(&mut Cursor::new(buf)).is_err());
    }
}
