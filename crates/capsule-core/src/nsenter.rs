//! Early namespace-entry shim for the re-executed `init` process.
//!
//! A process cannot move itself into a new PID namespace, and joining a
//! mount namespace from a multi-threaded process fails. So before anything
//! else runs (logging included) the shim joins the requested namespaces,
//! clones the real container process with `CLONE_PARENT` and the requested
//! clone flags, reports that child's pid to the runtime and exits. Only the
//! cloned child returns from [`nsexec`].

use std::fs::File;
use std::io::Write;
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, RawFd};

use capsule_common::constants::ENV_SYNC_PIPE;
use capsule_common::error::{CapsuleError, Result};

use crate::{namespace, sync};

/// Reads the sync descriptor number from the environment.
///
/// Returns `Ok(None)` when the variable is unset, i.e. the process was not
/// launched by the runtime.
///
/// # Errors
///
/// Returns `Pipe` if the value is not a positive integer.
pub fn sync_fd_from_env() -> Result<Option<RawFd>> {
    let Ok(raw) = std::env::var(ENV_SYNC_PIPE) else {
        return Ok(None);
    };
    match raw.parse::<RawFd>() {
        Ok(fd) if fd > 0 => Ok(Some(fd)),
        _ => Err(CapsuleError::Pipe {
            message: format!("invalid {ENV_SYNC_PIPE} value: {raw:?}"),
        }),
    }
}

/// Borrows the inherited sync descriptor as a `File` that is never closed
/// here; the initializer takes ownership of it later.
fn borrow_channel(fd: RawFd) -> ManuallyDrop<File> {
    // SAFETY: the descriptor was placed at this number by the runtime before
    // exec and stays open for the lifetime of the process. ManuallyDrop keeps
    // this handle from closing it.
    ManuallyDrop::new(unsafe { File::from_raw_fd(fd) })
}

/// Joins namespaces, clones the container process and exits in the
/// intermediate process. Returns in the cloned child only.
///
/// Does nothing when the process was not launched by the runtime.
pub fn nsexec() {
    let fd = match sync_fd_from_env() {
        Ok(Some(fd)) => fd,
        Ok(None) => return,
        Err(e) => abort(&e),
    };
    match enter_and_clone(fd) {
        Ok(0) => {}
        Ok(_) => std::process::exit(0),
        Err(e) => abort(&e),
    }
}

/// Returns 0 in the cloned child and the child's pid in the intermediate.
fn enter_and_clone(fd: RawFd) -> Result<i32> {
    let mut channel = borrow_channel(fd);

    for path in sync::read_namespaces(&mut *channel)? {
        namespace::join(&path)?;
    }
    let flags = sync::read_i32(&mut *channel)?;

    #[allow(clippy::cast_sign_loss)]
    let clone_flags = (flags | libc::CLONE_PARENT | libc::SIGCHLD) as libc::c_ulong;

    // SAFETY: the process is still single-threaded at this point. A raw
    // clone without a new stack behaves like fork: the child continues on a
    // copy of this stack and returns 0.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            clone_flags,
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_int>(),
            std::ptr::null_mut::<libc::c_int>(),
            0_usize,
        )
    };
    if ret < 0 {
        return Err(CapsuleError::system(
            "clone container process",
            std::io::Error::last_os_error(),
        ));
    }
    if ret == 0 {
        return Ok(0);
    }

    let pid = i32::try_from(ret).map_err(|_| CapsuleError::Pipe {
        message: format!("clone returned out-of-range pid {ret}"),
    })?;
    sync::write_i32(&mut *channel, pid)?;
    Ok(pid)
}

fn abort(err: &CapsuleError) -> ! {
    let _ = writeln!(std::io::stderr(), "nsenter: {err}");
    std::process::exit(1);
}
