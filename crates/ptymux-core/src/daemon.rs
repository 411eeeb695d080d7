//! Double-fork detachment of the server into a background daemon.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::libc;
use nix::sys::stat::{Mode, umask};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, chdir, dup2, fork, setsid};
use tracing::{debug, info, warn};

use crate::errors::{ForkStage, MuxError};

/// Exit status of the daemon when its standard streams cannot be redirected.
pub const REDIRECT_FAILED_EXIT_CODE: i32 = 3;

const DEV_NULL: &str = "/dev/null";

/// Which side of the daemonization a process ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonRole {
    /// The invoking process. It must stop here and never create pty sessions.
    Parent,
    /// The detached background process that carries on as the server.
    Daemon,
}

/// Redirection targets for the daemon's standard streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStreams {
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl Default for DaemonStreams {
    fn default() -> Self {
        Self {
            stdin: PathBuf::from(DEV_NULL),
            stdout: PathBuf::from(DEV_NULL),
            stderr: PathBuf::from(DEV_NULL),
        }
    }
}

impl DaemonStreams {
    pub fn new(stdin: PathBuf, stdout: PathBuf, stderr: PathBuf) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }
}

/// Detach into a daemon, terminating the process on failure.
///
/// Returns [`DaemonRole::Parent`] in the invoking process once the
/// intermediate child has exited, and [`DaemonRole::Daemon`] in the detached
/// grandchild. A failed fork is reported on the still-attached stderr and ends
/// the process with the stage's exit code (1 or 2).
///
/// Must run before any thread or pty session exists.
pub fn daemonize(streams: &DaemonStreams) -> DaemonRole {
    match try_daemonize(streams) {
        Ok(role) => role,
        Err(err) => {
            eprintln!("{err}");
            let code = match err {
                MuxError::ForkFailed { stage, .. } => stage.exit_code(),
                _ => REDIRECT_FAILED_EXIT_CODE,
            };
            std::process::exit(code);
        }
    }
}

/// Fallible form of [`daemonize`].
///
/// An `Err` from the first fork is returned in the invoking process. Every
/// later `Err` is returned inside the intermediate or the daemon process, which
/// must then exit instead of carrying on as the caller.
pub fn try_daemonize(streams: &DaemonStreams) -> Result<DaemonRole, MuxError> {
    // SAFETY: callers guarantee the process is still single-threaded.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            wait_for_intermediate(child);
            return Ok(DaemonRole::Parent);
        }
        Ok(ForkResult::Child) => {}
        Err(errno) => {
            return Err(MuxError::ForkFailed {
                stage: ForkStage::First,
                errno,
            });
        }
    }

    // Decouple from the parent's environment. The new session is created here,
    // in the intermediate, so the final process is never a session leader.
    chdir("/").map_err(|e| MuxError::Io(e.into()))?;
    umask(Mode::empty());
    setsid().map_err(MuxError::NewSessionFailed)?;

    // SAFETY: still single-threaded; the parent branch only calls `_exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => {
            // SAFETY: leave without running atexit handlers or flushing
            // buffers duplicated from the original process.
            unsafe { libc::_exit(0) }
        }
        Ok(ForkResult::Child) => {}
        Err(errno) => {
            return Err(MuxError::ForkFailed {
                stage: ForkStage::Second,
                errno,
            });
        }
    }

    redirect_standard_streams(streams)?;
    Ok(DaemonRole::Daemon)
}

fn wait_for_intermediate(child: Pid) {
    let status = loop {
        match waitpid(child, None) {
            Err(Errno::EINTR) => continue,
            other => break other,
        }
    };
    match status {
        Ok(WaitStatus::Exited(_, 0)) => {
            debug!(event = "core.daemon.intermediate_exited", pid = child.as_raw());
        }
        Ok(other) => warn!(
            event = "core.daemon.intermediate_failed",
            pid = child.as_raw(),
            status = ?other,
        ),
        Err(e) => warn!(
            event = "core.daemon.intermediate_wait_failed",
            pid = child.as_raw(),
            error = %e,
        ),
    }
}

/// Point stdin at `streams.stdin` (read-only) and stdout/stderr at their
/// targets opened for append. Standard error is a raw descriptor with no
/// user-space buffer, so when both share a file their lines may interleave
/// out of order.
fn redirect_standard_streams(streams: &DaemonStreams) -> Result<(), MuxError> {
    let stdin = open_stream("stdin", &streams.stdin, OpenOptions::new().read(true))?;
    let stdout = open_stream(
        "stdout",
        &streams.stdout,
        OpenOptions::new().append(true).create(true),
    )?;
    let stderr = open_stream(
        "stderr",
        &streams.stderr,
        OpenOptions::new().append(true).create(true),
    )?;

    for (name, path, file, target) in [
        ("stdin", &streams.stdin, &stdin, libc::STDIN_FILENO),
        ("stdout", &streams.stdout, &stdout, libc::STDOUT_FILENO),
        ("stderr", &streams.stderr, &stderr, libc::STDERR_FILENO),
    ] {
        dup2(file.as_raw_fd(), target).map_err(|errno| MuxError::StreamRedirectFailed {
            stream: name,
            path: path.clone(),
            source: errno.into(),
        })?;
    }

    info!(
        event = "core.daemon.streams_redirected",
        stdin = %streams.stdin.display(),
        stdout = %streams.stdout.display(),
        stderr = %streams.stderr.display(),
    );
    Ok(())
}

fn open_stream(
    stream: &'static str,
    path: &Path,
    options: &OpenOptions,
) -> Result<File, MuxError> {
    options
        .open(path)
        .map_err(|source| MuxError::StreamRedirectFailed {
            stream,
            path: path.to_path_buf(),
            source,
        })
}
