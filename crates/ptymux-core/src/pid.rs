use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::errors::MuxError;

/// Record `pid` in the PID file, creating parent directories as needed.
///
/// The daemon calls this after detaching, so the recorded pid is the
/// grandchild's and not the invoking process's.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<(), MuxError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{pid}\n"))?;
    debug!(event = "core.pid.write_completed", pid = pid, path = %path.display());
    Ok(())
}

/// PID stored in the file. `None` when missing or unparsable.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let content = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(
                event = "core.pid.read_failed",
                path = %path.display(),
                error = %e,
            );
            return None;
        }
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => Some(pid),
        _ => {
            warn!(
                event = "core.pid.parse_failed",
                path = %path.display(),
                content = %content.trim(),
            );
            None
        }
    }
}

pub fn remove_pid_file(path: &Path) -> Result<(), MuxError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(event = "core.pid.remove_completed", path = %path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MuxError::Io(e)),
    }
}

/// `kill(pid, 0)`: existence check without delivering a signal.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists, owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// PID of the running server, if any.
///
/// A PID file naming a dead process is stale and gets removed.
pub fn check_server_running(pid_path: &Path) -> Option<u32> {
    let pid = read_pid_file(pid_path)?;
    if is_process_alive(pid) {
        return Some(pid);
    }

    warn!(
        event = "core.pid.stale_detected",
        pid = pid,
        path = %pid_path.display(),
    );
    if let Err(e) = remove_pid_file(pid_path) {
        warn!(
            event = "core.pid.stale_remove_failed",
            pid = pid,
            path = %pid_path.display(),
            error = %e,
        );
    }
    None
}

/// Removes the PID file when dropped, as long as it still names `pid`.
///
/// A newer server that has already overwritten the file keeps its entry.
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
    pid: u32,
}

impl PidFileGuard {
    pub fn create(path: PathBuf, pid: u32) -> Result<Self, MuxError> {
        write_pid_file(&path, pid)?;
        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if read_pid_file(&self.path) != Some(self.pid) {
            return;
        }
        if let Err(e) = remove_pid_file(&self.path) {
            warn!(
                event = "core.pid.remove_failed",
                path = %self.path.display(),
                error = %e,
            );
        }
    }
}
