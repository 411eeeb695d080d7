use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::libc;
use nix::pty::openpty;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, ttyname};
use tracing::debug;

use crate::errors::MuxError;
use crate::geometry::{self, GeometryUpdate};

/// Lifecycle of a pane's pty pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyState {
    Created,
    ControllingTtyEstablished,
    Running,
    Closed,
}

impl std::fmt::Display for PtyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyState::Created => write!(f, "created"),
            PtyState::ControllingTtyEstablished => write!(f, "controlling_tty_established"),
            PtyState::Running => write!(f, "running"),
            PtyState::Closed => write!(f, "closed"),
        }
    }
}

/// One pane's pty pair: the master end kept by the server, the slave device
/// path handed to the child, the child's pid and the last applied geometry.
///
/// Closing the master is the only way to cancel a pane: the kernel then
/// hangs up the slave and signals the child's session.
#[derive(Debug)]
pub struct PtySession {
    id: String,
    master: Option<File>,
    slave_path: PathBuf,
    child_pid: Option<Pid>,
    geometry: GeometryUpdate,
    state: PtyState,
}

/// A freshly opened pty pair, before any child exists.
pub struct OpenedPty {
    pub session: PtySession,
    pub slave: OwnedFd,
}

impl PtySession {
    /// Wrap an already opened master end.
    pub fn new(
        id: impl Into<String>,
        master: OwnedFd,
        slave_path: PathBuf,
        geometry: GeometryUpdate,
    ) -> Self {
        Self {
            id: id.into(),
            master: Some(File::from(master)),
            slave_path,
            child_pid: None,
            geometry,
            state: PtyState::Created,
        }
    }

    /// Allocate a new pty pair sized to `geometry`.
    ///
    /// Both ends are close-on-exec so shells spawned for other panes never
    /// inherit them. `dup2` onto the standard streams clears the flag on the
    /// copies a pane's own child keeps.
    pub fn open(id: impl Into<String>, geometry: GeometryUpdate) -> Result<OpenedPty, MuxError> {
        let winsize = libc::winsize {
            ws_row: geometry.rows,
            ws_col: geometry.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pair = openpty(Some(&winsize), None)
            .map_err(|e| MuxError::SpawnFailed(format!("openpty: {e}")))?;
        for fd in [&pair.master, &pair.slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(MuxError::IoControl)?;
        }
        let slave_path = slave_device_path(&pair.slave)?;

        let session = Self::new(id, pair.master, slave_path, geometry);
        debug!(
            event = "core.pty.open_completed",
            pane_id = session.id(),
            slave = %session.slave_path.display(),
            rows = geometry.rows,
            cols = geometry.cols,
        );
        Ok(OpenedPty {
            session,
            slave: pair.slave,
        })
    }

    // --- Getters ---

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PtyState {
        self.state
    }

    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    pub fn child_pid(&self) -> Option<Pid> {
        self.child_pid
    }

    pub fn geometry(&self) -> GeometryUpdate {
        self.geometry
    }

    pub fn master_fd(&self) -> Option<BorrowedFd<'_>> {
        self.master.as_ref().map(|f| f.as_fd())
    }

    pub fn master_raw_fd(&self) -> Option<RawFd> {
        self.master.as_ref().map(|f| f.as_raw_fd())
    }

    // --- State transitions ---

    /// `Created -> ControllingTtyEstablished`.
    pub fn mark_controlling_tty_established(&mut self) -> Result<(), MuxError> {
        self.transition(PtyState::Created, PtyState::ControllingTtyEstablished)
    }

    /// `ControllingTtyEstablished -> Running`, recording the child pid.
    pub fn set_running(&mut self, pid: Pid) -> Result<(), MuxError> {
        self.transition(PtyState::ControllingTtyEstablished, PtyState::Running)?;
        self.child_pid = Some(pid);
        Ok(())
    }

    /// Record the child pid without changing state (parent side, pre-handshake).
    pub(crate) fn attach_child(&mut self, pid: Pid) {
        self.child_pid = Some(pid);
    }

    /// Close the master end. Idempotent.
    pub fn close(&mut self) {
        if self.master.take().is_some() {
            debug!(event = "core.pty.close_completed", pane_id = self.id.as_str());
        }
        self.state = PtyState::Closed;
    }

    fn transition(&mut self, from: PtyState, to: PtyState) -> Result<(), MuxError> {
        if self.state != from {
            return Err(MuxError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    // --- I/O ---

    /// Apply a new geometry to the pty. Last write wins.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), MuxError> {
        let fd = self
            .master_raw_fd()
            .ok_or(MuxError::IoControl(nix::errno::Errno::EBADF))?;
        geometry::apply(fd, rows, cols)?;
        self.geometry = GeometryUpdate::new(rows, cols);
        Ok(())
    }

    /// Read whatever the master has buffered into `buf`.
    pub fn read_output(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.master.as_ref() {
            Some(mut master) => master.read(buf),
            None => Ok(0),
        }
    }

    /// Write input bytes to the pane.
    pub fn write_input(&self, data: &[u8]) -> Result<(), MuxError> {
        let mut master = self.master.as_ref().ok_or_else(|| {
            MuxError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("pane {} is closed", self.id),
            ))
        })?;
        master.write_all(data)?;
        master.flush()?;
        Ok(())
    }

    /// Non-blocking check for child exit. Marks the session closed once the
    /// child has been reaped.
    pub fn try_reap(&mut self) -> Result<Option<WaitStatus>, MuxError> {
        let Some(pid) = self.child_pid else {
            return Ok(None);
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                self.child_pid = None;
                self.close();
                Ok(Some(status))
            }
            Ok(_) => Ok(None),
            Err(nix::errno::Errno::ECHILD) => {
                self.child_pid = None;
                self.close();
                Ok(None)
            }
            Err(e) => Err(MuxError::Io(io::Error::from(e))),
        }
    }
}

/// Path of the slave device behind `fd` (`/dev/pts/N` on Linux).
fn slave_device_path(fd: &OwnedFd) -> Result<PathBuf, MuxError> {
    ttyname(fd).map_err(|e| MuxError::SpawnFailed(format!("ttyname: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::OpenOptionsExt;

    fn opened() -> OpenedPty {
        PtySession::open("%0", GeometryUpdate::new(24, 80)).unwrap()
    }

    #[test]
    fn test_open_starts_created_with_slave_path() {
        let OpenedPty { session, slave: _slave } = opened();
        assert_eq!(session.state(), PtyState::Created);
        assert_eq!(session.id(), "%0");
        assert!(session.slave_path().exists());
        assert!(session.child_pid().is_none());
        assert!(session.master_fd().is_some());
    }

    #[test]
    fn test_slave_path_names_the_slave_device() {
        let OpenedPty { session, slave } = opened();
        assert_eq!(slave_device_path(&slave).unwrap(), session.slave_path());

        let reopened = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(session.slave_path())
            .unwrap();
        assert_eq!(ttyname(&reopened).unwrap(), session.slave_path());
        #[cfg(target_os = "linux")]
        assert!(session.slave_path().starts_with("/dev/pts"));
    }

    #[test]
    fn test_slave_path_of_non_tty_fails() {
        let file: OwnedFd = tempfile::tempfile().unwrap().into();
        let err = slave_device_path(&file).unwrap_err();
        assert!(err.to_string().contains("ttyname"), "got: {err}");
    }

    #[test]
    fn test_open_applies_initial_geometry() {
        let OpenedPty { session, slave: _slave } = opened();
        let size = geometry::read(session.master_raw_fd().unwrap()).unwrap();
        assert_eq!((size.rows, size.cols), (24, 80));
    }

    #[test]
    fn test_both_ends_are_close_on_exec() {
        let OpenedPty { session, slave } = opened();
        for fd in [session.master_raw_fd().unwrap(), slave.as_raw_fd()] {
            let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let OpenedPty { mut session, slave: _slave } = opened();
        session.mark_controlling_tty_established().unwrap();
        assert_eq!(session.state(), PtyState::ControllingTtyEstablished);

        session.set_running(Pid::from_raw(4242)).unwrap();
        assert_eq!(session.state(), PtyState::Running);
        assert_eq!(session.child_pid(), Some(Pid::from_raw(4242)));

        session.close();
        assert_eq!(session.state(), PtyState::Closed);
        assert!(session.master_fd().is_none());
    }

    #[test]
    fn test_controlling_tty_established_only_once() {
        let OpenedPty { mut session, slave: _slave } = opened();
        session.mark_controlling_tty_established().unwrap();

        let err = session.mark_controlling_tty_established().unwrap_err();
        assert!(matches!(
            err,
            MuxError::InvalidTransition {
                from: PtyState::ControllingTtyEstablished,
                to: PtyState::ControllingTtyEstablished,
            }
        ));
    }

    #[test]
    fn test_cannot_run_without_controlling_tty() {
        let OpenedPty { mut session, slave: _slave } = opened();
        let err = session.set_running(Pid::from_raw(1)).unwrap_err();
        assert_eq!(err.error_code(), "invalid_transition");
        assert_eq!(session.state(), PtyState::Created);
        assert!(session.child_pid().is_none());
    }

    #[test]
    fn test_resize_updates_geometry() {
        let OpenedPty { mut session, slave: _slave } = opened();
        session.resize(50, 132).unwrap();
        assert_eq!(session.geometry(), GeometryUpdate::new(50, 132));
        let size = geometry::read(session.master_raw_fd().unwrap()).unwrap();
        assert_eq!((size.rows, size.cols), (50, 132));
    }

    #[test]
    fn test_resize_after_close_is_io_control_error() {
        let OpenedPty { mut session, slave: _slave } = opened();
        session.close();
        let err = session.resize(10, 10).unwrap_err();
        assert!(matches!(err, MuxError::IoControl(_)));
        assert_eq!(session.geometry(), GeometryUpdate::new(24, 80));
    }

    #[test]
    fn test_input_reaches_slave() {
        let OpenedPty { session, slave } = opened();
        // Raw mode on the slave so the line discipline does not hold the bytes back.
        let mut attrs = nix::sys::termios::tcgetattr(&slave).unwrap();
        nix::sys::termios::cfmakeraw(&mut attrs);
        nix::sys::termios::tcsetattr(&slave, nix::sys::termios::SetArg::TCSANOW, &attrs).unwrap();

        session.write_input(b"ping").unwrap();

        let mut slave = File::from(slave);
        let mut buf = [0u8; 4];
        slave.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_write_after_close_fails() {
        let OpenedPty { mut session, slave: _slave } = opened();
        session.close();
        assert!(session.write_input(b"x").is_err());
        let mut buf = [0u8; 8];
        assert_eq!(session.read_output(&mut buf).unwrap(), 0);
    }
}
