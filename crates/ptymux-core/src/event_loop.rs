//! Readiness-driven loop owning every pane's pty master.
//!
//! One thread, one `poll(2)` per round. Output is drained under a
//! [`NonBlockingScope`] so a slow pane never stalls the others, hung-up panes
//! are closed and their children reaped without blocking. Closing a pane is
//! the only way to cancel it.

use std::io;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::wait::WaitStatus;
use tracing::{debug, info, warn};

use crate::errors::MuxError;
use crate::nonblocking::NonBlockingScope;
use crate::pty::PtySession;

const READ_CHUNK: usize = 4096;

/// Per-pane read cap for one round.
const MAX_READ_PER_ROUND: usize = 64 * 1024;

/// Longest wait of a single round; `poll` timeouts are whole milliseconds in a `u16`.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(u16::MAX as u64);

/// How a pane's child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneExit {
    Code(i32),
    Signal(i32),
    /// Reaped elsewhere, or the pane never had a child.
    Unknown,
}

impl PaneExit {
    fn from_wait(status: Option<WaitStatus>) -> Self {
        match status {
            Some(WaitStatus::Exited(_, code)) => PaneExit::Code(code),
            Some(WaitStatus::Signaled(_, signal, _)) => PaneExit::Signal(signal as i32),
            _ => PaneExit::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaneEvent {
    Output { pane: String, data: Vec<u8> },
    Exited { pane: String, exit: PaneExit },
}

pub struct PaneLoop {
    panes: Vec<PtySession>,
    /// Closed panes whose child has not been reaped yet.
    exiting: Vec<PtySession>,
    poll_interval: Duration,
}

impl PaneLoop {
    /// Intervals above [`MAX_POLL_INTERVAL`] are clamped to it.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            panes: Vec::new(),
            exiting: Vec::new(),
            poll_interval: poll_interval.min(MAX_POLL_INTERVAL),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Take ownership of a pane. Ids stay reserved until the pane's exit has
    /// been reported.
    pub fn add(&mut self, session: PtySession) -> Result<(), MuxError> {
        let id = session.id();
        if self.position(id).is_some() || self.exiting.iter().any(|s| s.id() == id) {
            return Err(MuxError::DuplicatePane { id: id.to_string() });
        }
        debug!(event = "core.loop.pane_added", pane_id = id);
        if session.master_fd().is_some() {
            self.panes.push(session);
        } else {
            self.exiting.push(session);
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&PtySession> {
        self.panes.iter().find(|s| s.id() == id)
    }

    pub fn pane_ids(&self) -> impl Iterator<Item = &str> {
        self.panes.iter().map(PtySession::id)
    }

    /// Number of live panes.
    pub fn len(&self) -> usize {
        self.panes.len()
    }

    /// True once every pane has closed and its exit has been reported.
    pub fn is_empty(&self) -> bool {
        self.panes.is_empty() && self.exiting.is_empty()
    }

    /// Forward a window-size change to pane `id`.
    pub fn resize(&mut self, id: &str, rows: u16, cols: u16) -> Result<(), MuxError> {
        let idx = self.require(id)?;
        self.panes[idx].resize(rows, cols)
    }

    pub fn write_input(&self, id: &str, data: &[u8]) -> Result<(), MuxError> {
        let idx = self.require(id)?;
        self.panes[idx].write_input(data)
    }

    /// Cancel pane `id` by closing its master. The kernel hangs up the slave;
    /// the exit is reported by a later [`poll_once`](Self::poll_once).
    pub fn close(&mut self, id: &str) -> Result<(), MuxError> {
        let idx = self.require(id)?;
        let mut session = self.panes.remove(idx);
        session.close();
        info!(event = "core.loop.pane_close_requested", pane_id = id);
        self.exiting.push(session);
        Ok(())
    }

    pub fn close_all(&mut self) {
        for mut session in self.panes.drain(..) {
            session.close();
            info!(event = "core.loop.pane_close_requested", pane_id = session.id());
            self.exiting.push(session);
        }
    }

    /// Wait up to the poll interval for pane activity and handle it.
    ///
    /// Returns output in pane order, followed by exits of panes reaped during
    /// this round. An interrupted `poll` yields an empty round.
    pub fn poll_once(&mut self) -> Result<Vec<PaneEvent>, MuxError> {
        let mut events = Vec::new();
        let ready = self.wait_ready()?;

        let mut hung_up = Vec::new();
        for (idx, flags) in ready {
            let session = &self.panes[idx];
            let mut data = Vec::new();
            let hangup = if flags.contains(PollFlags::POLLIN) {
                match drain(session, &mut data) {
                    Ok(hangup) => hangup,
                    Err(e) => {
                        warn!(
                            event = "core.loop.read_failed",
                            pane_id = session.id(),
                            error = %e,
                        );
                        true
                    }
                }
            } else {
                flags.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
            };
            if !data.is_empty() {
                events.push(PaneEvent::Output {
                    pane: session.id().to_string(),
                    data,
                });
            }
            if hangup {
                hung_up.push(idx);
            }
        }

        // Highest index first so the remaining indices stay valid.
        for idx in hung_up.into_iter().rev() {
            let mut session = self.panes.remove(idx);
            debug!(event = "core.loop.pane_hangup", pane_id = session.id());
            session.close();
            self.exiting.push(session);
        }

        self.reap(&mut events);
        Ok(events)
    }

    fn wait_ready(&self) -> Result<Vec<(usize, PollFlags)>, MuxError> {
        if self.panes.is_empty() {
            if !self.exiting.is_empty() {
                std::thread::sleep(self.poll_interval);
            }
            return Ok(Vec::new());
        }

        let (indices, mut fds): (Vec<usize>, Vec<PollFd<'_>>) = self
            .panes
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.master_fd().map(|fd| (idx, PollFd::new(fd, PollFlags::POLLIN))))
            .unzip();

        let timeout = PollTimeout::try_from(self.poll_interval)
            .map_err(|e| MuxError::ConfigInvalid(format!("poll interval: {e}")))?;
        match poll(&mut fds, timeout) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(e) => return Err(MuxError::Io(e.into())),
        }

        Ok(indices
            .into_iter()
            .zip(fds.iter())
            .filter_map(|(idx, fd)| {
                fd.revents()
                    .filter(|flags| !flags.is_empty())
                    .map(|flags| (idx, flags))
            })
            .collect())
    }

    fn reap(&mut self, events: &mut Vec<PaneEvent>) {
        let mut idx = 0;
        while idx < self.exiting.len() {
            let session = &mut self.exiting[idx];
            let status = match session.try_reap() {
                Ok(status) => status,
                Err(e) => {
                    warn!(
                        event = "core.loop.reap_failed",
                        pane_id = session.id(),
                        error = %e,
                    );
                    idx += 1;
                    continue;
                }
            };
            if status.is_none() && session.child_pid().is_some() {
                idx += 1;
                continue;
            }

            let session = self.exiting.remove(idx);
            let exit = PaneExit::from_wait(status);
            info!(event = "core.loop.pane_exited", pane_id = session.id(), exit = ?exit);
            events.push(PaneEvent::Exited {
                pane: session.id().to_string(),
                exit,
            });
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.panes.iter().position(|s| s.id() == id)
    }

    fn require(&self, id: &str) -> Result<usize, MuxError> {
        self.position(id)
            .ok_or_else(|| MuxError::PaneNotFound { id: id.to_string() })
    }
}

/// Read everything the master has buffered. Returns whether the pane hung up.
fn drain(session: &PtySession, out: &mut Vec<u8>) -> Result<bool, MuxError> {
    let Some(fd) = session.master_fd() else {
        return Ok(true);
    };
    let _scope = NonBlockingScope::acquire(fd)?;
    let mut buf = [0u8; READ_CHUNK];
    while out.len() < MAX_READ_PER_ROUND {
        match session.read_output(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            // Linux reports a master whose slave side is fully closed as EIO.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(true),
            Err(e) => return Err(MuxError::Io(e)),
        }
    }
    Ok(false)
}
