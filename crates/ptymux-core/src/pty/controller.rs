use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::libc;
use nix::unistd::setsid;

use crate::errors::MuxError;
use crate::pty::session::{PtySession, PtyState};

const DEV_TTY: &str = "/dev/tty";

/// Result of probing `/dev/tty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllingTty {
    Attached,
    Detached,
}

/// The OS operations the controlling-terminal handshake is built from.
///
/// Implementations run between `fork` and `exec`: they must not log, lock or
/// allocate beyond what opening a path needs.
pub trait TtyOps {
    /// Open `/dev/tty` without acquiring it and close it again.
    fn probe_controlling_tty(&mut self) -> Result<ControllingTty, MuxError>;

    /// Become the leader of a new session.
    fn new_session(&mut self) -> Result<(), MuxError>;

    /// Open `path` read-write and close it again.
    fn check_slave(&mut self, path: &Path) -> Result<(), MuxError>;

    /// Open `/dev/tty` write-only; succeeds only with a controlling terminal.
    fn open_controlling_tty(&mut self) -> Result<(), MuxError>;
}

/// [`TtyOps`] against the real kernel.
#[derive(Debug, Default)]
pub struct SystemTty;

impl TtyOps for SystemTty {
    fn probe_controlling_tty(&mut self) -> Result<ControllingTty, MuxError> {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(DEV_TTY)
        {
            Ok(_tty) => Ok(ControllingTty::Attached),
            Err(e) if means_no_tty(&e) => Ok(ControllingTty::Detached),
            Err(e) => Err(MuxError::TtyProbeFailed(e)),
        }
    }

    fn new_session(&mut self) -> Result<(), MuxError> {
        setsid().map(drop).map_err(MuxError::NewSessionFailed)
    }

    fn check_slave(&mut self, path: &Path) -> Result<(), MuxError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(drop)
            .map_err(|source| MuxError::SlaveUnreachable {
                path: path.to_path_buf(),
                source,
            })
    }

    fn open_controlling_tty(&mut self) -> Result<(), MuxError> {
        OpenOptions::new()
            .write(true)
            .open(DEV_TTY)
            .map(drop)
            .map_err(MuxError::TtyAcquisitionFailed)
    }
}

/// `ENXIO` is what the kernel answers when the caller has no controlling
/// terminal; `ENOENT`/`ENODEV` when the device node itself is missing.
fn means_no_tty(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENXIO) | Some(libc::ENOENT) | Some(libc::ENODEV)
    )
}

/// Make `session`'s slave the controlling terminal of the calling process.
///
/// Must run once, in the process that will own the pty, before it writes
/// anything. The sequence is:
///
/// 1. probe `/dev/tty` and drop any prior controlling terminal (absence is fine),
/// 2. `setsid()`,
/// 3. probe again, which must now report [`ControllingTty::Detached`],
/// 4. open and close the slave device (on Linux and the BSDs this open is what
///    attaches the slave to the new session),
/// 5. open `/dev/tty` write-only to confirm the slave is now the controlling tty.
///
/// On success the session moves to [`PtyState::ControllingTtyEstablished`]. Any
/// failing step aborts without retrying and leaves the session state untouched.
pub fn establish_controlling_tty(session: &mut PtySession) -> Result<(), MuxError> {
    establish_controlling_tty_with(&mut SystemTty, session)
}

/// [`establish_controlling_tty`] over an explicit set of OS operations.
pub fn establish_controlling_tty_with<T>(ops: &mut T, session: &mut PtySession) -> Result<(), MuxError>
where
    T: TtyOps + ?Sized,
{
    if session.state() != PtyState::Created {
        return Err(MuxError::InvalidTransition {
            from: session.state(),
            to: PtyState::ControllingTtyEstablished,
        });
    }

    ops.probe_controlling_tty()?;
    ops.new_session()?;
    if ops.probe_controlling_tty()? == ControllingTty::Attached {
        return Err(MuxError::TtyDetachmentFailed);
    }
    ops.check_slave(session.slave_path())?;
    ops.open_controlling_tty()?;

    session.mark_controlling_tty_established()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryUpdate;
    use crate::pty::session::OpenedPty;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    /// Scripted [`TtyOps`] that records every call.
    #[derive(Default)]
    struct ScriptedTty {
        probes: VecDeque<Result<ControllingTty, MuxError>>,
        setsid_error: Option<MuxError>,
        slave_error: bool,
        acquire_error: bool,
        calls: Vec<String>,
    }

    impl ScriptedTty {
        fn detaching() -> Self {
            Self {
                probes: VecDeque::from([
                    Ok(ControllingTty::Attached),
                    Ok(ControllingTty::Detached),
                ]),
                ..Default::default()
            }
        }
    }

    impl TtyOps for ScriptedTty {
        fn probe_controlling_tty(&mut self) -> Result<ControllingTty, MuxError> {
            self.calls.push("probe".to_string());
            self.probes
                .pop_front()
                .unwrap_or(Ok(ControllingTty::Detached))
        }

        fn new_session(&mut self) -> Result<(), MuxError> {
            self.calls.push("setsid".to_string());
            match self.setsid_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn check_slave(&mut self, path: &Path) -> Result<(), MuxError> {
            self.calls.push(format!("slave {}", path.display()));
            if self.slave_error {
                return Err(MuxError::SlaveUnreachable {
                    path: path.to_path_buf(),
                    source: io::Error::from_raw_os_error(libc::ENOENT),
                });
            }
            Ok(())
        }

        fn open_controlling_tty(&mut self) -> Result<(), MuxError> {
            self.calls.push("acquire".to_string());
            if self.acquire_error {
                return Err(MuxError::TtyAcquisitionFailed(io::Error::from_raw_os_error(
                    libc::ENXIO,
                )));
            }
            Ok(())
        }
    }

    fn session() -> OpenedPty {
        PtySession::open("%1", GeometryUpdate::new(24, 80)).unwrap()
    }

    #[test]
    fn test_happy_path_runs_every_stage_in_order() {
        let OpenedPty { mut session, slave: _slave } = session();
        let mut tty = ScriptedTty::detaching();

        establish_controlling_tty_with(&mut tty, &mut session).unwrap();

        assert_eq!(session.state(), PtyState::ControllingTtyEstablished);
        let slave = format!("slave {}", session.slave_path().display());
        assert_eq!(tty.calls, vec!["probe", "setsid", "probe", slave.as_str(), "acquire"]);
    }

    #[test]
    fn test_no_prior_controlling_tty_is_not_an_error() {
        let OpenedPty { mut session, slave: _slave } = session();
        let mut tty = ScriptedTty {
            probes: VecDeque::from([Ok(ControllingTty::Detached), Ok(ControllingTty::Detached)]),
            ..Default::default()
        };

        establish_controlling_tty_with(&mut tty, &mut session).unwrap();
        assert_eq!(session.state(), PtyState::ControllingTtyEstablished);
    }

    #[test]
    fn test_reprobe_success_is_detachment_failure() {
        let OpenedPty { mut session, slave: _slave } = session();
        let mut tty = ScriptedTty {
            probes: VecDeque::from([Ok(ControllingTty::Attached), Ok(ControllingTty::Attached)]),
            ..Default::default()
        };

        let err = establish_controlling_tty_with(&mut tty, &mut session).unwrap_err();

        assert!(matches!(err, MuxError::TtyDetachmentFailed));
        assert_eq!(session.state(), PtyState::Created);
        // Nothing after the re-probe ran.
        assert_eq!(tty.calls, vec!["probe", "setsid", "probe"]);
    }

    #[test]
    fn test_probe_io_error_is_surfaced_not_swallowed() {
        let OpenedPty { mut session, slave: _slave } = session();
        let mut tty = ScriptedTty {
            probes: VecDeque::from([Err(MuxError::TtyProbeFailed(io::Error::from_raw_os_error(
                libc::EACCES,
            )))]),
            ..Default::default()
        };

        let err = establish_controlling_tty_with(&mut tty, &mut session).unwrap_err();
        assert_eq!(err.error_code(), "tty_probe_failed");
        assert_eq!(tty.calls, vec!["probe"]);
        assert_eq!(session.state(), PtyState::Created);
    }

    #[test]
    fn test_setsid_failure_stops_the_sequence() {
        let OpenedPty { mut session, slave: _slave } = session();
        let mut tty = ScriptedTty::detaching();
        tty.setsid_error = Some(MuxError::NewSessionFailed(nix::errno::Errno::EPERM));

        let err = establish_controlling_tty_with(&mut tty, &mut session).unwrap_err();
        assert!(matches!(err, MuxError::NewSessionFailed(_)));
        assert_eq!(tty.calls, vec!["probe", "setsid"]);
    }

    #[test]
    fn test_unreachable_slave_reports_path() {
        let OpenedPty { mut session, slave: _slave } = session();
        let mut tty = ScriptedTty::detaching();
        tty.slave_error = true;

        let err = establish_controlling_tty_with(&mut tty, &mut session).unwrap_err();
        match err {
            MuxError::SlaveUnreachable { path, .. } => {
                assert_eq!(path, session.slave_path().to_path_buf())
            }
            other => panic!("expected SlaveUnreachable, got {other:?}"),
        }
        assert_eq!(session.state(), PtyState::Created);
    }

    #[test]
    fn test_final_open_failure_is_acquisition_failure() {
        let OpenedPty { mut session, slave: _slave } = session();
        let mut tty = ScriptedTty::detaching();
        tty.acquire_error = true;

        let err = establish_controlling_tty_with(&mut tty, &mut session).unwrap_err();
        assert!(matches!(err, MuxError::TtyAcquisitionFailed(_)));
        assert!(err.is_pane_scoped());
        assert_eq!(session.state(), PtyState::Created);
    }

    #[test]
    fn test_second_call_is_rejected_before_touching_the_os() {
        let OpenedPty { mut session, slave: _slave } = session();
        establish_controlling_tty_with(&mut ScriptedTty::detaching(), &mut session).unwrap();

        let mut tty = ScriptedTty::detaching();
        let err = establish_controlling_tty_with(&mut tty, &mut session).unwrap_err();
        assert_eq!(err.error_code(), "invalid_transition");
        assert!(tty.calls.is_empty());
    }

    #[test]
    fn test_system_probe_maps_missing_device_to_detached() {
        assert!(means_no_tty(&io::Error::from_raw_os_error(libc::ENXIO)));
        assert!(means_no_tty(&io::Error::from_raw_os_error(libc::ENOENT)));
        assert!(!means_no_tty(&io::Error::from_raw_os_error(libc::EACCES)));
        assert!(!means_no_tty(&io::Error::other("not an os error")));
    }

    #[test]
    fn test_system_check_slave_on_missing_path() {
        let path = PathBuf::from("/dev/ptymux-no-such-slave");
        let err = SystemTty.check_slave(&path).unwrap_err();
        assert_eq!(err.error_code(), "slave_unreachable");
    }
}
