use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, chdir, dup2, execve, fork, pipe2};
use tracing::{debug, error, info};

use crate::errors::MuxError;
use crate::geometry::GeometryUpdate;
use crate::pty::controller::establish_controlling_tty;
use crate::pty::session::{OpenedPty, PtySession};

/// What to run inside a new pane.
#[derive(Debug, Clone)]
pub struct PaneCommand {
    program: PathBuf,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl PaneCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Everything the child needs to exec, converted before `fork`.
#[derive(Debug)]
struct ExecPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: Option<PathBuf>,
}

impl ExecPlan {
    fn build(command: &PaneCommand) -> Result<Self, MuxError> {
        let program = to_cstring(command.program.as_os_str())?;
        let mut argv = Vec::with_capacity(command.args.len() + 1);
        argv.push(program.clone());
        for arg in &command.args {
            argv.push(to_cstring(arg)?);
        }

        let mut vars: Vec<(OsString, OsString)> = std::env::vars_os()
            .filter(|(key, _)| !command.env.iter().any(|(k, _)| k == key))
            .collect();
        vars.extend(command.env.iter().cloned());
        let envp = vars
            .into_iter()
            .map(|(key, value)| {
                let mut pair = key.into_vec();
                pair.push(b'=');
                pair.extend(value.into_vec());
                CString::new(pair)
                    .map_err(|e| MuxError::SpawnFailed(format!("environment entry: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            program,
            argv,
            envp,
            cwd: command.cwd.clone(),
        })
    }
}

fn to_cstring(s: &OsStr) -> Result<CString, MuxError> {
    CString::new(s.as_bytes())
        .map_err(|e| MuxError::SpawnFailed(format!("argument contains NUL: {e}")))
}

/// Child-side setup step reported back through the status pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ChildStage {
    Probe = 1,
    NewSession = 2,
    Detach = 3,
    Slave = 4,
    Acquire = 5,
    Redirect = 6,
    Chdir = 7,
    Exec = 8,
    Unknown = 9,
}

impl ChildStage {
    fn from_byte(b: u8) -> Self {
        match b {
            1 => ChildStage::Probe,
            2 => ChildStage::NewSession,
            3 => ChildStage::Detach,
            4 => ChildStage::Slave,
            5 => ChildStage::Acquire,
            6 => ChildStage::Redirect,
            7 => ChildStage::Chdir,
            8 => ChildStage::Exec,
            _ => ChildStage::Unknown,
        }
    }
}

/// Failure report written by the child: one stage byte and a native-endian errno.
const REPORT_LEN: usize = 5;

fn encode_report(stage: ChildStage, errno: i32) -> [u8; REPORT_LEN] {
    let e = errno.to_ne_bytes();
    [stage as u8, e[0], e[1], e[2], e[3]]
}

fn classify(err: &MuxError) -> (ChildStage, i32) {
    let io_errno = |e: &io::Error| e.raw_os_error().unwrap_or(0);
    match err {
        MuxError::TtyProbeFailed(e) => (ChildStage::Probe, io_errno(e)),
        MuxError::NewSessionFailed(e) => (ChildStage::NewSession, *e as i32),
        MuxError::TtyDetachmentFailed => (ChildStage::Detach, 0),
        MuxError::SlaveUnreachable { source, .. } => (ChildStage::Slave, io_errno(source)),
        MuxError::TtyAcquisitionFailed(e) => (ChildStage::Acquire, io_errno(e)),
        _ => (ChildStage::Unknown, 0),
    }
}

fn decode_report(report: &[u8], session: &PtySession, program: &Path) -> MuxError {
    let stage = ChildStage::from_byte(report[0]);
    let errno = i32::from_ne_bytes([report[1], report[2], report[3], report[4]]);
    let os = || io::Error::from_raw_os_error(errno);
    match stage {
        ChildStage::Probe => MuxError::TtyProbeFailed(os()),
        ChildStage::NewSession => MuxError::NewSessionFailed(Errno::from_raw(errno)),
        ChildStage::Detach => MuxError::TtyDetachmentFailed,
        ChildStage::Slave => MuxError::SlaveUnreachable {
            path: session.slave_path().to_path_buf(),
            source: os(),
        },
        ChildStage::Acquire => MuxError::TtyAcquisitionFailed(os()),
        ChildStage::Redirect => MuxError::SpawnFailed(format!("dup2 onto stdio: {}", os())),
        ChildStage::Chdir => MuxError::SpawnFailed(format!("chdir: {}", os())),
        ChildStage::Exec => {
            MuxError::SpawnFailed(format!("exec {}: {}", program.display(), os()))
        }
        ChildStage::Unknown => MuxError::SpawnFailed("child setup failed".to_string()),
    }
}

/// Open a pty, fork, and run `command` in the child with the pty slave as its
/// controlling terminal and standard streams.
///
/// The child performs the controlling-terminal handshake before `exec`. Its
/// outcome travels back over a close-on-exec pipe: EOF without data means the
/// exec succeeded, anything else is decoded into the error of the failed
/// stage. On success the returned session is [`PtyState::Running`](crate::pty::PtyState::Running).
///
/// Only call from a process whose other threads hold no locks the child
/// could need. The child never logs, and allocates only when a handshake
/// stage fails.
pub fn spawn_pane(
    id: &str,
    command: &PaneCommand,
    geometry: GeometryUpdate,
) -> Result<PtySession, MuxError> {
    let plan = ExecPlan::build(command)?;
    let OpenedPty { mut session, slave } = PtySession::open(id, geometry)?;
    let (status_rx, status_tx) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| MuxError::SpawnFailed(format!("pipe: {e}")))?;

    info!(
        event = "core.pane.spawn_started",
        pane_id = id,
        program = %command.program.display(),
        rows = geometry.rows,
        cols = geometry.cols,
    );

    // SAFETY: the child branch only performs async-signal-safe work with data
    // prepared above before it execs or `_exit`s.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(status_rx);
            let (stage, errno) = match run_child(&mut session, slave, &plan) {
                Err(err) => classify(&err),
                Ok(stage_and_errno) => stage_and_errno,
            };
            let mut tx = File::from(status_tx);
            let _ = tx.write_all(&encode_report(stage, errno));
            // SAFETY: terminate the forked child without running the parent's atexit handlers.
            unsafe { libc::_exit(127) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(slave);
            drop(status_tx);
            session.attach_child(child);
            await_exec(session, status_rx, child, command.program())
        }
        Err(e) => {
            error!(event = "core.pane.spawn_failed", pane_id = id, error = %e);
            Err(MuxError::SpawnFailed(format!("fork: {e}")))
        }
    }
}

/// Child side. Returns only on failure: `Ok` carries an exec-stage report,
/// `Err` a handshake error.
fn run_child(
    session: &mut PtySession,
    slave: OwnedFd,
    plan: &ExecPlan,
) -> Result<(ChildStage, i32), MuxError> {
    // The master is close-on-exec; the child never touches it.
    establish_controlling_tty(session)?;

    let slave_fd = slave.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if let Err(e) = dup2(slave_fd, target) {
            return Ok((ChildStage::Redirect, e as i32));
        }
    }
    if slave_fd > libc::STDERR_FILENO {
        drop(slave);
    } else {
        std::mem::forget(slave);
    }

    if let Some(dir) = &plan.cwd {
        if let Err(e) = chdir(dir.as_path()) {
            return Ok((ChildStage::Chdir, e as i32));
        }
    }

    let err = match execve(&plan.program, &plan.argv, &plan.envp) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    Ok((ChildStage::Exec, err as i32))
}

/// Parent side: wait for the child's handshake verdict.
fn await_exec(
    mut session: PtySession,
    status_rx: OwnedFd,
    child: Pid,
    program: &Path,
) -> Result<PtySession, MuxError> {
    let mut report = Vec::with_capacity(REPORT_LEN);
    File::from(status_rx).read_to_end(&mut report)?;

    if !report.is_empty() {
        let err = if report.len() >= REPORT_LEN {
            decode_report(&report, &session, program)
        } else {
            MuxError::SpawnFailed("truncated child status report".to_string())
        };
        // The child `_exit`s right after reporting.
        let _ = waitpid(child, None);
        session.close();
        error!(
            event = "core.pane.spawn_failed",
            pane_id = session.id(),
            error_code = err.error_code(),
            error = %err,
        );
        return Err(err);
    }

    session.mark_controlling_tty_established()?;
    session.set_running(child)?;
    info!(
        event = "core.pane.spawn_completed",
        pane_id = session.id(),
        pid = child.as_raw(),
        slave = %session.slave_path().display(),
    );
    debug!(event = "core.pane.state", pane_id = session.id(), state = %session.state());
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_roundtrip_keeps_stage_and_errno() {
        let opened = PtySession::open("%9", GeometryUpdate::new(24, 80)).unwrap();
        let report = encode_report(ChildStage::Acquire, libc::ENXIO);
        let err = decode_report(&report, &opened.session, Path::new("/bin/sh"));
        match err {
            MuxError::TtyAcquisitionFailed(e) => assert_eq!(e.raw_os_error(), Some(libc::ENXIO)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_detach_report_maps_to_detachment_failure() {
        let opened = PtySession::open("%9", GeometryUpdate::new(24, 80)).unwrap();
        let (stage, errno) = classify(&MuxError::TtyDetachmentFailed);
        let err = decode_report(&encode_report(stage, errno), &opened.session, Path::new("sh"));
        assert!(matches!(err, MuxError::TtyDetachmentFailed));
    }

    #[test]
    fn test_exec_report_names_program() {
        let opened = PtySession::open("%9", GeometryUpdate::new(24, 80)).unwrap();
        let report = encode_report(ChildStage::Exec, libc::ENOENT);
        let err = decode_report(&report, &opened.session, Path::new("/no/such/shell"));
        assert!(err.to_string().contains("/no/such/shell"));
        assert!(err.is_pane_scoped());
    }

    #[test]
    fn test_exec_plan_overrides_environment() {
        let command = PaneCommand::new("/bin/sh")
            .args(["-c", "true"])
            .env("PTYMUX_PANE", "%3")
            .env("PATH", "/opt/bin");
        let plan = ExecPlan::build(&command).unwrap();

        assert_eq!(plan.argv.len(), 3);
        assert_eq!(plan.argv[0].to_bytes(), b"/bin/sh");
        assert!(plan.envp.iter().any(|e| e.to_bytes() == b"PTYMUX_PANE=%3"));
        let paths: Vec<_> = plan
            .envp
            .iter()
            .filter(|e| e.to_bytes().starts_with(b"PATH="))
            .collect();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].to_bytes(), b"PATH=/opt/bin");
    }

    #[test]
    fn test_exec_plan_rejects_nul_bytes() {
        let command = PaneCommand::new("/bin/sh").arg("a\0b");
        let err = ExecPlan::build(&command).unwrap_err();
        assert_eq!(err.error_code(), "spawn_failed");
    }
}
