use std::io;
use std::path::PathBuf;

use nix::errno::Errno;

use crate::pty::PtyState;

/// Which fork of the double-fork sequence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkStage {
    First,
    Second,
}

impl ForkStage {
    /// Process exit status used when this stage fails.
    pub fn exit_code(self) -> i32 {
        match self {
            ForkStage::First => 1,
            ForkStage::Second => 2,
        }
    }
}

impl std::fmt::Display for ForkStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForkStage::First => write!(f, "#1"),
            ForkStage::Second => write!(f, "#2"),
        }
    }
}

/// All error types for the ptymux-core crate.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("failed to disconnect from controlling tty: /dev/tty is still openable after setsid")]
    TtyDetachmentFailed,

    #[error("could not open controlling tty /dev/tty: {0}")]
    TtyAcquisitionFailed(#[source] io::Error),

    #[error("probing /dev/tty failed: {0}")]
    TtyProbeFailed(#[source] io::Error),

    #[error("setsid failed: {0}")]
    NewSessionFailed(#[source] Errno),

    #[error("could not open child pty {}: {source}", path.display())]
    SlaveUnreachable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("fork {stage} failed: ({}) {}", *errno as i32, errno.desc())]
    ForkFailed { stage: ForkStage, errno: Errno },

    #[error("redirecting {stream} to {} failed: {source}", path.display())]
    StreamRedirectFailed {
        stream: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ioctl failed: {0}")]
    IoControl(#[source] Errno),

    #[error("no account entry for user '{user}'")]
    UserLookup { user: String },

    #[error("pane spawn failed: {0}")]
    SpawnFailed(String),

    #[error("invalid pty session transition: {from} -> {to}")]
    InvalidTransition { from: PtyState, to: PtyState },

    #[error("no pane with id '{id}'")]
    PaneNotFound { id: String },

    #[error("pane id '{id}' is already in use")]
    DuplicatePane { id: String },

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl MuxError {
    /// Stable error code string, used in logs and by UI collaborators.
    pub fn error_code(&self) -> &'static str {
        match self {
            MuxError::TtyDetachmentFailed => "tty_detachment_failed",
            MuxError::TtyAcquisitionFailed(_) => "tty_acquisition_failed",
            MuxError::TtyProbeFailed(_) => "tty_probe_failed",
            MuxError::NewSessionFailed(_) => "new_session_failed",
            MuxError::SlaveUnreachable { .. } => "slave_unreachable",
            MuxError::ForkFailed { .. } => "fork_failed",
            MuxError::StreamRedirectFailed { .. } => "stream_redirect_failed",
            MuxError::IoControl(_) => "io_control_error",
            MuxError::UserLookup { .. } => "user_lookup_error",
            MuxError::SpawnFailed(_) => "spawn_failed",
            MuxError::InvalidTransition { .. } => "invalid_transition",
            MuxError::PaneNotFound { .. } => "pane_not_found",
            MuxError::DuplicatePane { .. } => "duplicate_pane",
            MuxError::ConfigInvalid(_) => "config_invalid",
            MuxError::Io(_) => "io_error",
        }
    }

    /// Whether this error abandons only the pane being set up.
    ///
    /// Pane-scoped errors are shown in that pane; the rest of the server keeps
    /// running. Everything else aborts the request or the whole server.
    pub fn is_pane_scoped(&self) -> bool {
        matches!(
            self,
            MuxError::TtyDetachmentFailed
                | MuxError::TtyAcquisitionFailed(_)
                | MuxError::TtyProbeFailed(_)
                | MuxError::NewSessionFailed(_)
                | MuxError::SlaveUnreachable { .. }
                | MuxError::IoControl(_)
                | MuxError::SpawnFailed(_)
        )
    }
}
