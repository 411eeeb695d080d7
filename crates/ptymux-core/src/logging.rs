use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::errors::MuxError;

/// Environment variable holding the filter directives, e.g. `ptymux_core=debug`.
pub const LOG_ENV: &str = "PTYMUX_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Where log events go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Human-readable lines on stderr. For foreground runs.
    Stderr,
    /// JSON lines appended to a file. For the daemon, whose stderr is detached.
    File(PathBuf),
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber. Fails if one is already installed.
///
/// Call after daemonizing: a file opened before the double fork would be
/// shared with the exiting parent.
pub fn init_logging(target: &LogTarget) -> Result<(), MuxError> {
    let result = match target {
        LogTarget::Stderr => tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init(),
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(Mutex::new(file))
                        .with_target(false),
                )
                .try_init()
        }
    };
    result.map_err(|e| MuxError::Io(std::io::Error::other(format!("logging init: {e}"))))
}
