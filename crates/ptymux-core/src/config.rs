use std::path::{Path, PathBuf};
use std::time::Duration;

use ptymux_paths::PtymuxPaths;
use serde::{Deserialize, Serialize};

use crate::daemon::DaemonStreams;
use crate::errors::MuxError;
use crate::event_loop::MAX_POLL_INTERVAL;
use crate::geometry::GeometryUpdate;

/// Server configuration.
///
/// Read from the `[server]` section of `~/.ptymux/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Default: `~/.ptymux/server.pid`
    #[serde(default = "default_pid_path")]
    pub pid_path: PathBuf,

    /// Structured log output of the daemonized server.
    /// Default: `~/.ptymux/server.log`
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// Stream redirection targets applied when daemonizing.
    /// Default: `/dev/null` for all three.
    #[serde(default = "default_stream_path")]
    pub stdin_path: PathBuf,
    #[serde(default = "default_stream_path")]
    pub stdout_path: PathBuf,
    #[serde(default = "default_stream_path")]
    pub stderr_path: PathBuf,

    /// Shell for new panes. None = the user's login shell.
    #[serde(default)]
    pub default_shell: Option<PathBuf>,

    /// How long the resolved login shell is memoized. 0 = forever.
    /// Default: 300
    #[serde(default = "default_shell_cache_ttl_secs")]
    pub shell_cache_ttl_secs: u64,

    /// Geometry of panes created before any client reports a size.
    /// Default: 24x80
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    #[serde(default = "default_cols")]
    pub default_cols: u16,

    /// Upper bound on how long the pane loop blocks in `poll`.
    /// Default: 50
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.default_rows == 0 || self.default_cols == 0 {
            return Err(MuxError::ConfigInvalid(
                "default_rows and default_cols must be > 0".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(MuxError::ConfigInvalid(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.poll_interval() > MAX_POLL_INTERVAL {
            return Err(MuxError::ConfigInvalid(format!(
                "poll_interval_ms must be <= {}",
                MAX_POLL_INTERVAL.as_millis()
            )));
        }
        if let Some(shell) = &self.default_shell
            && !shell.is_absolute()
        {
            return Err(MuxError::ConfigInvalid(format!(
                "default_shell must be an absolute path, got '{}'",
                shell.display()
            )));
        }
        Ok(())
    }

    pub fn daemon_streams(&self) -> DaemonStreams {
        DaemonStreams::new(
            self.stdin_path.clone(),
            self.stdout_path.clone(),
            self.stderr_path.clone(),
        )
    }

    pub fn default_geometry(&self) -> GeometryUpdate {
        GeometryUpdate::new(self.default_rows, self.default_cols)
    }

    pub fn shell_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.shell_cache_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pid_path: default_pid_path(),
            log_path: default_log_path(),
            stdin_path: default_stream_path(),
            stdout_path: default_stream_path(),
            stderr_path: default_stream_path(),
            default_shell: None,
            shell_cache_ttl_secs: default_shell_cache_ttl_secs(),
            default_rows: default_rows(),
            default_cols: default_cols(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_pid_path() -> PathBuf {
    PtymuxPaths::resolve_or_tmp().server_pid_file()
}

fn default_log_path() -> PathBuf {
    PtymuxPaths::resolve_or_tmp().server_log_file()
}

fn default_stream_path() -> PathBuf {
    PathBuf::from("/dev/null")
}

fn default_shell_cache_ttl_secs() -> u64 {
    300
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

fn default_poll_interval_ms() -> u64 {
    50
}

/// Just enough of the config file to pull out `[server]`.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
}

/// Load server configuration from `~/.ptymux/config.toml`.
pub fn load_server_config() -> Result<ServerConfig, MuxError> {
    load_server_config_from(&PtymuxPaths::resolve_or_tmp().user_config())
}

/// Load the `[server]` section of `config_path`.
///
/// A missing or unparsable file yields defaults; only invalid values are errors.
pub fn load_server_config_from(config_path: &Path) -> Result<ServerConfig, MuxError> {
    let config = match std::fs::read_to_string(config_path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => file.server,
            Err(e) => {
                tracing::warn!(
                    event = "core.config.parse_failed",
                    path = %config_path.display(),
                    error = %e,
                );
                ServerConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServerConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "core.config.read_failed",
                path = %config_path.display(),
                error = %e,
            );
            ServerConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}
