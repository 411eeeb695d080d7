use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use nix::libc;
use ptymux_core::cache::{Clock, ExpiringCache, SystemClock};
use ptymux_core::geometry;
use ptymux_core::pid::PidFileGuard;
use ptymux_core::{
    GeometryUpdate, MuxError, PaneCommand, PaneEvent, PaneLoop, ServerConfig, spawn_pane,
};
use tracing::{debug, info, warn};

use crate::signals;

/// Id of the pane the server starts with.
pub const FIRST_PANE_ID: &str = "%0";

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub foreground: bool,
    /// Shell command for the first pane. None = interactive shell.
    pub command: Option<String>,
    pub geometry: GeometryUpdate,
}

type ShellLookup = fn() -> Result<PathBuf, MuxError>;

/// Shell used for new panes: the configured override, or the user's login
/// shell memoized for the configured ttl.
pub struct ShellSource<C: Clock = SystemClock> {
    configured: Option<PathBuf>,
    login_shell: ExpiringCache<PathBuf, C>,
    lookup: ShellLookup,
}

impl ShellSource<SystemClock> {
    pub fn new(configured: Option<PathBuf>, ttl: Duration) -> Self {
        Self::with_lookup(configured, ExpiringCache::new(ttl), ptymux_core::default_shell)
    }
}

impl<C: Clock> ShellSource<C> {
    pub fn with_lookup(
        configured: Option<PathBuf>,
        login_shell: ExpiringCache<PathBuf, C>,
        lookup: ShellLookup,
    ) -> Self {
        Self {
            configured,
            login_shell,
            lookup,
        }
    }

    pub fn shell(&mut self) -> Result<PathBuf, MuxError> {
        if let Some(shell) = &self.configured {
            return Ok(shell.clone());
        }
        let lookup = self.lookup;
        self.login_shell.get_or_try_compute(lookup).cloned()
    }
}

pub fn pane_command(pane_id: &str, shell: PathBuf, command: Option<&str>) -> PaneCommand {
    let pane = PaneCommand::new(shell).env("PTYMUX_PANE", pane_id);
    match command {
        Some(command) => pane.args(["-c", command]),
        None => pane,
    }
}

/// Size of the terminal on our stdin, if it is one.
pub fn terminal_geometry() -> Option<GeometryUpdate> {
    let size = geometry::read(libc::STDIN_FILENO).ok()?;
    (size.rows > 0 && size.cols > 0).then(|| GeometryUpdate::new(size.rows, size.cols))
}

/// Run the first pane until every pane has exited, copying pane output to
/// stdout. SIGTERM, SIGINT or SIGHUP close all panes first.
pub fn run_server(
    config: &ServerConfig,
    options: &StartOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    signals::install()?;
    let pid = std::process::id();
    let _pid_file = PidFileGuard::create(config.pid_path.clone(), pid)?;

    let mut shells = ShellSource::new(config.default_shell.clone(), config.shell_cache_ttl());
    let shell = shells.shell()?;
    let command = pane_command(FIRST_PANE_ID, shell, options.command.as_deref());
    let session = spawn_pane(FIRST_PANE_ID, &command, options.geometry)?;

    let mut pane_loop = PaneLoop::new(config.poll_interval());
    pane_loop.add(session)?;
    info!(
        event = "server.start_completed",
        pid = pid,
        foreground = options.foreground,
        pid_file = %config.pid_path.display(),
    );

    let mut stdout = std::io::stdout().lock();
    let mut shutting_down = false;
    while !pane_loop.is_empty() {
        if !shutting_down && signals::shutdown_requested() {
            info!(event = "server.shutdown_started", panes = pane_loop.len());
            pane_loop.close_all();
            shutting_down = true;
        }
        if options.foreground && signals::take_winch() {
            forward_terminal_size(&mut pane_loop);
        }

        for event in pane_loop.poll_once()? {
            match event {
                PaneEvent::Output { pane, data } => {
                    debug!(event = "server.pane_output", pane_id = %pane, bytes = data.len());
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                PaneEvent::Exited { pane, exit } => {
                    info!(event = "server.pane_exited", pane_id = %pane, exit = ?exit);
                }
            }
        }
    }

    info!(event = "server.stop_completed", pid = pid);
    Ok(())
}

fn forward_terminal_size(pane_loop: &mut PaneLoop) {
    let Some(size) = terminal_geometry() else {
        return;
    };
    let ids: Vec<String> = pane_loop.pane_ids().map(str::to_string).collect();
    for id in ids {
        if let Err(e) = pane_loop.resize(&id, size.rows, size.cols) {
            warn!(event = "server.resize_failed", pane_id = %id, error = %e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptymux_core::ManualClock;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static LOOKUPS: AtomicUsize = AtomicUsize::new(0);

    fn counting_lookup() -> Result<PathBuf, MuxError> {
        LOOKUPS.fetch_add(1, Ordering::SeqCst);
        Ok(PathBuf::from("/bin/counted"))
    }

    fn failing_lookup() -> Result<PathBuf, MuxError> {
        Err(MuxError::UserLookup {
            user: "ghost".to_string(),
        })
    }

    #[test]
    fn test_configured_shell_wins() {
        let mut shells = ShellSource::with_lookup(
            Some(PathBuf::from("/bin/zsh")),
            ExpiringCache::new(Duration::ZERO),
            failing_lookup,
        );
        assert_eq!(shells.shell().unwrap(), PathBuf::from("/bin/zsh"));
    }

    #[test]
    fn test_login_shell_is_memoized_for_ttl() {
        let clock = Rc::new(ManualClock::default());
        let cache = ExpiringCache::with_clock(Duration::from_secs(300), clock.clone());
        let mut shells = ShellSource::with_lookup(None, cache, counting_lookup);

        let before = LOOKUPS.load(Ordering::SeqCst);
        assert_eq!(shells.shell().unwrap(), PathBuf::from("/bin/counted"));
        assert_eq!(shells.shell().unwrap(), PathBuf::from("/bin/counted"));
        assert_eq!(LOOKUPS.load(Ordering::SeqCst), before + 1);

        clock.advance(Duration::from_secs(301));
        shells.shell().unwrap();
        assert_eq!(LOOKUPS.load(Ordering::SeqCst), before + 2);
    }

    #[test]
    fn test_lookup_failure_is_surfaced() {
        let mut shells =
            ShellSource::with_lookup(None, ExpiringCache::new(Duration::ZERO), failing_lookup);
        assert_eq!(shells.shell().unwrap_err().error_code(), "user_lookup_error");
    }

    #[test]
    fn test_pane_command_runs_script_with_dash_c() {
        let command = pane_command("%0", PathBuf::from("/bin/sh"), Some("echo hi"));
        assert_eq!(command.program(), PathBuf::from("/bin/sh").as_path());
    }
}
