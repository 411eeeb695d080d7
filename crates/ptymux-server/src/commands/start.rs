use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::ArgMatches;
use ptymux_core::pid::{check_server_running, read_pid_file};
use ptymux_core::{
    DaemonRole, GeometryUpdate, LogTarget, ServerConfig, daemonize, init_logging,
    load_server_config,
};
use tracing::info;

use crate::server::{self, StartOptions};

const READY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn handle_start_command(
    matches: &ArgMatches,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_server_config()?;
    if let Some(path) = matches.get_one::<PathBuf>("stdout") {
        config.stdout_path = path.clone();
    }
    if let Some(path) = matches.get_one::<PathBuf>("stderr") {
        config.stderr_path = path.clone();
    }
    // The daemon runs from `/`; relative paths must be resolved first.
    absolutize_paths(&mut config)?;

    let foreground = matches.get_flag("foreground");

    if let Some(pid) = check_server_running(&config.pid_path) {
        println!("Server already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        init_logging(&LogTarget::Stderr)?;
        eprintln!(
            "Starting server in foreground (PID: {})...",
            std::process::id()
        );
    } else {
        match daemonize(&config.daemon_streams()) {
            DaemonRole::Parent => {
                report_started(&config.pid_path);
                return Ok(());
            }
            DaemonRole::Daemon => init_logging(&LogTarget::File(config.log_path.clone()))?,
        }
    }

    let options = StartOptions {
        foreground,
        command: matches.get_one::<String>("command").cloned(),
        geometry: initial_geometry(matches, &config, foreground),
    };
    info!(
        event = "server.start_started",
        foreground = foreground,
        rows = options.geometry.rows,
        cols = options.geometry.cols,
    );
    server::run_server(&config, &options)
}

fn absolutize_paths(config: &mut ServerConfig) -> std::io::Result<()> {
    for path in [
        &mut config.pid_path,
        &mut config.log_path,
        &mut config.stdin_path,
        &mut config.stdout_path,
        &mut config.stderr_path,
    ] {
        *path = std::path::absolute(&*path)?;
    }
    Ok(())
}

/// Flags first, then (in the foreground) the attached terminal, then config.
fn initial_geometry(matches: &ArgMatches, config: &ServerConfig, foreground: bool) -> GeometryUpdate {
    let fallback = if foreground {
        server::terminal_geometry().unwrap_or_else(|| config.default_geometry())
    } else {
        config.default_geometry()
    };
    GeometryUpdate::new(
        matches.get_one::<u16>("rows").copied().unwrap_or(fallback.rows),
        matches.get_one::<u16>("cols").copied().unwrap_or(fallback.cols),
    )
}

/// Parent side of daemonization: wait briefly for the daemon's PID file.
///
/// A daemon whose pane finishes quickly may already be gone, so a missing
/// file is reported but not treated as failure.
fn report_started(pid_path: &Path) {
    let start = Instant::now();
    while start.elapsed() < READY_TIMEOUT {
        if let Some(pid) = read_pid_file(pid_path) {
            println!("Server started (PID: {})", pid);
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    println!("Server started (PID unknown)");
}
