use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::ArgMatches;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use ptymux_core::load_server_config;
use ptymux_core::pid::{check_server_running, is_process_alive};
use serde::Serialize;
use tracing::{debug, error, info};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct ServerStatus {
    running: bool,
    pid: Option<u32>,
    pid_file: PathBuf,
    log_file: PathBuf,
}

pub(crate) fn handle_status_command(
    matches: &ArgMatches,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = matches.get_flag("json");
    debug!(event = "server.status_started");

    let config = load_server_config()?;
    let pid = check_server_running(&config.pid_path);
    let status = ServerStatus {
        running: pid.is_some(),
        pid,
        pid_file: config.pid_path,
        log_file: config.log_path,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else if let Some(pid) = status.pid {
        println!("Server: running (PID: {})", pid);
        println!("Log: {}", status.log_file.display());
    } else {
        println!("Server: stopped");
    }
    Ok(())
}

pub(crate) fn handle_stop_command() -> Result<(), Box<dyn std::error::Error>> {
    debug!(event = "server.stop_started");

    let config = load_server_config()?;
    let Some(pid) = check_server_running(&config.pid_path) else {
        println!("Server is not running");
        return Ok(());
    };

    kill(Pid::from_raw(i32::try_from(pid)?), Signal::SIGTERM).map_err(|e| {
        error!(event = "server.stop_failed", pid = pid, error = %e);
        e
    })?;

    // The server removes its PID file once its last pane has exited.
    let start = Instant::now();
    loop {
        if !config.pid_path.exists() || !is_process_alive(pid) {
            println!("Server stopped");
            info!(event = "server.stop_completed", pid = pid);
            return Ok(());
        }
        if start.elapsed() > STOP_TIMEOUT {
            eprintln!("Server did not stop after {}s", STOP_TIMEOUT.as_secs());
            return Err("Server stop timed out".into());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
