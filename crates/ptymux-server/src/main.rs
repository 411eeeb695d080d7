mod app;
mod commands;
mod server;
mod signals;

use tracing::error;

fn main() {
    let matches = app::build_cli().get_matches();

    if let Err(e) = commands::run_command(&matches) {
        error!(event = "server.command_failed", error = %e);
        eprintln!("ptymux-server: {}", e);
        std::process::exit(1);
    }
}
