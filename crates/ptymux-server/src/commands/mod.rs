mod control;
mod start;

use clap::ArgMatches;
use ptymux_core::{LogTarget, init_logging};
use tracing::error;

pub fn run_command(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    match matches.subcommand() {
        // `start` installs its own subscriber once it knows where it runs.
        Some(("start", sub_matches)) => start::handle_start_command(sub_matches),
        Some(("status", sub_matches)) => {
            init_logging(&LogTarget::Stderr)?;
            control::handle_status_command(sub_matches)
        }
        Some(("stop", _)) => {
            init_logging(&LogTarget::Stderr)?;
            control::handle_stop_command()
        }
        _ => {
            error!(event = "server.command_unknown");
            Err("Unknown command".into())
        }
    }
}
