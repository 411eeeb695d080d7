mod global;
mod server;


use clap::Command;

pub fn build_cli() -> Command {
    global::root_command()
        .subcommand(server::start_command())
        .subcommand(server::status_command())
        .subcommand(server::stop_command())
}
