use clap::Command;

pub fn root_command() -> Command {
    Command::new("ptymux-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Background server owning the pseudo-terminals behind ptymux panes")
        .long_about(
            "ptymux-server detaches into a daemon, opens a pseudo-terminal for each pane, \
             runs the user's login shell on it as the controlling terminal and relays the \
             pane's output.",
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
}
