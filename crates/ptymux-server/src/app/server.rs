use clap::{Arg, ArgAction, Command};

pub fn start_command() -> Command {
    Command::new("start")
        .about("Start the server and its first pane")
        .arg(
            Arg::new("foreground")
                .long("foreground")
                .help("Stay attached to the terminal instead of daemonizing")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stdout")
                .long("stdout")
                .help("File the daemon's standard output is appended to")
                .value_name("PATH")
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .arg(
            Arg::new("stderr")
                .long("stderr")
                .help("File the daemon's standard error is appended to")
                .value_name("PATH")
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .arg(
            Arg::new("command")
                .long("command")
                .short('c')
                .help("Run this shell command in the pane instead of an interactive login shell")
                .value_name("CMD"),
        )
        .arg(
            Arg::new("rows")
                .long("rows")
                .help("Initial pane height")
                .value_parser(clap::value_parser!(u16).range(1..)),
        )
        .arg(
            Arg::new("cols")
                .long("cols")
                .help("Initial pane width")
                .value_parser(clap::value_parser!(u16).range(1..)),
        )
}

pub fn status_command() -> Command {
    Command::new("status").about("Show server status").arg(
        Arg::new("json")
            .long("json")
            .help("Output as JSON")
            .action(ArgAction::SetTrue),
    )
}

pub fn stop_command() -> Command {
    Command::new("stop").about("Stop the running server and close its panes")
}
