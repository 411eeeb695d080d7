pub mod cache;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod event_loop;
pub mod geometry;
pub mod logging;
pub mod nonblocking;
pub mod pid;
pub mod pty;
pub mod shell;

// Primary re-exports
pub use cache::{AttributeCache, Clock, DEFAULT_TTL, ExpiringCache, ManualClock, SystemClock};
pub use config::{ServerConfig, load_server_config, load_server_config_from};
pub use daemon::{DaemonRole, DaemonStreams, daemonize, try_daemonize};
pub use errors::{ForkStage, MuxError};
pub use event_loop::{PaneEvent, PaneExit, PaneLoop};
pub use geometry::{GeometryUpdate, WindowSize};
pub use logging::{LogTarget, init_logging};
pub use nonblocking::{NonBlockingScope, with_nonblocking};
pub use pty::{
    OpenedPty, PaneCommand, PtySession, PtyState, establish_controlling_tty, spawn_pane,
};
pub use shell::default_shell;
