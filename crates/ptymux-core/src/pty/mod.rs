pub mod controller;
pub mod session;
pub mod spawn;

pub use controller::{
    ControllingTty, SystemTty, TtyOps, establish_controlling_tty, establish_controlling_tty_with,
};
pub use session::{OpenedPty, PtySession, PtyState};
pub use spawn::{PaneCommand, spawn_pane};
