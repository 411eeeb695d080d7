use std::sync::atomic::{AtomicBool, Ordering};

use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static WINCH_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_winch(_: libc::c_int) {
    WINCH_PENDING.store(true, Ordering::SeqCst);
}

/// Route SIGTERM, SIGINT and SIGHUP to a shutdown flag, and SIGWINCH to a
/// resize flag.
///
/// No `SA_RESTART`: a pending signal interrupts the pane loop's `poll` so the
/// flags are seen within one round.
pub fn install() -> nix::Result<()> {
    let shutdown = SigAction::new(
        SigHandler::Handler(on_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let winch = SigAction::new(
        SigHandler::Handler(on_winch),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: both handlers only store to an atomic.
    unsafe {
        for signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP] {
            sigaction(signal, &shutdown)?;
        }
        sigaction(Signal::SIGWINCH, &winch)?;
    }
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Whether SIGWINCH arrived since the last call.
pub fn take_winch() -> bool {
    WINCH_PENDING.swap(false, Ordering::SeqCst)
}
