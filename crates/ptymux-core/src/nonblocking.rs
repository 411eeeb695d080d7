use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tracing::warn;

use crate::errors::MuxError;

/// Scoped `O_NONBLOCK` on one descriptor.
///
/// Acquiring reads the current status flags, stores them and sets
/// `O_NONBLOCK`. Dropping the guard writes the stored flags back verbatim,
/// also when the scope is left through `?` or a panic.
///
/// Two overlapping scopes on the same descriptor race on which original value
/// gets restored; callers sharing a descriptor must serialise their scopes.
pub struct NonBlockingScope<'fd> {
    fd: RawFd,
    original: i32,
    _fd: PhantomData<BorrowedFd<'fd>>,
}

impl<'fd> NonBlockingScope<'fd> {
    pub fn acquire(fd: BorrowedFd<'fd>) -> Result<Self, MuxError> {
        let raw = fd.as_raw_fd();
        let original = fcntl(raw, FcntlArg::F_GETFL).map_err(MuxError::IoControl)?;
        let flags = OFlag::from_bits_retain(original) | OFlag::O_NONBLOCK;
        fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(MuxError::IoControl)?;
        Ok(Self {
            fd: raw,
            original,
            _fd: PhantomData,
        })
    }

    /// The status flags observed when the scope was acquired.
    pub fn original_flags(&self) -> OFlag {
        OFlag::from_bits_retain(self.original)
    }
}

impl Drop for NonBlockingScope<'_> {
    fn drop(&mut self) {
        let original = OFlag::from_bits_retain(self.original);
        if let Err(e) = fcntl(self.fd, FcntlArg::F_SETFL(original)) {
            warn!(
                event = "core.nonblocking.restore_failed",
                fd = self.fd,
                error = %e,
            );
        }
    }
}

/// Run `f` with `fd` in non-blocking mode, restoring the original flags after.
pub fn with_nonblocking<F, T>(fd: &impl AsFd, f: F) -> Result<T, MuxError>
where
    F: FnOnce() -> Result<T, MuxError>,
{
    let _scope = NonBlockingScope::acquire(fd.as_fd())?;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;

    fn status_flags(fd: &impl AsFd) -> i32 {
        fcntl(fd.as_fd().as_raw_fd(), FcntlArg::F_GETFL).unwrap()
    }

    #[test]
    fn test_scope_sets_nonblocking_and_restores() {
        let pty = openpty(None, None).unwrap();
        let before = status_flags(&pty.master);
        assert_eq!(before & OFlag::O_NONBLOCK.bits(), 0);

        {
            let scope = NonBlockingScope::acquire(pty.master.as_fd()).unwrap();
            assert_eq!(scope.original_flags().bits(), before);
            assert_ne!(status_flags(&pty.master) & OFlag::O_NONBLOCK.bits(), 0);
        }

        assert_eq!(status_flags(&pty.master), before);
    }

    #[test]
    fn test_restores_exact_flags_when_already_nonblocking() {
        let pty = openpty(None, None).unwrap();
        let raw = pty.master.as_raw_fd();
        let with_nb = OFlag::from_bits_retain(status_flags(&pty.master)) | OFlag::O_NONBLOCK;
        fcntl(raw, FcntlArg::F_SETFL(with_nb)).unwrap();
        let before = status_flags(&pty.master);

        drop(NonBlockingScope::acquire(pty.master.as_fd()).unwrap());

        // Still non-blocking: the stored value is restored, not "original minus O_NONBLOCK".
        assert_eq!(status_flags(&pty.master), before);
    }

    #[test]
    fn test_restores_after_error_inside_scope() {
        let pty = openpty(None, None).unwrap();
        let before = status_flags(&pty.master);

        let result: Result<(), MuxError> = with_nonblocking(&pty.master, || {
            Err(MuxError::ConfigInvalid("boom".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(status_flags(&pty.master), before);
    }

    #[test]
    fn test_restores_after_panic_inside_scope() {
        let pty = openpty(None, None).unwrap();
        let before = status_flags(&pty.master);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = NonBlockingScope::acquire(pty.master.as_fd()).unwrap();
            panic!("inside scope");
        }));

        assert!(outcome.is_err());
        assert_eq!(status_flags(&pty.master), before);
    }

    #[test]
    fn test_repeated_scopes_return_to_first_observed_flags() {
        let pty = openpty(None, None).unwrap();
        let before = status_flags(&pty.master);

        for _ in 0..5 {
            let _scope = NonBlockingScope::acquire(pty.master.as_fd()).unwrap();
        }
        with_nonblocking(&pty.slave, || Ok(())).unwrap();

        assert_eq!(status_flags(&pty.master), before);
    }
}
