//! Window-size propagation to pty devices.

use std::os::fd::RawFd;

use nix::libc;
use tracing::debug;

use crate::errors::MuxError;

nix::ioctl_write_ptr_bad!(set_winsize, libc::TIOCSWINSZ, libc::winsize);
nix::ioctl_read_bad!(get_winsize, libc::TIOCGWINSZ, libc::winsize);

/// A (rows, cols) pair applied to a pane. No history is kept; last write wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryUpdate {
    pub rows: u16,
    pub cols: u16,
}

impl GeometryUpdate {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

/// The kernel's view of a pty's size, pixel fields included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

/// Send `TIOCSWINSZ` for `fd` with pixel fields left at 0 ("unspecified").
///
/// Zero rows or columns are passed through as-is. Fails with
/// [`MuxError::IoControl`] when `fd` is not an open pty endpoint.
pub fn apply(fd: RawFd, rows: u16, cols: u16) -> Result<(), MuxError> {
    let ws = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `ws` outlives the call and the kernel only reads from it.
    unsafe { set_winsize(fd, &ws) }.map_err(MuxError::IoControl)?;
    debug!(
        event = "core.geometry.apply_completed",
        fd = fd,
        rows = rows,
        cols = cols,
    );
    Ok(())
}

pub fn apply_update(fd: RawFd, update: GeometryUpdate) -> Result<(), MuxError> {
    apply(fd, update.rows, update.cols)
}

/// Read the current window size of `fd` with `TIOCGWINSZ`.
pub fn read(fd: RawFd) -> Result<WindowSize, MuxError> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `ws` is a valid, writable winsize for the duration of the call.
    unsafe { get_winsize(fd, &mut ws) }.map_err(MuxError::IoControl)?;
    Ok(ws.into())
}
