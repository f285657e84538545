//! PTY transport: pair allocation, window size, raw mode.
//!
//! `openpty(3)` performs the grant/unlock/name dance; the slave comes back
//! opened without becoming our controlling terminal. Window size moves via
//! the TIOC[GS]WINSZ ioctls, raw mode via termios with the prior state saved
//! for restore.

use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices, Termios};
use tracing::debug;

pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a master/slave pair.
pub fn open_pty() -> Result<PtyPair> {
    let pty = nix::pty::openpty(None, None).context("pty unavailable")?;
    Ok(PtyPair {
        master: pty.master,
        slave: pty.slave,
    })
}

pub fn get_winsize(fd: RawFd) -> Result<libc::winsize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) } < 0 {
        return Err(std::io::Error::last_os_error()).context("TIOCGWINSZ");
    }
    Ok(ws)
}

pub fn set_winsize(fd: RawFd, ws: &libc::winsize) -> Result<()> {
    if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, ws) } < 0 {
        return Err(std::io::Error::last_os_error()).context("TIOCSWINSZ");
    }
    Ok(())
}

/// Put a terminal into raw mode: no canonical input, echo, signal
/// generation or flow control; 8-bit, no parity; VMIN=1, VTIME=0.
/// Returns the prior state for restore.
pub fn set_raw(fd: RawFd) -> Result<Termios> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let saved = termios::tcgetattr(fd).context("tcgetattr")?;
    let mut raw = saved.clone();
    termios::cfmakeraw(&mut raw);
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    termios::tcsetattr(fd, SetArg::TCSANOW, &raw).context("tcsetattr")?;
    Ok(saved)
}

pub fn restore_termios(fd: RawFd, saved: &Termios) -> Result<()> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    termios::tcsetattr(fd, SetArg::TCSANOW, saved).context("tcsetattr restore")?;
    Ok(())
}

/// Raw-mode switch for the outer controlling terminal.
///
/// The saved termios is restored explicitly on the shutdown path and again
/// from `Drop`, so panics and early returns also leave the terminal sane.
pub struct RawModeGuard {
    fd: RawFd,
    saved: Termios,
}

impl RawModeGuard {
    pub fn new(fd: RawFd) -> Result<Self> {
        let saved = set_raw(fd)?;
        Ok(Self { fd, saved })
    }

    /// The cooked state captured when raw mode was entered.
    pub fn saved(&self) -> Termios {
        self.saved.clone()
    }

    /// Restore the saved cooked state. Safe to call more than once.
    pub fn restore(&self) {
        if let Err(e) = restore_termios(self.fd, &self.saved) {
            debug!(error = %e, "termios restore failed");
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_open_pty_and_winsize_roundtrip() {
        let pair = open_pty().unwrap();
        let ws = libc::winsize {
            ws_row: 48,
            ws_col: 132,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        set_winsize(pair.master.as_raw_fd(), &ws).unwrap();

        let got = get_winsize(pair.slave.as_raw_fd()).unwrap();
        assert_eq!(got.ws_row, 48);
        assert_eq!(got.ws_col, 132);
    }

    #[test]
    fn test_raw_mode_save_and_restore_on_slave() {
        let pair = open_pty().unwrap();
        let fd = pair.slave.as_raw_fd();

        let saved = set_raw(fd).unwrap();
        let raw_state =
            termios::tcgetattr(unsafe { BorrowedFd::borrow_raw(fd) }).unwrap();
        assert!(!raw_state
            .local_flags
            .intersects(termios::LocalFlags::ICANON | termios::LocalFlags::ECHO));
        assert_eq!(
            raw_state.control_chars[SpecialCharacterIndices::VMIN as usize],
            1
        );
        assert_eq!(
            raw_state.control_chars[SpecialCharacterIndices::VTIME as usize],
            0
        );

        restore_termios(fd, &saved).unwrap();
        let restored =
            termios::tcgetattr(unsafe { BorrowedFd::borrow_raw(fd) }).unwrap();
        assert_eq!(
            restored.local_flags.contains(termios::LocalFlags::ICANON),
            saved.local_flags.contains(termios::LocalFlags::ICANON)
        );
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let pair = open_pty().unwrap();
        let fd = pair.slave.as_raw_fd();
        let before = termios::tcgetattr(unsafe { BorrowedFd::borrow_raw(fd) }).unwrap();
        let canonical_before = before.local_flags.contains(termios::LocalFlags::ICANON);

        {
            let _guard = RawModeGuard::new(fd).unwrap();
            let during = termios::tcgetattr(unsafe { BorrowedFd::borrow_raw(fd) }).unwrap();
            assert!(!during.local_flags.contains(termios::LocalFlags::ICANON));
        }

        let after = termios::tcgetattr(unsafe { BorrowedFd::borrow_raw(fd) }).unwrap();
        assert_eq!(
            after.local_flags.contains(termios::LocalFlags::ICANON),
            canonical_before
        );
    }
}
