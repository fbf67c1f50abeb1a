//! Local terminal control: raw mode and window size queries.

use std::io::IsTerminal;
use std::mem::MaybeUninit;

use termlink_core::error::TerminalError;

/// Puts stdin into raw mode and restores the original termios settings
/// when dropped.
///
/// Dropping on every exit path, including errors and cancelled futures,
/// is what keeps the user's terminal usable no matter how the session
/// ended.
pub struct RawModeGuard {
    fd: libc::c_int,
    original: libc::termios,
}

impl RawModeGuard {
    /// Switch stdin to raw mode, remembering the current settings.
    pub fn enable() -> Result<Self, TerminalError> {
        if !std::io::stdin().is_terminal() {
            return Err(TerminalError::NotATty);
        }
        let fd = libc::STDIN_FILENO;

        let mut original = MaybeUninit::<libc::termios>::uninit();
        // SAFETY: tcgetattr fills the termios struct for a valid fd; the
        // return code is checked before assume_init.
        let rc = unsafe { libc::tcgetattr(fd, original.as_mut_ptr()) };
        if rc != 0 {
            return Err(TerminalError::GetAttr(std::io::Error::last_os_error()));
        }
        // SAFETY: initialized by the successful tcgetattr above.
        let original = unsafe { original.assume_init() };

        let mut raw = original;
        // SAFETY: cfmakeraw only mutates the struct passed in.
        unsafe { libc::cfmakeraw(&mut raw) };
        // SAFETY: raw is a fully initialized termios; TCSADRAIN lets
        // pending output finish before the switch.
        let rc = unsafe { libc::tcsetattr(fd, libc::TCSADRAIN, &raw) };
        if rc != 0 {
            return Err(TerminalError::SetAttr(std::io::Error::last_os_error()));
        }

        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // SAFETY: restores the attributes captured in enable(). Failure
        // here has no fallback; the process is on its way out.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSADRAIN, &self.original);
        }
    }
}

/// Current window size of the controlling terminal as (rows, cols).
///
/// Falls back to 24x80 when the query fails or reports zero, so a
/// handshake can always carry a usable size.
pub fn window_size() -> (u32, u32) {
    // SAFETY: a zeroed winsize is a valid out-parameter for TIOCGWINSZ.
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGWINSZ writes into the winsize struct; the return code
    // is checked before the fields are trusted.
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc != 0 {
        return (24, 80);
    }

    let rows = if ws.ws_row == 0 { 24 } else { u32::from(ws.ws_row) };
    let cols = if ws.ws_col == 0 { 80 } else { u32::from(ws.ws_col) };
    (rows, cols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_never_zero() {
        // Whether or not the test runs under a tty, both dimensions must
        // come back usable.
        let (rows, cols) = window_size();
        assert!(rows > 0);
        assert!(cols > 0);
    }

    #[test]
    fn test_raw_mode_requires_tty() {
        // Test runners detach stdin from a terminal; enabling raw mode
        // must fail cleanly instead of corrupting some other descriptor.
        if !std::io::stdin().is_terminal() {
            assert!(matches!(
                RawModeGuard::enable(),
                Err(TerminalError::NotATty)
            ));
        }
    }
}
