// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Raw-terminal scope and non-blocking stdin reads.
//!
//! Raw mode clears ICANON, ECHO and ISIG so keystrokes (including
//! ctrl-c) reach the guest immediately, with VMIN=1/VTIME=0. Output
//! processing is left on so the guest's "\n" still returns the cursor
//! to column 0. The saved attributes are restored with drain
//! semantics on drop, on every exit path.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// RAII raw-mode scope for a terminal fd.
pub struct RawTerminal {
    fd: RawFd,
    saved: libc::termios,
}

impl RawTerminal {
    /// Enter raw mode on `fd`. Returns `None` when `fd` is not a
    /// terminal (piped stdin), which is not an error.
    pub fn enter(fd: RawFd) -> io::Result<Option<RawTerminal>> {
        // SAFETY: isatty is harmless on any fd.
        if unsafe { libc::isatty(fd) } == 0 {
            return Ok(None);
        }
        // SAFETY: tcgetattr fills the struct on success, which is
        // checked before use.
        let mut saved: libc::termios = unsafe { mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut saved) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut raw = saved;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ISIG);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;
        // SAFETY: raw is a valid termios derived from the saved one.
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Some(RawTerminal { fd, saved }))
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        // SAFETY: restores the attributes captured in enter(); TCSADRAIN
        // lets pending output finish first.
        unsafe { libc::tcsetattr(self.fd, libc::TCSADRAIN, &self.saved) };
    }
}

/// Drain whatever is currently readable on `fd` without blocking.
pub fn read_available(fd: RawFd) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let ready = unsafe { libc::poll(&mut pollfd, 1, 0) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if ready == 0 || pollfd.revents & libc::POLLIN == 0 {
            return Ok(out);
        }

        let mut buf = [0u8; 64];
        // SAFETY: reads at most buf.len() bytes into a stack buffer.
        let count = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if count <= 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..count as usize]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_skips_non_terminals() {
        let mut fds = [0; 2];
        // SAFETY: fds is a valid two-element array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert!(RawTerminal::enter(fds[0]).unwrap().is_none());
        // SAFETY: closing the pipe we just opened.
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_read_available_drains_pipe() {
        let mut fds = [0; 2];
        // SAFETY: fds is a valid two-element array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // SAFETY: writing a short constant buffer to the write end.
        let written = unsafe { libc::write(fds[1], b"input\n".as_ptr().cast(), 6) };
        assert_eq!(written, 6);

        assert_eq!(read_available(fds[0]).unwrap(), b"input\n");
        // Nothing left: returns empty instead of blocking.
        assert!(read_available(fds[0]).unwrap().is_empty());

        // SAFETY: closing the pipe.
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_read_available_handles_large_input() {
        let mut fds = [0; 2];
        // SAFETY: fds is a valid two-element array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let data = vec![b'x'; 300];
        // SAFETY: writing a valid buffer to the write end.
        let written = unsafe { libc::write(fds[1], data.as_ptr().cast(), data.len()) };
        assert_eq!(written, 300);

        assert_eq!(read_available(fds[0]).unwrap(), data);
        // SAFETY: closing the pipe.
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
