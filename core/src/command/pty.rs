//! Pseudo-terminal plumbing: the openpty pair and an async wrapper for
//! the primary endpoint.

use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;

use nix::pty::Winsize;
use nix::pty::openpty;
use nix::sys::termios::LocalFlags;
use nix::sys::termios::SetArg;
use nix::sys::termios::tcgetattr;
use nix::sys::termios::tcsetattr;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

/// Opens a pseudo-terminal pair. Local echo is disabled on the secondary
/// so that bytes typed into the stream are not mirrored back into the
/// output, which keeps stdout framing clean.
pub(crate) fn open() -> io::Result<(PtyPrimary, OwnedFd)> {
    let pair = openpty(None, None).map_err(io::Error::from)?;
    disable_echo(&pair.slave)?;
    let primary = PtyPrimary::new(pair.master)?;
    Ok((primary, pair.slave))
}

fn disable_echo(fd: &OwnedFd) -> io::Result<()> {
    let mut attrs = tcgetattr(fd).map_err(io::Error::from)?;
    attrs.local_flags.remove(LocalFlags::ECHO);
    tcsetattr(fd, SetArg::TCSANOW, &attrs).map_err(io::Error::from)
}

/// The parent's duplex byte stream to the child's terminal. Reads and
/// writes are async over a non-blocking descriptor; winsize updates and
/// the interrupt-byte injection are immediate.
pub(crate) struct PtyPrimary {
    fd: AsyncFd<OwnedFd>,
}

impl PtyPrimary {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        let fd = AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { fd })
    }

    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| raw_read(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub(crate) async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| raw_write(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => {
                    let n = result?;
                    buf = &buf[n..];
                }
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Queues `0x03` on the terminal so the line discipline delivers
    /// SIGINT to the foreground process group. Best effort: a full
    /// terminal buffer means the child is not reading anyway and the
    /// signal ladder follows.
    pub(crate) fn inject_interrupt(&self) {
        let _ = raw_write(self.fd.get_ref().as_raw_fd(), &[0x03]);
    }

    /// Applying the same winsize repeatedly is idempotent; updates may
    /// arrive in any order relative to child output.
    pub(crate) fn set_winsize(&self, rows: u16, cols: u16, x: u16, y: u16) -> io::Result<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: x,
            ws_ypixel: y,
        };
        let rc = unsafe {
            libc::ioctl(
                self.fd.get_ref().as_raw_fd(),
                libc::TIOCSWINSZ,
                &raw const winsize,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn winsize(&self) -> io::Result<(u16, u16)> {
        let mut winsize = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe {
            libc::ioctl(
                self.fd.get_ref().as_raw_fd(),
                libc::TIOCGWINSZ,
                &raw mut winsize,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((winsize.ws_row, winsize.ws_col))
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn raw_read(fd: i32, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn raw_write(fd: i32, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
