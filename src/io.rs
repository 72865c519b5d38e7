//! Non-blocking I/O on raw file descriptors.
//!
//! These are the building blocks for bodies that wait on devices: every
//! function reports `WouldBlock` as an error so it can be handed straight to
//! [`Suspender::await_io`], and the end-of-stream conditions are reported as
//! a [`Transfer`] so the body can forward them with
//! [`Suspender::suspend_with`].
//!
//! ```no_run
//! use stackful_coro::io::{self, Transfer};
//! use stackful_coro::{Context, Suspend};
//!
//! let mut ctx = Context::bind(|s, fd: i32| {
//!     let mut buf = [0; 64];
//!     loop {
//!         match io::await_read(s, fd, &mut buf) {
//!             Transfer::Bytes(n) => println!("read {} bytes", n),
//!             Transfer::Eof => break,
//!             Transfer::Closed => s.suspend_with(Suspend::IoClosed),
//!         }
//!     }
//! })
//! .unwrap();
//! io::set_nonblocking(0).unwrap();
//! ctx.setup(0);
//! ctx.run();
//! ```

use std::io;
use std::os::unix::io::RawFd;

use crate::Suspender;

/// Outcome of a successful [`read`] or [`write`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transfer {
    /// This many bytes were transferred.
    Bytes(usize),
    /// The device has no more data to read. It may still be writable.
    Eof,
    /// The device is not available for any operation anymore.
    Closed,
}

/// Puts `fd` into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFL))?;
        if flags & libc::O_NONBLOCK == 0 {
            cvt(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        }
    }
    Ok(())
}

/// Reads from `fd` into `buf`.
///
/// A zero-length read into a non-empty buffer is [`Transfer::Eof`]. A reset
/// connection is [`Transfer::Closed`].
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<Transfer> {
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    match ret {
        -1 => closed_or_err(io::Error::last_os_error()),
        0 if !buf.is_empty() => Ok(Transfer::Eof),
        n => Ok(Transfer::Bytes(n as usize)),
    }
}

/// Writes `buf` to `fd`.
///
/// Writing to a pipe or socket whose other end is gone is
/// [`Transfer::Closed`]. This relies on `SIGPIPE` being ignored, which the
/// Rust runtime does for executables.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<Transfer> {
    let ret = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    match ret {
        -1 => closed_or_err(io::Error::last_os_error()),
        n => Ok(Transfer::Bytes(n as usize)),
    }
}

/// [`read`] from inside a body, suspending while `fd` has nothing to read.
pub fn await_read(suspender: &Suspender, fd: RawFd, buf: &mut [u8]) -> Transfer {
    suspender.await_io(|| read(fd, buf))
}

/// [`write`] from inside a body, suspending while `fd` is full.
pub fn await_write(suspender: &Suspender, fd: RawFd, buf: &[u8]) -> Transfer {
    suspender.await_io(|| write(fd, buf))
}

fn closed_or_err(err: io::Error) -> io::Result<Transfer> {
    match err.raw_os_error() {
        Some(libc::EPIPE) | Some(libc::ECONNRESET) => Ok(Transfer::Closed),
        _ => Err(err),
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
