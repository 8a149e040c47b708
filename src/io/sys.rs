// Thin wrappers over the socket calls the stream layer issues directly.
// Everything here works on raw descriptors owned elsewhere.

use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags, Shutdown};
use std::io::{self, Result as IoResult};
use std::os::fd::RawFd;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

pub(crate) fn is_would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn retry<T>(mut f: impl FnMut() -> nix::Result<T>) -> IoResult<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            r => return r.map_err(io::Error::from),
        }
    }
}

fn wait_flag(nonblocking: bool) -> MsgFlags {
    if nonblocking {
        MsgFlags::MSG_DONTWAIT
    } else {
        MsgFlags::empty()
    }
}

/// `recv(2)`, retried on `EINTR`. With `nonblocking` the call never waits,
/// even on a socket in blocking mode.
pub(crate) fn recv(fd: RawFd, buf: &mut [u8], nonblocking: bool) -> IoResult<usize> {
    let flags = wait_flag(nonblocking);
    retry(|| socket::recv(fd, &mut *buf, flags))
}

/// `send(2)` without SIGPIPE, retried on `EINTR`. Returns the number of bytes
/// the kernel accepted.
pub(crate) fn send(fd: RawFd, buf: &[u8], nonblocking: bool) -> IoResult<usize> {
    let flags = SEND_FLAGS | wait_flag(nonblocking);
    retry(|| socket::send(fd, buf, flags))
}

/// Bytes queued in the kernel receive buffer (`FIONREAD`).
pub(crate) fn available(fd: RawFd) -> IoResult<usize> {
    let mut n: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n as *mut libc::c_int) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(n.max(0) as usize)
}

/// `shutdown(2)`. "Not connected" is not an error here: the peer may already
/// be gone when we get around to half-closing.
pub(crate) fn shutdown(fd: RawFd, how: std::net::Shutdown) -> IoResult<()> {
    let how = match how {
        std::net::Shutdown::Read => Shutdown::Read,
        std::net::Shutdown::Write => Shutdown::Write,
        std::net::Shutdown::Both => Shutdown::Both,
    };
    match socket::shutdown(fd, how) {
        Ok(()) | Err(Errno::ENOTCONN) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_recv_send_available() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut buf = [0u8; 16];
        let err = recv(b.as_raw_fd(), &mut buf, true).unwrap_err();
        assert!(is_would_block(&err));

        a.write_all(b"hello").unwrap();
        assert_eq!(available(b.as_raw_fd()).unwrap(), 5);
        assert_eq!(recv(b.as_raw_fd(), &mut buf[..2], true).unwrap(), 2);
        assert_eq!(available(b.as_raw_fd()).unwrap(), 3);
        assert_eq!(send(b.as_raw_fd(), b"pong", true).unwrap(), 4);

        shutdown(a.as_raw_fd(), std::net::Shutdown::Write).unwrap();
        assert_eq!(recv(b.as_raw_fd(), &mut buf, false).unwrap(), 3);
        assert_eq!(recv(b.as_raw_fd(), &mut buf, false).unwrap(), 0);
    }

    #[test]
    fn test_shutdown_unconnected_is_ok() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        shutdown(listener.as_raw_fd(), std::net::Shutdown::Both).unwrap();
        let err = send(-1, b"x", true).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
