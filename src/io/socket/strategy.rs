use crate::io::sys;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{self, Result as IoResult};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

#[cfg(target_os = "linux")]
use crate::io::epoller::{EpollHandler, Reactors};
#[cfg(target_os = "linux")]
use nix::sys::epoll::EpollFlags;
#[cfg(target_os = "linux")]
use std::os::fd::AsFd;
#[cfg(target_os = "linux")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(target_os = "linux")]
use tokio::sync::Notify;

/// How a [`SocketStream`](super::SocketStream) waits for its socket once the
/// non-blocking fast paths came up empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadStrategy {
    /// Blocking `recv`/`send` on tokio's blocking pool.
    Direct,
    /// tokio's readiness reactor (`AsyncFd`).
    Async,
    /// Dedicated edge-triggered epoll reactors.
    #[cfg(target_os = "linux")]
    Epoll,
}

impl Default for ReadStrategy {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        ReadStrategy::Epoll
    }

    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        ReadStrategy::Async
    }
}

/// Slow path of a socket: wait for readiness, then move bytes.
#[async_trait]
pub(crate) trait SocketIo: Send + Sync {
    /// Receives at most `buf.len()` bytes, waiting as long as needed.
    async fn read(&self, buf: &mut [u8]) -> IoResult<usize>;

    /// Sends a prefix of `buf`, waiting until at least one byte is accepted.
    async fn write(&self, buf: &[u8]) -> IoResult<usize>;

    /// Drops reactor registrations and wakes waiters. Idempotent; runs
    /// before the descriptors are released.
    fn detach(&self);
}

pub(crate) struct DirectIo {
    fd: Arc<OwnedFd>,
}

impl DirectIo {
    pub fn new(fd: Arc<OwnedFd>) -> Self {
        Self { fd }
    }
}

#[async_trait]
impl SocketIo for DirectIo {
    async fn read(&self, buf: &mut [u8]) -> IoResult<usize> {
        // The blocking task owns its buffer and a handle on the socket, so a
        // close from another task (shutdown) wakes it without a dangling fd.
        let fd = self.fd.clone();
        let len = buf.len();
        let (tmp, n) = tokio::task::spawn_blocking(move || {
            let mut tmp = vec![0u8; len];
            let n = sys::recv(fd.as_raw_fd(), &mut tmp, false)?;
            Ok::<_, io::Error>((tmp, n))
        })
        .await
        .map_err(io::Error::other)??;
        buf[..n].copy_from_slice(&tmp[..n]);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> IoResult<usize> {
        let fd = self.fd.clone();
        let data = buf.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut pos = 0;
            while pos < data.len() {
                pos += sys::send(fd.as_raw_fd(), &data[pos..], false)?;
            }
            Ok::<_, io::Error>(pos)
        })
        .await
        .map_err(io::Error::other)?
    }

    fn detach(&self) {}
}

pub(crate) struct AsyncIo {
    fd: AsyncFd<OwnedFd>,
}

impl AsyncIo {
    /// Registers a duplicate of the socket with tokio's reactor. Needs a
    /// running runtime.
    pub fn new(fd: &OwnedFd) -> IoResult<Self> {
        let dup = fd.try_clone()?;
        let fd = AsyncFd::with_interest(dup, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { fd })
    }
}

#[async_trait]
impl SocketIo for AsyncIo {
    async fn read(&self, buf: &mut [u8]) -> IoResult<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| sys::recv(inner.as_raw_fd(), buf, true)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> IoResult<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| sys::send(inner.as_raw_fd(), buf, true)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    fn detach(&self) {}
}

#[cfg(target_os = "linux")]
struct Readiness {
    label: String,
    notify: Notify,
}

#[cfg(target_os = "linux")]
impl EpollHandler for Readiness {
    fn on_event(&self, _events: EpollFlags) {
        self.notify.notify_one();
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Edge-triggered epoll strategy. Reads and writes go through two separate
/// duplicates of the socket, each registered with its own reactor, so the
/// two directions never share registration state.
#[cfg(target_os = "linux")]
pub(crate) struct EpollIo {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    reactors: Reactors,
    readable: Arc<Readiness>,
    writable: Arc<Readiness>,
    write_armed: AtomicBool,
    detached: AtomicBool,
}

#[cfg(target_os = "linux")]
const READ_INTEREST: EpollFlags = EpollFlags::EPOLLIN
    .union(EpollFlags::EPOLLRDHUP)
    .union(EpollFlags::EPOLLET);
#[cfg(target_os = "linux")]
const WRITE_INTEREST: EpollFlags = EpollFlags::EPOLLOUT.union(EpollFlags::EPOLLONESHOT);

#[cfg(target_os = "linux")]
impl EpollIo {
    /// `fd` must already be in non-blocking mode.
    pub fn new(fd: &OwnedFd, reactors: &Reactors, label: &str) -> crate::Result<Self> {
        let read_fd = fd.try_clone()?;
        let write_fd = fd.try_clone()?;
        let readable = Arc::new(Readiness {
            label: format!("{} read", label),
            notify: Notify::new(),
        });
        let writable = Arc::new(Readiness {
            label: format!("{} write", label),
            notify: Notify::new(),
        });
        reactors
            .read
            .add_fd(read_fd.as_fd(), READ_INTEREST, readable.clone())?;
        Ok(Self {
            read_fd,
            write_fd,
            reactors: reactors.clone(),
            readable,
            writable,
            write_armed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        })
    }

    fn arm_write(&self) -> IoResult<()> {
        let result = if self.write_armed.swap(true, Ordering::AcqRel) {
            self.reactors
                .write
                .modify_fd(self.write_fd.as_fd(), WRITE_INTEREST)
        } else {
            self.reactors.write.add_fd(
                self.write_fd.as_fd(),
                WRITE_INTEREST,
                self.writable.clone(),
            )
        };
        result.map_err(|e| match e {
            crate::Error::Io(e) => e,
            e => io::Error::other(e),
        })
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl SocketIo for EpollIo {
    async fn read(&self, buf: &mut [u8]) -> IoResult<usize> {
        loop {
            match sys::recv(self.read_fd.as_raw_fd(), buf, true) {
                Err(e) if sys::is_would_block(&e) => {
                    if self.detached.load(Ordering::Acquire) {
                        return Err(io::ErrorKind::NotConnected.into());
                    }
                    // A stored permit covers an edge that fired before we
                    // started waiting.
                    self.readable.notify.notified().await;
                }
                result => return result,
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> IoResult<usize> {
        loop {
            match sys::send(self.write_fd.as_raw_fd(), buf, true) {
                Err(e) if sys::is_would_block(&e) => {
                    if self.detached.load(Ordering::Acquire) {
                        return Err(io::ErrorKind::NotConnected.into());
                    }
                    self.arm_write()?;
                    self.writable.notify.notified().await;
                }
                result => return result,
            }
        }
    }

    fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reactors.read.remove_fd(self.read_fd.as_fd());
        if self.write_armed.load(Ordering::Acquire) {
            self.reactors.write.remove_fd(self.write_fd.as_fd());
        }
        self.readable.notify.notify_waiters();
        self.readable.notify.notify_one();
        self.writable.notify.notify_waiters();
        self.writable.notify.notify_one();
    }
}

#[cfg(target_os = "linux")]
impl Drop for EpollIo {
    fn drop(&mut self) {
        self.detach();
    }
}
