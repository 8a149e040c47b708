//! Readiness-aware TCP socket stream.
//!
//! Every read first tries to avoid the reactor entirely:
//! 1. serve from the read-ahead buffer,
//! 2. for small requests ask the kernel how much is queued (`FIONREAD`) and,
//!    when it is more than requested, pull a whole read-ahead buffer in one
//!    `recv`,
//! 3. optionally try one non-blocking `recv` ("smart sync read"),
//! 4. only then fall back to the selected [`ReadStrategy`].
//!
//! Small reads (record headers and the like) are dominated by syscall cost,
//! so batching them pays; the read-ahead buffer is released again when large
//! reads dominate.

mod read_ahead;
mod strategy;

pub use strategy::ReadStrategy;

use crate::error::{Error, Result};
use crate::io::stream::shutdown_flags;
use crate::io::{AtomicStreamState, ByteStream, StreamState, sys};
use async_trait::async_trait;
use read_ahead::ReadAhead;
use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use strategy::{AsyncIo, DirectIo, SocketIo};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[cfg(target_os = "linux")]
use crate::io::epoller::Reactors;

pub const DEFAULT_READ_AHEAD_SIZE: usize = 256;

/// Per-socket knobs, threaded in from configuration.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub read_strategy: ReadStrategy,
    pub read_ahead: bool,
    pub read_ahead_size: usize,
    pub smart_sync_read: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            read_strategy: ReadStrategy::default(),
            read_ahead: true,
            read_ahead_size: DEFAULT_READ_AHEAD_SIZE,
            smart_sync_read: true,
        }
    }
}

impl SocketOptions {
    pub fn read_strategy(mut self, strategy: ReadStrategy) -> Self {
        self.read_strategy = strategy;
        self
    }

    pub fn read_ahead(mut self, enabled: bool, size: usize) -> Self {
        self.read_ahead = enabled;
        self.read_ahead_size = size;
        self
    }

    pub fn smart_sync_read(mut self, enabled: bool) -> Self {
        self.smart_sync_read = enabled;
        self
    }
}

struct ReadSide {
    ahead: ReadAhead,
    // Lower bound of bytes still queued in the kernel; `None` means unknown.
    available: Option<usize>,
}

/// A TCP socket implementing [`ByteStream`].
pub struct SocketStream {
    label: String,
    socket: Arc<OwnedFd>,
    io: Box<dyn SocketIo>,
    options: SocketOptions,
    state: AtomicStreamState,
    reader: Mutex<ReadSide>,
    writer: Mutex<()>,
    closing: CancellationToken,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl SocketStream {
    /// Wraps a connected socket. The epoll strategy registers with
    /// [`Reactors::global`]; the async strategy needs a tokio runtime.
    pub fn new(stream: std::net::TcpStream, options: &SocketOptions) -> Result<Self> {
        #[cfg(target_os = "linux")]
        if options.read_strategy == ReadStrategy::Epoll {
            let reactors = Reactors::global()?;
            return Self::with_reactors(stream, options, &reactors);
        }
        Self::build(stream, options, |fd, _| match options.read_strategy {
            ReadStrategy::Direct => Ok(Box::new(DirectIo::new(fd.clone())) as Box<dyn SocketIo>),
            _ => Ok(Box::new(AsyncIo::new(fd)?) as Box<dyn SocketIo>),
        })
    }

    /// Like [`new`](Self::new) but registers with the given reactor pair
    /// when the epoll strategy is selected.
    #[cfg(target_os = "linux")]
    pub fn with_reactors(
        stream: std::net::TcpStream,
        options: &SocketOptions,
        reactors: &Reactors,
    ) -> Result<Self> {
        Self::build(stream, options, |fd, label| match options.read_strategy {
            ReadStrategy::Direct => Ok(Box::new(DirectIo::new(fd.clone())) as Box<dyn SocketIo>),
            ReadStrategy::Async => Ok(Box::new(AsyncIo::new(fd)?) as Box<dyn SocketIo>),
            ReadStrategy::Epoll => {
                Ok(Box::new(strategy::EpollIo::new(fd, reactors, label)?) as Box<dyn SocketIo>)
            }
        })
    }

    pub async fn connect(addr: SocketAddr, options: &SocketOptions) -> Result<Self> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        Self::from_tokio(stream, options)
    }

    pub fn from_tokio(stream: tokio::net::TcpStream, options: &SocketOptions) -> Result<Self> {
        stream.set_nodelay(true)?;
        Self::new(stream.into_std()?, options)
    }

    fn build<F>(stream: std::net::TcpStream, options: &SocketOptions, make_io: F) -> Result<Self>
    where
        F: FnOnce(&Arc<OwnedFd>, &str) -> Result<Box<dyn SocketIo>>,
    {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        // Direct reads block in the kernel; every other path is non-blocking.
        stream.set_nonblocking(options.read_strategy != ReadStrategy::Direct)?;
        let label = match peer_addr {
            Some(addr) => format!("socket({})", addr),
            None => "socket".to_string(),
        };
        let socket = Arc::new(OwnedFd::from(stream));
        let io = make_io(&socket, &label)?;
        tracing::trace!("{}: using {:?} strategy", label, options.read_strategy);
        Ok(Self {
            label,
            io,
            reader: Mutex::new(ReadSide {
                ahead: ReadAhead::new(options.read_ahead_size),
                available: None,
            }),
            writer: Mutex::new(()),
            options: options.clone(),
            state: AtomicStreamState::new(),
            closing: CancellationToken::new(),
            socket,
            local_addr,
            peer_addr,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    /// Bytes currently held in the read-ahead buffer. `None` while a read
    /// is in flight.
    pub fn buffered(&self) -> Option<usize> {
        self.reader.try_lock().ok().map(|side| side.ahead.pending())
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn received(&self, n: usize) -> usize {
        if n == 0 {
            self.state.insert(StreamState::REMOTE_SHUTDOWN);
        }
        n
    }

    /// Steps 2 and 3 of the read path. `Ok(None)` means nothing was
    /// available without waiting.
    fn try_read_now(&self, side: &mut ReadSide, buf: &mut [u8]) -> Result<Option<usize>> {
        let fd = self.fd();
        if self.options.read_ahead && buf.len() < side.ahead.capacity() {
            let avail = match side.available {
                Some(n) if n > 0 => n,
                _ => sys::available(fd)?,
            };
            if avail > buf.len() {
                match sys::recv(fd, side.ahead.spare(), true) {
                    Ok(0) => return Ok(Some(0)),
                    Ok(n) => {
                        side.ahead.filled(n);
                        side.ahead.reward();
                        side.available = Some(avail.saturating_sub(n));
                        return Ok(Some(side.ahead.take(buf)));
                    }
                    Err(e) if sys::is_would_block(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            } else if avail > 0 {
                match sys::recv(fd, buf, true) {
                    Ok(n) => {
                        side.available = None;
                        return Ok(Some(n));
                    }
                    Err(e) if sys::is_would_block(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            side.available = None;
        } else {
            side.ahead.decay();
            side.available = None;
        }

        if self.options.smart_sync_read {
            match sys::recv(fd, buf, true) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if sys::is_would_block(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketStream")
            .field("label", &self.label)
            .field("fd", &self.fd())
            .field("strategy", &self.options.read_strategy)
            .field("state", &self.state.load())
            .finish()
    }
}

#[async_trait]
impl ByteStream for SocketStream {
    fn state(&self) -> StreamState {
        self.state.load()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self
            .reader
            .try_lock()
            .map_err(|_| Error::protocol(format!("{}: concurrent read", self.label)))?;
        if self.closing.is_cancelled() {
            return Err(Error::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let side = &mut *guard;
        if side.ahead.pending() > 0 {
            return Ok(side.ahead.take(buf));
        }
        if !self.state.load().can_read() {
            return Ok(0);
        }
        if let Some(n) = self.try_read_now(side, buf)? {
            return Ok(self.received(n));
        }
        let n = tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(Error::Closed),
            r = self.io.read(buf) => r?,
        };
        Ok(self.received(n))
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        let _guard = self
            .writer
            .try_lock()
            .map_err(|_| Error::protocol(format!("{}: concurrent write", self.label)))?;
        if self.closing.is_cancelled() {
            return Err(Error::Closed);
        }
        if !self.state.load().can_write() {
            return Err(Error::protocol(format!("{}: write after shutdown", self.label)));
        }
        // Common case: the send buffer has room and nothing else is needed.
        let mut pos = match sys::send(self.fd(), buf, true) {
            Ok(n) => n,
            Err(e) if sys::is_would_block(&e) => 0,
            Err(e) => return Err(e.into()),
        };
        while pos < buf.len() {
            pos += tokio::select! {
                biased;
                _ = self.closing.cancelled() => return Err(Error::Closed),
                r = self.io.write(&buf[pos..]) => r?,
            };
        }
        Ok(())
    }

    async fn shutdown(&self, how: Shutdown) -> Result<()> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        let prev = self.state.insert(shutdown_flags(how));
        if prev.contains(shutdown_flags(how)) {
            return Ok(());
        }
        sys::shutdown(self.fd(), how)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        self.closing.cancel();
        self.state.insert(StreamState::CLOSED);
        if let Err(e) = sys::shutdown(self.fd(), Shutdown::Both) {
            tracing::trace!("{}: shutdown on close: {}", self.label, e);
        }
        self.io.detach();
        tracing::trace!("{}: closed", self.label);
        Ok(())
    }
}

impl Drop for SocketStream {
    fn drop(&mut self) {
        self.io.detach();
    }
}
