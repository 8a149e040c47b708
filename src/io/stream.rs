use crate::error::{Error, Result};
use crate::io::StreamState;
use async_trait::async_trait;
use std::net::Shutdown;
use std::sync::Arc;

/// A connected, ordered, non-blocking byte endpoint.
///
/// Methods take `&self` so that one reader and one writer can run at the same
/// time. Each direction is single-flight: issuing a second `read` (or
/// `write`) while one is outstanding fails with [`Error::Protocol`].
#[async_trait]
pub trait ByteStream: Send + Sync {
    /// Current state, observable without blocking.
    fn state(&self) -> StreamState;

    /// Reads at most `buf.len()` bytes. `Ok(0)` means the remote side has
    /// finished sending.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Writes all of `buf`, retrying partial transport writes internally.
    async fn write(&self, buf: &[u8]) -> Result<()>;

    /// Half-closes one direction (or both).
    async fn shutdown(&self, how: Shutdown) -> Result<()>;

    /// Tears the stream down. Pending operations fail with
    /// [`Error::Closed`]. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;

    /// Fills `buf` completely. Hitting EOF before that is an error.
    async fn read_full(&self, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            match self.read(&mut buf[pos..]).await? {
                0 => return Err(Error::UnexpectedEof("stream body")),
                n => pos += n,
            }
        }
        Ok(())
    }
}

pub type ByteStreamRef = Arc<dyn ByteStream>;

#[async_trait]
impl<T: ByteStream + ?Sized> ByteStream for Arc<T> {
    fn state(&self) -> StreamState {
        (**self).state()
    }
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf).await
    }
    async fn write(&self, buf: &[u8]) -> Result<()> {
        (**self).write(buf).await
    }
    async fn shutdown(&self, how: Shutdown) -> Result<()> {
        (**self).shutdown(how).await
    }
    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

/// State flags implied by shutting down `how`.
pub(crate) fn shutdown_flags(how: Shutdown) -> StreamState {
    match how {
        Shutdown::Write => StreamState::LOCAL_SHUTDOWN,
        Shutdown::Read => StreamState::REMOTE_SHUTDOWN,
        Shutdown::Both => StreamState::CLOSED,
    }
}
