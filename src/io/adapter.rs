use crate::error::{Error, Result};
use crate::io::stream::shutdown_flags;
use crate::io::{AtomicStreamState, ByteStream, StreamState};
use async_trait::async_trait;
use std::net::Shutdown;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// [`ByteStream`] over any tokio `AsyncRead + AsyncWrite`: TLS streams,
/// in-memory duplex pipes, tokio TCP streams and so on.
pub struct AsyncIoStream<T> {
    label: String,
    reader: Mutex<Option<ReadHalf<T>>>,
    writer: Mutex<Option<WriteHalf<T>>>,
    state: AtomicStreamState,
    closing: CancellationToken,
}

/// Connected in-memory pair, each side buffering up to `capacity` bytes.
pub fn loopback_pair(capacity: usize) -> (AsyncIoStream<DuplexStream>, AsyncIoStream<DuplexStream>) {
    let (a, b) = tokio::io::duplex(capacity);
    (
        AsyncIoStream::new("loopback-a", a),
        AsyncIoStream::new("loopback-b", b),
    )
}

impl<T> AsyncIoStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(label: impl Into<String>, io: T) -> Self {
        let (r, w) = tokio::io::split(io);
        Self {
            label: label.into(),
            reader: Mutex::new(Some(r)),
            writer: Mutex::new(Some(w)),
            state: AtomicStreamState::new(),
            closing: CancellationToken::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[async_trait]
impl<T> ByteStream for AsyncIoStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
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
        if !self.state.load().can_read() {
            return Ok(0);
        }
        let reader = guard.as_mut().ok_or(Error::Closed)?;
        let read = tokio::select! {
            biased;
            _ = self.closing.cancelled() => None,
            r = reader.read(buf) => Some(r),
        };
        let Some(read) = read else {
            // Closed while this read held the half: release it here.
            guard.take();
            return Err(Error::Closed);
        };
        let n = read?;
        if n == 0 && !buf.is_empty() {
            self.state.insert(StreamState::REMOTE_SHUTDOWN);
        }
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self
            .writer
            .try_lock()
            .map_err(|_| Error::protocol(format!("{}: concurrent write", self.label)))?;
        if self.closing.is_cancelled() {
            return Err(Error::Closed);
        }
        if !self.state.load().can_write() {
            return Err(Error::protocol(format!("{}: write after shutdown", self.label)));
        }
        let writer = guard.as_mut().ok_or(Error::Closed)?;
        let written = tokio::select! {
            biased;
            _ = self.closing.cancelled() => None,
            r = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => Some(r),
        };
        match written {
            Some(r) => Ok(r?),
            None => {
                guard.take();
                Err(Error::Closed)
            }
        }
    }

    async fn shutdown(&self, how: Shutdown) -> Result<()> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        let prev = self.state.insert(shutdown_flags(how));
        if matches!(how, Shutdown::Write | Shutdown::Both) && prev.can_write() {
            let mut guard = self.writer.lock().await;
            if let Some(w) = guard.as_mut() {
                w.shutdown().await?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        self.closing.cancel();
        self.state.insert(StreamState::CLOSED);
        // A half held by an in-flight operation is released by that
        // operation once it sees the token.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        tracing::trace!("{}: closed", self.label);
        Ok(())
    }
}
