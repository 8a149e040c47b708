use crate::error::{Error, Result};
use crate::io::{ByteStream, StreamState};
use crate::msg::{DEFAULT_MAX_MESSAGE_SIZE, MsgStreamRef};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::net::Shutdown;
use tokio::sync::Mutex;

/// Byte-stream view of a message transport: writes are split into messages
/// of at most `max_chunk` bytes, reads drain one message at a time.
pub struct MsgByteStream {
    inner: MsgStreamRef,
    max_chunk: usize,
    leftover: Mutex<Bytes>,
    writer: Mutex<()>,
}

impl MsgByteStream {
    pub fn new(inner: MsgStreamRef) -> Self {
        Self {
            inner,
            max_chunk: DEFAULT_MAX_MESSAGE_SIZE,
            leftover: Mutex::new(Bytes::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn max_chunk(mut self, size: usize) -> Self {
        self.max_chunk = size.max(1);
        self
    }

    pub fn inner(&self) -> &MsgStreamRef {
        &self.inner
    }
}

#[async_trait]
impl ByteStream for MsgByteStream {
    fn state(&self) -> StreamState {
        self.inner.state()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut leftover = self
            .leftover
            .try_lock()
            .map_err(|_| Error::protocol("concurrent read"))?;
        if buf.is_empty() {
            return Ok(0);
        }
        // Empty messages carry nothing for a byte stream.
        while leftover.is_empty() {
            match self.inner.recv().await? {
                Some(msg) => *leftover = msg,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(leftover.len());
        buf[..n].copy_from_slice(&leftover[..n]);
        leftover.advance(n);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        let _guard = self
            .writer
            .try_lock()
            .map_err(|_| Error::protocol("concurrent write"))?;
        for chunk in buf.chunks(self.max_chunk) {
            self.inner.send(Bytes::copy_from_slice(chunk)).await?;
        }
        Ok(())
    }

    async fn shutdown(&self, how: Shutdown) -> Result<()> {
        match how {
            Shutdown::Read => Ok(()),
            Shutdown::Write | Shutdown::Both => self.inner.shutdown().await,
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{MsgStream, msg_pair};
    use std::sync::Arc;
    use test_log::test;

    #[test(tokio::test)]
    async fn test_chunked_writes_and_partial_reads() {
        let (a, b) = msg_pair(16);
        let a = MsgByteStream::new(Arc::new(a)).max_chunk(4);
        let b = Arc::new(b);
        a.write(b"0123456789").await.unwrap();
        a.shutdown(Shutdown::Write).await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap(), &b"0123"[..]);
        let reader = MsgByteStream::new(b.clone());
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"456");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"7");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[test(tokio::test)]
    async fn test_skips_empty_messages() {
        let (a, b) = msg_pair(16);
        a.send(Bytes::new()).await.unwrap();
        a.send(Bytes::from_static(b"x")).await.unwrap();
        let reader = MsgByteStream::new(Arc::new(b));
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 1);
    }
}
