use crate::error::{Error, Result};
use crate::io::{ByteStreamRef, StreamState};
use crate::msg::MsgStream;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::Shutdown;
use tokio::sync::Mutex;
use tracing::trace;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;

/// Messages over a byte stream, each prefixed with its length as a big-endian
/// `u32`.
pub struct FramedMsgStream {
    inner: ByteStreamRef,
    max_message_size: usize,
    sender: Mutex<()>,
    receiver: Mutex<()>,
}

impl FramedMsgStream {
    pub fn new(inner: ByteStreamRef) -> Self {
        Self {
            inner,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            sender: Mutex::new(()),
            receiver: Mutex::new(()),
        }
    }

    /// Larger messages are refused on send and treated as a protocol
    /// violation on receive.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn inner(&self) -> &ByteStreamRef {
        &self.inner
    }
}

#[async_trait]
impl MsgStream for FramedMsgStream {
    fn state(&self) -> StreamState {
        self.inner.state()
    }

    async fn send(&self, msg: Bytes) -> Result<()> {
        if msg.len() > self.max_message_size {
            return Err(Error::invalid(format!(
                "message of {} bytes exceeds limit of {}",
                msg.len(),
                self.max_message_size
            )));
        }
        let mut buf = BytesMut::with_capacity(LEN_PREFIX + msg.len());
        buf.put_u32(msg.len() as u32);
        buf.put_slice(&msg);
        let _guard = self.sender.lock().await;
        self.inner.write(&buf).await
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        let _guard = self
            .receiver
            .try_lock()
            .map_err(|_| Error::protocol("concurrent message receive"))?;

        let mut header = [0u8; LEN_PREFIX];
        let mut got = 0;
        while got < LEN_PREFIX {
            match self.inner.read(&mut header[got..]).await? {
                0 if got == 0 => return Ok(None),
                0 => return Err(Error::UnexpectedEof("message header")),
                n => got += n,
            }
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_message_size {
            return Err(Error::protocol(format!(
                "incoming message of {} bytes exceeds limit of {}",
                len, self.max_message_size
            )));
        }
        let mut body = vec![0u8; len];
        self.inner.read_full(&mut body).await.map_err(|e| match e {
            Error::UnexpectedEof(_) => Error::UnexpectedEof("message body"),
            e => e,
        })?;
        trace!("received framed message of {} bytes", len);
        Ok(Some(body.into()))
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown(Shutdown::Write).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
