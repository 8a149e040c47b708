//! Message transports: ordered delivery of discrete messages with
//! independent shutdown of each direction.

mod framed;
mod inverse;
mod pipe;
mod stream;

pub use framed::{DEFAULT_MAX_MESSAGE_SIZE, FramedMsgStream};
pub use inverse::{AllToOne, InverseMux};
pub use pipe::{MemMsgStream, msg_pair};
pub use stream::MsgByteStream;

use crate::error::Result;
use crate::io::StreamState;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// A transport of whole messages.
///
/// `send` may be called from several tasks at once; messages are then
/// serialised in an unspecified order. `recv` is single-flight like
/// [`ByteStream::read`](crate::io::ByteStream::read).
#[async_trait]
pub trait MsgStream: Send + Sync {
    fn state(&self) -> StreamState;

    async fn send(&self, msg: Bytes) -> Result<()>;

    /// Next message, or `None` once the remote side stopped sending.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Stops sending. The peer observes `None` after the last message.
    async fn shutdown(&self) -> Result<()>;

    /// Tears the transport down; idempotent.
    async fn close(&self) -> Result<()>;
}

pub type MsgStreamRef = Arc<dyn MsgStream>;

#[async_trait]
impl<T: MsgStream + ?Sized> MsgStream for Arc<T> {
    fn state(&self) -> StreamState {
        (**self).state()
    }
    async fn send(&self, msg: Bytes) -> Result<()> {
        (**self).send(msg).await
    }
    async fn recv(&self) -> Result<Option<Bytes>> {
        (**self).recv().await
    }
    async fn shutdown(&self) -> Result<()> {
        (**self).shutdown().await
    }
    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}
