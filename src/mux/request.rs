use crate::error::{Error, Result};
use crate::msg::MsgStream;
use crate::mux::{Channel, Multiplexer};
use bytes::Bytes;

/// A channel opened by [`Multiplexer::request`]. Dropping it (or calling
/// [`finish`](Self::finish)) closes the channel unless it was taken with
/// [`keep_open`](Self::keep_open).
#[must_use = "the request channel closes when this is dropped"]
pub struct RequestResult {
    channel: Channel,
}

impl RequestResult {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Next reply message; `None` once the responder is done.
    pub async fn recv(&self) -> Result<Option<Bytes>> {
        self.channel.recv().await
    }

    /// A reply that must be there: EOF instead is a protocol EOF.
    pub async fn recv_reply(&self) -> Result<Bytes> {
        self.channel
            .recv()
            .await?
            .ok_or(Error::UnexpectedEof("reply"))
    }

    pub fn keep_open(self) -> Channel {
        self.channel
    }

    pub async fn finish(self) -> Result<()> {
        self.channel.close().await
    }
}

impl Multiplexer {
    /// Opens a channel and sends `msg` on it; the caller reads the replies.
    pub async fn request(&self, msg: Bytes) -> Result<RequestResult> {
        let channel = self.create_channel()?;
        channel.send(msg).await?;
        Ok(RequestResult { channel })
    }

    /// One message out, exactly one reply back, channel closed.
    pub async fn request_and_get_reply(&self, msg: Bytes) -> Result<Bytes> {
        let request = self.request(msg).await?;
        request.channel().shutdown().await?;
        let reply = request.recv_reply().await;
        request.finish().await?;
        reply
    }
}
