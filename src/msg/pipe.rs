use crate::error::{Error, Result};
use crate::io::{AtomicStreamState, StreamState};
use crate::msg::MsgStream;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// One end of an in-memory message pipe.
pub struct MemMsgStream {
    label: String,
    tx: StdMutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    state: AtomicStreamState,
    closing: CancellationToken,
}

/// Connected pair of in-memory message streams, each direction queueing up
/// to `capacity` messages.
pub fn msg_pair(capacity: usize) -> (MemMsgStream, MemMsgStream) {
    let (tx_a, rx_b) = mpsc::channel(capacity.max(1));
    let (tx_b, rx_a) = mpsc::channel(capacity.max(1));
    (
        MemMsgStream::new("pipe-a", tx_a, rx_a),
        MemMsgStream::new("pipe-b", tx_b, rx_b),
    )
}

impl MemMsgStream {
    fn new(label: &str, tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            label: label.to_string(),
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            state: AtomicStreamState::new(),
            closing: CancellationToken::new(),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MsgStream for MemMsgStream {
    fn state(&self) -> StreamState {
        self.state.load()
    }

    async fn send(&self, msg: Bytes) -> Result<()> {
        if self.closing.is_cancelled() {
            return Err(Error::Closed);
        }
        let Some(tx) = self.sender() else {
            return Err(Error::protocol(format!("{}: send after shutdown", self.label)));
        };
        tokio::select! {
            r = tx.send(msg) => r.map_err(|_| Error::Io(io::Error::from(io::ErrorKind::BrokenPipe))),
            _ = self.closing.cancelled() => Err(Error::Closed),
        }
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        let mut rx = self
            .rx
            .try_lock()
            .map_err(|_| Error::protocol(format!("{}: concurrent receive", self.label)))?;
        if self.closing.is_cancelled() {
            rx.close();
            return Err(Error::Closed);
        }
        let msg = tokio::select! {
            biased;
            _ = self.closing.cancelled() => {
                rx.close();
                return Err(Error::Closed);
            }
            msg = rx.recv() => msg,
        };
        if msg.is_none() {
            self.state.insert(StreamState::REMOTE_SHUTDOWN);
        }
        Ok(msg)
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.insert(StreamState::LOCAL_SHUTDOWN);
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        self.closing.cancel();
        self.state.insert(StreamState::CLOSED);
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        // A receive in flight holds the queue; it closes it on seeing the
        // token.
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
        Ok(())
    }
}
