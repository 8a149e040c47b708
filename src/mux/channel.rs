use crate::error::{Error, Result};
use crate::io::{AtomicStreamState, StreamState};
use crate::msg::MsgStream;
use crate::mux::Shared;
use crate::mux::frame::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Why a channel stopped before an orderly close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reset {
    /// The underlying transport ended or failed.
    TransportLost,
    /// The peer sent more messages than it had credits for.
    Overrun,
    /// The peer opened an id that was still live.
    DuplicateOpen,
    /// Closed on this side.
    Local,
}

impl Reset {
    fn to_error(self, id: u32) -> Error {
        match self {
            Reset::TransportLost => Error::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("channel {}: transport lost", id),
            )),
            Reset::Overrun => Error::protocol(format!("channel {}: peer exceeded window", id)),
            Reset::DuplicateOpen => Error::protocol(format!("channel {}: id reused while open", id)),
            Reset::Local => Error::Closed,
        }
    }
}

/// Channel state shared between the user-facing [`Channel`] and the
/// demultiplexer.
pub(crate) struct ChannelCore {
    pub(crate) id: u32,
    inbox: StdMutex<Option<mpsc::UnboundedSender<Bytes>>>,
    // Messages delivered whose credit has not been handed back yet.
    in_flight: AtomicU32,
    // Messages consumed since the last WINDOW frame.
    unacked: AtomicU32,
    credits: Semaphore,
    state: AtomicStreamState,
    reset: OnceLock<Reset>,
    peer_closed: AtomicBool,
    disposed: AtomicBool,
    peer_gone: CancellationToken,
}

impl ChannelCore {
    pub(crate) fn new(id: u32, window: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Arc::new(Self {
            id,
            inbox: StdMutex::new(Some(tx)),
            in_flight: AtomicU32::new(0),
            unacked: AtomicU32::new(0),
            credits: Semaphore::new(window as usize),
            state: AtomicStreamState::new(),
            reset: OnceLock::new(),
            peer_closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            peer_gone: CancellationToken::new(),
        });
        (core, rx)
    }

    /// Queues an incoming message. Returns `false` if the peer overran the
    /// window.
    pub(crate) fn deliver(&self, msg: Bytes, window: u32) -> bool {
        let inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = inbox.as_ref() else {
            trace!("channel {}: data after remote shutdown dropped", self.id);
            return true;
        };
        if self.in_flight.load(Ordering::Acquire) >= window {
            return false;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        // The receiver lives as long as the channel handle; a dropped handle
        // is about to be disposed anyway.
        let _ = tx.send(msg);
        true
    }

    /// The peer will send no more data.
    pub(crate) fn end_inbound(&self) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub(crate) fn peer_close(&self) {
        self.peer_closed.store(true, Ordering::Release);
        self.end_inbound();
        self.peer_gone.cancel();
    }

    pub(crate) fn reset(&self, reason: Reset) {
        let _ = self.reset.set(reason);
        self.end_inbound();
        self.peer_gone.cancel();
    }

    pub(crate) fn add_credits(&self, n: u32) {
        self.credits.add_permits(n as usize);
    }

    pub(crate) fn is_peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::Acquire)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Records one consumed message; returns the credits to hand back once
    /// half the window is used up.
    fn consumed(&self, window: u32) -> Option<u32> {
        let threshold = (window / 2).max(1);
        let unacked = self.unacked.fetch_add(1, Ordering::AcqRel) + 1;
        if unacked < threshold {
            return None;
        }
        let n = self.unacked.swap(0, Ordering::AcqRel);
        self.in_flight.fetch_sub(n, Ordering::AcqRel);
        Some(n)
    }

    pub(crate) fn gone_error(&self) -> Error {
        match self.reset.get() {
            Some(reason) => reason.to_error(self.id),
            None => Error::Closed,
        }
    }
}

/// One logical connection of a [`Multiplexer`](super::Multiplexer).
///
/// Dropping a channel closes it.
pub struct Channel {
    core: Arc<ChannelCore>,
    shared: Arc<Shared>,
    inbox: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl Channel {
    pub(crate) fn new(
        core: Arc<ChannelCore>,
        shared: Arc<Shared>,
        inbox: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            core,
            shared,
            inbox: Mutex::new(inbox),
        }
    }

    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Largest message [`send`](MsgStream::send) accepts.
    pub fn max_message_size(&self) -> usize {
        self.shared.config.max_message_size
    }

    /// Answers a request: sends `msg`, then shuts down the sending side.
    pub async fn reply(&self, msg: Bytes) -> Result<()> {
        self.send(msg).await?;
        self.shutdown().await
    }

    fn dispose(&self) {
        if self.core.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.state.insert(StreamState::CLOSED);
        self.core.reset(Reset::Local);
        self.shared.dispose(&self.core);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.core.id)
            .field("state", &self.core.state.load())
            .finish()
    }
}

#[async_trait]
impl MsgStream for Channel {
    fn state(&self) -> StreamState {
        self.core.state.load()
    }

    async fn send(&self, msg: Bytes) -> Result<()> {
        if self.core.is_disposed() {
            return Err(Error::Closed);
        }
        if !self.core.state.load().can_write() {
            return Err(Error::protocol(format!(
                "channel {}: send after shutdown",
                self.core.id
            )));
        }
        if msg.len() > self.max_message_size() {
            return Err(Error::invalid(format!(
                "message of {} bytes exceeds channel limit of {}",
                msg.len(),
                self.max_message_size()
            )));
        }
        tokio::select! {
            biased;
            _ = self.core.peer_gone.cancelled() => return Err(self.core.gone_error()),
            permit = self.core.credits.acquire() => match permit {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(Error::Closed),
            },
        }
        self.shared.send_data(&self.core, msg).await
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        let mut inbox = self
            .inbox
            .try_lock()
            .map_err(|_| Error::protocol(format!("channel {}: concurrent receive", self.core.id)))?;
        if self.core.is_disposed() {
            return Err(Error::Closed);
        }
        match inbox.recv().await {
            Some(msg) => {
                if let Some(n) = self.core.consumed(self.shared.config.window) {
                    self.shared
                        .enqueue_for(&self.core, Frame::window(self.core.id, n));
                }
                Ok(Some(msg))
            }
            None => {
                self.core.state.insert(StreamState::REMOTE_SHUTDOWN);
                match self.core.reset.get() {
                    Some(reason) => Err(reason.to_error(self.core.id)),
                    None => Ok(None),
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let prev = self.core.state.insert(StreamState::LOCAL_SHUTDOWN);
        if prev.can_write() {
            self.shared
                .enqueue_for(&self.core, Frame::shutdown(self.core.id));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dispose();
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.dispose();
    }
}
