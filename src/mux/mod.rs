//! Logical channel multiplexer.
//!
//! Runs any number of independent [`Channel`]s over one message transport.
//! Every transport message is one [`Frame`] tagged with a channel id. Both
//! sides open channels without coordination: the initiator allocates odd ids,
//! the acceptor even ones, and id 0 carries ping traffic.
//!
//! Closing is a two-step handshake: the side that disposes a channel sends
//! CLOSE and keeps the id reserved until the peer's CLOSE_ACK arrives, so a
//! recycled id can never collect frames meant for its previous owner.
//!
//! Flow control counts messages. Each side may have at most
//! [`MuxConfig::window`] messages outstanding per channel; the receiver hands
//! credit back with WINDOW frames as the application consumes data, so the
//! demultiplexer never waits for a slow channel.

mod channel;
pub mod frame;
mod request;

pub use channel::Channel;
pub use frame::{Frame, Opcode};
pub use request::RequestResult;

use crate::error::{Error, Result};
use crate::msg::MsgStreamRef;
use bytes::Bytes;
use channel::{ChannelCore, Reset};
use frame::CONTROL_CHANNEL;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

pub const DEFAULT_WINDOW: u32 = 64;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Which end of the transport this side is; decides the id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        }
    }

    /// True when `id` comes from this side's id space.
    pub fn owns(self, id: u32) -> bool {
        id != CONTROL_CHANNEL && (id % 2 == 1) == (self == Role::Initiator)
    }
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Messages a sender may have outstanding per channel.
    pub window: u32,
    /// Largest payload of one channel message.
    pub max_message_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

struct ChannelTable {
    open: HashMap<u32, Arc<ChannelCore>>,
    // Disposed here, CLOSE sent, waiting for the peer's CLOSE_ACK.
    closing: HashSet<u32>,
    released: BTreeSet<u32>,
    next_id: u32,
}

impl ChannelTable {
    fn new(role: Role) -> Self {
        Self {
            open: HashMap::new(),
            closing: HashSet::new(),
            released: BTreeSet::new(),
            next_id: role.first_id(),
        }
    }

    fn allocate(&mut self) -> Result<u32> {
        if let Some(id) = self.released.pop_first() {
            return Ok(id);
        }
        let id = self.next_id;
        self.next_id = id
            .checked_add(2)
            .ok_or_else(|| Error::protocol("channel ids exhausted"))?;
        Ok(id)
    }
}

struct Outgoing {
    frame: Frame,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// State shared by the multiplexer handle, its channels and its two tasks.
pub(crate) struct Shared {
    label: String,
    role: Role,
    config: MuxConfig,
    transport: MsgStreamRef,
    table: StdMutex<ChannelTable>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    accepted: StdMutex<Option<mpsc::UnboundedSender<Channel>>>,
    pings: StdMutex<HashMap<u32, oneshot::Sender<()>>>,
    next_nonce: AtomicU32,
    closed: CancellationToken,
    torn_down: AtomicBool,
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Queues a frame for the writer task. Frames leave in queue order.
    fn enqueue(&self, frame: Frame) -> bool {
        self.outbox.send(Outgoing { frame, done: None }).is_ok()
    }

    /// Queues a frame on behalf of a channel, unless the channel is no
    /// longer registered or the peer closed it. Checked and queued under the
    /// table lock, so nothing for the id can follow our CLOSE or CLOSE_ACK.
    fn enqueue_for(&self, core: &Arc<ChannelCore>, frame: Frame) -> bool {
        self.push_for(core, Outgoing { frame, done: None })
    }

    fn push_for(&self, core: &Arc<ChannelCore>, item: Outgoing) -> bool {
        let table = lock(&self.table);
        let live = table.open.get(&core.id).is_some_and(|c| Arc::ptr_eq(c, core));
        if !live || core.is_peer_closed() || self.closed.is_cancelled() {
            trace!("{}: {:?} for gone channel dropped", self.label, item.frame);
            return false;
        }
        self.outbox.send(item).is_ok()
    }

    async fn send_data(&self, core: &Arc<ChannelCore>, msg: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let item = Outgoing {
            frame: Frame::data(core.id, msg),
            done: Some(tx),
        };
        if !self.push_for(core, item) {
            return Err(core.gone_error());
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }

    /// Local side is done with `core`.
    fn dispose(&self, core: &Arc<ChannelCore>) {
        let id = core.id;
        let mut table = lock(&self.table);
        let registered = table.open.get(&id).is_some_and(|c| Arc::ptr_eq(c, core));
        if !registered {
            return;
        }
        table.open.remove(&id);
        if core.is_peer_closed() {
            // Peer already closed and we acknowledged; nothing more can arrive.
            if self.role.owns(id) {
                table.released.insert(id);
            }
            return;
        }
        if self.closed.is_cancelled() {
            return;
        }
        table.closing.insert(id);
        self.enqueue(Frame::close(id));
        trace!("{}: channel {} closing", self.label, id);
    }

    fn teardown(&self, reason: &str) {
        self.closed.cancel();
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("{}: shutting down: {}", self.label, reason);
        lock(&self.accepted).take();
        let cores: Vec<_> = {
            let mut table = lock(&self.table);
            table.closing.clear();
            table.open.drain().map(|(_, core)| core).collect()
        };
        for core in cores {
            core.reset(Reset::TransportLost);
        }
        lock(&self.pings).clear();
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<()> {
        trace!("{}: <- {:?}", self.label, frame);
        let id = frame.channel;
        match frame.op {
            Opcode::Ping => {
                self.enqueue(Frame::pong(frame.nonce()?));
            }
            Opcode::Pong => {
                let nonce = frame.nonce()?;
                match lock(&self.pings).remove(&nonce) {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => debug!("{}: unsolicited pong {}", self.label, nonce),
                }
            }
            op if id == CONTROL_CHANNEL => {
                error!("{}: {:?} frame on the control channel", self.label, op);
            }
            Opcode::Open => self.on_open(id),
            Opcode::Data => self.on_data(id, frame.payload),
            Opcode::Shutdown => {
                let table = lock(&self.table);
                match table.open.get(&id) {
                    Some(core) => core.end_inbound(),
                    None if table.closing.contains(&id) => {}
                    None => debug!("{}: shutdown for unknown channel {}", self.label, id),
                }
            }
            Opcode::Close => self.on_close(id),
            Opcode::CloseAck => {
                let mut table = lock(&self.table);
                if table.closing.remove(&id) {
                    if self.role.owns(id) {
                        table.released.insert(id);
                    }
                    trace!("{}: channel {} released", self.label, id);
                } else {
                    debug!("{}: close ack for channel {} not closing", self.label, id);
                }
            }
            Opcode::Window => {
                let credits = frame.credits()?;
                if let Some(core) = lock(&self.table).open.get(&id) {
                    core.add_credits(credits);
                }
            }
        }
        Ok(())
    }

    fn on_open(self: &Arc<Self>, id: u32) {
        if self.role.owns(id) {
            error!("{}: peer opened channel {} from our id space", self.label, id);
            return;
        }
        let mut table = lock(&self.table);
        if table.closing.contains(&id) {
            error!("{}: peer reopened channel {} before acking close", self.label, id);
            return;
        }
        if let Some(existing) = table.open.remove(&id) {
            error!("{}: peer reopened live channel {}", self.label, id);
            existing.reset(Reset::DuplicateOpen);
            table.closing.insert(id);
            self.enqueue(Frame::close(id));
            return;
        }
        let Some(accepted) = lock(&self.accepted).clone() else {
            return;
        };
        let (core, inbox) = ChannelCore::new(id, self.config.window);
        table.open.insert(id, core.clone());
        drop(table);
        debug!("{}: remote opened channel {}", self.label, id);
        // If nobody accepts any more, dropping the channel closes it.
        let _ = accepted.send(Channel::new(core, self.clone(), inbox));
    }

    fn on_data(&self, id: u32, payload: Bytes) {
        let mut table = lock(&self.table);
        let Some(core) = table.open.get(&id) else {
            if !table.closing.contains(&id) {
                debug!("{}: data for unknown channel {}", self.label, id);
            }
            return;
        };
        if core.deliver(payload, self.config.window) {
            return;
        }
        error!("{}: channel {} exceeded its window, aborting it", self.label, id);
        if let Some(core) = table.open.remove(&id) {
            core.reset(Reset::Overrun);
        }
        table.closing.insert(id);
        self.enqueue(Frame::close(id));
    }

    fn on_close(&self, id: u32) {
        let mut table = lock(&self.table);
        if table.closing.contains(&id) {
            trace!("{}: simultaneous close of channel {}", self.label, id);
        } else if let Some(core) = table.open.get(&id).cloned() {
            core.peer_close();
            // A peer id may be reused by the peer as soon as our ack lands;
            // our own ids stay reserved until the local handle is disposed.
            if !self.role.owns(id) {
                table.open.remove(&id);
            }
        } else {
            debug!("{}: close for unknown channel {}", self.label, id);
        }
        // Still under the table lock: the channel is already marked gone, so
        // no frame for it can be queued behind the ack.
        self.enqueue(Frame::close_ack(id));
    }
}

async fn run_reader(shared: Arc<Shared>) {
    let reason = loop {
        let msg = tokio::select! {
            msg = shared.transport.recv() => msg,
            _ = shared.closed.cancelled() => break "closed locally".to_string(),
        };
        let frame = match msg {
            Ok(Some(msg)) => Frame::decode(msg),
            Ok(None) => break "transport eof".to_string(),
            Err(e) => {
                if !shared.closed.is_cancelled() {
                    warn!("{}: transport receive failed: {}", shared.label, e);
                }
                break format!("transport error: {}", e);
            }
        };
        if let Err(e) = frame.and_then(|f| shared.dispatch(f)) {
            error!("{}: {}", shared.label, e);
            break e.to_string();
        }
    };
    shared.teardown(&reason);
    if let Err(e) = shared.transport.close().await {
        trace!("{}: closing transport: {}", shared.label, e);
    }
}

async fn run_writer(shared: Arc<Shared>, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
    loop {
        // Drain what is already queued before honouring a close.
        let item = tokio::select! {
            biased;
            item = outgoing.recv() => item,
            _ = shared.closed.cancelled() => None,
        };
        let Some(Outgoing { frame, done }) = item else {
            break;
        };
        trace!("{}: -> {:?}", shared.label, frame);
        match shared.transport.send(frame.encode()).await {
            Ok(()) => {
                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                if !shared.closed.is_cancelled() {
                    warn!("{}: transport send failed: {}", shared.label, e);
                }
                if let Some(done) = done {
                    let _ = done.send(Err(e));
                }
                shared.teardown("transport send failed");
                break;
            }
        }
    }
}

/// Many logical [`Channel`]s over one message transport.
///
/// Dropping the multiplexer tears it down and aborts every channel.
pub struct Multiplexer {
    shared: Arc<Shared>,
    accepted: Mutex<mpsc::UnboundedReceiver<Channel>>,
}

impl Multiplexer {
    /// Starts the reader and writer tasks; needs a tokio runtime.
    pub fn new(transport: MsgStreamRef, role: Role, config: MuxConfig) -> Self {
        let (outbox, outgoing) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let label = match role {
            Role::Initiator => "mux-initiator",
            Role::Acceptor => "mux-acceptor",
        };
        let shared = Arc::new(Shared {
            label: label.to_string(),
            role,
            table: StdMutex::new(ChannelTable::new(role)),
            config,
            transport,
            outbox,
            accepted: StdMutex::new(Some(accept_tx)),
            pings: StdMutex::new(HashMap::new()),
            next_nonce: AtomicU32::new(1),
            closed: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        });
        tokio::spawn(run_writer(shared.clone(), outgoing));
        tokio::spawn(run_reader(shared.clone()));
        Self {
            shared,
            accepted: Mutex::new(accept_rx),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    /// Opens a channel with a fresh id.
    pub fn create_channel(&self) -> Result<Channel> {
        let shared = &self.shared;
        let mut table = lock(&shared.table);
        if shared.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        let id = table.allocate()?;
        let (core, inbox) = ChannelCore::new(id, shared.config.window);
        table.open.insert(id, core.clone());
        shared.enqueue(Frame::open(id));
        drop(table);
        debug!("{}: opened channel {}", shared.label, id);
        Ok(Channel::new(core, shared.clone(), inbox))
    }

    /// Next channel opened by the peer; `None` once the multiplexer is down.
    pub async fn accept(&self) -> Option<Channel> {
        self.accepted.lock().await.recv().await
    }

    /// Round trip of one PING.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration> {
        let shared = &self.shared;
        let nonce = shared.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&shared.pings).insert(nonce, tx);
        if shared.closed.is_cancelled() || !shared.enqueue(Frame::ping(nonce)) {
            lock(&shared.pings).remove(&nonce);
            return Err(Error::Closed);
        }
        let started = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                lock(&shared.pings).remove(&nonce);
                Err(Error::Timeout("pong"))
            }
        }
    }

    /// Channels currently registered, including remotely closed ones whose
    /// local handle is still alive.
    pub fn channel_count(&self) -> usize {
        lock(&self.shared.table).open.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the multiplexer has shut down.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub async fn close(&self) -> Result<()> {
        self.shared.teardown("closed locally");
        self.shared.transport.close().await
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.teardown("multiplexer dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_spaces() {
        assert!(Role::Initiator.owns(1));
        assert!(Role::Initiator.owns(7));
        assert!(!Role::Initiator.owns(2));
        assert!(Role::Acceptor.owns(2));
        assert!(!Role::Acceptor.owns(3));
        assert!(!Role::Acceptor.owns(CONTROL_CHANNEL));
        assert!(!Role::Initiator.owns(CONTROL_CHANNEL));
    }

    #[test]
    fn test_released_ids_recycled_lowest_first() {
        let mut table = ChannelTable::new(Role::Acceptor);
        let ids: Vec<u32> = (0..4).map(|_| table.allocate().unwrap()).collect();
        assert_eq!(ids, vec![2, 4, 6, 8]);
        table.released.insert(6);
        table.released.insert(4);
        assert_eq!(table.allocate().unwrap(), 4);
        assert_eq!(table.allocate().unwrap(), 6);
        assert_eq!(table.allocate().unwrap(), 10);
    }

    #[test]
    fn test_id_exhaustion() {
        let mut table = ChannelTable::new(Role::Initiator);
        table.next_id = u32::MAX;
        assert!(table.allocate().is_err());
    }
}
