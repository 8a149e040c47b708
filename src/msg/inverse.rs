use crate::error::{Error, Result};
use crate::io::StreamState;
use crate::msg::{MsgStream, MsgStreamRef};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type PreRead = JoinHandle<Result<Option<Bytes>>>;

struct RecvCursor {
    index: usize,
    primed: bool,
    eof: bool,
    // One outstanding receive per member while pre-reading. A slot keeps its
    // handle until the result is consumed, so a cancelled `recv` loses
    // nothing.
    pending: Vec<Option<PreRead>>,
}

/// Stripes one logical message stream over several transports.
///
/// Messages are sent round-robin over the send members and consumed
/// round-robin from the receive members, so a peer doing the same over the
/// same links in the same order sees the original sequence.
pub struct InverseMux {
    label: &'static str,
    send: Arc<[MsgStreamRef]>,
    recv: Arc<[MsgStreamRef]>,
    cursor: AtomicUsize,
    reader: Mutex<RecvCursor>,
    pre_read: bool,
}

impl InverseMux {
    pub fn new(send: Vec<MsgStreamRef>, recv: Vec<MsgStreamRef>) -> Result<Self> {
        if send.is_empty() {
            return Err(Error::invalid("inverse mux needs at least one send member"));
        }
        if recv.is_empty() {
            return Err(Error::invalid("inverse mux needs at least one receive member"));
        }
        Ok(Self::from_parts("inverse-mux", send.into(), recv.into()))
    }

    fn from_parts(
        label: &'static str,
        send: Arc<[MsgStreamRef]>,
        recv: Arc<[MsgStreamRef]>,
    ) -> Self {
        let slots = recv.len();
        Self {
            label,
            send,
            recv,
            cursor: AtomicUsize::new(0),
            reader: Mutex::new(RecvCursor {
                index: 0,
                primed: false,
                eof: false,
                pending: (0..slots).map(|_| None).collect(),
            }),
            pre_read: false,
        }
    }

    /// Keep one receive outstanding on every member so that a slow link does
    /// not delay the others.
    pub fn pre_read(mut self, enabled: bool) -> Self {
        self.pre_read = enabled;
        self
    }

    pub fn send_members(&self) -> &[MsgStreamRef] {
        &self.send
    }

    pub fn recv_members(&self) -> &[MsgStreamRef] {
        &self.recv
    }

    fn next_send(&self) -> usize {
        let n = self.send.len();
        match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % n))
        {
            Ok(i) | Err(i) => i,
        }
    }

    /// Every member once, even when it appears in both sets.
    fn members(&self) -> Vec<&MsgStreamRef> {
        let mut seen: Vec<*const ()> = Vec::new();
        let mut out = Vec::new();
        for m in self.send.iter().chain(self.recv.iter()) {
            let ptr = Arc::as_ptr(m) as *const ();
            if !seen.contains(&ptr) {
                seen.push(ptr);
                out.push(m);
            }
        }
        out
    }
}

fn spawn_pre_read(member: &MsgStreamRef) -> PreRead {
    let member = member.clone();
    tokio::spawn(async move { member.recv().await })
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
}

#[async_trait]
impl MsgStream for InverseMux {
    fn state(&self) -> StreamState {
        StreamState::most_closed(self.members().into_iter().map(|m| m.state()))
    }

    async fn send(&self, msg: Bytes) -> Result<()> {
        let i = self.next_send();
        trace!("{}: send {} bytes via member {}", self.label, msg.len(), i);
        self.send[i].send(msg).await
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        let mut cursor = self
            .reader
            .try_lock()
            .map_err(|_| Error::protocol(format!("{}: concurrent receive", self.label)))?;
        if cursor.eof {
            return Ok(None);
        }
        if self.pre_read && !cursor.primed {
            for (slot, member) in cursor.pending.iter_mut().zip(self.recv.iter()) {
                *slot = Some(spawn_pre_read(member));
            }
            cursor.primed = true;
        }

        let i = cursor.index;
        let result = match cursor.pending[i].as_mut() {
            Some(handle) => match handle.await {
                Ok(r) => r,
                Err(e) => Err(Error::Io(io::Error::other(e))),
            },
            None => self.recv[i].recv().await,
        };
        cursor.pending[i] = None;

        match &result {
            Ok(Some(_)) => {
                if self.pre_read {
                    cursor.pending[i] = Some(spawn_pre_read(&self.recv[i]));
                }
                cursor.index = (i + 1) % self.recv.len();
            }
            Ok(None) => {
                debug!("{}: member {} finished, ending stream", self.label, i);
                cursor.eof = true;
            }
            Err(_) => {}
        }
        result
    }

    async fn shutdown(&self) -> Result<()> {
        first_error(join_all(self.send.iter().map(|m| m.shutdown())).await)
    }

    async fn close(&self) -> Result<()> {
        let results = join_all(self.members().into_iter().map(|m| m.close())).await;
        if let Ok(mut cursor) = self.reader.try_lock() {
            for handle in cursor.pending.iter_mut().filter_map(Option::take) {
                handle.abort();
            }
        }
        first_error(results)
    }
}

impl Drop for InverseMux {
    fn drop(&mut self) {
        for handle in self.reader.get_mut().pending.iter().flatten() {
            handle.abort();
        }
    }
}

/// Round-robin over a single shared set of bidirectional members.
pub struct AllToOne {
    inner: InverseMux,
}

impl AllToOne {
    pub fn new(members: Vec<MsgStreamRef>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::invalid("all-to-one needs at least one member"));
        }
        let members: Arc<[MsgStreamRef]> = members.into();
        Ok(Self {
            inner: InverseMux::from_parts("all-to-one", members.clone(), members),
        })
    }

    pub fn pre_read(self, enabled: bool) -> Self {
        Self {
            inner: self.inner.pre_read(enabled),
        }
    }

    pub fn members(&self) -> &[MsgStreamRef] {
        self.inner.send_members()
    }
}

#[async_trait]
impl MsgStream for AllToOne {
    fn state(&self) -> StreamState {
        self.inner.state()
    }
    async fn send(&self, msg: Bytes) -> Result<()> {
        self.inner.send(msg).await
    }
    async fn recv(&self) -> Result<Option<Bytes>> {
        self.inner.recv().await
    }
    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
