//! Tunnel links: several TCP connections, each introduced by a
//! [`LinkHeader`], combined with [`AllToOne`] into the transport of one
//! [`Multiplexer`].

use crate::error::{Error, Result};
use crate::io::{ByteStream, SocketOptions, SocketStream};
use crate::msg::{AllToOne, FramedMsgStream, MsgStreamRef};
use crate::mux::{MuxConfig, Multiplexer, Role};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub const LINK_MAGIC: [u8; 4] = *b"RMUX";
pub const LINK_HEADER_LEN: usize = 10;

/// Reply to a tunnel request when the target was reached.
pub const REPLY_OK: &[u8] = b"OK";
/// Prefix of a failure reply; the reason follows.
pub const REPLY_ERR: &[u8] = b"ERR ";

/// First bytes on every link: `"RMUX" | session u32 BE | index u8 | count u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHeader {
    pub session: u32,
    pub index: u8,
    pub count: u8,
}

impl LinkHeader {
    pub fn encode(&self) -> [u8; LINK_HEADER_LEN] {
        let mut buf = [0u8; LINK_HEADER_LEN];
        buf[..4].copy_from_slice(&LINK_MAGIC);
        buf[4..8].copy_from_slice(&self.session.to_be_bytes());
        buf[8] = self.index;
        buf[9] = self.count;
        buf
    }

    pub fn decode(buf: &[u8; LINK_HEADER_LEN]) -> Result<Self> {
        if buf[..4] != LINK_MAGIC {
            return Err(Error::protocol("bad link magic"));
        }
        let header = Self {
            session: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            index: buf[8],
            count: buf[9],
        };
        if header.count == 0 || header.index >= header.count {
            return Err(Error::protocol(format!(
                "bad link index {}/{}",
                header.index, header.count
            )));
        }
        Ok(header)
    }

    pub async fn read_from(stream: &dyn ByteStream) -> Result<Self> {
        let mut buf = [0u8; LINK_HEADER_LEN];
        stream.read_full(&mut buf).await.map_err(|e| match e {
            Error::UnexpectedEof(_) => Error::UnexpectedEof("link header"),
            e => e,
        })?;
        Self::decode(&buf)
    }

    pub async fn write_to(&self, stream: &dyn ByteStream) -> Result<()> {
        stream.write(&self.encode()).await
    }
}

/// Everything needed to turn links into a multiplexer.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub links: u8,
    pub socket: SocketOptions,
    pub mux: MuxConfig,
    /// Limit of one link message (a mux frame).
    pub link_message_size: usize,
    pub pre_read: bool,
}

fn assemble(members: Vec<MsgStreamRef>, role: Role, opts: &TunnelOptions) -> Result<Multiplexer> {
    let transport = AllToOne::new(members)?.pre_read(opts.pre_read);
    Ok(Multiplexer::new(Arc::new(transport), role, opts.mux.clone()))
}

/// Dials `opts.links` links to `server` and starts the initiating side.
pub async fn connect(server: &str, opts: &TunnelOptions) -> Result<Multiplexer> {
    let session: u32 = rand::random();
    let mut members: Vec<MsgStreamRef> = Vec::with_capacity(opts.links as usize);
    for index in 0..opts.links {
        let tcp = tokio::net::TcpStream::connect(server).await?;
        let stream = Arc::new(SocketStream::from_tokio(tcp, &opts.socket)?);
        LinkHeader {
            session,
            index,
            count: opts.links,
        }
        .write_to(stream.as_ref())
        .await?;
        members.push(Arc::new(
            FramedMsgStream::new(stream).max_message_size(opts.link_message_size),
        ));
    }
    debug!("tunnel session {:08x}: {} links up", session, opts.links);
    assemble(members, Role::Initiator, opts)
}

/// Starts the accepting side over a complete, ordered set of links.
pub fn accept(members: Vec<MsgStreamRef>, opts: &TunnelOptions) -> Result<Multiplexer> {
    assemble(members, Role::Acceptor, opts)
}

struct PendingSession {
    count: u8,
    links: Vec<Option<MsgStreamRef>>,
    started: Instant,
}

/// Groups incoming links by session until every index has arrived.
pub struct SessionAssembler {
    pending: HashMap<u32, PendingSession>,
    max_age: Duration,
}

impl SessionAssembler {
    /// Incomplete sessions older than `max_age` are dropped.
    pub fn new(max_age: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            max_age,
        }
    }

    /// Adds one link; returns the links of the session in index order once
    /// the last one arrived.
    pub fn add(
        &mut self,
        header: LinkHeader,
        link: MsgStreamRef,
    ) -> Result<Option<Vec<MsgStreamRef>>> {
        let _ = self.prune();
        let session = self
            .pending
            .entry(header.session)
            .or_insert_with(|| PendingSession {
                count: header.count,
                links: (0..header.count).map(|_| None).collect(),
                started: Instant::now(),
            });
        if session.count != header.count {
            return Err(Error::protocol(format!(
                "session {:08x}: link count {} disagrees with {}",
                header.session, header.count, session.count
            )));
        }
        let slot = &mut session.links[header.index as usize];
        if slot.is_some() {
            return Err(Error::protocol(format!(
                "session {:08x}: duplicate link {}",
                header.session, header.index
            )));
        }
        *slot = Some(link);
        if session.links.iter().any(Option::is_none) {
            return Ok(None);
        }
        let links = self
            .pending
            .remove(&header.session)
            .map(|s| s.links.into_iter().flatten().collect());
        Ok(links)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drops incomplete sessions older than `max_age`, and their links with
    /// them. Returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        let before = self.pending.len();
        let max_age = self.max_age;
        self.pending.retain(|session, pending| {
            let keep = pending.started.elapsed() < max_age;
            if !keep {
                debug!("session {:08x}: incomplete, dropped", session);
            }
            keep
        });
        before - self.pending.len()
    }
}
