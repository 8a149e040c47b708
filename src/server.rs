use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::{
    config::{Config, Mode},
    io::{ByteStreamRef, SocketOptions, SocketStream, TwoWayCopier},
    msg::{FramedMsgStream, MsgByteStream, MsgStream, MsgStreamRef},
    mux::{Channel, Multiplexer},
    tunnel::{self, LinkHeader, REPLY_ERR, REPLY_OK, SessionAssembler, TunnelOptions},
};

const LINK_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_PRUNE_INTERVAL: Duration = Duration::from_secs(5);

/// The relay binary: accepts TCP connections and forwards them directly or
/// through a multiplexed tunnel, depending on [`Mode`].
pub struct RelayServer {
    config: Config,
    socket: SocketOptions,
    tunnel: TunnelOptions,
    // Tunnel client only: the current tunnel, rebuilt after it fails.
    current_tunnel: Mutex<Option<Arc<Multiplexer>>>,
}

impl RelayServer {
    pub async fn from_config_file(config_path: &str) -> Result<Self> {
        // easy_error errors are not Sync, so they cannot go through `?`.
        let cfg = Config::load(config_path)
            .await
            .map_err(|e| anyhow!("load {}: {}", config_path, e))?;
        Ok(Self::new(cfg))
    }

    pub fn new(config: Config) -> Self {
        let socket = config.socket.options();
        let tunnel = TunnelOptions {
            links: config.links,
            socket: socket.clone(),
            mux: config.mux.mux_config(),
            link_message_size: config.mux.link_message_size(),
            pre_read: config.mux.pre_read,
        };
        Self {
            config,
            socket,
            tunnel,
            current_tunnel: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .with_context(|| format!("bind {}", self.config.listen))?;
        info!(
            "{:?} relay listening on {}",
            self.config.mode,
            listener.local_addr()?
        );
        #[cfg(target_os = "linux")]
        spawn_diagnostics()?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let server = Arc::new(self);
        match server.config.mode {
            Mode::Direct | Mode::TunnelClient => server.serve_clients(listener).await,
            Mode::TunnelServer => server.serve_links(listener).await,
        }
    }

    fn target(&self) -> Result<String> {
        self.config
            .target
            .clone()
            .ok_or_else(|| anyhow!("no target configured"))
    }

    async fn serve_clients(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let target = self.target()?;
        loop {
            let (client, peer) = listener.accept().await.context("accept")?;
            let server = self.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let label = format!("{} -> {}", peer, target);
                let result = match server.config.mode {
                    Mode::TunnelClient => server.relay_tunneled(&label, client, &target).await,
                    _ => server.relay_direct(&label, client, &target).await,
                };
                if let Err(e) = result {
                    warn!("{}: {:#}", label, e);
                }
            });
        }
    }

    async fn relay_direct(&self, label: &str, client: TcpStream, target: &str) -> Result<()> {
        let client = Arc::new(SocketStream::from_tokio(client, &self.socket)?);
        let remote = TcpStream::connect(target)
            .await
            .with_context(|| format!("connect {}", target))?;
        let remote = Arc::new(SocketStream::from_tokio(remote, &self.socket)?);
        self.pump(label, client, remote).await
    }

    async fn relay_tunneled(&self, label: &str, client: TcpStream, target: &str) -> Result<()> {
        let client = Arc::new(SocketStream::from_tokio(client, &self.socket)?);
        let mux = self.tunnel().await?;
        let request = mux.request(Bytes::copy_from_slice(target.as_bytes())).await?;
        let reply = request.recv_reply().await?;
        if reply != REPLY_OK {
            let reason = reply.strip_prefix(REPLY_ERR).unwrap_or(&reply[..]);
            return Err(anyhow!(
                "tunnel server refused: {}",
                String::from_utf8_lossy(reason)
            ));
        }
        let channel = request.keep_open();
        debug!("{}: tunneled on channel {}", label, channel.id());
        let remote = channel_stream(channel);
        self.pump(label, client, remote).await
    }

    /// The live tunnel, dialing a new one if there is none.
    async fn tunnel(&self) -> Result<Arc<Multiplexer>> {
        let mut current = self.current_tunnel.lock().await;
        if let Some(mux) = current.as_ref() {
            if !mux.is_closed() {
                return Ok(mux.clone());
            }
        }
        let server = self
            .config
            .server
            .as_deref()
            .ok_or_else(|| anyhow!("no tunnel server configured"))?;
        let mux = tunnel::connect(server, &self.tunnel)
            .await
            .with_context(|| format!("connect tunnel {}", server))?;
        let mux = Arc::new(mux);
        info!("tunnel to {} established with {} links", server, self.tunnel.links);
        if let Some(interval) = self.config.mux.ping_interval() {
            tokio::spawn(keepalive(mux.clone(), interval, self.config.timeouts.ping()));
        }
        *current = Some(mux.clone());
        Ok(mux)
    }

    async fn serve_links(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let sessions = Arc::new(Mutex::new(SessionAssembler::new(SESSION_ASSEMBLY_TIMEOUT)));
        let mut prune = tokio::time::interval(SESSION_PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let (link, peer) = tokio::select! {
                accepted = listener.accept() => accepted.context("accept")?,
                _ = prune.tick() => {
                    let dropped = sessions.lock().await.prune();
                    if dropped > 0 {
                        debug!("dropped {} incomplete tunnel sessions", dropped);
                    }
                    continue;
                }
            };
            let server = self.clone();
            let sessions = sessions.clone();
            tokio::spawn(async move {
                if let Err(e) = server.admit_link(link, sessions).await {
                    warn!("{}: link rejected: {:#}", peer, e);
                }
            });
        }
    }

    async fn admit_link(
        self: Arc<Self>,
        link: TcpStream,
        sessions: Arc<Mutex<SessionAssembler>>,
    ) -> Result<()> {
        let stream = Arc::new(SocketStream::from_tokio(link, &self.socket)?);
        let header = tokio::time::timeout(
            LINK_HANDSHAKE_TIMEOUT,
            LinkHeader::read_from(stream.as_ref()),
        )
        .await
        .map_err(|_| anyhow!("link header timed out"))??;
        trace!("link {:?}", header);
        let member: MsgStreamRef = Arc::new(
            FramedMsgStream::new(stream).max_message_size(self.tunnel.link_message_size),
        );
        let Some(links) = sessions.lock().await.add(header, member)? else {
            return Ok(());
        };
        info!(
            "tunnel session {:08x} up with {} links",
            header.session,
            links.len()
        );
        let mux = tunnel::accept(links, &self.tunnel)?;
        while let Some(channel) = mux.accept().await {
            let server = self.clone();
            tokio::spawn(async move {
                let id = channel.id();
                if let Err(e) = server.serve_channel(channel).await {
                    warn!("channel {}: {:#}", id, e);
                }
            });
        }
        info!("tunnel session {:08x} closed", header.session);
        Ok(())
    }

    async fn serve_channel(&self, channel: Channel) -> Result<()> {
        let target = channel
            .recv()
            .await?
            .ok_or_else(|| anyhow!("channel {} ended before its request", channel.id()))?;
        let target = String::from_utf8(target.to_vec()).context("target is not utf8")?;
        let remote = match TcpStream::connect(&target).await {
            Ok(remote) => remote,
            Err(e) => {
                let mut reply = REPLY_ERR.to_vec();
                reply.extend_from_slice(e.to_string().as_bytes());
                channel.reply(reply.into()).await?;
                return Err(anyhow!(e).context(format!("connect {}", target)));
            }
        };
        channel.send(Bytes::from_static(REPLY_OK)).await?;
        let remote = Arc::new(SocketStream::from_tokio(remote, &self.socket)?);
        let label = format!("channel {} -> {}", channel.id(), target);
        let local = channel_stream(channel);
        self.pump(&label, local, remote).await
    }

    async fn pump(&self, label: &str, a: ByteStreamRef, b: ByteStreamRef) -> Result<()> {
        let timeouts = &self.config.timeouts;
        let mut copier = TwoWayCopier::new(a, b)
            .label(label)
            .half_close_timeout(timeouts.half_close())
            .half_close_jitter(timeouts.half_close_jitter());
        if let Some(idle) = timeouts.idle() {
            copier = copier.idle_timeout(idle);
        }
        let stats = copier.run().await?;
        debug!(
            "{}: finished, {} bytes out, {} bytes back{}",
            label,
            stats.a_to_b,
            stats.b_to_a,
            stats
                .forced
                .map(|r| format!(" ({:?})", r))
                .unwrap_or_default()
        );
        Ok(())
    }
}

fn channel_stream(channel: Channel) -> ByteStreamRef {
    let max = channel.max_message_size();
    Arc::new(MsgByteStream::new(Arc::new(channel)).max_chunk(max))
}

async fn keepalive(mux: Arc<Multiplexer>, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = mux.closed() => break,
        }
        match mux.ping(timeout).await {
            Ok(rtt) => trace!("tunnel ping: {:?}", rtt),
            Err(e) => {
                warn!("tunnel keepalive failed: {}", e);
                if let Err(e) = mux.close().await {
                    debug!("closing tunnel: {}", e);
                }
                break;
            }
        }
    }
}

/// JSON snapshot of the process-wide epoll reactors.
#[cfg(target_os = "linux")]
pub fn epoller_snapshot_json() -> Result<String> {
    let reactors = crate::io::Reactors::global()?;
    Ok(serde_json::to_string(&reactors.snapshot())?)
}

#[cfg(target_os = "linux")]
fn spawn_diagnostics() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut usr1 = signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            match epoller_snapshot_json() {
                Ok(json) => info!("epoller snapshot: {}", json),
                Err(e) => warn!("epoller snapshot failed: {}", e),
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn test_construction_from_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!("redmux-test-{}.yaml", std::process::id()));
        tokio::fs::write(
            &path,
            "mode: tunnelClient\nlisten: \"127.0.0.1:0\"\ntarget: \"a:1\"\nserver: \"b:2\"\nlinks: 2\nmux:\n  maxMessageSize: 1000\n",
        )
        .await?;
        let server = RelayServer::from_config_file(path.to_str().unwrap()).await;
        tokio::fs::remove_file(&path).await?;
        let server = server?;
        assert_eq!(server.config().mode, Mode::TunnelClient);
        assert_eq!(server.tunnel.links, 2);
        assert_eq!(server.tunnel.link_message_size, 1005);
        Ok(())
    }

    #[test(tokio::test)]
    async fn test_missing_file() {
        let err = RelayServer::from_config_file("/nonexistent/redmux.yaml")
            .await
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("/nonexistent/redmux.yaml"));
    }

    #[test(tokio::test)]
    async fn test_invalid_config_reported() -> Result<()> {
        let path = std::env::temp_dir().join(format!("redmux-bad-{}.yaml", std::process::id()));
        tokio::fs::write(&path, "mode: direct\nlisten: \"127.0.0.1:0\"\n").await?;
        let result = RelayServer::from_config_file(path.to_str().unwrap()).await;
        tokio::fs::remove_file(&path).await?;
        let err = result.err().unwrap();
        assert!(format!("{:#}", err).starts_with("load "));
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_snapshot_json() {
        let json = epoller_snapshot_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["name"], "global-read");
        assert_eq!(parsed[1]["name"], "global-write");
    }
}
