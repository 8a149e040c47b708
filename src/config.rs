use easy_error::{Error, ResultExt, bail};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::mux::MuxConfig;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    /// Accept TCP and relay straight to `target`.
    Direct,
    /// Accept TCP and carry each connection as a channel to the tunnel server.
    TunnelClient,
    /// Accept tunnel links and connect the targets their channels ask for.
    TunnelServer,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub mode: Mode,
    pub listen: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default = "default_links")]
    pub links: u8,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub mux: MuxSettings,
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_links() -> u8 {
    1
}

impl Config {
    pub async fn load(path: &str) -> Result<Self, Error> {
        let s = tokio::fs::read(path).await.context("read file")?;
        let s = String::from_utf8(s).context("parse utf8")?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        let cfg: Self = serde_yaml_ng::from_str(s).context("parse yaml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self.mode {
            Mode::Direct if self.target.is_none() => bail!("direct mode needs a target"),
            Mode::TunnelClient if self.target.is_none() => {
                bail!("tunnelClient mode needs a target")
            }
            Mode::TunnelClient if self.server.is_none() => {
                bail!("tunnelClient mode needs a server")
            }
            _ => {}
        }
        if self.links == 0 {
            bail!("links must be at least 1");
        }
        if self.socket.read_ahead_size == 0 {
            bail!("socket.readAheadSize must be positive");
        }
        if self.mux.window == 0 {
            bail!("mux.window must be positive");
        }
        if self.mux.max_message_size == 0 {
            bail!("mux.maxMessageSize must be positive");
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SocketConfig {
    #[cfg(unix)]
    #[serde(default)]
    pub read_strategy: crate::io::ReadStrategy,
    #[serde(default = "default_true")]
    pub read_ahead: bool,
    #[serde(default = "default_read_ahead_size")]
    pub read_ahead_size: usize,
    #[serde(default = "default_true")]
    pub smart_sync_read: bool,
}

fn default_true() -> bool {
    true
}

fn default_read_ahead_size() -> usize {
    256
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            #[cfg(unix)]
            read_strategy: Default::default(),
            read_ahead: true,
            read_ahead_size: default_read_ahead_size(),
            smart_sync_read: true,
        }
    }
}

#[cfg(unix)]
impl SocketConfig {
    pub fn options(&self) -> crate::io::SocketOptions {
        crate::io::SocketOptions::default()
            .read_strategy(self.read_strategy)
            .read_ahead(self.read_ahead, self.read_ahead_size)
            .smart_sync_read(self.smart_sync_read)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MuxSettings {
    #[serde(default = "default_window")]
    pub window: u32,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_true")]
    pub pre_read: bool,
    /// Seconds between keepalive pings; 0 disables them.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
}

fn default_window() -> u32 {
    crate::mux::DEFAULT_WINDOW
}

fn default_max_message_size() -> usize {
    crate::mux::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_ping_interval() -> u64 {
    30
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            window: default_window(),
            max_message_size: default_max_message_size(),
            pre_read: true,
            ping_interval: default_ping_interval(),
        }
    }
}

impl MuxSettings {
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            window: self.window,
            max_message_size: self.max_message_size,
        }
    }

    /// Limit for one link message: a channel payload plus its frame header.
    pub fn link_message_size(&self) -> usize {
        self.max_message_size + crate::mux::frame::HEADER_LEN
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval > 0).then(|| Duration::from_secs(self.ping_interval))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// Seconds the remaining direction may run after the other finished.
    #[serde(default = "default_half_close")]
    pub half_close: u64,
    /// Milliseconds of random spread applied to `half_close`.
    #[serde(default = "default_half_close_jitter")]
    pub half_close_jitter: u64,
    /// Seconds without traffic before a relayed connection is dropped; 0
    /// disables.
    #[serde(default = "default_idle")]
    pub idle: u64,
    /// Seconds to wait for a pong.
    #[serde(default = "default_ping")]
    pub ping: u64,
}

fn default_half_close() -> u64 {
    10
}

fn default_half_close_jitter() -> u64 {
    1000
}

fn default_idle() -> u64 {
    600
}

fn default_ping() -> u64 {
    10
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            half_close: default_half_close(),
            half_close_jitter: default_half_close_jitter(),
            idle: default_idle(),
            ping: default_ping(),
        }
    }
}

impl Timeouts {
    pub fn half_close(&self) -> Duration {
        Duration::from_secs(self.half_close)
    }

    pub fn half_close_jitter(&self) -> Duration {
        Duration::from_millis(self.half_close_jitter)
    }

    pub fn idle(&self) -> Option<Duration> {
        (self.idle > 0).then(|| Duration::from_secs(self.idle))
    }

    pub fn ping(&self) -> Duration {
        Duration::from_secs(self.ping)
    }
}
