//! redmux library
//!
//! Non-blocking socket streams, an edge-triggered epoll reactor, and message
//! transports layered on top: a logical channel multiplexer plus inverse
//! multiplexing over several physical links.

pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod msg;
pub mod mux;
#[cfg(unix)]
pub mod server;
#[cfg(unix)]
pub mod tunnel;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::Config;
pub use error::{Error, Result};
#[cfg(unix)]
pub use server::RelayServer;
