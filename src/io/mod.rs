//! Byte-stream layer.
//!
//! - [`ByteStream`]: the uniform `&self` read/write/shutdown/close contract
//! - [`SocketStream`]: TCP sockets with read-ahead and selectable wait strategy
//! - [`Epoller`]: dedicated edge-triggered reactors used by the epoll strategy
//! - [`TwoWayCopier`]: pumps a stream pair until both directions are done

mod adapter;
mod copy;
#[cfg(target_os = "linux")]
mod epoller;
#[cfg(unix)]
mod socket;
mod state;
mod stream;
#[cfg(unix)]
pub(crate) mod sys;

pub use adapter::{AsyncIoStream, loopback_pair};
pub use copy::{CopyStats, ForceClose, TwoWayCopier};
#[cfg(target_os = "linux")]
pub use epoller::{EpollHandler, Epoller, EpollerSnapshot, Reactors};
#[cfg(unix)]
pub use socket::{ReadStrategy, SocketOptions, SocketStream};
pub use state::{AtomicStreamState, StreamState};
pub use stream::{ByteStream, ByteStreamRef};
