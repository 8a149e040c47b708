use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Two-bit state of a stream: local side shut down and/or remote side shut
/// down. `CLOSED` is both bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamState(u8);

impl StreamState {
    pub const OPEN: Self = Self(0);
    pub const LOCAL_SHUTDOWN: Self = Self(0b01);
    pub const REMOTE_SHUTDOWN: Self = Self(0b10);
    pub const CLOSED: Self = Self(0b11);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_open(self) -> bool {
        self.0 == 0
    }

    pub const fn is_closed(self) -> bool {
        self.contains(Self::CLOSED)
    }

    /// Local side may still send.
    pub const fn can_write(self) -> bool {
        !self.contains(Self::LOCAL_SHUTDOWN)
    }

    /// Remote side may still deliver data.
    pub const fn can_read(self) -> bool {
        !self.contains(Self::REMOTE_SHUTDOWN)
    }

    /// Folds a set of member states into the state of the group: every
    /// restriction present on any member applies to the whole.
    pub fn most_closed(states: impl IntoIterator<Item = Self>) -> Self {
        states.into_iter().fold(Self::OPEN, Self::union)
    }
}

impl BitOr for StreamState {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0 => "Open",
            1 => "LocalShutdown",
            2 => "RemoteShutdown",
            _ => "Closed",
        };
        f.write_str(name)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared, monotonic state cell: flags can be added but never removed.
#[derive(Debug, Default)]
pub struct AtomicStreamState(AtomicU8);

impl AtomicStreamState {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn load(&self) -> StreamState {
        StreamState(self.0.load(Ordering::Acquire))
    }

    /// Adds `flags`, returning the previous state.
    pub fn insert(&self, flags: StreamState) -> StreamState {
        StreamState(self.0.fetch_or(flags.0, Ordering::AcqRel))
    }
}
