use std::io;

/// Errors surfaced by streams, message transports and the multiplexer.
///
/// A clean end of stream is never an error: byte reads return `Ok(0)` and
/// message receives return `Ok(None)`. `UnexpectedEof` is reserved for places
/// where more data was mandatory.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport fault reported by the OS or an underlying transport.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The peer ended the stream where more data (or a reply) was required.
    #[error("unexpected eof while reading {0}")]
    UnexpectedEof(&'static str),
    /// Misuse by the caller or a malformed peer: fails loudly.
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("stream closed")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// True for transport faults, as opposed to protocol or usage errors.
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let e: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(e.is_fault());
        assert!(!e.is_protocol_violation());

        let e = Error::protocol("second read in flight");
        assert!(e.is_protocol_violation());
        assert_eq!(
            e.to_string(),
            "protocol violation: second read in flight"
        );
        assert_eq!(
            Error::UnexpectedEof("reply").to_string(),
            "unexpected eof while reading reply"
        );
    }
}
