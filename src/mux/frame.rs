use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Frames on this channel carry multiplexer control traffic (ping/pong).
pub const CONTROL_CHANNEL: u32 = 0;

pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Data = 0,
    Open = 1,
    Shutdown = 2,
    Close = 3,
    CloseAck = 4,
    Window = 5,
    Ping = 6,
    Pong = 7,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Opcode::Data,
            1 => Opcode::Open,
            2 => Opcode::Shutdown,
            3 => Opcode::Close,
            4 => Opcode::CloseAck,
            5 => Opcode::Window,
            6 => Opcode::Ping,
            7 => Opcode::Pong,
            v => return Err(Error::protocol(format!("unknown frame opcode {}", v))),
        })
    }
}

/// One multiplexer frame: `channel: u32 BE | op: u8 | payload`.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u32,
    pub op: Opcode,
    pub payload: Bytes,
}

impl Frame {
    fn new(channel: u32, op: Opcode, payload: Bytes) -> Self {
        Self {
            channel,
            op,
            payload,
        }
    }

    fn with_u32(channel: u32, op: Opcode, value: u32) -> Self {
        Self::new(channel, op, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn data(channel: u32, payload: Bytes) -> Self {
        Self::new(channel, Opcode::Data, payload)
    }

    pub fn open(channel: u32) -> Self {
        Self::new(channel, Opcode::Open, Bytes::new())
    }

    pub fn shutdown(channel: u32) -> Self {
        Self::new(channel, Opcode::Shutdown, Bytes::new())
    }

    pub fn close(channel: u32) -> Self {
        Self::new(channel, Opcode::Close, Bytes::new())
    }

    pub fn close_ack(channel: u32) -> Self {
        Self::new(channel, Opcode::CloseAck, Bytes::new())
    }

    pub fn window(channel: u32, credits: u32) -> Self {
        Self::with_u32(channel, Opcode::Window, credits)
    }

    pub fn ping(nonce: u32) -> Self {
        Self::with_u32(CONTROL_CHANNEL, Opcode::Ping, nonce)
    }

    pub fn pong(nonce: u32) -> Self {
        Self::with_u32(CONTROL_CHANNEL, Opcode::Pong, nonce)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.channel);
        buf.put_u8(self.op as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut msg: Bytes) -> Result<Self> {
        if msg.len() < HEADER_LEN {
            return Err(Error::protocol(format!("short frame of {} bytes", msg.len())));
        }
        let channel = msg.get_u32();
        let op = Opcode::try_from(msg.get_u8())?;
        Ok(Self::new(channel, op, msg))
    }

    fn payload_u32(&self) -> Result<u32> {
        let bytes: [u8; 4] = self.payload[..]
            .try_into()
            .map_err(|_| Error::protocol(format!("{:?} frame needs a 4 byte payload", self.op)))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Credits carried by a WINDOW frame.
    pub fn credits(&self) -> Result<u32> {
        self.payload_u32()
    }

    /// Nonce carried by a PING or PONG frame.
    pub fn nonce(&self) -> Result<u32> {
        self.payload_u32()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame({} {:?} +{})",
            self.channel,
            self.op,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let bytes = Frame::window(0x01020304, 9).encode();
        assert_eq!(&bytes[..], &[1, 2, 3, 4, 5, 0, 0, 0, 9]);

        let frame = Frame::decode(Frame::data(7, Bytes::from_static(b"abc")).encode()).unwrap();
        assert_eq!(frame.channel, 7);
        assert_eq!(frame.op, Opcode::Data);
        assert_eq!(&frame.payload[..], b"abc");

        assert_eq!(Frame::decode(Frame::ping(42).encode()).unwrap().nonce().unwrap(), 42);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(Frame::decode(Bytes::from_static(&[0, 0, 1])).unwrap_err().is_protocol_violation());
        assert!(Frame::decode(Bytes::from_static(&[0, 0, 0, 1, 99])).unwrap_err().is_protocol_violation());
        let bad = Frame::decode(Bytes::from_static(&[0, 0, 0, 1, 5, 1])).unwrap();
        assert!(bad.credits().is_err());
    }
}
