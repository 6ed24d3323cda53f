//! Channel framing over the rendezvous byte stream.
//!
//! ```text
//! +------------------+-----------+------------------+-----------+
//! | channel (u32 BE) | flags: u8 | length (u32 BE)  | payload   |
//! +------------------+-----------+------------------+-----------+
//! ```
//!
//! A frame with no flags carries channel data. `OPEN` carries a JSON
//! [`OpenRequest`], `ACK` confirms an open, `CLOSE` ends a channel from
//! either side. Channel 0 is the control channel.

use crate::{DynoError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Reserved control channel id.
pub const CONTROL_CHANNEL: u32 = 0;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

const HEADER_LEN: usize = 4 + 1 + 4;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const OPEN = 1 << 0;
        const ACK = 1 << 1;
        const CLOSE = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u32,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(channel: u32, payload: Bytes) -> Self {
        Self {
            channel,
            flags: FrameFlags::empty(),
            payload,
        }
    }

    pub fn open(channel: u32, request: &OpenRequest) -> Result<Self> {
        Ok(Self {
            channel,
            flags: FrameFlags::OPEN,
            payload: Bytes::from(serde_json::to_vec(request)?),
        })
    }

    pub fn ack(channel: u32) -> Self {
        Self {
            channel,
            flags: FrameFlags::ACK,
            payload: Bytes::new(),
        }
    }

    pub fn close(channel: u32) -> Self {
        Self {
            channel,
            flags: FrameFlags::CLOSE,
            payload: Bytes::new(),
        }
    }

    pub fn is_data(&self) -> bool {
        self.flags.is_empty()
    }
}

/// Payload of an `OPEN` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OpenRequest {
    /// Execute a command on the remote side
    Run { command: String },
    /// Forward to a TCP port on the remote side
    Tunnel {
        #[serde(with = "port_string")]
        port: u16,
    },
}

mod port_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&port.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(D::Error::custom)
    }
}

/// Length-prefixed codec for [`Frame`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DynoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let channel = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let raw_flags = src[4];
        let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;

        let flags = FrameFlags::from_bits(raw_flags)
            .ok_or_else(|| DynoError::Protocol(format!("unknown frame flags {:#04x}", raw_flags)))?;
        if length > MAX_PAYLOAD {
            return Err(DynoError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                length, MAX_PAYLOAD
            )));
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            channel,
            flags,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = DynoError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(DynoError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                frame.payload.len(),
                MAX_PAYLOAD
            )));
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u32(frame.channel);
        dst.put_u8(frame.flags.bits());
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(Frame::data(7, Bytes::from_static(b"ls\n")), &mut buf)
            .unwrap();

        assert_eq!(&buf[..], &[0, 0, 0, 7, 0, 0, 0, 0, 3, b'l', b's', b'\n']);
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        FrameCodec.encode(Frame::close(3), &mut buf).unwrap();
        FrameCodec
            .encode(Frame::data(3, Bytes::from_static(b"payload")), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(HEADER_LEN + 4);
        let first = FrameCodec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(first, Frame::close(3));
        assert!(FrameCodec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let second = FrameCodec.decode(&mut partial).unwrap().unwrap();
        assert!(second.is_data());
        assert_eq!(second.payload, Bytes::from_static(b"payload"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0x80, 0, 0, 0, 0][..]);
        let err = FrameCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, DynoError::Protocol(_)));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0);
        buf.put_u32((MAX_PAYLOAD + 1) as u32);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_open_request_payloads() {
        let run = Frame::open(2, &OpenRequest::Run { command: "bash".into() }).unwrap();
        assert_eq!(run.flags, FrameFlags::OPEN);
        let json: serde_json::Value = serde_json::from_slice(&run.payload).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "run", "command": "bash"}));

        let tunnel = Frame::open(3, &OpenRequest::Tunnel { port: 5000 }).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&tunnel.payload).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "tunnel", "port": "5000"}));

        let back: OpenRequest = serde_json::from_slice(&tunnel.payload).unwrap();
        assert_eq!(back, OpenRequest::Tunnel { port: 5000 });
    }
}
