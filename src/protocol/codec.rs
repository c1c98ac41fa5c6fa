//! Frame encoding and decoding.
//!
//! Wire format (big-endian header):
//! - Bytes 0-1: protocol version (u16)
//! - Bytes 2-3: message kind (u16)
//! - Bytes 4-7: payload length (u32)
//! - Payload: the rkyv-serialised [`Message`]

use bytes::{Buf, BufMut, BytesMut};
use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::protocol::{Message, MessageKind, PROTOCOL_VERSION};

pub const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MessageCodec {
    version: u16,
    peer_version: Option<u16>,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION)
    }
}

impl MessageCodec {
    pub fn new(version: u16) -> Self {
        Self {
            version,
            peer_version: None,
        }
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// Version stamped on the most recent frame received from the peer.
    pub fn peer_version(&self) -> Option<u16> {
        self.peer_version
    }
}

impl<'a> Encoder<&'a Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: &'a Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = rkyv::to_bytes::<RkyvError>(msg)
            .map_err(|e| ProtocolError::Serialisation(e.to_string()))?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(FRAME_HEADER_SIZE + payload.len());
        dst.put_u16(self.version);
        dst.put_u16(msg.kind().as_u16());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let version = u16::from_be_bytes([src[0], src[1]]);
        let raw_kind = u16::from_be_bytes([src[2], src[3]]);
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        let kind =
            MessageKind::from_u16(raw_kind).ok_or(ProtocolError::UnknownMessageKind(raw_kind))?;

        if src.len() < FRAME_HEADER_SIZE + len {
            src.reserve(FRAME_HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        // Archived data must be aligned; the read buffer gives no such guarantee
        let mut payload = AlignedVec::<16>::with_capacity(len);
        payload.extend_from_slice(&src[..len]);
        src.advance(len);
        self.peer_version = Some(version);

        let msg = rkyv::from_bytes::<Message, RkyvError>(&payload)
            .map_err(|e| ProtocolError::Deserialisation(e.to_string()))?;
        if msg.kind() != kind {
            return Err(ProtocolError::KindMismatch {
                header: kind.name(),
                payload: msg.kind().name(),
            });
        }
        Ok(Some(msg))
    }
}
