//! Framed control-channel codec for `tokio_util`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::GaError;
use crate::header::{ControlHeader, HEADER_SIZE};
use crate::message::ControlMessage;

/// Largest payload accepted on the control channel.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Encodes and decodes [`ControlMessage`]s as header + bincode payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = GaError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&src[..HEADER_SIZE]);
        let header = ControlHeader::from_bytes(&raw)?;

        let len = header.payload_length as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(GaError::PayloadTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len);
        if !header.verify(&payload) {
            return Err(GaError::ChecksumMismatch);
        }

        ControlMessage::from_payload(header.subtype, &payload).map(Some)
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = GaError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.payload_bytes()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(GaError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = ControlHeader::for_payload(item.subtype(), &payload);
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&payload);
        Ok(())
    }
}
