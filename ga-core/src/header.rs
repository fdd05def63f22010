//! Fixed-size control frame header.
//!
//! ```text
//! magic:          [u8; 4]  "GAC0"
//! checksum:       u32      first 4 bytes of blake3(payload), LE
//! subtype:        u8       ControlSubtype
//! reserved:       [u8; 3]  zero
//! payload_length: u32      LE
//! ```

use crate::error::GaError;
use crate::message::ControlSubtype;

/// Encoded header length in bytes.
pub const HEADER_SIZE: usize = 16;

/// Magic bytes at the start of every control frame.
pub const MAGIC: [u8; 4] = *b"GAC0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub checksum: u32,
    pub subtype: ControlSubtype,
    pub payload_length: u32,
}

impl ControlHeader {
    /// Header for `payload`, computing its checksum.
    pub fn for_payload(subtype: ControlSubtype, payload: &[u8]) -> Self {
        Self {
            checksum: checksum(payload),
            subtype,
            payload_length: payload.len() as u32,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8] = self.subtype as u8;
        buf[12..16].copy_from_slice(&self.payload_length.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self, GaError> {
        if bytes[0..4] != MAGIC {
            return Err(GaError::InvalidMagic);
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[4..8]);
        let checksum = u32::from_le_bytes(word);
        word.copy_from_slice(&bytes[12..16]);
        let payload_length = u32::from_le_bytes(word);
        Ok(Self {
            checksum,
            subtype: ControlSubtype::try_from(bytes[8])?,
            payload_length,
        })
    }

    /// Whether `payload` matches the checksum carried in this header.
    pub fn verify(&self, payload: &[u8]) -> bool {
        checksum(payload) == self.checksum
    }
}

/// Truncated blake3 digest used as the frame checksum.
pub fn checksum(payload: &[u8]) -> u32 {
    let digest = blake3::hash(payload);
    let mut word = [0u8; 4];
    word.copy_from_slice(&digest.as_bytes()[0..4]);
    u32::from_le_bytes(word)
}
