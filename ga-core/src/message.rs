//! Control-channel message types.
//!
//! Subtypes decode through `TryFrom`, so an unknown tag is an error, never a panic.
//! Payloads are serialised with `serde` + `bincode` and carried inside
//! the frames produced by [`ControlCodec`](crate::codec::ControlCodec).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GaError;

// ── ControlSubtype ───────────────────────────────────────────────

/// Tag identifying the payload of a control frame.
///
/// - `0x01..0x0F`: system messages, routed to registered handlers
/// - `0x10..`: input events, routed to the control-replay stage
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSubtype {
    /// Receiver network-quality telemetry.
    NetReport = 0x01,
    /// Explicit encoder reconfiguration request.
    Reconfig = 0x02,
    /// BBR-style bandwidth report.
    BbrReport = 0x03,
    /// Keyboard / mouse input for replay.
    Input = 0x10,
}

impl ControlSubtype {
    /// System messages are handled by the control dispatcher.
    pub fn is_system(self) -> bool {
        (self as u8) < 0x10
    }
}

impl TryFrom<u8> for ControlSubtype {
    type Error = GaError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ControlSubtype::NetReport),
            0x02 => Ok(ControlSubtype::Reconfig),
            0x03 => Ok(ControlSubtype::BbrReport),
            0x10 => Ok(ControlSubtype::Input),
            _ => Err(GaError::UnknownVariant {
                type_name: "ControlSubtype",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for ControlSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlSubtype::NetReport => write!(f, "net-report"),
            ControlSubtype::Reconfig => write!(f, "reconfig"),
            ControlSubtype::BbrReport => write!(f, "bbr-report"),
            ControlSubtype::Input => write!(f, "input"),
        }
    }
}

// ── Payloads ─────────────────────────────────────────────────────

/// Network-quality telemetry measured by the receiver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NetReport {
    /// Estimated path capacity in bits per second.
    pub capacity: u32,
    /// Packets lost in the reporting period.
    pub pktloss: u32,
    /// Packets expected in the reporting period.
    pub pktcount: u32,
    /// Frames received in the reporting period.
    pub framecount: u32,
    /// Bytes received in the reporting period.
    pub bytecount: u32,
    /// Length of the reporting period in microseconds.
    pub duration: u32,
}

/// Explicit reconfiguration request. Negative fields mean "unchanged".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconfigRequest {
    pub reconf_id: i32,
    pub crf: i32,
    /// Frames per second (denominator is 1).
    pub framerate: i32,
    /// Target bitrate in kbps.
    pub bitrate: i32,
    pub width: i32,
    pub height: i32,
}

impl Default for ReconfigRequest {
    fn default() -> Self {
        Self {
            reconf_id: 0,
            crf: -1,
            framerate: -1,
            bitrate: -1,
            width: -1,
            height: -1,
        }
    }
}

/// Bandwidth report. The RTT is queried from the transport separately.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BbrReport {
    /// Receive rate observed by the client over the last round.
    pub rcvrate: u32,
}

/// Input event captured on the client, replayed on the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InputEvent {
    Key { scancode: u32, pressed: bool },
    MouseMove { x: i32, y: i32 },
    MouseButton { button: u8, pressed: bool, x: i32, y: i32 },
    MouseWheel { dx: i32, dy: i32 },
}

// ── ControlMessage ───────────────────────────────────────────────

/// A decoded control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    NetReport(NetReport),
    Reconfig(ReconfigRequest),
    BbrReport(BbrReport),
    Input(InputEvent),
}

impl ControlMessage {
    pub fn subtype(&self) -> ControlSubtype {
        match self {
            ControlMessage::NetReport(_) => ControlSubtype::NetReport,
            ControlMessage::Reconfig(_) => ControlSubtype::Reconfig,
            ControlMessage::BbrReport(_) => ControlSubtype::BbrReport,
            ControlMessage::Input(_) => ControlSubtype::Input,
        }
    }

    /// Serialise the payload (without framing).
    pub fn payload_bytes(&self) -> Result<Vec<u8>, GaError> {
        let bytes = match self {
            ControlMessage::NetReport(m) => bincode::serialize(m)?,
            ControlMessage::Reconfig(m) => bincode::serialize(m)?,
            ControlMessage::BbrReport(m) => bincode::serialize(m)?,
            ControlMessage::Input(m) => bincode::serialize(m)?,
        };
        Ok(bytes)
    }

    /// Deserialise a payload of the given subtype.
    pub fn from_payload(subtype: ControlSubtype, payload: &[u8]) -> Result<Self, GaError> {
        let msg = match subtype {
            ControlSubtype::NetReport => ControlMessage::NetReport(bincode::deserialize(payload)?),
            ControlSubtype::Reconfig => ControlMessage::Reconfig(bincode::deserialize(payload)?),
            ControlSubtype::BbrReport => ControlMessage::BbrReport(bincode::deserialize(payload)?),
            ControlSubtype::Input => ControlMessage::Input(bincode::deserialize(payload)?),
        };
        Ok(msg)
    }
}

// ── Tests ────────────────────────────────────────────────────────
