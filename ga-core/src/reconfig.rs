//! Live encoder reconfiguration.
//!
//! Both the BBR controller and explicit client requests end up here:
//! a [`ReconfigCommand`] is built fresh per dispatch and handed to the
//! encoder stage through its [`Reconfigurable`] entry point. Delivery
//! failures are logged and dropped; the next report simply tries again.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info};

use crate::error::GaError;
use crate::message::ReconfigRequest;

// ── ReconfigCommand ──────────────────────────────────────────────

/// Parameter changes for a running encoder. `None` leaves a field as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconfigCommand {
    /// Encoder instance the command targets.
    pub id: i32,
    pub bitrate_kbps: Option<u32>,
    /// Constant rate factor (quantisation target).
    pub crf: Option<u32>,
    /// Frame rate as `(numerator, denominator)`.
    pub framerate: Option<(u32, u32)>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ReconfigCommand {
    /// Bitrate-only command for encoder 0, as issued by the controller.
    pub fn bitrate_only(bitrate_kbps: u32) -> Self {
        Self {
            id: 0,
            bitrate_kbps: Some(bitrate_kbps),
            ..Default::default()
        }
    }

    /// Build a command from a client request.
    ///
    /// Non-positive bitrate, frame rate, width and height mean "unchanged";
    /// so does a negative crf (crf 0 is a valid, lossless target).
    pub fn from_request(req: &ReconfigRequest) -> Self {
        let positive = |v: i32| u32::try_from(v).ok().filter(|&v| v > 0);
        Self {
            id: req.reconf_id,
            bitrate_kbps: positive(req.bitrate),
            crf: u32::try_from(req.crf).ok(),
            framerate: positive(req.framerate).map(|n| (n, 1)),
            width: positive(req.width),
            height: positive(req.height),
        }
    }

    /// Whether the command changes anything at all.
    pub fn is_empty(&self) -> bool {
        self.bitrate_kbps.is_none()
            && self.crf.is_none()
            && self.framerate.is_none()
            && self.width.is_none()
            && self.height.is_none()
    }
}

impl fmt::Display for ReconfigCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt(v: Option<u32>) -> String {
            v.map_or_else(|| "-".to_string(), |v| v.to_string())
        }
        let framerate = self
            .framerate
            .map_or_else(|| "-".to_string(), |(n, d)| format!("{n}/{d}"));
        write!(
            f,
            "id={} bitrate={} crf={} framerate={} size={}x{}",
            self.id,
            opt(self.bitrate_kbps),
            opt(self.crf),
            framerate,
            opt(self.width),
            opt(self.height),
        )
    }
}

// ── ReconfigAck ──────────────────────────────────────────────────

/// Encoder state reported back after a successful reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconfigAck {
    pub bitrate_kbps: u32,
    /// Rate-control buffer size chosen by the encoder (kbit).
    pub buffer_size: u32,
    pub framerate: (u32, u32),
}

// ── Reconfigurable ───────────────────────────────────────────────

/// A stage that accepts live parameter changes.
///
/// Implementations must tolerate being called concurrently with their
/// own processing loop; synchronisation is theirs to own.
pub trait Reconfigurable: Send + Sync {
    fn reconfigure(&self, cmd: &ReconfigCommand) -> Result<ReconfigAck, GaError>;
}

// ── ReconfigDispatcher ───────────────────────────────────────────

/// Single delivery path from control handlers to the video encoder.
#[derive(Clone)]
pub struct ReconfigDispatcher {
    target: Arc<dyn Reconfigurable>,
}

impl ReconfigDispatcher {
    pub fn new(target: Arc<dyn Reconfigurable>) -> Self {
        Self { target }
    }

    /// Deliver `cmd` to the encoder, logging the outcome either way.
    pub fn deliver(&self, cmd: ReconfigCommand) -> Result<ReconfigAck, GaError> {
        match self.target.reconfigure(&cmd) {
            Ok(ack) => {
                let (num, den) = ack.framerate;
                info!(
                    bitrate_kbps = ack.bitrate_kbps,
                    buffer_size = ack.buffer_size,
                    framerate = %format!("{num}/{den}"),
                    "reconfigure encoder OK"
                );
                Ok(ack)
            }
            Err(e) => {
                error!(err = e.status_code(), command = %cmd, "reconfigure encoder failed: {e}");
                Err(e)
            }
        }
    }

    /// Build and deliver a bitrate-only command.
    pub fn set_bitrate(&self, bitrate_kbps: u32) -> Result<ReconfigAck, GaError> {
        self.deliver(ReconfigCommand::bitrate_only(bitrate_kbps))
    }
}

impl fmt::Debug for ReconfigDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconfigDispatcher").finish_non_exhaustive()
    }
}

// ── Tests ────────────────────────────────────────────────────────
