//! Domain-specific error types for the ga control plane.
//!
//! All fallible operations return `Result<T, GaError>`.
//! Control-message handling never panics on bad input: every failure is
//! typed, logged by the caller, and recoverable except stage startup.

use thiserror::Error;

use crate::pipeline::{StageKind, StagePhase};

/// Status code used by stages when a reconfiguration argument is invalid.
pub const EINVAL: i32 = -22;

/// Status code used when a stage cannot accept commands in its current state.
pub const EAGAIN: i32 = -11;

/// The canonical error type for the ga control plane.
#[derive(Debug, Error)]
pub enum GaError {
    // ── Control channel ──────────────────────────────────────────
    /// Received bytes that do not start with the control frame magic.
    #[error("invalid magic bytes: expected GAC0")]
    InvalidMagic,

    /// The frame payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The payload exceeds the codec limit.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The TCP/UDP layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Pipeline ─────────────────────────────────────────────────
    /// A stage failed to load, initialise or start.
    #[error("{stage} {phase} failed: {reason}")]
    Stage {
        stage: StageKind,
        phase: StagePhase,
        reason: String,
    },

    /// A stage rejected a reconfiguration command.
    #[error("reconfigure rejected (err = {code}): {reason}")]
    Reconfigure { code: i32, reason: String },

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl GaError {
    /// Negative status code for this error, as reported to control logs.
    pub fn status_code(&self) -> i32 {
        match self {
            GaError::Reconfigure { code, .. } => *code,
            GaError::ChannelClosed => EAGAIN,
            _ => -1,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        GaError::Reconfigure {
            code: EINVAL,
            reason: reason.into(),
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for GaError {
    fn from(s: String) -> Self {
        GaError::Other(s)
    }
}

impl From<&str> for GaError {
    fn from(s: &str) -> Self {
        GaError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GaError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GaError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for GaError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        GaError::Encoding(e.to_string())
    }
}
