//! # ga-core
//!
//! Control plane and stage pipeline for the ga streaming server.
//!
//! This crate contains:
//! - **BBR**: `RttSampleStore`, `CongestionEstimator`, `BitrateGovernor`
//!   and the `BbrController` that ties them together
//! - **Reconfiguration**: `ReconfigCommand` and the `ReconfigDispatcher`
//!   that delivers it to the video encoder
//! - **Control channel**: `ControlHeader`, `ControlCodec` for framed TCP
//!   I/O via `tokio_util`, `ControlDispatcher` and `ControlServer`
//! - **Pipeline**: `StageRegistry`, `Pipeline` and `RunningPipeline`
//! - **Stages**: reference capture, filter, encoder and transport stages
//! - **Error**: `GaError`, a typed `thiserror`-based error

pub mod bbr;
pub mod codec;
pub mod control;
pub mod error;
pub mod header;
pub mod message;
pub mod pipeline;
pub mod reconfig;
pub mod stages;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bbr::{BbrConfig, BbrController, BbrState, RttFixed, RttSampleStore, RttSource};
pub use codec::{ControlCodec, MAX_PAYLOAD_SIZE};
pub use control::{ControlDispatcher, ControlHandler, ControlServer};
pub use error::GaError;
pub use header::{ControlHeader, HEADER_SIZE};
pub use message::{BbrReport, ControlMessage, ControlSubtype, InputEvent, NetReport, ReconfigRequest};
pub use pipeline::{
    CropRect, Pipeline, PipelineSettings, RunningPipeline, Stage, StageKind, StageRegistry,
};
pub use reconfig::{ReconfigAck, ReconfigCommand, ReconfigDispatcher, Reconfigurable};
