//! Built-in pipeline stages.
//!
//! | Stage             | Kind              | Reads      | Writes     |
//! |-------------------|-------------------|------------|------------|
//! | [`ControlReplay`] | control-replay    | control    | input sink |
//! | [`PatternSource`] | video-source      |            | `video-0`  |
//! | [`ColorFilter`]   | filter            | `video-0`  | `filter-0` |
//! | [`VideoEncoder`]  | video-encoder     | `filter-0` | `stream-0` |
//! | [`ToneSource`]    | audio-source      |            | `audio-0`  |
//! | [`AudioEncoder`]  | audio-encoder     | `audio-0`  | `stream-0` |
//! | [`TransportServer`] | transport-server | `stream-0` | UDP        |
//!
//! These are reference implementations: synthetic sources and
//! zstd-based encoders that exercise the orchestrator and the control
//! plane without platform capture or codec libraries.

pub mod aencoder;
pub mod asource;
pub mod filter;
pub mod replay;
pub mod transport;
pub mod types;
pub mod vencoder;
pub mod vsource;

pub use aencoder::AudioEncoder;
pub use asource::ToneSource;
pub use filter::ColorFilter;
pub use replay::{ControlReplay, InputSink, TracingSink};
pub use transport::{TransportRtt, TransportServer};
pub use vencoder::{EncoderControl, EncoderParams, VideoEncoder};
pub use vsource::PatternSource;
