//! Reference video encoder with live reconfiguration.
//!
//! Encodes planar YUV 4:2:0 frames from `filter-0` into zstd-compressed
//! packets on `stream-0`. The encoder is deliberately simple, but it
//! honours every parameter a [`ReconfigCommand`] can change:
//!
//! - **framerate**: frames arriving faster than the target rate are dropped.
//! - **resolution**: frames are rescaled (nearest neighbour) when the
//!   target differs from the input.
//! - **crf**: `crf / 8` low bits of every sample are discarded before
//!   compression, so higher values compress better.
//! - **bitrate**: a token bucket refilled at `bitrate_kbps` with one
//!   second of burst drops packets that would exceed the budget.
//!
//! Live parameters sit behind a mutex in [`EncoderControl`], which is the
//! stage's [`Reconfigurable`] entry point. The encode loop snapshots them
//! once per frame.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GaError;
use crate::pipeline::{
    PipeReceiver, PipeSender, Stage, StageContext, StageKind, StageTask, not_initialized,
    spawn_stage,
};
use crate::reconfig::{ReconfigAck, ReconfigCommand, Reconfigurable};
use crate::stages::types::{EncodedPacket, MediaKind, MediaUnit, PixelFormat, VideoFrame};

/// Highest accepted constant rate factor.
pub const CRF_MAX: u32 = 51;

/// zstd level used for every frame (favour speed).
const ZSTD_LEVEL: i32 = 1;

// ── EncoderParams ────────────────────────────────────────────────

/// Live encoder parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderParams {
    pub bitrate_kbps: u32,
    pub crf: u32,
    /// `(numerator, denominator)`, both non-zero.
    pub framerate: (u32, u32),
    /// Output size; `None` keeps the input size.
    pub resolution: Option<(u32, u32)>,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            bitrate_kbps: crate::bbr::governor::DEFAULT_INITIAL_BITRATE_KBPS,
            crf: 23,
            framerate: (30, 1),
            resolution: None,
        }
    }
}

impl EncoderParams {
    /// Apply `cmd` on top of these parameters, validating the result.
    pub fn merged(&self, cmd: &ReconfigCommand) -> Result<Self, GaError> {
        let mut next = *self;

        if let Some(bitrate) = cmd.bitrate_kbps {
            if bitrate == 0 {
                return Err(GaError::invalid("bitrate must be positive"));
            }
            next.bitrate_kbps = bitrate;
        }
        if let Some(crf) = cmd.crf {
            if crf > CRF_MAX {
                return Err(GaError::invalid(format!("crf {crf} exceeds {CRF_MAX}")));
            }
            next.crf = crf;
        }
        if let Some((num, den)) = cmd.framerate {
            if num == 0 || den == 0 {
                return Err(GaError::invalid(format!("invalid framerate {num}/{den}")));
            }
            next.framerate = (num, den);
        }
        if cmd.width.is_some() || cmd.height.is_some() {
            let (cur_w, cur_h) = next.resolution.unwrap_or((0, 0));
            let w = cmd.width.unwrap_or(cur_w);
            let h = cmd.height.unwrap_or(cur_h);
            if w == 0 || h == 0 || w % 2 != 0 || h % 2 != 0 {
                return Err(GaError::invalid(format!("invalid resolution {w}x{h}")));
            }
            next.resolution = Some((w, h));
        }

        Ok(next)
    }

    /// Whole frames per second, at least 1.
    pub fn fps(&self) -> u32 {
        let (num, den) = self.framerate;
        (num / den.max(1)).max(1)
    }

    /// Rate-control buffer in kbit: five frames' worth of bitrate.
    pub fn buffer_size(&self) -> u32 {
        (self.bitrate_kbps as u64 * 5 / self.fps() as u64) as u32
    }

    /// Minimum spacing between emitted frames.
    pub fn frame_interval(&self) -> Duration {
        let (num, den) = self.framerate;
        Duration::from_secs(den as u64) / num.max(1)
    }
}

// ── EncoderControl ───────────────────────────────────────────────

/// Shared, lockable view of the encoder's parameters.
#[derive(Debug, Default)]
pub struct EncoderControl {
    params: Mutex<EncoderParams>,
}

impl EncoderControl {
    pub fn new(params: EncoderParams) -> Self {
        Self {
            params: Mutex::new(params),
        }
    }

    pub fn params(&self) -> Result<EncoderParams, GaError> {
        self.params
            .lock()
            .map(|p| *p)
            .map_err(|_| GaError::Other("encoder parameters poisoned".into()))
    }

    fn replace(&self, params: EncoderParams) -> Result<(), GaError> {
        let mut guard = self
            .params
            .lock()
            .map_err(|_| GaError::Other("encoder parameters poisoned".into()))?;
        *guard = params;
        Ok(())
    }
}

impl Reconfigurable for EncoderControl {
    fn reconfigure(&self, cmd: &ReconfigCommand) -> Result<ReconfigAck, GaError> {
        if cmd.id != 0 {
            return Err(GaError::invalid(format!("no encoder with id {}", cmd.id)));
        }
        let mut guard = self
            .params
            .lock()
            .map_err(|_| GaError::Other("encoder parameters poisoned".into()))?;
        let next = guard.merged(cmd)?;
        *guard = next;

        Ok(ReconfigAck {
            bitrate_kbps: next.bitrate_kbps,
            buffer_size: next.buffer_size(),
            framerate: next.framerate,
        })
    }
}

// ── Frame processing ─────────────────────────────────────────────

/// Nearest-neighbour resize of one image plane.
fn scale_plane(src: &[u8], sw: usize, sh: usize, dw: usize, dh: usize, out: &mut Vec<u8>) {
    for y in 0..dh {
        let row = (y * sh / dh) * sw;
        for x in 0..dw {
            out.push(src[row + x * sw / dw]);
        }
    }
}

/// Rescale a YUV 4:2:0 frame to `width` × `height`.
pub fn scale_yuv420p(frame: &VideoFrame, width: u32, height: u32) -> Result<VideoFrame, GaError> {
    let (y, u, v) = frame
        .yuv_planes()
        .ok_or_else(|| GaError::Other("encoder input is not a complete YUV 4:2:0 frame".into()))?;

    let (sw, sh) = (frame.width as usize, frame.height as usize);
    let (dw, dh) = (width as usize, height as usize);
    let mut data = Vec::with_capacity(PixelFormat::Yuv420p.frame_len(width, height));
    scale_plane(y, sw, sh, dw, dh, &mut data);
    let (scw, sch) = (sw.div_ceil(2), sh.div_ceil(2));
    let (dcw, dch) = (dw.div_ceil(2), dh.div_ceil(2));
    scale_plane(u, scw, sch, dcw, dch, &mut data);
    scale_plane(v, scw, sch, dcw, dch, &mut data);

    Ok(VideoFrame {
        frame_number: frame.frame_number,
        width,
        height,
        format: PixelFormat::Yuv420p,
        data,
        timestamp: frame.timestamp,
    })
}

/// Drop the `crf / 8` low bits of every sample.
pub fn quantize(data: &mut [u8], crf: u32) {
    let shift = (crf / 8).min(7);
    if shift == 0 {
        return;
    }
    let mask = 0xFFu8 << shift;
    for b in data {
        *b &= mask;
    }
}

/// Stateful part of the encoder: pacing, rate control and sequencing.
#[derive(Debug)]
pub struct FrameEncoder {
    next_due: Option<Instant>,
    /// Available budget in bits.
    tokens: f64,
    last_refill: Option<Instant>,
    sequence: u64,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            next_due: None,
            tokens: 0.0,
            last_refill: None,
            sequence: 0,
        }
    }

    /// Encode `frame` under `params`. `Ok(None)` means the frame was
    /// dropped for pacing or rate control.
    pub fn encode(
        &mut self,
        frame: &VideoFrame,
        params: &EncoderParams,
        now: Instant,
    ) -> Result<Option<EncodedPacket>, GaError> {
        if !self.admit(params, now) {
            return Ok(None);
        }

        let mut scaled = match params.resolution {
            Some((w, h)) if (w, h) != (frame.width, frame.height) => scale_yuv420p(frame, w, h)?,
            _ => {
                if frame.yuv_planes().is_none() {
                    return Err(GaError::Other(
                        "encoder input is not a complete YUV 4:2:0 frame".into(),
                    ));
                }
                frame.clone()
            }
        };
        quantize(&mut scaled.data, params.crf);

        let data = zstd::encode_all(scaled.data.as_slice(), ZSTD_LEVEL)
            .map_err(|e| GaError::Other(format!("zstd encode failed: {e}")))?;

        if !self.spend(params, data.len(), now) {
            debug!(size = data.len(), bitrate_kbps = params.bitrate_kbps, "over budget, frame dropped");
            return Ok(None);
        }

        let sequence = self.sequence;
        self.sequence += 1;
        Ok(Some(EncodedPacket {
            kind: MediaKind::Video,
            sequence,
            width: scaled.width,
            height: scaled.height,
            is_keyframe: true,
            data,
            timestamp: frame.timestamp,
        }))
    }

    /// Frame-rate gate. Allows a quarter interval of early jitter.
    fn admit(&mut self, params: &EncoderParams, now: Instant) -> bool {
        let interval = params.frame_interval();
        let base = match self.next_due {
            Some(due) if now + interval / 4 < due => return false,
            // Keep the cadence unless a whole interval was missed.
            Some(due) if now < due + interval => due,
            _ => now,
        };
        self.next_due = Some(base + interval);
        true
    }

    /// Token-bucket check; consumes budget only for admitted packets.
    fn spend(&mut self, params: &EncoderParams, bytes: usize, now: Instant) -> bool {
        let capacity = params.bitrate_kbps as f64 * 1000.0;
        self.tokens = match self.last_refill {
            None => capacity,
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                (self.tokens + elapsed * capacity).min(capacity)
            }
        };
        self.last_refill = Some(now);

        let bits = bytes as f64 * 8.0;
        if bits > self.tokens {
            return false;
        }
        self.tokens -= bits;
        true
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

// ── VideoEncoder stage ───────────────────────────────────────────

struct Wiring {
    input: PipeReceiver,
    output: PipeSender,
    shutdown: CancellationToken,
}

/// Video encoder stage between `filter-0` and `stream-0`.
pub struct VideoEncoder {
    control: Arc<EncoderControl>,
    wiring: Option<Wiring>,
}

impl VideoEncoder {
    pub fn new() -> Self {
        Self {
            control: Arc::new(EncoderControl::default()),
            wiring: None,
        }
    }

    pub fn control(&self) -> Arc<EncoderControl> {
        Arc::clone(&self.control)
    }
}

impl Default for VideoEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for VideoEncoder {
    fn kind(&self) -> StageKind {
        StageKind::VideoEncoder
    }

    fn initialize(&mut self, ctx: &mut StageContext<'_>) -> Result<(), GaError> {
        let settings = ctx.settings;
        let (width, height) = settings.capture_size();
        let initial = EncoderParams::default()
            .merged(&ReconfigCommand {
                id: 0,
                bitrate_kbps: Some(settings.encoder.bitrate_kbps),
                crf: Some(settings.encoder.crf),
                framerate: Some((settings.video.fps, 1)),
                width: Some(width),
                height: Some(height),
            })
            .map_err(|e| GaError::Config(format!("encoder settings rejected: {e}")))?;
        self.control.replace(initial)?;

        info!(
            bitrate_kbps = initial.bitrate_kbps,
            crf = initial.crf,
            fps = initial.fps(),
            width,
            height,
            "video encoder ready"
        );

        let names = &settings.pipes;
        self.wiring = Some(Wiring {
            input: ctx.pipes.take_receiver(&names.filter)?,
            output: ctx.pipes.sender(&names.stream),
            shutdown: ctx.shutdown.clone(),
        });
        Ok(())
    }

    fn start(&mut self) -> Result<StageTask, GaError> {
        let wiring = self.wiring.take().ok_or_else(|| not_initialized(self.kind()))?;
        spawn_stage(self.kind(), run(wiring, Arc::clone(&self.control)))
    }

    fn reconfigurer(&self) -> Option<Arc<dyn Reconfigurable>> {
        Some(self.control.clone() as Arc<dyn Reconfigurable>)
    }
}

async fn run(wiring: Wiring, control: Arc<EncoderControl>) {
    let Wiring {
        mut input,
        output,
        shutdown,
    } = wiring;
    let mut encoder = FrameEncoder::new();
    let mut encoded = 0u64;

    loop {
        let unit = tokio::select! {
            _ = shutdown.cancelled() => break,
            unit = input.recv() => match unit {
                Some(unit) => unit,
                None => break,
            },
        };
        let MediaUnit::Video(frame) = unit else {
            warn!("video encoder ignoring non-video unit");
            continue;
        };

        let params = match control.params() {
            Ok(p) => p,
            Err(e) => {
                warn!("{e}");
                break;
            }
        };
        let packet = match encoder.encode(&frame, &params, Instant::now()) {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(e) => {
                warn!(frame = frame.frame_number, "encode failed: {e}");
                continue;
            }
        };
        encoded += 1;

        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = output.send(MediaUnit::Encoded(packet)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(encoded, "video encoder stopped");
}
