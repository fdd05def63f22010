//! Synthetic video source.
//!
//! Produces a moving RGBA test pattern at the configured frame rate.
//! Frames that do not fit in the output pipe are dropped rather than
//! queued; a source never waits for downstream stages.

use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::GaError;
use crate::pipeline::{
    PipeSender, Stage, StageContext, StageKind, StageTask, not_initialized, spawn_stage,
};
use crate::stages::types::{MediaUnit, PixelFormat, VideoFrame};

/// Render frame `frame_number` of the test pattern.
///
/// Diagonal colour bands scroll one pixel per frame; alpha is opaque.
pub fn render_pattern(width: u32, height: u32, frame_number: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(PixelFormat::Rgba8.frame_len(width, height));
    let shift = frame_number as u32;
    for y in 0..height {
        for x in 0..width {
            let band = x.wrapping_add(y).wrapping_add(shift);
            data.extend_from_slice(&[
                (band & 0xFF) as u8,
                ((y * 255) / height.max(1)) as u8,
                ((x * 255) / width.max(1)) as u8,
                0xFF,
            ]);
        }
    }
    data
}

struct Wiring {
    output: PipeSender,
    width: u32,
    height: u32,
    fps: u32,
    shutdown: CancellationToken,
}

/// Video source stage emitting [`render_pattern`] frames to `video-0`.
#[derive(Default)]
pub struct PatternSource {
    wiring: Option<Wiring>,
}

impl PatternSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for PatternSource {
    fn kind(&self) -> StageKind {
        StageKind::VideoSource
    }

    fn initialize(&mut self, ctx: &mut StageContext<'_>) -> Result<(), GaError> {
        if let Some(crop) = ctx.settings.crop {
            crop.validate()?;
        }
        let (width, height) = ctx.settings.capture_size();
        if width == 0 || height == 0 {
            return Err(GaError::Config(format!("invalid capture size {width}x{height}")));
        }
        let fps = ctx.settings.video.fps;
        if fps == 0 {
            return Err(GaError::Config("video fps must be positive".into()));
        }

        info!(width, height, fps, "pattern source ready");
        self.wiring = Some(Wiring {
            output: ctx.pipes.sender(&ctx.settings.pipes.video),
            width,
            height,
            fps,
            shutdown: ctx.shutdown.clone(),
        });
        Ok(())
    }

    fn start(&mut self) -> Result<StageTask, GaError> {
        let wiring = self.wiring.take().ok_or_else(|| not_initialized(self.kind()))?;
        spawn_stage(self.kind(), run(wiring))
    }
}

async fn run(wiring: Wiring) {
    let Wiring {
        output,
        width,
        height,
        fps,
        shutdown,
    } = wiring;

    let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut frame_number = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let frame = VideoFrame {
            frame_number,
            width,
            height,
            format: PixelFormat::Rgba8,
            data: render_pattern(width, height, frame_number),
            timestamp: Instant::now(),
        };
        frame_number += 1;

        match output.try_send(MediaUnit::Video(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!(frame_number, "video pipe full, frame dropped"),
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!(frames = frame_number, "pattern source stopped");
}
