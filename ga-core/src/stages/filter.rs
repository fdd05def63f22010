//! RGBA → YUV 4:2:0 colour conversion stage.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GaError;
use crate::pipeline::{
    PipeReceiver, PipeSender, Stage, StageContext, StageKind, StageTask, not_initialized,
    spawn_stage,
};
use crate::stages::types::{MediaUnit, PixelFormat, VideoFrame};

// BT.601 studio-swing coefficients, 8-bit fixed point.
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

fn chroma_u(r: i32, g: i32, b: i32) -> u8 {
    (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8
}

fn chroma_v(r: i32, g: i32, b: i32) -> u8 {
    (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8
}

/// Convert tightly packed RGBA to planar YUV 4:2:0.
///
/// Chroma is computed from the average colour of each 2×2 block; blocks
/// on an odd right or bottom edge average the pixels that exist.
pub fn rgba_to_yuv420p(width: u32, height: u32, rgba: &[u8]) -> Result<Vec<u8>, GaError> {
    let expected = PixelFormat::Rgba8.frame_len(width, height);
    if rgba.len() < expected {
        return Err(GaError::Other(format!(
            "RGBA frame too short: {} < {expected}",
            rgba.len()
        )));
    }

    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let mut out = vec![0u8; PixelFormat::Yuv420p.frame_len(width, height)];
    let (y_plane, chroma) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    let pixel = |x: usize, y: usize| {
        let i = (y * w + x) * 4;
        (rgba[i] as i32, rgba[i + 1] as i32, rgba[i + 2] as i32)
    };

    for y in 0..h {
        for x in 0..w {
            let (r, g, b) = pixel(x, y);
            y_plane[y * w + x] = luma(r, g, b);
        }
    }

    for cy in 0..ch {
        for cx in 0..cw {
            let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
            for y in (cy * 2)..(cy * 2 + 2).min(h) {
                for x in (cx * 2)..(cx * 2 + 2).min(w) {
                    let (pr, pg, pb) = pixel(x, y);
                    r += pr;
                    g += pg;
                    b += pb;
                    n += 1;
                }
            }
            let (r, g, b) = (r / n, g / n, b / n);
            u_plane[cy * cw + cx] = chroma_u(r, g, b);
            v_plane[cy * cw + cx] = chroma_v(r, g, b);
        }
    }

    Ok(out)
}

/// Convert a frame to YUV 4:2:0, passing YUV frames through untouched.
pub fn convert_frame(frame: VideoFrame) -> Result<VideoFrame, GaError> {
    match frame.format {
        PixelFormat::Yuv420p => Ok(frame),
        PixelFormat::Rgba8 => Ok(VideoFrame {
            data: rgba_to_yuv420p(frame.width, frame.height, &frame.data)?,
            format: PixelFormat::Yuv420p,
            ..frame
        }),
    }
}

struct Wiring {
    input: PipeReceiver,
    output: PipeSender,
    shutdown: CancellationToken,
}

/// Colour conversion stage between `video-0` and `filter-0`.
#[derive(Default)]
pub struct ColorFilter {
    wiring: Option<Wiring>,
}

impl ColorFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for ColorFilter {
    fn kind(&self) -> StageKind {
        StageKind::ColorFilter
    }

    fn initialize(&mut self, ctx: &mut StageContext<'_>) -> Result<(), GaError> {
        let names = &ctx.settings.pipes;
        self.wiring = Some(Wiring {
            input: ctx.pipes.take_receiver(&names.video)?,
            output: ctx.pipes.sender(&names.filter),
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
        mut input,
        output,
        shutdown,
    } = wiring;

    loop {
        let unit = tokio::select! {
            _ = shutdown.cancelled() => break,
            unit = input.recv() => match unit {
                Some(unit) => unit,
                None => break,
            },
        };

        let frame = match unit {
            MediaUnit::Video(frame) => frame,
            other => {
                warn!("filter ignoring non-video unit: {other:?}");
                continue;
            }
        };

        let converted = match convert_frame(frame) {
            Ok(f) => f,
            Err(e) => {
                warn!("colour conversion failed: {e}");
                continue;
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = output.send(MediaUnit::Video(converted)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!("colour filter stopped");
}
