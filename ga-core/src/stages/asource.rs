//! Synthetic audio source: a continuous sine tone.

use std::f64::consts::TAU;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::GaError;
use crate::pipeline::{
    PipeSender, Stage, StageContext, StageKind, StageTask, not_initialized, spawn_stage,
};
use crate::stages::types::{AudioChunk, MediaUnit};

/// Length of one emitted chunk.
pub const CHUNK_DURATION: Duration = Duration::from_millis(20);

const TONE_HZ: f64 = 440.0;
const AMPLITUDE: f64 = 8000.0;

/// Phase-continuous sine generator producing interleaved i16 PCM.
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    sample_rate: u32,
    channels: u16,
    phase: f64,
}

impl ToneGenerator {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            phase: 0.0,
        }
    }

    /// Sample frames per [`CHUNK_DURATION`].
    pub fn frames_per_chunk(&self) -> usize {
        (self.sample_rate as u64 * CHUNK_DURATION.as_millis() as u64 / 1000) as usize
    }

    /// Next chunk; every channel carries the same signal.
    pub fn next_chunk(&mut self) -> Vec<i16> {
        let frames = self.frames_per_chunk();
        let step = TAU * TONE_HZ / self.sample_rate as f64;
        let mut samples = Vec::with_capacity(frames * self.channels as usize);
        for _ in 0..frames {
            let s = (self.phase.sin() * AMPLITUDE) as i16;
            samples.extend(std::iter::repeat_n(s, self.channels as usize));
            self.phase = (self.phase + step) % TAU;
        }
        samples
    }
}

struct Wiring {
    output: PipeSender,
    generator: ToneGenerator,
    shutdown: CancellationToken,
}

/// Audio source stage writing 20 ms PCM chunks to `audio-0`.
#[derive(Default)]
pub struct ToneSource {
    wiring: Option<Wiring>,
}

impl ToneSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for ToneSource {
    fn kind(&self) -> StageKind {
        StageKind::AudioSource
    }

    fn initialize(&mut self, ctx: &mut StageContext<'_>) -> Result<(), GaError> {
        let audio = ctx.settings.audio;
        if audio.sample_rate == 0 || audio.channels == 0 {
            return Err(GaError::Config(format!(
                "invalid audio format {} Hz × {}",
                audio.sample_rate, audio.channels
            )));
        }
        info!(sample_rate = audio.sample_rate, channels = audio.channels, "tone source ready");
        self.wiring = Some(Wiring {
            output: ctx.pipes.sender(&ctx.settings.pipes.audio),
            generator: ToneGenerator::new(audio.sample_rate, audio.channels),
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
        mut generator,
        shutdown,
    } = wiring;
    let mut ticker = tokio::time::interval(CHUNK_DURATION);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let chunk = AudioChunk {
            sample_rate: generator.sample_rate,
            channels: generator.channels,
            samples: generator.next_chunk(),
            timestamp: Instant::now(),
        };
        match output.try_send(MediaUnit::Audio(chunk)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("audio pipe full, chunk dropped"),
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!("tone source stopped");
}
