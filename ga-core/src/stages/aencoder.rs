//! Reference audio encoder: zstd-compressed PCM.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GaError;
use crate::pipeline::{
    PipeReceiver, PipeSender, Stage, StageContext, StageKind, StageTask, not_initialized,
    spawn_stage,
};
use crate::stages::types::{AudioChunk, EncodedPacket, MediaKind, MediaUnit};

const ZSTD_LEVEL: i32 = 3;

/// Compress one chunk. The payload is little-endian i16 samples.
pub fn encode_chunk(chunk: &AudioChunk, sequence: u64) -> Result<EncodedPacket, GaError> {
    let pcm: Vec<u8> = chunk.samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let data = zstd::encode_all(pcm.as_slice(), ZSTD_LEVEL)
        .map_err(|e| GaError::Other(format!("zstd encode failed: {e}")))?;
    Ok(EncodedPacket {
        kind: MediaKind::Audio,
        sequence,
        width: 0,
        height: 0,
        is_keyframe: true,
        data,
        timestamp: chunk.timestamp,
    })
}

struct Wiring {
    input: PipeReceiver,
    output: PipeSender,
    shutdown: CancellationToken,
}

/// Audio encoder stage between `audio-0` and `stream-0`.
#[derive(Default)]
pub struct AudioEncoder {
    wiring: Option<Wiring>,
}

impl AudioEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for AudioEncoder {
    fn kind(&self) -> StageKind {
        StageKind::AudioEncoder
    }

    fn initialize(&mut self, ctx: &mut StageContext<'_>) -> Result<(), GaError> {
        let names = &ctx.settings.pipes;
        self.wiring = Some(Wiring {
            input: ctx.pipes.take_receiver(&names.audio)?,
            output: ctx.pipes.sender(&names.stream),
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
    let mut sequence = 0u64;

    loop {
        let unit = tokio::select! {
            _ = shutdown.cancelled() => break,
            unit = input.recv() => match unit {
                Some(unit) => unit,
                // No audio source on this host.
                None => break,
            },
        };
        let MediaUnit::Audio(chunk) = unit else {
            warn!("audio encoder ignoring non-audio unit");
            continue;
        };

        let packet = match encode_chunk(&chunk, sequence) {
            Ok(p) => p,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        sequence += 1;

        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = output.send(MediaUnit::Encoded(packet)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(packets = sequence, "audio encoder stopped");
}
