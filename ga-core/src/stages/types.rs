//! Shared types for the capture → filter → encoder → transport pipeline.
//!
//! These are **internal** representations passed between stages over
//! named pipes. They never go on the wire as-is; the transport stage
//! frames [`EncodedPacket`]s itself.

use std::time::Instant;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// Planar Y, then U and V at half resolution in both axes.
    Yuv420p,
}

impl PixelFormat {
    /// Bytes needed for a `width` × `height` image in this format.
    pub const fn frame_len(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgba8 => w * h * 4,
            PixelFormat::Yuv420p => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }
}

// ── VideoFrame ───────────────────────────────────────────────────

/// An uncompressed video frame, tightly packed (no row padding).
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Sequential frame number assigned by the source.
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Monotonic capture timestamp.
    pub timestamp: Instant,
}

impl VideoFrame {
    /// Y, U and V planes of a `Yuv420p` frame.
    ///
    /// Returns `None` for other formats or a short buffer.
    pub fn yuv_planes(&self) -> Option<(&[u8], &[u8], &[u8])> {
        if self.format != PixelFormat::Yuv420p || self.data.len() < self.format.frame_len(self.width, self.height) {
            return None;
        }
        let luma = self.width as usize * self.height as usize;
        let chroma = (self.width as usize).div_ceil(2) * (self.height as usize).div_ceil(2);
        let (y, rest) = self.data.split_at(luma);
        let (u, rest) = rest.split_at(chroma);
        Some((y, u, &rest[..chroma]))
    }
}

// ── AudioChunk ───────────────────────────────────────────────────

/// Interleaved signed 16-bit PCM.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
    pub timestamp: Instant,
}

// ── EncodedPacket ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

/// A compressed access unit ready for the transport stage.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub kind: MediaKind,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub is_keyframe: bool,
    pub data: Vec<u8>,
    pub timestamp: Instant,
}

// ── MediaUnit ────────────────────────────────────────────────────

/// Anything that travels over an inter-stage pipe.
#[derive(Debug, Clone)]
pub enum MediaUnit {
    Video(VideoFrame),
    Audio(AudioChunk),
    Encoded(EncodedPacket),
}
