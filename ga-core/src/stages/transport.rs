//! UDP media transport with chunked framing and RTT feedback.
//!
//! Encoded packets are split into MTU-sized datagrams so they travel
//! without IP fragmentation. The first datagram the server receives
//! from anyone selects the peer it streams to.
//!
//! ## Wire format
//!
//! **Frame header datagram** (34 bytes):
//! ```text
//! sequence:       u32  (4)
//! kind:           u8   (1)   0 = video, 1 = audio
//! packet_seq:     u64  (8)
//! timestamp_us:   u64  (8)   server clock, echoed back by the receiver
//! width:          u32  (4)
//! height:         u32  (4)
//! is_keyframe:    u8   (1)
//! total_chunks:   u32  (4)
//! ```
//!
//! **Chunk datagram** (12 byte header + payload):
//! ```text
//! sequence:       u32  (4)
//! chunk_index:    u32  (4)
//! chunk_size:     u32  (4)
//! data:           [u8] (variable, ≤ MTU − 12)
//! ```
//!
//! **Feedback datagram** (receiver → server, 12 bytes):
//! ```text
//! magic:          "GAFB"
//! timestamp_us:   u64  (8)   copied from a frame header
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bbr::{RttFixed, RttSource};
use crate::error::GaError;
use crate::pipeline::{
    PipeReceiver, Stage, StageContext, StageKind, StageTask, not_initialized, spawn_stage,
};
use crate::stages::types::{EncodedPacket, MediaKind, MediaUnit};

// ── Constants ────────────────────────────────────────────────────

/// Magic prefix of a feedback datagram.
pub const FEEDBACK_MAGIC: &[u8; 4] = b"GAFB";

/// Size of a feedback datagram.
pub const FEEDBACK_SIZE: usize = 12;

/// Receive buffer; larger than any datagram we accept.
const RECV_BUF: usize = 2048;

// ── FrameHeader ──────────────────────────────────────────────────

/// Per-packet metadata sent as the first datagram of each packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u32,
    pub kind: MediaKind,
    pub packet_seq: u64,
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    pub is_keyframe: bool,
    pub total_chunks: u32,
}

impl FrameHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 34;

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4] = match self.kind {
            MediaKind::Video => 0,
            MediaKind::Audio => 1,
        };
        buf[5..13].copy_from_slice(&self.packet_seq.to_le_bytes());
        buf[13..21].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[21..25].copy_from_slice(&self.width.to_le_bytes());
        buf[25..29].copy_from_slice(&self.height.to_le_bytes());
        buf[29] = self.is_keyframe as u8;
        buf[30..34].copy_from_slice(&self.total_chunks.to_le_bytes());
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, GaError> {
        let data: &[u8; Self::SIZE] = data
            .get(..Self::SIZE)
            .and_then(|d| d.try_into().ok())
            .ok_or_else(|| {
                GaError::Other(format!("FrameHeader too short: {} < {}", data.len(), Self::SIZE))
            })?;
        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[i..i + 8]);
            u64::from_le_bytes(b)
        };
        let kind = match data[4] {
            0 => MediaKind::Video,
            1 => MediaKind::Audio,
            other => {
                return Err(GaError::UnknownVariant {
                    type_name: "MediaKind",
                    value: other as u64,
                });
            }
        };
        Ok(Self {
            sequence: u32_at(0),
            kind,
            packet_seq: u64_at(5),
            timestamp_us: u64_at(13),
            width: u32_at(21),
            height: u32_at(25),
            is_keyframe: data[29] != 0,
            total_chunks: u32_at(30),
        })
    }
}

// ── ChunkHeader ──────────────────────────────────────────────────

/// Per-chunk metadata prepended to each data datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub sequence: u32,
    pub chunk_index: u32,
    pub chunk_size: u32,
}

impl ChunkHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 12;

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..8].copy_from_slice(&self.chunk_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, GaError> {
        if data.len() < Self::SIZE {
            return Err(GaError::Other(format!(
                "ChunkHeader too short: {} < {}",
                data.len(),
                Self::SIZE,
            )));
        }
        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Ok(Self {
            sequence: u32_at(0),
            chunk_index: u32_at(4),
            chunk_size: u32_at(8),
        })
    }
}

/// Split `packet` into a frame header datagram followed by chunk datagrams.
pub fn packetize(sequence: u32, packet: &EncodedPacket, timestamp_us: u64, mtu: usize) -> Vec<Vec<u8>> {
    let chunk_payload_max = mtu.saturating_sub(ChunkHeader::SIZE).max(1);
    let total_chunks = packet.data.len().div_ceil(chunk_payload_max);

    let header = FrameHeader {
        sequence,
        kind: packet.kind,
        packet_seq: packet.sequence,
        timestamp_us,
        width: packet.width,
        height: packet.height,
        is_keyframe: packet.is_keyframe,
        total_chunks: total_chunks as u32,
    };

    let mut datagrams = Vec::with_capacity(total_chunks + 1);
    datagrams.push(header.encode().to_vec());
    for (idx, chunk_data) in packet.data.chunks(chunk_payload_max).enumerate() {
        let ch = ChunkHeader {
            sequence,
            chunk_index: idx as u32,
            chunk_size: chunk_data.len() as u32,
        };
        let mut pkt = Vec::with_capacity(ChunkHeader::SIZE + chunk_data.len());
        pkt.extend_from_slice(&ch.encode());
        pkt.extend_from_slice(chunk_data);
        datagrams.push(pkt);
    }
    datagrams
}

/// Timestamp carried by a feedback datagram, if `data` is one.
pub fn parse_feedback(data: &[u8]) -> Option<u64> {
    if data.len() != FEEDBACK_SIZE || &data[..4] != FEEDBACK_MAGIC {
        return None;
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&data[4..]);
    Some(u64::from_le_bytes(ts))
}

/// Build a feedback datagram echoing `timestamp_us`.
pub fn feedback_datagram(timestamp_us: u64) -> [u8; FEEDBACK_SIZE] {
    let mut buf = [0u8; FEEDBACK_SIZE];
    buf[..4].copy_from_slice(FEEDBACK_MAGIC);
    buf[4..].copy_from_slice(&timestamp_us.to_le_bytes());
    buf
}

// ── TransportRtt ─────────────────────────────────────────────────

/// Latest RTT measured from feedback echoes, readable from any task.
#[derive(Debug, Default)]
pub struct TransportRtt {
    latest: AtomicU32,
    bytes_sent: AtomicU64,
}

impl TransportRtt {
    /// Store a measurement. A sub-unit RTT is stored as one unit so a
    /// real echo is never mistaken for "unavailable".
    pub fn record(&self, rtt: Duration) {
        let units = RttFixed::from_duration(rtt).0.max(1);
        self.latest.store(units, Ordering::Relaxed);
    }

    /// Total bytes sent to the peer.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl RttSource for TransportRtt {
    fn latest_rtt(&self) -> RttFixed {
        RttFixed(self.latest.load(Ordering::Relaxed))
    }
}

// ── TransportServer stage ────────────────────────────────────────

struct Wiring {
    input: PipeReceiver,
    socket: std::net::UdpSocket,
    mtu: usize,
    shutdown: CancellationToken,
}

/// Transport stage: serves `stream-0` to one UDP receiver.
pub struct TransportServer {
    rtt: Arc<TransportRtt>,
    local_addr: Option<SocketAddr>,
    wiring: Option<Wiring>,
}

impl TransportServer {
    pub fn new() -> Self {
        Self {
            rtt: Arc::new(TransportRtt::default()),
            local_addr: None,
            wiring: None,
        }
    }

    /// Address the socket is bound to, once initialised.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn rtt(&self) -> Arc<TransportRtt> {
        Arc::clone(&self.rtt)
    }
}

impl Default for TransportServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for TransportServer {
    fn kind(&self) -> StageKind {
        StageKind::TransportServer
    }

    fn initialize(&mut self, ctx: &mut StageContext<'_>) -> Result<(), GaError> {
        let transport = ctx.settings.transport;
        if transport.mtu <= ChunkHeader::SIZE.max(FrameHeader::SIZE) {
            return Err(GaError::Config(format!("mtu {} too small", transport.mtu)));
        }

        // Bind now so a busy port fails initialisation, not the task.
        let socket = std::net::UdpSocket::bind(transport.bind)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        info!(addr = %local, mtu = transport.mtu, "transport bound");

        self.local_addr = Some(local);
        self.wiring = Some(Wiring {
            input: ctx.pipes.take_receiver(&ctx.settings.pipes.stream)?,
            socket,
            mtu: transport.mtu,
            shutdown: ctx.shutdown.clone(),
        });
        Ok(())
    }

    fn start(&mut self) -> Result<StageTask, GaError> {
        let kind = self.kind();
        let wiring = self.wiring.take().ok_or_else(|| not_initialized(kind))?;
        spawn_stage(kind, run(wiring, Arc::clone(&self.rtt)))
    }

    fn rtt_source(&self) -> Option<Arc<dyn RttSource>> {
        Some(self.rtt.clone() as Arc<dyn RttSource>)
    }
}

async fn run(wiring: Wiring, rtt: Arc<TransportRtt>) {
    let Wiring {
        mut input,
        socket,
        mtu,
        shutdown,
    } = wiring;
    let socket = match UdpSocket::from_std(socket) {
        Ok(s) => s,
        Err(e) => {
            warn!("transport socket unusable: {e}");
            return;
        }
    };

    let epoch = Instant::now();
    let mut peer: Option<SocketAddr> = None;
    let mut sequence = 0u32;
    let mut buf = vec![0u8; RECV_BUF];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            recv = socket.recv_from(&mut buf) => {
                let (len, from) = match recv {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("transport recv error: {e}");
                        continue;
                    }
                };
                if peer.is_none() {
                    info!(peer = %from, "receiver attached");
                    peer = Some(from);
                }
                if peer != Some(from) {
                    continue;
                }
                if let Some(ts) = parse_feedback(&buf[..len]) {
                    let now_us = epoch.elapsed().as_micros() as u64;
                    if ts <= now_us {
                        rtt.record(Duration::from_micros(now_us - ts));
                    }
                }
            }

            unit = input.recv() => {
                let Some(unit) = unit else { break };
                let MediaUnit::Encoded(packet) = unit else {
                    warn!("transport ignoring raw media unit");
                    continue;
                };
                let Some(to) = peer else {
                    debug!(seq = packet.sequence, "no receiver yet, packet dropped");
                    continue;
                };

                let timestamp_us = epoch.elapsed().as_micros() as u64;
                let mut sent = 0usize;
                for datagram in packetize(sequence, &packet, timestamp_us, mtu) {
                    match socket.send_to(&datagram, to).await {
                        Ok(n) => sent += n,
                        Err(e) => {
                            debug!("UDP send to {to} failed: {e}");
                            break;
                        }
                    }
                }
                sequence = sequence.wrapping_add(1);
                rtt.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
            }
        }
    }
    debug!(bytes = rtt.bytes_sent(), "transport stopped");
}

// ── Tests ────────────────────────────────────────────────────────
