//! End-to-end tests over loopback sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use ga_core::bbr::RttFixed;
use ga_core::error::GaError;
use ga_core::pipeline::{
    PipeRegistry, StageContext, StagePhase, StageTask, spawn_stage,
};
use ga_core::stages::TransportServer;
use ga_core::stages::transport::{FrameHeader, feedback_datagram};
use ga_core::stages::types::{EncodedPacket, MediaKind, MediaUnit};
use ga_core::{
    BbrConfig, BbrReport, ControlCodec, ControlDispatcher, ControlMessage, ControlServer,
    Pipeline, PipelineSettings, ReconfigAck, ReconfigCommand, ReconfigDispatcher,
    ReconfigRequest, Reconfigurable, RttSource, Stage, StageKind, StageRegistry,
};

// ── Helpers ──────────────────────────────────────────────────────

#[derive(Default)]
struct MockEncoder {
    commands: Mutex<Vec<ReconfigCommand>>,
}

impl Reconfigurable for MockEncoder {
    fn reconfigure(&self, cmd: &ReconfigCommand) -> Result<ReconfigAck, GaError> {
        self.commands.lock().unwrap().push(*cmd);
        Ok(ReconfigAck {
            bitrate_kbps: cmd.bitrate_kbps.unwrap_or(0),
            buffer_size: 0,
            framerate: (30, 1),
        })
    }
}

struct MockRtt(AtomicU32);

impl RttSource for MockRtt {
    fn latest_rtt(&self) -> RttFixed {
        RttFixed(self.0.load(Ordering::Relaxed))
    }
}

/// Stage that fails in the configured phase.
struct FailingStage {
    kind: StageKind,
    phase: StagePhase,
}

impl Stage for FailingStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn initialize(&mut self, _ctx: &mut StageContext<'_>) -> Result<(), GaError> {
        match self.phase {
            StagePhase::Init => Err("device unavailable".into()),
            _ => Ok(()),
        }
    }

    fn start(&mut self) -> Result<StageTask, GaError> {
        match self.phase {
            StagePhase::Start => Err("thread refused".into()),
            _ => spawn_stage(self.kind, async {}),
        }
    }
}

fn loopback_settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.video.width = 64;
    settings.video.height = 48;
    settings.transport.bind = SocketAddr::from(([127, 0, 0, 1], 0));
    settings
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ── Control channel ──────────────────────────────────────────────

#[tokio::test]
async fn bbr_reports_over_tcp_drive_encoder_bitrate() {
    let encoder = Arc::new(MockEncoder::default());
    let rtt = Arc::new(MockRtt(AtomicU32::new(RttFixed::from_millis(20).0)));
    let dispatcher = ControlDispatcher::with_default_handlers(
        ReconfigDispatcher::new(encoder.clone()),
        rtt,
        BbrConfig::default(),
    );

    let server = ControlServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(server.run(dispatcher, None, shutdown.clone()));

    let mut client = Framed::new(TcpStream::connect(addr).await.unwrap(), ControlCodec::new());
    // Enter startup, then two startup rounds: 200 → 400 → 800.
    for _ in 0..3 {
        client
            .send(ControlMessage::BbrReport(BbrReport { rcvrate: 100 }))
            .await
            .unwrap();
    }
    client
        .send(ControlMessage::Reconfig(ReconfigRequest {
            crf: 30,
            ..Default::default()
        }))
        .await
        .unwrap();

    wait_for(|| encoder.commands.lock().unwrap().len() == 3).await;
    let commands = encoder.commands.lock().unwrap().clone();
    assert_eq!(commands[0], ReconfigCommand::bitrate_only(400));
    assert_eq!(commands[1], ReconfigCommand::bitrate_only(800));
    assert_eq!(commands[2].crf, Some(30));
    assert_eq!(commands[2].bitrate_kbps, None);

    shutdown.cancel();
    task.await.unwrap();
}

// ── Pipeline ─────────────────────────────────────────────────────

#[tokio::test]
async fn init_failure_is_reported_with_stage_and_phase() {
    let mut registry = StageRegistry::builtin();
    registry.register(StageKind::VideoEncoder, || {
        Box::new(FailingStage {
            kind: StageKind::VideoEncoder,
            phase: StagePhase::Init,
        })
    });
    let err = Pipeline::new(registry, loopback_settings())
        .launch()
        .err()
        .unwrap();

    match err {
        GaError::Stage { stage, phase, reason } => {
            assert_eq!(stage, StageKind::VideoEncoder);
            assert_eq!(phase, StagePhase::Init);
            assert!(reason.contains("device unavailable"));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn start_failure_is_reported_with_stage_and_phase() {
    let mut registry = StageRegistry::builtin();
    registry.register(StageKind::TransportServer, || {
        Box::new(FailingStage {
            kind: StageKind::TransportServer,
            phase: StagePhase::Start,
        })
    });
    let err = Pipeline::new(registry, loopback_settings())
        .launch()
        .err()
        .unwrap();
    assert_eq!(
        err.to_string(),
        "transport-server start failed: thread refused"
    );
}

#[tokio::test]
async fn builtin_pipeline_runs_and_accepts_reconfiguration() {
    let running = Pipeline::new(StageRegistry::builtin(), loopback_settings())
        .launch()
        .unwrap();

    let kinds = running.stage_kinds();
    assert_eq!(kinds.first(), Some(&StageKind::ControlReplay));
    assert_eq!(kinds.last(), Some(&StageKind::TransportServer));
    assert!(running.input_sender().is_some());
    assert!(running.rtt_source().unwrap().latest_rtt().is_unavailable());

    let encoder = running.encoder().unwrap();
    let ack = encoder
        .reconfigure(&ReconfigCommand::bitrate_only(1200))
        .unwrap();
    assert_eq!(ack.bitrate_kbps, 1200);
    assert_eq!(ack.buffer_size, 1200 * 5 / 30);

    let mut dispatcher = ControlDispatcher::for_pipeline(&running, BbrConfig::default()).unwrap();
    dispatcher.dispatch(&ControlMessage::BbrReport(BbrReport { rcvrate: 10 }));

    running.shutdown().await;
}

// ── Transport ────────────────────────────────────────────────────

#[tokio::test]
async fn transport_measures_rtt_from_feedback_echo() {
    let settings = loopback_settings();
    let mut pipes = PipeRegistry::new();
    let stream_tx = pipes.sender(&settings.pipes.stream);
    let shutdown = CancellationToken::new();

    let mut transport = TransportServer::new();
    transport
        .initialize(&mut StageContext {
            settings: &settings,
            pipes: &mut pipes,
            shutdown: shutdown.clone(),
        })
        .unwrap();
    let server_addr = transport.local_addr().unwrap();
    let rtt = transport.rtt_source().unwrap();
    let task = transport.start().unwrap();

    assert!(rtt.latest_rtt().is_unavailable());

    // Attach as the receiver.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"hello", server_addr).await.unwrap();

    // Keep sending until the server has registered us and a header arrives.
    let mut buf = [0u8; 2048];
    let header = loop {
        stream_tx
            .send(MediaUnit::Encoded(EncodedPacket {
                kind: MediaKind::Video,
                sequence: 0,
                width: 64,
                height: 48,
                is_keyframe: true,
                data: vec![7; 3000],
                timestamp: Instant::now(),
            }))
            .await
            .unwrap();
        match tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) if len == FrameHeader::SIZE => {
                break FrameHeader::decode(&buf[..len]).unwrap();
            }
            _ => continue,
        }
    };
    assert_eq!(header.total_chunks, 3);

    tokio::time::sleep(Duration::from_millis(5)).await;
    client
        .send_to(&feedback_datagram(header.timestamp_us), server_addr)
        .await
        .unwrap();

    wait_for(|| !rtt.latest_rtt().is_unavailable()).await;
    assert!(rtt.latest_rtt() >= RttFixed::from_millis(4));

    shutdown.cancel();
    task.await.unwrap();
}
