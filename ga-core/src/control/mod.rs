//! Control-message dispatch.
//!
//! Every decoded [`ControlMessage`] goes through a [`ControlDispatcher`],
//! which routes it by subtype to one registered [`ControlHandler`].
//! Handlers run synchronously on the control task. An error from a
//! handler is logged and swallowed: one bad message never stops the
//! control loop.
//!
//! | Subtype      | Handler              | Effect                               |
//! |--------------|----------------------|--------------------------------------|
//! | `NetReport`  | [`NetReportHandler`] | logs receiver statistics             |
//! | `Reconfig`   | [`ReconfigHandler`]  | forwards an explicit encoder change  |
//! | `BbrReport`  | [`BbrReportHandler`] | runs one BBR round, maybe sets bitrate |

pub mod server;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::bbr::{BbrConfig, BbrController, RttSource};
use crate::error::GaError;
use crate::message::{BbrReport, ControlMessage, ControlSubtype, NetReport, ReconfigRequest};
use crate::pipeline::RunningPipeline;
use crate::reconfig::{ReconfigCommand, ReconfigDispatcher};

pub use server::ControlServer;

// ── ControlHandler ───────────────────────────────────────────────

/// Handler for one control subtype.
pub trait ControlHandler: Send {
    fn handle(&mut self, msg: &ControlMessage) -> Result<(), GaError>;
}

fn unexpected(handler: &str, msg: &ControlMessage) -> GaError {
    GaError::Other(format!("{handler} cannot handle {} message", msg.subtype()))
}

// ── NetReportHandler ─────────────────────────────────────────────

/// Receiver statistics derived from a [`NetReport`].
///
/// Ratios with a zero denominator are reported as `0.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetStats {
    pub capacity_kbps: f64,
    pub loss_percent: f64,
    /// Packets per frame.
    pub overhead: f64,
    pub kbytes: u32,
    pub seconds: f64,
    pub kbytes_per_sec: f64,
}

impl NetStats {
    pub fn from_report(r: &NetReport) -> Self {
        let ratio = |num: f64, den: f64| if den == 0.0 { 0.0 } else { num / den };
        let seconds = r.duration as f64 / 1_000_000.0;
        Self {
            capacity_kbps: r.capacity as f64 / 1024.0,
            loss_percent: 100.0 * ratio(r.pktloss as f64, r.pktcount as f64),
            overhead: ratio(r.pktcount as f64, r.framecount as f64),
            kbytes: r.bytecount / 1024,
            seconds,
            kbytes_per_sec: ratio(r.bytecount as f64 / 1024.0, seconds),
        }
    }
}

/// Logs network reports. Has no other effect.
#[derive(Debug, Default)]
pub struct NetReportHandler;

impl ControlHandler for NetReportHandler {
    fn handle(&mut self, msg: &ControlMessage) -> Result<(), GaError> {
        let ControlMessage::NetReport(report) = msg else {
            return Err(unexpected("net-report handler", msg));
        };
        let s = NetStats::from_report(report);
        info!(
            "net-report: capacity={:.3} Kbps; loss-rate={:.2}% ({}/{}); overhead={:.2} [{} KB received in {:.3}s ({:.2}KB/s)]",
            s.capacity_kbps,
            s.loss_percent,
            report.pktloss,
            report.pktcount,
            s.overhead,
            s.kbytes,
            s.seconds,
            s.kbytes_per_sec,
        );
        Ok(())
    }
}

// ── ReconfigHandler ──────────────────────────────────────────────

/// Forwards explicit client reconfiguration requests to the encoder.
#[derive(Debug)]
pub struct ReconfigHandler {
    reconfig: ReconfigDispatcher,
}

impl ReconfigHandler {
    pub fn new(reconfig: ReconfigDispatcher) -> Self {
        Self { reconfig }
    }

    fn apply(&self, req: &ReconfigRequest) -> Result<(), GaError> {
        let cmd = ReconfigCommand::from_request(req);
        if cmd.is_empty() {
            info!(id = cmd.id, "reconfig request changes nothing, forwarding anyway");
        }
        // Failure is already logged by the dispatcher; it is not fatal.
        let _ = self.reconfig.deliver(cmd);
        Ok(())
    }
}

impl ControlHandler for ReconfigHandler {
    fn handle(&mut self, msg: &ControlMessage) -> Result<(), GaError> {
        match msg {
            ControlMessage::Reconfig(req) => self.apply(req),
            other => Err(unexpected("reconfig handler", other)),
        }
    }
}

// ── BbrReportHandler ─────────────────────────────────────────────

/// Runs the BBR controller on each bandwidth report.
///
/// The RTT is pulled from the transport when the report is handled, not
/// carried in the report itself.
pub struct BbrReportHandler {
    controller: BbrController,
    rtt: Arc<dyn RttSource>,
    reconfig: ReconfigDispatcher,
}

impl BbrReportHandler {
    pub fn new(config: BbrConfig, rtt: Arc<dyn RttSource>, reconfig: ReconfigDispatcher) -> Self {
        Self {
            controller: BbrController::new(config),
            rtt,
            reconfig,
        }
    }

    /// Handle one report at an explicit time (useful for testing).
    pub fn on_report(&mut self, report: &BbrReport, now: Instant) {
        let latest = self.rtt.latest_rtt();
        if let Some(kbps) = self.controller.on_report(latest, report.rcvrate, now) {
            let _ = self.reconfig.set_bitrate(kbps);
        }
    }

    pub fn controller(&self) -> &BbrController {
        &self.controller
    }
}

impl ControlHandler for BbrReportHandler {
    fn handle(&mut self, msg: &ControlMessage) -> Result<(), GaError> {
        match msg {
            ControlMessage::BbrReport(report) => {
                self.on_report(report, Instant::now());
                Ok(())
            }
            other => Err(unexpected("bbr handler", other)),
        }
    }
}

// ── ControlDispatcher ────────────────────────────────────────────

/// Routes control messages to their handlers.
#[derive(Default)]
pub struct ControlDispatcher {
    handlers: HashMap<ControlSubtype, Box<dyn ControlHandler>>,
}

impl ControlDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with the net-report, reconfig and BBR handlers.
    pub fn with_default_handlers(
        reconfig: ReconfigDispatcher,
        rtt: Arc<dyn RttSource>,
        bbr: BbrConfig,
    ) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(ControlSubtype::NetReport, Box::new(NetReportHandler));
        dispatcher.register(
            ControlSubtype::Reconfig,
            Box::new(ReconfigHandler::new(reconfig.clone())),
        );
        dispatcher.register(
            ControlSubtype::BbrReport,
            Box::new(BbrReportHandler::new(bbr, rtt, reconfig)),
        );
        dispatcher
    }

    /// Default handlers wired to a running pipeline's encoder and
    /// transport.
    pub fn for_pipeline(pipeline: &RunningPipeline, bbr: BbrConfig) -> Result<Self, GaError> {
        let encoder = pipeline
            .encoder()
            .ok_or_else(|| GaError::Other("pipeline has no reconfigurable video encoder".into()))?;
        let rtt = pipeline
            .rtt_source()
            .ok_or_else(|| GaError::Other("pipeline has no RTT source".into()))?;
        Ok(Self::with_default_handlers(
            ReconfigDispatcher::new(encoder),
            rtt,
            bbr,
        ))
    }

    /// Install `handler` for `subtype`, replacing any previous one.
    pub fn register(&mut self, subtype: ControlSubtype, handler: Box<dyn ControlHandler>) {
        self.handlers.insert(subtype, handler);
    }

    /// Route `msg` to its handler. Never fails.
    pub fn dispatch(&mut self, msg: &ControlMessage) {
        let subtype = msg.subtype();
        match self.handlers.get_mut(&subtype) {
            Some(handler) => {
                if let Err(e) = handler.handle(msg) {
                    warn!(%subtype, "control handler failed: {e}");
                }
            }
            None => debug!(%subtype, "no handler registered"),
        }
    }

    pub fn handles(&self, subtype: ControlSubtype) -> bool {
        self.handlers.contains_key(&subtype)
    }
}

// ── Tests ────────────────────────────────────────────────────────
