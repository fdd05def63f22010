//! # bbr: adaptive bitrate from receiver feedback
//!
//! | Module      | Purpose                                             |
//! |-------------|-----------------------------------------------------|
//! | `rtt`       | Fixed-point RTT values and the sample ring buffer   |
//! | `estimator` | BBR-style state machine producing per-round gains   |
//! | `governor`  | Applies gains to the target bitrate within bounds   |
//!
//! [`BbrController`] bundles the estimator and governor into the one
//! object owned by the control-message handler.

pub mod estimator;
pub mod governor;
pub mod rtt;

use std::time::{Duration, Instant};

use tracing::debug;

pub use estimator::{BbrState, CongestionEstimator, EstimatorConfig, Round};
pub use governor::{BITRATE_MAX_KBPS, BITRATE_MIN_KBPS, BitrateGovernor};
pub use rtt::{RTT_CAPACITY, RTT_WINDOW, RttFixed, RttSample, RttSampleStore, RttSource};

// ── BbrConfig ────────────────────────────────────────────────────

/// Configuration for a [`BbrController`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BbrConfig {
    /// Bitrate before the first gain is applied (kbps).
    pub initial_bitrate_kbps: u32,
    /// RTT inflation over `RTProp` that triggers a back-off.
    pub rtt_inflation: RttFixed,
    /// Minimum time between upward probes in steady state.
    pub probe_interval: Duration,
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self {
            initial_bitrate_kbps: governor::DEFAULT_INITIAL_BITRATE_KBPS,
            rtt_inflation: estimator::DEFAULT_RTT_INFLATION,
            probe_interval: estimator::DEFAULT_PROBE_INTERVAL,
        }
    }
}

// ── BbrController ────────────────────────────────────────────────

/// Congestion estimator plus bitrate governor.
///
/// Mutated only from the control-message task; no interior locking.
#[derive(Debug, Clone)]
pub struct BbrController {
    estimator: CongestionEstimator,
    governor: BitrateGovernor,
}

impl BbrController {
    pub fn new(config: BbrConfig) -> Self {
        Self {
            estimator: CongestionEstimator::new(EstimatorConfig {
                rtt_inflation: config.rtt_inflation,
                probe_interval: config.probe_interval,
            }),
            governor: BitrateGovernor::new(config.initial_bitrate_kbps),
        }
    }

    /// Handle one bandwidth report.
    ///
    /// Returns the new target bitrate when the round produced a
    /// significant gain, `None` when nothing should be sent downstream.
    pub fn on_report(&mut self, latest_rtt: RttFixed, rcvrate: u32, now: Instant) -> Option<u32> {
        let gain = self.estimator.on_report(latest_rtt, rcvrate, now)?;
        let kbps = self.governor.apply_gain(gain);
        debug!(target: "bbr", gain, bitrate_kbps = kbps, "gain applied");
        Some(kbps)
    }

    pub fn state(&self) -> BbrState {
        self.estimator.state()
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.governor.bitrate_kbps()
    }

    pub fn estimator(&self) -> &CongestionEstimator {
        &self.estimator
    }

    pub fn governor(&self) -> &BitrateGovernor {
        &self.governor
    }
}

impl Default for BbrController {
    fn default() -> Self {
        Self::new(BbrConfig::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────
