//! BBR-style congestion estimator.
//!
//! Consumes one bandwidth report per control round and yields a
//! multiplicative gain for the target bitrate.
//!
//! ```text
//! WaitingRtt ──► Startup ──► Drain ──► Probe ◄─┐
//!                                        └─────┘
//! ```
//!
//! `Probe` is the steady state. It backs off when the measured RTT rises
//! above `RTProp` and probes upward on a fixed interval otherwise.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::bbr::rtt::{RTT_WINDOW, RttFixed, RttSampleStore};

/// Startup gain: attempt to double the delivery rate each round.
pub const STARTUP_GAIN: f64 = 2.0;
/// Drain gain: inverse of the startup gain.
pub const DRAIN_GAIN: f64 = 0.5;
/// Gain applied when RTT inflation signals a standing queue.
pub const BACKOFF_GAIN: f64 = 0.75;
/// Gain applied on a periodic bandwidth probe.
pub const PROBE_GAIN: f64 = 1.25;
/// Gains this close to 1.0 are not worth a reconfiguration.
pub const GAIN_TOLERANCE: f64 = 0.1;
/// Slack so that the band edges 0.9 and 1.1 count as inside it.
const GAIN_EPSILON: f64 = 1e-9;

/// Default RTT inflation threshold over `RTProp` (5 ms).
pub const DEFAULT_RTT_INFLATION: RttFixed = RttFixed::from_millis(5);
/// Default interval between bandwidth probes in `Probe`.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_micros(4_000_000);

// ── BbrState ─────────────────────────────────────────────────────

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BbrState {
    /// No RTT measurement seen yet.
    #[default]
    WaitingRtt,
    /// Doubling until the receive rate plateaus.
    Startup,
    /// One round at the inverse gain to drain the startup queue.
    Drain,
    /// Steady state: congestion avoidance with periodic probing.
    Probe,
}

impl fmt::Display for BbrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BbrState::WaitingRtt => write!(f, "waiting-rtt"),
            BbrState::Startup => write!(f, "startup"),
            BbrState::Drain => write!(f, "drain"),
            BbrState::Probe => write!(f, "probe"),
        }
    }
}

// ── EstimatorConfig ──────────────────────────────────────────────

/// Tunables for [`CongestionEstimator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorConfig {
    /// `latest_rtt - RTProp` above this means the path is congested.
    pub rtt_inflation: RttFixed,
    /// Minimum time between upward probes while in `Probe`.
    pub probe_interval: Duration,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            rtt_inflation: DEFAULT_RTT_INFLATION,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

// ── Round ────────────────────────────────────────────────────────

/// Result of one estimator round, before the tolerance filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Round {
    /// State after the round.
    pub state: BbrState,
    /// Minimum RTT over the trailing window, including this sample.
    pub rt_prop: RttFixed,
    /// Raw gain computed this round.
    pub gain: f64,
}

impl Round {
    /// Whether the gain is far enough from 1.0 to act on. The band
    /// `[0.9, 1.1]` is inclusive.
    pub fn is_significant(&self) -> bool {
        (self.gain - 1.0).abs() > GAIN_TOLERANCE + GAIN_EPSILON
    }
}

// ── CongestionEstimator ──────────────────────────────────────────

/// BBR-like state machine driven by periodic receiver reports.
#[derive(Debug, Clone)]
pub struct CongestionEstimator {
    config: EstimatorConfig,
    state: BbrState,
    rtts: RttSampleStore,
    /// Receive rate seen one startup round ago.
    startup_prev1: u32,
    /// Receive rate seen two startup rounds ago.
    startup_prev2: u32,
    /// Last time a probe (or back-off) reset the probe timer.
    last_probe: Option<Instant>,
}

impl CongestionEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config,
            state: BbrState::WaitingRtt,
            rtts: RttSampleStore::new(),
            startup_prev1: 0,
            startup_prev2: 0,
            last_probe: None,
        }
    }

    /// Run one round and return the gain only if it is significant.
    ///
    /// `None` means no bitrate change: either the RTT is unavailable or
    /// the gain is within [`GAIN_TOLERANCE`] of 1.0.
    pub fn on_report(&mut self, latest_rtt: RttFixed, rcvrate: u32, now: Instant) -> Option<f64> {
        self.evaluate(latest_rtt, rcvrate, now)
            .filter(Round::is_significant)
            .map(|round| round.gain)
    }

    /// Run one round and return the raw outcome.
    ///
    /// Returns `None` without touching any state when `latest_rtt` is
    /// unavailable.
    pub fn evaluate(&mut self, latest_rtt: RttFixed, rcvrate: u32, now: Instant) -> Option<Round> {
        if !self.rtts.record(latest_rtt) {
            return None;
        }
        let rt_prop = self.rtts.min_over_window(RTT_WINDOW).unwrap_or(latest_rtt);

        debug!(
            target: "bbr",
            rtt = %latest_rtt,
            rt_prop = %rt_prop,
            rcvrate,
            state = %self.state,
            "bandwidth report"
        );

        let gain = match self.state {
            BbrState::WaitingRtt => {
                self.transition(BbrState::Startup);
                1.0
            }
            BbrState::Startup => {
                if self.startup_prev2 != 0 && self.is_plateau(rcvrate) {
                    self.transition(BbrState::Drain);
                }
                self.startup_prev2 = self.startup_prev1;
                self.startup_prev1 = rcvrate;
                STARTUP_GAIN
            }
            BbrState::Drain => {
                self.last_probe = Some(now);
                self.transition(BbrState::Probe);
                DRAIN_GAIN
            }
            BbrState::Probe => self.probe_gain(latest_rtt, rt_prop, now),
        };

        Some(Round {
            state: self.state,
            rt_prop,
            gain,
        })
    }

    pub fn state(&self) -> BbrState {
        self.state
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Current `RTProp` estimate, if any RTT has been recorded.
    pub fn rt_prop(&self) -> Option<RttFixed> {
        self.rtts.min_over_window(RTT_WINDOW)
    }

    /// Receive rates from the last two startup rounds, newest first.
    pub fn startup_history(&self) -> (u32, u32) {
        (self.startup_prev1, self.startup_prev2)
    }

    pub fn last_probe(&self) -> Option<Instant> {
        self.last_probe
    }

    pub fn rtt_samples(&self) -> &RttSampleStore {
        &self.rtts
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Less than 25% growth over the smaller of the two previous rounds.
    fn is_plateau(&self, rcvrate: u32) -> bool {
        let base = self.startup_prev2.min(self.startup_prev1) as u64;
        base * 5 / 4 > rcvrate as u64
    }

    fn probe_gain(&mut self, latest_rtt: RttFixed, rt_prop: RttFixed, now: Instant) -> f64 {
        if latest_rtt.saturating_sub(rt_prop) > self.config.rtt_inflation {
            self.last_probe = Some(now);
            return BACKOFF_GAIN;
        }

        let since_probe = self
            .last_probe
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if since_probe > self.config.probe_interval {
            info!(target: "bbr", "probing bandwidth");
            self.last_probe = Some(now);
            PROBE_GAIN
        } else {
            1.0
        }
    }

    fn transition(&mut self, next: BbrState) {
        info!(target: "bbr", from = %self.state, to = %next, "state transition");
        self.state = next;
    }
}

impl Default for CongestionEstimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────
