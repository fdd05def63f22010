//! Round-trip-time samples and the ring buffer the estimator windows over.
//!
//! RTT values arrive from the transport layer as 16.16 fixed-point
//! seconds: one unit is 1/65536 s. A value of zero means the transport
//! has no measurement yet and is never stored.

use std::fmt;
use std::time::{Duration, SystemTime};

/// Number of samples the store can hold.
pub const RTT_CAPACITY: usize = 256;

/// Number of most-recent samples used for the `RTProp` estimate.
pub const RTT_WINDOW: usize = 80;

/// Units per second of [`RttFixed`].
pub const RTT_UNITS_PER_SEC: u64 = 65_536;

// ── RttFixed ─────────────────────────────────────────────────────

/// A round-trip time in units of 1/65536 second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RttFixed(pub u32);

impl RttFixed {
    /// "No measurement available".
    pub const UNAVAILABLE: RttFixed = RttFixed(0);

    /// Integer conversion, matching `ms * 65536 / 1000`, saturating at
    /// `u32::MAX` units.
    pub const fn from_millis(ms: u32) -> Self {
        let units = ms as u64 * RTT_UNITS_PER_SEC / 1000;
        if units > u32::MAX as u64 {
            RttFixed(u32::MAX)
        } else {
            RttFixed(units as u32)
        }
    }

    /// Convert a duration, saturating at `u32::MAX` units.
    pub fn from_duration(d: Duration) -> Self {
        let units = d.as_micros() * RTT_UNITS_PER_SEC as u128 / 1_000_000;
        RttFixed(units.min(u32::MAX as u128) as u32)
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_micros(self.0 as u64 * 1_000_000 / RTT_UNITS_PER_SEC)
    }

    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 * 1000.0 / RTT_UNITS_PER_SEC as f64
    }

    pub fn is_unavailable(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: RttFixed) -> RttFixed {
        RttFixed(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for RttFixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} ms", self.as_millis_f64())
    }
}

// ── RttSource ────────────────────────────────────────────────────

/// Query for the most recent RTT measured by the transport layer.
///
/// Returns [`RttFixed::UNAVAILABLE`] until a measurement exists.
pub trait RttSource: Send + Sync {
    fn latest_rtt(&self) -> RttFixed;
}

// ── RttSample ────────────────────────────────────────────────────

/// One recorded measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    /// Wall-clock time of insertion. Kept for time-based windowing even
    /// though the current policy windows by count.
    pub capture_time: SystemTime,
    pub rtt: RttFixed,
}

// ── RttSampleStore ───────────────────────────────────────────────

/// Fixed-capacity ring buffer of RTT samples.
///
/// Insertion overwrites the oldest slot once [`RTT_CAPACITY`] samples
/// are live. Only non-zero RTTs are ever stored.
#[derive(Debug, Clone)]
pub struct RttSampleStore {
    samples: Vec<RttSample>,
    /// Slot the next sample is written to.
    head: usize,
}

impl RttSampleStore {
    pub fn new() -> Self {
        Self {
            samples: Vec::with_capacity(RTT_CAPACITY),
            head: 0,
        }
    }

    /// Record `rtt` stamped with the current wall-clock time.
    ///
    /// Returns `false` (and stores nothing) for an unavailable RTT.
    pub fn record(&mut self, rtt: RttFixed) -> bool {
        self.record_at(rtt, SystemTime::now())
    }

    /// Record with an explicit timestamp (useful for testing).
    pub fn record_at(&mut self, rtt: RttFixed, capture_time: SystemTime) -> bool {
        if rtt.is_unavailable() {
            return false;
        }
        let sample = RttSample { capture_time, rtt };
        if self.samples.len() < RTT_CAPACITY {
            self.samples.push(sample);
        } else {
            self.samples[self.head] = sample;
        }
        self.head = (self.head + 1) % RTT_CAPACITY;
        true
    }

    /// Minimum RTT over the most recent `window` samples, bounded by the
    /// number of samples stored. `None` if the store is empty.
    pub fn min_over_window(&self, window: usize) -> Option<RttFixed> {
        self.iter_recent()
            .take(window)
            .map(|sample| sample.rtt)
            .min()
    }

    /// Samples from newest to oldest.
    pub fn iter_recent(&self) -> impl Iterator<Item = &RttSample> + '_ {
        let len = self.samples.len();
        (0..len).map(move |i| &self.samples[(self.head + RTT_CAPACITY - 1 - i) % RTT_CAPACITY])
    }

    /// Most recently recorded sample.
    pub fn latest(&self) -> Option<&RttSample> {
        self.iter_recent().next()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for RttSampleStore {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Brute-force reference: min over the last `window` of `history`.
    fn reference_min(history: &[u32], window: usize) -> Option<u32> {
        let n = history.len().min(RTT_CAPACITY).min(window);
        history[history.len() - n..].iter().copied().min()
    }

    #[test]
    fn fixed_point_conversions() {
        assert_eq!(RttFixed::from_millis(5).0, 327);
        assert_eq!(RttFixed::from_millis(20).0, 1310);
        assert_eq!(RttFixed::from_millis(1000).0, 65_536);
        assert_eq!(
            RttFixed::from_duration(Duration::from_secs(1)),
            RttFixed(65_536)
        );
        assert_eq!(RttFixed(65_536).as_duration(), Duration::from_secs(1));
    }

    #[test]
    fn huge_millis_saturate() {
        assert_eq!(RttFixed::from_millis(65_535_999).0, 4_294_967_230);
        assert_eq!(RttFixed::from_millis(65_536_000), RttFixed(u32::MAX));
        assert_eq!(RttFixed::from_millis(u32::MAX), RttFixed(u32::MAX));
    }

    #[test]
    fn empty_store_has_no_minimum() {
        let store = RttSampleStore::new();
        assert!(store.is_empty());
        assert_eq!(store.min_over_window(RTT_WINDOW), None);
    }

    #[test]
    fn zero_is_never_recorded() {
        let mut store = RttSampleStore::new();
        assert!(!store.record(RttFixed::UNAVAILABLE));
        assert!(store.is_empty());

        store.record(RttFixed(500));
        assert!(!store.record(RttFixed(0)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.min_over_window(RTT_WINDOW), Some(RttFixed(500)));
    }

    #[test]
    fn minimum_scans_every_slot_in_window() {
        let mut store = RttSampleStore::new();
        // Minimum sits in the middle, not at the newest slot.
        for rtt in [900, 300, 700, 800] {
            store.record(RttFixed(rtt));
        }
        assert_eq!(store.min_over_window(RTT_WINDOW), Some(RttFixed(300)));
        assert_eq!(store.latest().map(|s| s.rtt), Some(RttFixed(800)));
    }

    #[test]
    fn old_minimum_leaves_the_window() {
        let mut store = RttSampleStore::new();
        store.record(RttFixed(10));
        for _ in 0..RTT_WINDOW {
            store.record(RttFixed(1000));
        }
        assert_eq!(store.min_over_window(RTT_WINDOW), Some(RttFixed(1000)));
        // Still visible with a wider window.
        assert_eq!(store.min_over_window(RTT_WINDOW + 1), Some(RttFixed(10)));
    }

    #[test]
    fn wraps_at_capacity() {
        let mut store = RttSampleStore::new();
        for i in 1..=(RTT_CAPACITY as u32 + 10) {
            store.record(RttFixed(i));
        }
        assert_eq!(store.len(), RTT_CAPACITY);
        assert_eq!(store.latest().map(|s| s.rtt), Some(RttFixed(RTT_CAPACITY as u32 + 10)));
        // Oldest surviving sample is 11.
        assert_eq!(store.min_over_window(usize::MAX), Some(RttFixed(11)));
        assert_eq!(
            store.min_over_window(RTT_WINDOW),
            Some(RttFixed(RTT_CAPACITY as u32 + 10 - RTT_WINDOW as u32 + 1))
        );
    }

    #[test]
    fn matches_reference_over_pseudo_random_history() {
        let mut store = RttSampleStore::new();
        let mut history = Vec::new();
        let mut x: u32 = 0x1234_5678;
        for _ in 0..1000 {
            // xorshift32
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            let rtt = x % 5000;
            if store.record(RttFixed(rtt)) {
                history.push(rtt);
            }
            for window in [1, 7, RTT_WINDOW, RTT_CAPACITY] {
                assert_eq!(
                    store.min_over_window(window).map(|r| r.0),
                    reference_min(&history, window),
                );
            }
        }
        assert!(history.iter().all(|&r| r != 0));
    }
}
