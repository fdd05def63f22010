//! Target bitrate bookkeeping.
//!
//! The governor is the single writer of the target bitrate. Each gain is
//! applied to the previous *clamped* value, so a gain that would leave
//! the bounds is truncated, never rejected.

/// Lowest bitrate the governor will ever target (kbps).
pub const BITRATE_MIN_KBPS: u32 = 50;
/// Highest bitrate the governor will ever target (kbps).
pub const BITRATE_MAX_KBPS: u32 = 30_000;
/// Bitrate before the first gain is applied (kbps).
pub const DEFAULT_INITIAL_BITRATE_KBPS: u32 = 200;

/// Applies gains to the current target bitrate within fixed bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitrateGovernor {
    bitrate_kbps: u32,
    min_kbps: u32,
    max_kbps: u32,
}

impl BitrateGovernor {
    /// Governor with the default bounds, starting at `initial_kbps`
    /// (clamped into range).
    pub fn new(initial_kbps: u32) -> Self {
        Self::with_bounds(initial_kbps, BITRATE_MIN_KBPS, BITRATE_MAX_KBPS)
    }

    /// Governor with explicit bounds. `min_kbps` must not exceed `max_kbps`;
    /// if it does, the bounds are swapped.
    pub fn with_bounds(initial_kbps: u32, min_kbps: u32, max_kbps: u32) -> Self {
        let (min_kbps, max_kbps) = if min_kbps <= max_kbps {
            (min_kbps, max_kbps)
        } else {
            (max_kbps, min_kbps)
        };
        let mut governor = Self {
            bitrate_kbps: min_kbps,
            min_kbps,
            max_kbps,
        };
        governor.bitrate_kbps = governor.clamp(initial_kbps);
        governor
    }

    /// Multiply the current bitrate by `gain`, clamp, store and return it.
    pub fn apply_gain(&mut self, gain: f64) -> u32 {
        let scaled = self.bitrate_kbps as f64 * gain;
        // `as` saturates: NaN → 0, +inf → u32::MAX, negatives → 0.
        self.bitrate_kbps = self.clamp(scaled as u32);
        self.bitrate_kbps
    }

    /// Clamp `kbps` into the governor's bounds.
    pub fn clamp(&self, kbps: u32) -> u32 {
        kbps.clamp(self.min_kbps, self.max_kbps)
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate_kbps
    }

    pub fn bounds(&self) -> (u32, u32) {
        (self.min_kbps, self.max_kbps)
    }
}

impl Default for BitrateGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_BITRATE_KBPS)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubling_caps_at_maximum_without_overshoot() {
        let mut gov = BitrateGovernor::new(200);
        let mut seen = Vec::new();
        for _ in 0..10 {
            let kbps = gov.apply_gain(2.0);
            assert!(kbps <= BITRATE_MAX_KBPS);
            seen.push(kbps);
        }
        assert_eq!(
            seen,
            vec![400, 800, 1600, 3200, 6400, 12_800, 25_600, 30_000, 30_000, 30_000]
        );
        assert_eq!(gov.bitrate_kbps(), 30_000);
    }

    #[test]
    fn clamp_base_carries_into_next_round() {
        let mut gov = BitrateGovernor::new(25_600);
        assert_eq!(gov.apply_gain(2.0), 30_000);
        // Next multiplication starts from the clamped value.
        assert_eq!(gov.apply_gain(0.5), 15_000);
    }

    #[test]
    fn floors_at_minimum() {
        let mut gov = BitrateGovernor::new(200);
        for _ in 0..20 {
            assert!(gov.apply_gain(0.5) >= BITRATE_MIN_KBPS);
        }
        assert_eq!(gov.bitrate_kbps(), BITRATE_MIN_KBPS);
    }

    #[test]
    fn truncates_fractional_results() {
        let mut gov = BitrateGovernor::new(201);
        assert_eq!(gov.apply_gain(0.75), 150);
        assert_eq!(gov.apply_gain(1.25), 187);
    }

    #[test]
    fn extreme_gains_stay_in_bounds() {
        for gain in [0.0, -3.0, 1e12, f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let mut gov = BitrateGovernor::default();
            let kbps = gov.apply_gain(gain);
            assert!((BITRATE_MIN_KBPS..=BITRATE_MAX_KBPS).contains(&kbps), "gain {gain}");
        }
    }

    #[test]
    fn clamp_is_idempotent() {
        let gov = BitrateGovernor::default();
        for v in [0, 49, 50, 200, 30_000, 30_001, u32::MAX] {
            let once = gov.clamp(v);
            assert_eq!(gov.clamp(once), once);
        }
    }

    #[test]
    fn initial_value_is_clamped() {
        assert_eq!(BitrateGovernor::new(10).bitrate_kbps(), BITRATE_MIN_KBPS);
        assert_eq!(BitrateGovernor::new(90_000).bitrate_kbps(), BITRATE_MAX_KBPS);
        assert_eq!(BitrateGovernor::with_bounds(500, 1000, 100).bounds(), (100, 1000));
    }
}
