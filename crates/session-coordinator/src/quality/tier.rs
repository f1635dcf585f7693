//! Quality tier state machine for one video producer.

use common::types::QualityTier;

/// Fraction of the current tier's target below which a sample counts
/// toward a downgrade.
pub const DOWNGRADE_FACTOR: f64 = 0.7;

/// Fraction of the current tier's target above which a sample counts
/// toward an upgrade.
pub const UPGRADE_FACTOR: f64 = 1.2;

/// Consecutive samples required before changing tier.
pub const CONSECUTIVE_SAMPLES: u32 = 2;

/// A tier change decided by [`TierController::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierChange {
    pub from: QualityTier,
    pub to: QualityTier,
}

impl TierChange {
    /// `up` or `down`, for the tier change metric.
    pub fn direction(&self) -> &'static str {
        if self.to > self.from {
            "up"
        } else {
            "down"
        }
    }
}

/// Two-sample hysteresis over observed bitrate.
///
/// A sample inside the neutral band resets both streaks. An upgrade also
/// requires the bitrate to sit above the next tier's downgrade line, so a
/// link that cannot sustain the higher tier does not bounce between two
/// adjacent tiers. This is stricter than upgrading on 1.2× of the current
/// target alone: with the 150/500/1200 kbps targets, a low-tier link must
/// reach 350 kbps, not 180 kbps, before it is promoted to medium.
#[derive(Debug, Clone)]
pub struct TierController {
    tier: QualityTier,
    below: u32,
    above: u32,
}

impl Default for TierController {
    fn default() -> Self {
        Self::new(QualityTier::High)
    }
}

impl TierController {
    pub fn new(initial: QualityTier) -> Self {
        Self {
            tier: initial,
            below: 0,
            above: 0,
        }
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    /// Feed one bitrate sample. Returns the change, if this sample caused one.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe(&mut self, bitrate_bps: u64) -> Option<TierChange> {
        let observed = bitrate_bps as f64;
        let target = self.tier.target_bitrate_bps() as f64;

        if observed < target * DOWNGRADE_FACTOR {
            self.above = 0;
            self.below += 1;
            if self.below >= CONSECUTIVE_SAMPLES {
                return self.shift(self.tier.lower());
            }
        } else if observed > target * UPGRADE_FACTOR && self.sustains_next_tier(observed) {
            self.below = 0;
            self.above += 1;
            if self.above >= CONSECUTIVE_SAMPLES {
                return self.shift(self.tier.higher());
            }
        } else {
            self.below = 0;
            self.above = 0;
        }
        None
    }

    #[allow(clippy::cast_precision_loss)]
    fn sustains_next_tier(&self, observed: f64) -> bool {
        self.tier.higher().is_some_and(|next| {
            observed >= next.target_bitrate_bps() as f64 * DOWNGRADE_FACTOR
        })
    }

    fn shift(&mut self, next: Option<QualityTier>) -> Option<TierChange> {
        self.below = 0;
        self.above = 0;
        let to = next?;
        let from = self.tier;
        self.tier = to;
        Some(TierChange { from, to })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_downgrade_needs_two_consecutive_low_samples() {
        let mut tier = TierController::default();
        // 0.7 * 1.2 Mbps = 840 kbps
        assert_eq!(tier.observe(800_000), None);
        let change = tier.observe(800_000).unwrap();
        assert_eq!(change.from, QualityTier::High);
        assert_eq!(change.to, QualityTier::Medium);
        assert_eq!(change.direction(), "down");
        assert_eq!(tier.tier(), QualityTier::Medium);
    }

    #[test]
    fn test_neutral_sample_resets_streak() {
        let mut tier = TierController::default();
        assert_eq!(tier.observe(500_000), None);
        assert_eq!(tier.observe(1_000_000), None);
        assert_eq!(tier.observe(500_000), None);
        assert_eq!(tier.tier(), QualityTier::High);
    }

    #[test]
    fn test_upgrade_needs_two_consecutive_high_samples() {
        let mut tier = TierController::new(QualityTier::Medium);
        // Above 1.2 * 500k and above 0.7 * 1.2M
        assert_eq!(tier.observe(900_000), None);
        let change = tier.observe(900_000).unwrap();
        assert_eq!(change.to, QualityTier::High);
        assert_eq!(change.direction(), "up");
    }

    #[test]
    fn test_marginal_link_does_not_oscillate() {
        let mut tier = TierController::new(QualityTier::Low);
        // 250 kbps exceeds 1.2 * 150k but would sit below medium's
        // downgrade line, so no upgrade happens
        for _ in 0..10 {
            assert_eq!(tier.observe(250_000), None);
        }
        assert_eq!(tier.tier(), QualityTier::Low);
    }

    #[test]
    fn test_tier_is_clamped_at_the_ends() {
        let mut top = TierController::new(QualityTier::High);
        for _ in 0..4 {
            assert_eq!(top.observe(5_000_000), None);
        }
        assert_eq!(top.tier(), QualityTier::High);

        let mut bottom = TierController::new(QualityTier::Low);
        for _ in 0..4 {
            assert_eq!(bottom.observe(0), None);
        }
        assert_eq!(bottom.tier(), QualityTier::Low);
    }
}
