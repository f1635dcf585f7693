//! Roster-size driven scalability policy.

use common::types::ScalabilityPolicy;

/// Roster sizes at which the policy steps down.
pub const BAND_THRESHOLDS: [usize; 3] = [50, 100, 200];

/// Band index for a roster size: 0 below the first threshold, up to 3.
pub fn band_for(roster_size: usize) -> usize {
    BAND_THRESHOLDS
        .iter()
        .filter(|&&threshold| roster_size >= threshold)
        .count()
}

/// Policy for a roster of `roster_size` participants.
pub fn policy_for(roster_size: usize) -> ScalabilityPolicy {
    match band_for(roster_size) {
        0 => ScalabilityPolicy {
            max_video_streams: 25,
            audio_only_recommended: false,
            bandwidth_limit_kbps: 2500,
        },
        1 => ScalabilityPolicy {
            max_video_streams: 16,
            audio_only_recommended: false,
            bandwidth_limit_kbps: 1500,
        },
        2 => ScalabilityPolicy {
            max_video_streams: 9,
            audio_only_recommended: true,
            bandwidth_limit_kbps: 800,
        },
        _ => ScalabilityPolicy {
            max_video_streams: 4,
            audio_only_recommended: true,
            bandwidth_limit_kbps: 500,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_edges() {
        assert_eq!(band_for(0), 0);
        assert_eq!(band_for(49), 0);
        assert_eq!(band_for(50), 1);
        assert_eq!(band_for(99), 1);
        assert_eq!(band_for(100), 2);
        assert_eq!(band_for(199), 2);
        assert_eq!(band_for(200), 3);
        assert_eq!(band_for(5000), 3);
    }

    #[test]
    fn test_large_roster_recommends_audio_only() {
        let small = policy_for(10);
        let large = policy_for(120);
        assert!(!small.audio_only_recommended);
        assert!(large.audio_only_recommended);
        assert!(large.max_video_streams < small.max_video_streams);
        assert!(large.bandwidth_limit_kbps < small.bandwidth_limit_kbps);
    }

    #[test]
    fn test_policy_never_loosens_as_roster_grows() {
        let mut previous = policy_for(0);
        for size in [50, 100, 200, 300] {
            let next = policy_for(size);
            assert!(next.max_video_streams <= previous.max_video_streams);
            assert!(next.bandwidth_limit_kbps <= previous.bandwidth_limit_kbps);
            previous = next;
        }
    }
}
