//! Trust policy: maps a session's age to a baseline pacing profile. Used
//! both as the startup default for a session consumer's pacer and as the
//! ceiling SmartGuard will never exceed.

use crate::pacer::PacerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustLevel {
    pub level: u8,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub rpm: u32,
}

const LEVELS: [TrustLevel; 4] = [
    TrustLevel { level: 1, min_delay_ms: 20_000, max_delay_ms: 40_000, rpm: 3 },
    TrustLevel { level: 2, min_delay_ms: 10_000, max_delay_ms: 15_000, rpm: 5 },
    TrustLevel { level: 3, min_delay_ms: 5_000, max_delay_ms: 8_000, rpm: 10 },
    TrustLevel { level: 4, min_delay_ms: 2_000, max_delay_ms: 4_000, rpm: 20 },
];

/// Resolve the trust level for a session given its age in days.
pub fn level_for_age_days(age_days: f64) -> TrustLevel {
    if age_days < 3.0 {
        LEVELS[0]
    } else if age_days < 7.0 {
        LEVELS[1]
    } else if age_days < 14.0 {
        LEVELS[2]
    } else {
        LEVELS[3]
    }
}

/// Resolve the trust level for a session given its `createdAt` (epoch ms)
/// and the current time (epoch ms).
pub fn level_for_created_at(created_at_ms: i64, now_ms: i64) -> TrustLevel {
    let age_days = (now_ms - created_at_ms).max(0) as f64 / 86_400_000.0;
    level_for_age_days(age_days)
}

impl TrustLevel {
    pub fn pacer_defaults(&self, burst_limit: u32, burst_cooldown_ms: u64) -> PacerConfig {
        PacerConfig {
            min_delay_ms: self.min_delay_ms,
            max_delay_ms: self.max_delay_ms,
            rpm: None,
            burst_limit,
            burst_cooldown_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_1_for_brand_new_session() {
        let level = level_for_age_days(0.5);
        assert_eq!(level.level, 1);
        assert_eq!(level.rpm, 3);
    }

    #[test]
    fn level_4_for_mature_session() {
        let level = level_for_age_days(30.0);
        assert_eq!(level.level, 4);
        assert_eq!(level.rpm, 20);
    }

    #[test]
    fn boundaries_are_exclusive_on_the_upper_edge() {
        assert_eq!(level_for_age_days(2.999).level, 1);
        assert_eq!(level_for_age_days(3.0).level, 2);
        assert_eq!(level_for_age_days(6.999).level, 2);
        assert_eq!(level_for_age_days(7.0).level, 3);
        assert_eq!(level_for_age_days(13.999).level, 3);
        assert_eq!(level_for_age_days(14.0).level, 4);
    }

    #[test]
    fn level_for_created_at_uses_age_in_days() {
        let now = 14 * 86_400_000;
        let level = level_for_created_at(0, now);
        assert_eq!(level.level, 4);
    }
}
