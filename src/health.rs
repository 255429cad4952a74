use serde::{Deserialize, Serialize};

use crate::types::{elapsed_since, TimeUs};

/// Aiding sensors tracked for staleness and faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AidingSource {
    Baro,
    Gps,
    Range,
    Vision,
    OpticalFlow,
    Mag,
    Airspeed,
}

impl AidingSource {
    pub const ALL: [AidingSource; 7] = [
        AidingSource::Baro,
        AidingSource::Gps,
        AidingSource::Range,
        AidingSource::Vision,
        AidingSource::OpticalFlow,
        AidingSource::Mag,
        AidingSource::Airspeed,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Baro => "Baro",
            Self::Gps => "GPS",
            Self::Range => "Range",
            Self::Vision => "Vision",
            Self::OpticalFlow => "Flow",
            Self::Mag => "Mag",
            Self::Airspeed => "Airspeed",
        }
    }
}

/// Fusion bookkeeping for a single source
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub last_fusion_us: Option<TimeUs>,
    pub last_failure_us: Option<TimeUs>,
    pub faulty: bool,
}

impl SourceHealth {
    pub fn time_since_fusion(&self, now: TimeUs) -> TimeUs {
        elapsed_since(now, self.last_fusion_us)
    }

    pub fn time_since_failure(&self, now: TimeUs) -> TimeUs {
        elapsed_since(now, self.last_failure_us)
    }

    /// True once `cooldown_us` has passed since the last recorded failure.
    pub fn can_retry(&self, now: TimeUs, cooldown_us: TimeUs) -> bool {
        self.time_since_failure(now) > cooldown_us
    }
}

/// Per-source health plus the per-channel fusion clocks.
///
/// The estimator core reports fusion outcomes here; the controllers read the
/// elapsed times to detect timeouts and restart the clocks after a reset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StalenessTracker {
    sources: [SourceHealth; 7],
    pub last_pos_fuse_us: Option<TimeUs>,
    pub last_vel_fuse_us: Option<TimeUs>,
    pub last_hgt_fuse_us: Option<TimeUs>,
    pub last_hagl_fuse_us: Option<TimeUs>,
    pub last_bad_vert_accel_us: Option<TimeUs>,
}

impl StalenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(&self, source: AidingSource) -> &SourceHealth {
        &self.sources[source.index()]
    }

    pub fn source_mut(&mut self, source: AidingSource) -> &mut SourceHealth {
        &mut self.sources[source.index()]
    }

    pub fn record_fusion(&mut self, source: AidingSource, now: TimeUs) {
        self.source_mut(source).last_fusion_us = Some(now);
    }

    pub fn record_failure(&mut self, source: AidingSource, now: TimeUs) {
        self.source_mut(source).last_failure_us = Some(now);
    }

    pub fn is_faulty(&self, source: AidingSource) -> bool {
        self.source(source).faulty
    }

    pub fn set_faulty(&mut self, source: AidingSource, faulty: bool) {
        self.source_mut(source).faulty = faulty;
    }

    pub fn time_since_pos_fuse(&self, now: TimeUs) -> TimeUs {
        elapsed_since(now, self.last_pos_fuse_us)
    }

    pub fn time_since_vel_fuse(&self, now: TimeUs) -> TimeUs {
        elapsed_since(now, self.last_vel_fuse_us)
    }

    pub fn time_since_hgt_fuse(&self, now: TimeUs) -> TimeUs {
        elapsed_since(now, self.last_hgt_fuse_us)
    }

    pub fn time_since_hagl_fuse(&self, now: TimeUs) -> TimeUs {
        elapsed_since(now, self.last_hagl_fuse_us)
    }

    pub fn time_since_bad_vert_accel(&self, now: TimeUs) -> TimeUs {
        elapsed_since(now, self.last_bad_vert_accel_us)
    }

    /// Restart the horizontal position and velocity timeout clocks.
    pub fn restart_pos_vel_clocks(&mut self, now: TimeUs) {
        self.last_pos_fuse_us = Some(now);
        self.last_vel_fuse_us = Some(now);
    }

    /// Sources currently carrying a fault mark.
    pub fn faulty_sources(&self) -> Vec<AidingSource> {
        AidingSource::ALL
            .iter()
            .copied()
            .filter(|s| self.is_faulty(*s))
            .collect()
    }

    /// Format health status for logging
    pub fn format_status(&self, now: TimeUs) -> String {
        let parts: Vec<String> = AidingSource::ALL
            .iter()
            .map(|s| {
                let health = self.source(*s);
                let fused = match health.last_fusion_us {
                    Some(_) => format!("{:.1}s", health.time_since_fusion(now) as f64 * 1e-6),
                    None => "never".to_string(),
                };
                let mark = if health.faulty { "✗" } else { "✓" };
                format!("{} {} ({})", s.name(), mark, fused)
            })
            .collect();
        format!("Health: {}", parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_fused_is_infinitely_stale() {
        let tracker = StalenessTracker::new();
        assert_eq!(
            tracker.source(AidingSource::Baro).time_since_fusion(1_000),
            TimeUs::MAX
        );
        assert_eq!(tracker.time_since_hgt_fuse(0), TimeUs::MAX);
    }

    #[test]
    fn test_failure_cooldown() {
        let mut tracker = StalenessTracker::new();
        assert!(tracker.source(AidingSource::Gps).can_retry(0, 5_000_000));

        tracker.record_failure(AidingSource::Gps, 1_000_000);
        let gps = tracker.source(AidingSource::Gps);
        assert!(!gps.can_retry(3_000_000, 5_000_000));
        assert!(!gps.can_retry(6_000_000, 5_000_000));
        assert!(gps.can_retry(6_000_001, 5_000_000));
    }

    #[test]
    fn test_fault_marks() {
        let mut tracker = StalenessTracker::new();
        tracker.set_faulty(AidingSource::Baro, true);
        tracker.set_faulty(AidingSource::Range, true);
        tracker.set_faulty(AidingSource::Range, false);

        assert_eq!(tracker.faulty_sources(), vec![AidingSource::Baro]);
        let status = tracker.format_status(0);
        assert!(status.contains("Baro ✗"));
        assert!(status.contains("GPS ✓"));
    }

    #[test]
    fn test_restart_pos_vel_clocks() {
        let mut tracker = StalenessTracker::new();
        tracker.restart_pos_vel_clocks(2_000);
        assert_eq!(tracker.time_since_pos_fuse(2_500), 500);
        assert_eq!(tracker.time_since_vel_fuse(2_500), 500);
    }
}
