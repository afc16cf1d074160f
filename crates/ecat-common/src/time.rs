//! Cycle clock: converts wall-clock durations into tick counts.
//!
//! Every dwell in the drive sequence is configured in milliseconds and
//! turned into a tick count here, so stage lengths do not depend on the
//! chosen period.

use std::time::Duration;

/// Fixed-period clock shared by the cyclic worker and the drive sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleClock {
    period: Duration,
}

impl CycleClock {
    /// Create a clock; a zero period is clamped to 1µs.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_micros(1)),
        }
    }

    /// Create a clock from a period in milliseconds.
    #[must_use]
    pub fn from_millis(period_ms: u64) -> Self {
        Self::new(Duration::from_millis(period_ms))
    }

    /// The configured period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of whole ticks covered by `duration`.
    #[must_use]
    pub fn ticks_for(&self, duration: Duration) -> u64 {
        let ticks = duration.as_nanos() / self.period.as_nanos();
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Ticks that fit in `cap`, bounded by `wanted`.
    #[must_use]
    pub fn capped_ticks(&self, wanted: u64, cap: Duration) -> u64 {
        wanted.min(self.ticks_for(cap).max(1))
    }
}

impl Default for CycleClock {
    fn default() -> Self {
        Self::from_millis(2)
    }
}
