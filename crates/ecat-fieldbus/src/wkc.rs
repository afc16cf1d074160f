//! Working counter monitoring.
//!
//! Every exchange returns a working counter. Comparing it with the expected
//! value tells whether all slaves processed the frame; a missing frame is
//! reported as [`WKC_NO_FRAME`].

use crate::master::WKC_NO_FRAME;
use serde::Serialize;
use tracing::{info, warn};

/// Classification of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WkcClass {
    /// Working counter reached the expected value.
    Success,
    /// Frame returned but not every slave processed it.
    Degraded,
    /// No frame returned within the receive timeout.
    Timeout,
}

/// Immutable working counter statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WkcStats {
    /// Cycles with `actual >= expected`.
    pub success: u64,
    /// Cycles with `actual < expected`.
    pub degraded: u64,
    /// Cycles without a returned frame.
    pub timeout: u64,
    /// Last observed working counter.
    pub last_wkc: i32,
    /// Expected working counter at the last observation.
    pub expected_wkc: u16,
    /// Current run of non-success cycles.
    pub consecutive_failures: u32,
}

impl WkcStats {
    /// Number of observations.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.success + self.degraded + self.timeout
    }

    /// Share of successful cycles, 0.0 without observations.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.success as f64 / total as f64,
        }
    }

    /// Share of non-successful cycles, 0.0 without observations.
    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.degraded + self.timeout) as f64 / total as f64,
        }
    }
}

/// Running working counter classification.
#[derive(Debug, Clone)]
pub struct WorkingCounterMonitor {
    stats: WkcStats,
    warning_ratio: f64,
    min_samples: u64,
    warned: bool,
}

impl WorkingCounterMonitor {
    /// Create a monitor that warns once the non-success ratio exceeds
    /// `warning_ratio` after at least `min_samples` observations.
    #[must_use]
    pub fn new(warning_ratio: f64, min_samples: u64) -> Self {
        Self {
            stats: WkcStats::default(),
            warning_ratio,
            min_samples: min_samples.max(1),
            warned: false,
        }
    }

    /// Classify one exchange and update the totals.
    pub fn observe(&mut self, actual: i32, expected: u16) -> WkcClass {
        let class = if actual == WKC_NO_FRAME {
            WkcClass::Timeout
        } else if actual >= i32::from(expected) {
            WkcClass::Success
        } else {
            WkcClass::Degraded
        };

        match class {
            WkcClass::Success => {
                self.stats.success += 1;
                self.stats.consecutive_failures = 0;
            }
            WkcClass::Degraded => {
                self.stats.degraded += 1;
                self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
            }
            WkcClass::Timeout => {
                self.stats.timeout += 1;
                self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
            }
        }
        self.stats.last_wkc = actual;
        self.stats.expected_wkc = expected;

        if !self.warned
            && self.stats.total() >= self.min_samples
            && self.stats.failure_ratio() > self.warning_ratio
        {
            self.warned = true;
            warn!(
                degraded = self.stats.degraded,
                timeout = self.stats.timeout,
                total = self.stats.total(),
                ratio = self.stats.failure_ratio(),
                threshold = self.warning_ratio,
                "Working counter failure ratio above threshold"
            );
        }

        class
    }

    /// Current statistics.
    #[must_use]
    pub fn snapshot(&self) -> WkcStats {
        self.stats
    }

    /// Length of the current run of non-success cycles.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.stats.consecutive_failures
    }

    /// True once the threshold warning has been raised.
    #[must_use]
    pub fn warning_raised(&self) -> bool {
        self.warned
    }

    /// Operator reset: clear all totals and re-arm the warning.
    pub fn reset(&mut self) {
        self.stats = WkcStats::default();
        self.warned = false;
        info!("Working counter statistics reset");
    }
}

/// Log a periodic statistics line; warns when timeouts exceed
/// `warning_ratio` of the successful cycles.
pub fn report(stats: &WkcStats, warning_ratio: f64) {
    info!(
        total = stats.total(),
        success = stats.success,
        degraded = stats.degraded,
        timeout = stats.timeout,
        success_rate = format!("{:.1}%", stats.success_rate() * 100.0),
        last_wkc = stats.last_wkc,
        expected_wkc = stats.expected_wkc,
        "Working counter statistics"
    );
    if stats.timeout as f64 > stats.success as f64 * warning_ratio {
        warn!(
            timeout = stats.timeout,
            success = stats.success,
            "Frame timeouts exceed tolerated share of successful cycles"
        );
    }
}
