//! Tick metrics for the cyclic exchange loop.
//!
//! A fixed ring buffer of inter-tick intervals plus running statistics
//! for tick execution time. No allocation after construction.

use serde::Serialize;
use std::time::Duration;

/// Interval and execution-time statistics for the cyclic worker.
#[derive(Debug)]
pub struct TickMetrics {
    /// Ring buffer of inter-tick intervals in nanoseconds.
    intervals: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of intervals held (saturates at buffer size).
    interval_count: usize,
    /// Ticks recorded.
    total_ticks: u64,
    /// Shortest tick execution time in nanoseconds.
    min_exec_ns: u64,
    /// Longest tick execution time in nanoseconds.
    max_exec_ns: u64,
    /// Sum of execution times for the mean.
    sum_exec_ns: u64,
    /// Ticks whose execution exceeded the period.
    overrun_count: u64,
    /// Configured period in nanoseconds.
    period_ns: u64,
}

impl TickMetrics {
    /// Create a collector keeping the last `window` intervals.
    #[must_use]
    pub fn new(window: usize, period: Duration) -> Self {
        let size = window.max(1);
        Self {
            intervals: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            interval_count: 0,
            total_ticks: 0,
            min_exec_ns: u64::MAX,
            max_exec_ns: 0,
            sum_exec_ns: 0,
            overrun_count: 0,
            period_ns: u64::try_from(period.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    /// Record one tick: its execution time and, after the first tick,
    /// the interval since the previous tick start.
    ///
    /// Returns true when the tick overran the period.
    pub fn record(&mut self, exec: Duration, interval: Option<Duration>) -> bool {
        let exec_ns = u64::try_from(exec.as_nanos()).unwrap_or(u64::MAX);

        if let Some(interval) = interval {
            self.intervals[self.write_pos] = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
            self.write_pos = (self.write_pos + 1) % self.intervals.len();
            self.interval_count = (self.interval_count + 1).min(self.intervals.len());
        }

        self.total_ticks += 1;
        self.min_exec_ns = self.min_exec_ns.min(exec_ns);
        self.max_exec_ns = self.max_exec_ns.max(exec_ns);
        self.sum_exec_ns = self.sum_exec_ns.wrapping_add(exec_ns);

        let overrun = exec_ns > self.period_ns;
        if overrun {
            self.overrun_count += 1;
        }
        overrun
    }

    /// Total ticks recorded.
    #[must_use]
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Number of overrunning ticks.
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Percentile of the retained intervals (0.0 to 100.0).
    #[must_use]
    pub fn interval_percentile(&self, percentile: f64) -> Option<Duration> {
        if self.interval_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }
        let mut sorted: Vec<u64> = self.intervals[..self.interval_count].to_vec();
        sorted.sort_unstable();
        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(Duration::from_nanos(sorted[idx.min(sorted.len() - 1)]))
    }

    /// Mean of the retained intervals.
    #[must_use]
    pub fn mean_interval(&self) -> Option<Duration> {
        if self.interval_count == 0 {
            return None;
        }
        let sum: u64 = self.intervals[..self.interval_count].iter().sum();
        Some(Duration::from_nanos(sum / self.interval_count as u64))
    }

    /// Retained intervals, oldest first.
    #[must_use]
    pub fn intervals(&self) -> Vec<Duration> {
        let held = if self.interval_count < self.intervals.len() {
            self.intervals[..self.interval_count].to_vec()
        } else {
            let (newer, older) = self.intervals.split_at(self.write_pos);
            older.iter().chain(newer).copied().collect()
        };
        held.into_iter().map(Duration::from_nanos).collect()
    }

    /// Snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self) -> TickSnapshot {
        let has_ticks = self.total_ticks > 0;
        TickSnapshot {
            total_ticks: self.total_ticks,
            period_ns: self.period_ns,
            min_exec_ns: has_ticks.then_some(self.min_exec_ns),
            max_exec_ns: has_ticks.then_some(self.max_exec_ns),
            mean_exec_ns: has_ticks.then(|| self.sum_exec_ns / self.total_ticks),
            mean_interval_ns: self
                .mean_interval()
                .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)),
            p99_interval_ns: self
                .interval_percentile(99.0)
                .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)),
            overrun_count: self.overrun_count,
        }
    }

    /// Reset all counters.
    pub fn reset(&mut self) {
        self.intervals.fill(0);
        self.write_pos = 0;
        self.interval_count = 0;
        self.total_ticks = 0;
        self.min_exec_ns = u64::MAX;
        self.max_exec_ns = 0;
        self.sum_exec_ns = 0;
        self.overrun_count = 0;
    }
}

/// Immutable view of [`TickMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickSnapshot {
    /// Ticks recorded.
    pub total_ticks: u64,
    /// Configured period in nanoseconds.
    pub period_ns: u64,
    /// Shortest tick execution time.
    pub min_exec_ns: Option<u64>,
    /// Longest tick execution time.
    pub max_exec_ns: Option<u64>,
    /// Mean tick execution time.
    pub mean_exec_ns: Option<u64>,
    /// Mean inter-tick interval over the window.
    pub mean_interval_ns: Option<u64>,
    /// 99th percentile inter-tick interval over the window.
    pub p99_interval_ns: Option<u64>,
    /// Overrunning ticks.
    pub overrun_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrun_counting() {
        let mut metrics = TickMetrics::new(16, Duration::from_millis(2));
        assert!(!metrics.record(Duration::from_micros(300), None));
        assert!(metrics.record(Duration::from_micros(2500), Some(Duration::from_millis(2))));
        assert!(!metrics.record(Duration::from_micros(400), Some(Duration::from_micros(2500))));
        assert_eq!(metrics.total_ticks(), 3);
        assert_eq!(metrics.overrun_count(), 1);
    }

    #[test]
    fn test_interval_window_wraps() {
        let mut metrics = TickMetrics::new(4, Duration::from_millis(1));
        for i in 1..=10u64 {
            metrics.record(Duration::from_micros(10), Some(Duration::from_micros(i * 100)));
        }
        // only the last four intervals remain: 700..=1000µs
        assert_eq!(metrics.mean_interval(), Some(Duration::from_micros(850)));
        assert_eq!(
            metrics.interval_percentile(100.0),
            Some(Duration::from_micros(1000))
        );
        let oldest_first: Vec<u64> = metrics
            .intervals()
            .iter()
            .map(|d| u64::try_from(d.as_micros()).unwrap())
            .collect();
        assert_eq!(oldest_first, vec![700, 800, 900, 1000]);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let mut metrics = TickMetrics::new(8, Duration::from_millis(2));
        assert_eq!(metrics.snapshot().min_exec_ns, None);

        metrics.record(Duration::from_micros(100), None);
        metrics.record(Duration::from_micros(300), Some(Duration::from_millis(2)));
        let snap = metrics.snapshot();
        assert_eq!(snap.total_ticks, 2);
        assert_eq!(snap.min_exec_ns, Some(100_000));
        assert_eq!(snap.max_exec_ns, Some(300_000));
        assert_eq!(snap.mean_interval_ns, Some(2_000_000));

        metrics.reset();
        assert_eq!(metrics.total_ticks(), 0);
        assert!(metrics.interval_percentile(50.0).is_none());
    }
}
