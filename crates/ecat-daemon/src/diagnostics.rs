//! Diagnostics output for the daemon.
//!
//! Wraps the runtime's [`SessionReport`] with a health verdict and uptime
//! and renders it as JSON, on exit with `--report` or on SIGHUP.

use ecat_common::state::SessionPhase;
use ecat_runtime::SessionReport;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Health verdict for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// All drives running and the working counter within bounds.
    Healthy,
    /// Exchanging, but with working counter shortfalls or lost slaves.
    Degraded,
    /// Bring-up failed or the session faulted.
    Unhealthy,
    /// Bring-up or enable sequence in progress.
    Starting,
    /// Session stopping or closed.
    ShuttingDown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Point-in-time diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Health verdict.
    pub health: HealthStatus,
    /// Daemon uptime.
    pub uptime_secs: f64,
    /// Full session report.
    pub session: SessionReport,
}

/// Builds snapshots for one daemon run.
#[derive(Debug)]
pub struct DiagnosticsCollector {
    warning_ratio: f64,
    start_time: Instant,
}

impl DiagnosticsCollector {
    /// Collector judging working counter health against `warning_ratio`.
    pub fn new(warning_ratio: f64) -> Self {
        Self {
            warning_ratio,
            start_time: Instant::now(),
        }
    }

    /// Derive health from a session report.
    pub fn health(&self, report: &SessionReport) -> HealthStatus {
        match report.phase {
            SessionPhase::Fault => HealthStatus::Unhealthy,
            SessionPhase::Stopping | SessionPhase::Closed => HealthStatus::ShuttingDown,
            SessionPhase::Running => {
                let wkc_degraded = report.wkc.total() > 0
                    && report.wkc.failure_ratio() > self.warning_ratio;
                let all_running = !report.drives.is_empty()
                    && report.drives.iter().all(|d| d.state == "RUNNING");
                if wkc_degraded || !report.lost_slaves.is_empty() {
                    HealthStatus::Degraded
                } else if all_running {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Starting
                }
            }
            _ => HealthStatus::Starting,
        }
    }

    /// Snapshot around `report`.
    pub fn snapshot(&self, report: SessionReport) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            health: self.health(&report),
            uptime_secs: self.uptime().as_secs_f64(),
            session: report,
        }
    }

    /// Time since the collector was created.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Render a snapshot as pretty JSON.
pub fn render_json(snapshot: &DiagnosticsSnapshot) -> serde_json::Result<String> {
    serde_json::to_string_pretty(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecat_fieldbus::wkc::WkcStats;
    use ecat_runtime::{BringupReport, DriveReport};

    fn report(phase: SessionPhase) -> SessionReport {
        SessionReport {
            phase,
            bringup: BringupReport::default(),
            wkc: WkcStats {
                success: 1000,
                expected_wkc: 3,
                last_wkc: 3,
                ..WkcStats::default()
            },
            worker_cycles: 1000,
            ticks: None,
            realtime: None,
            drives: vec![DriveReport {
                slave: 0,
                state: "RUNNING".into(),
                step: 5000,
                torque: 50,
                fault_cleared: true,
                status_word: Some(0x0237),
                position: Some(0),
            }],
            faults: Vec::new(),
            lost_slaves: Vec::new(),
            recovery_passes: 0,
        }
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(format!("{}", HealthStatus::Healthy), "healthy");
        assert_eq!(format!("{}", HealthStatus::ShuttingDown), "shutting_down");
    }

    #[test]
    fn test_health_from_phase() {
        let collector = DiagnosticsCollector::new(0.1);
        assert_eq!(collector.health(&report(SessionPhase::Running)), HealthStatus::Healthy);
        assert_eq!(collector.health(&report(SessionPhase::Fault)), HealthStatus::Unhealthy);
        assert_eq!(collector.health(&report(SessionPhase::Closed)), HealthStatus::ShuttingDown);
        assert_eq!(collector.health(&report(SessionPhase::SafeOp)), HealthStatus::Starting);
    }

    #[test]
    fn test_degraded_on_wkc_shortfall() {
        let collector = DiagnosticsCollector::new(0.1);
        let mut degraded = report(SessionPhase::Running);
        degraded.wkc.timeout = 200;
        assert_eq!(collector.health(&degraded), HealthStatus::Degraded);

        let mut lost = report(SessionPhase::Running);
        lost.lost_slaves = vec![0];
        assert_eq!(collector.health(&lost), HealthStatus::Degraded);
    }

    #[test]
    fn test_json_rendering() {
        let collector = DiagnosticsCollector::new(0.1);
        let json = render_json(&collector.snapshot(report(SessionPhase::Running))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["health"], "healthy");
        assert_eq!(value["session"]["phase"], "RUNNING");
        assert_eq!(value["session"]["drives"][0]["torque"], 50);
        assert_eq!(value["session"]["wkc"]["success"], 1000);
    }
}
