//! Distributed clock configuration and phase locking.
//!
//! Provides:
//! - Network-wide DC enable and per-slave SYNC0 arming
//! - Verification through the SM2 synchronization parameters (0x1C32)
//! - Deviation statistics
//! - A PI phase lock that aligns the master cycle to the reference clock
//!
//! Arming must happen after the process data map is applied and before
//! Safe-Operational is requested.

use crate::master::{MasterStack, ObjectAccess};
use crate::slave::objects;
use ecat_common::error::EcatResult;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 0x1C32:01 value once SYNC0 is active.
pub const SYNC_TYPE_DC_SYNC0: u16 = 2;

/// Readback of one slave's synchronization parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DcVerification {
    /// Slave position.
    pub slave: u16,
    /// 0x1C32:01, if readable.
    pub sync_type: Option<u16>,
    /// 0x1C32:02 in ns, if readable.
    pub cycle_time_ns: Option<u32>,
    /// Configured period in ns.
    pub expected_cycle_ns: u32,
}

impl DcVerification {
    /// SYNC0 is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.sync_type == Some(SYNC_TYPE_DC_SYNC0)
    }

    /// Cycle time matches the configured period (or could not be read).
    #[must_use]
    pub fn cycle_matches(&self) -> bool {
        self.cycle_time_ns.map_or(true, |ns| ns == self.expected_cycle_ns)
    }

    /// No defect found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.is_active() && self.cycle_matches()
    }
}

/// Outcome of configuring distributed clocks on the whole network.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DcReport {
    /// Network-wide enable succeeded.
    pub enabled: bool,
    /// Slaves with SYNC0 armed.
    pub armed: Vec<u16>,
    /// Per-slave readbacks.
    pub verifications: Vec<DcVerification>,
}

impl DcReport {
    /// Number of slaves with a verification defect.
    #[must_use]
    pub fn defects(&self) -> usize {
        self.verifications.iter().filter(|v| !v.is_ok()).count()
    }
}

/// Enables the sync signal and arms it on every slave.
#[derive(Debug, Clone)]
pub struct DistributedClockConfigurer {
    period: Duration,
    phase_shift: Duration,
    verify: bool,
}

impl DistributedClockConfigurer {
    /// Create a configurer for `period` with SYNC0 shifted by `phase_shift`.
    #[must_use]
    pub fn new(period: Duration, phase_shift: Duration) -> Self {
        Self {
            period,
            phase_shift,
            verify: true,
        }
    }

    /// Skip the 0x1C32 readback.
    #[must_use]
    pub fn without_verification(mut self) -> Self {
        self.verify = false;
        self
    }

    fn period_ns(&self) -> u32 {
        u32::try_from(self.period.as_nanos()).unwrap_or(u32::MAX)
    }

    /// Enable distributed clocks network-wide.
    ///
    /// # Errors
    ///
    /// Propagates master stack failures.
    pub fn configure_network<M: MasterStack + ?Sized>(&self, master: &mut M) -> EcatResult<bool> {
        let enabled = master.enable_distributed_clock()?;
        if enabled {
            info!(period = ?self.period, "Distributed clocks enabled");
        } else {
            warn!("No slave supports distributed clocks");
        }
        Ok(enabled)
    }

    /// Arm SYNC0 on one slave.
    ///
    /// # Errors
    ///
    /// Propagates master stack failures.
    pub fn configure_slave<M: MasterStack + ?Sized>(
        &self,
        master: &mut M,
        position: u16,
    ) -> EcatResult<()> {
        master.arm_slave_sync(position, self.period, self.phase_shift)?;
        debug!(
            slave = position,
            cycle_ns = self.period_ns(),
            shift = ?self.phase_shift,
            "SYNC0 armed"
        );
        Ok(())
    }

    /// Read back 0x1C32:01 and 0x1C32:02. Read failures and mismatches
    /// are logged, never returned.
    pub fn verify_slave<M: MasterStack + ?Sized>(&self, master: &mut M, position: u16) -> DcVerification {
        let sync_type = master
            .read_u16(position, objects::SM2_SYNC_TYPE)
            .map_err(|e| warn!(slave = position, error = %e, "Cannot read SM2 sync type"))
            .ok();
        let cycle_time_ns = master
            .read_i32(position, objects::SM2_CYCLE_TIME)
            .map_err(|e| debug!(slave = position, error = %e, "Cannot read SM2 cycle time"))
            .ok()
            .and_then(|ns| u32::try_from(ns).ok());

        let verification = DcVerification {
            slave: position,
            sync_type,
            cycle_time_ns,
            expected_cycle_ns: self.period_ns(),
        };
        if !verification.is_active() {
            warn!(
                slave = position,
                sync_type = ?verification.sync_type,
                expected = SYNC_TYPE_DC_SYNC0,
                "SYNC0 not active after arming"
            );
        }
        if !verification.cycle_matches() {
            warn!(
                slave = position,
                cycle_ns = ?verification.cycle_time_ns,
                expected_ns = verification.expected_cycle_ns,
                "SM2 cycle time differs from configured period"
            );
        }
        verification
    }

    /// Enable, arm every DC-capable slave and optionally verify.
    ///
    /// Per-slave failures are logged; the report records what succeeded.
    ///
    /// # Errors
    ///
    /// Propagates a failure of the network-wide enable.
    pub fn configure<M: MasterStack + ?Sized>(&self, master: &mut M) -> EcatResult<DcReport> {
        let mut report = DcReport {
            enabled: self.configure_network(master)?,
            ..DcReport::default()
        };
        if !report.enabled {
            return Ok(report);
        }

        let capable: Vec<u16> = master
            .slaves()
            .iter()
            .filter(|s| s.dc_supported)
            .map(|s| s.position)
            .collect();
        for position in capable {
            match self.configure_slave(master, position) {
                Ok(()) => report.armed.push(position),
                Err(e) => warn!(slave = position, error = %e, "Failed to arm SYNC0"),
            }
        }

        if self.verify {
            for &position in &report.armed {
                report.verifications.push(self.verify_slave(master, position));
            }
        }
        info!(
            armed = report.armed.len(),
            defects = report.defects(),
            "Distributed clock configuration complete"
        );
        Ok(report)
    }
}

/// PI controller aligning the master's cycle start with the reference clock.
///
/// `update` returns an offset in ns to add to the next cycle deadline.
#[derive(Debug, Clone)]
pub struct DcPhaseLock {
    period_ns: i64,
    shift_ns: i64,
    integral: i64,
}

impl DcPhaseLock {
    /// Create a phase lock for `period`, targeting `shift` after the sync edge.
    #[must_use]
    pub fn new(period: Duration, shift: Duration) -> Self {
        let period_ns = i64::try_from(period.as_nanos()).unwrap_or(i64::MAX).max(1);
        let shift_ns = i64::try_from(shift.as_nanos()).unwrap_or(0);
        Self {
            period_ns,
            shift_ns,
            integral: 0,
        }
    }

    /// Feed one reference clock sample; returns the deadline offset in ns.
    pub fn update(&mut self, dc_time_ns: i64) -> i64 {
        let mut delta = (dc_time_ns - self.shift_ns).rem_euclid(self.period_ns);
        if delta > self.period_ns / 2 {
            delta -= self.period_ns;
        }
        match delta.signum() {
            1 => self.integral += 1,
            -1 => self.integral -= 1,
            _ => {}
        }
        let offset = -(delta / 100) - (self.integral / 20);
        trace!(delta, integral = self.integral, offset, "DC phase lock");
        offset
    }

    /// Accumulated integral term.
    #[must_use]
    pub fn integral(&self) -> i64 {
        self.integral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedMaster;

    fn mapped_sim(drives: u16) -> SimulatedMaster {
        let mut sim = SimulatedMaster::new(drives);
        sim.open("sim0").unwrap();
        sim.enumerate_and_initialize().unwrap();
        sim.apply_process_data_map().unwrap();
        sim
    }

    #[test]
    fn test_configure_arms_and_verifies() {
        let mut sim = mapped_sim(2);
        let report = DistributedClockConfigurer::new(Duration::from_millis(2), Duration::ZERO)
            .configure(&mut sim)
            .unwrap();
        assert!(report.enabled);
        assert_eq!(report.armed, vec![0, 1]);
        assert_eq!(report.defects(), 0);
        assert_eq!(report.verifications[1].cycle_time_ns, Some(2_000_000));
    }

    #[test]
    fn test_arm_before_enable_is_reported() {
        let mut sim = mapped_sim(1);
        let dc = DistributedClockConfigurer::new(Duration::from_millis(1), Duration::ZERO);
        dc.configure_slave(&mut sim, 0).unwrap();
        let verification = dc.verify_slave(&mut sim, 0);
        assert!(!verification.is_active());
        assert!(verification.cycle_matches());
    }

    #[test]
    fn test_no_dc_support() {
        let mut sim = SimulatedMaster::new(1).without_dc();
        sim.open("sim0").unwrap();
        sim.enumerate_and_initialize().unwrap();
        let report = DistributedClockConfigurer::new(Duration::from_millis(2), Duration::ZERO)
            .configure(&mut sim)
            .unwrap();
        assert!(!report.enabled);
        assert!(report.armed.is_empty());
    }

    #[test]
    fn test_phase_lock_folds_delta() {
        let mut lock = DcPhaseLock::new(Duration::from_millis(1), Duration::ZERO);
        // 100 µs after the edge: positive delta, pull the deadline earlier
        assert_eq!(lock.update(5_100_000), -1_000);
        assert_eq!(lock.integral(), 1);
        // 900 µs after the edge folds to -100 µs
        assert_eq!(lock.update(5_900_000), 1_000);
        assert_eq!(lock.integral(), 0);
    }

    #[test]
    fn test_phase_lock_integral_term() {
        let mut lock = DcPhaseLock::new(Duration::from_millis(1), Duration::from_micros(50));
        let mut offset = 0;
        for _ in 0..40 {
            offset = lock.update(1_050_100);
        }
        assert_eq!(lock.integral(), 40);
        assert_eq!(offset, -1 - 2);
    }
}
