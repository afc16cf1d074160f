//! Link supervision while Operational.
//!
//! A run of non-success working counters means a slave stopped exchanging
//! process data. The supervisor then reads the network state and nudges
//! slaves back: an erroring Safe-Operational slave gets its error
//! acknowledged together with the Operational request, a plain
//! Safe-Operational slave only the request, and a slave that fell below
//! Safe-Operational is walked back up one state per pass. Slaves that answer with no
//! state are flagged lost. Nothing here fails the session.
//!
//! Each pass consumes the streak: the next one needs `threshold` fresh
//! failed exchanges.

use crate::context::SessionContext;
use ecat_fieldbus::slave::NetworkState;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

/// What one supervision pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryPass {
    /// Slaves that got an acknowledge plus Operational request.
    pub acknowledged: Vec<u16>,
    /// Slaves that got a plain Operational request.
    pub requested: Vec<u16>,
    /// Slaves below Safe-Operational sent one state up.
    pub reconfigured: Vec<u16>,
    /// Slaves flagged lost in this pass.
    pub lost: Vec<u16>,
    /// Previously lost slaves seen Operational again.
    pub found: Vec<u16>,
}

impl RecoveryPass {
    /// Nothing was done.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.acknowledged.is_empty()
            && self.requested.is_empty()
            && self.reconfigured.is_empty()
            && self.lost.is_empty()
            && self.found.is_empty()
    }
}

/// Watches the working counter and re-requests Operational for slaves
/// that dropped out.
#[derive(Debug, Clone)]
pub struct LinkSupervisor {
    threshold: u32,
    lost: BTreeSet<u16>,
    passes: u64,
    failures_at_last_pass: u64,
}

impl LinkSupervisor {
    /// Supervisor acting after `threshold` consecutive failed exchanges.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            lost: BTreeSet::new(),
            passes: 0,
            failures_at_last_pass: 0,
        }
    }

    /// Slaves currently flagged lost.
    #[must_use]
    pub fn lost(&self) -> Vec<u16> {
        self.lost.iter().copied().collect()
    }

    /// Recovery passes run so far.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Run a pass if the failure streak reached the threshold and at
    /// least `threshold` exchanges failed since the previous pass.
    pub fn check(&mut self, context: &SessionContext) -> Option<RecoveryPass> {
        let stats = context.wkc_stats();
        let failed = stats.degraded + stats.timeout;
        let fresh = failed.saturating_sub(self.failures_at_last_pass);
        if stats.consecutive_failures < self.threshold || fresh < u64::from(self.threshold) {
            return None;
        }
        self.failures_at_last_pass = failed;
        warn!(
            failures = stats.consecutive_failures,
            "Working counter failure streak; checking slave states"
        );
        Some(self.recover(context))
    }

    /// Read the network state and nudge every slave below Operational.
    pub fn recover(&mut self, context: &SessionContext) -> RecoveryPass {
        self.passes += 1;
        let mut pass = RecoveryPass::default();
        let mut bus = context.lock();

        if let Err(e) = bus.master.read_network_state() {
            error!(error = %e, "Cannot read network state; flagging all slaves lost");
            let all: Vec<u16> = bus.master.slaves().iter().map(|s| s.position).collect();
            for position in all {
                if self.lost.insert(position) {
                    pass.lost.push(position);
                }
            }
            return pass;
        }

        let snapshot: Vec<(u16, NetworkState, bool, bool, u16)> = bus
            .master
            .slaves()
            .iter()
            .map(|s| (s.position, s.state, s.error_indicated, s.silent, s.al_status_code))
            .collect();

        for (position, state, error_indicated, silent, al_status) in snapshot {
            if silent {
                if self.lost.insert(position) {
                    error!(slave = position, "Slave lost");
                    pass.lost.push(position);
                } else {
                    debug!(slave = position, "Slave still lost");
                }
                continue;
            }
            if self.lost.remove(&position) {
                info!(slave = position, %state, "Slave found again");
                pass.found.push(position);
            }

            let (target, bucket) = match (state, error_indicated) {
                (NetworkState::Op, false) => continue,
                (NetworkState::SafeOp | NetworkState::Op, true) => {
                    warn!(
                        slave = position,
                        %state,
                        al_status = format!("{al_status:#06x}"),
                        "Slave reports error; acknowledging"
                    );
                    (NetworkState::Op, &mut pass.acknowledged)
                }
                (NetworkState::SafeOp, false) => {
                    warn!(slave = position, "Slave in SAFE_OP; requesting OP");
                    (NetworkState::Op, &mut pass.requested)
                }
                (NetworkState::PreOp, _) => {
                    warn!(slave = position, "Slave in PRE_OP; requesting SAFE_OP");
                    (NetworkState::SafeOp, &mut pass.reconfigured)
                }
                (other, _) => {
                    warn!(slave = position, state = %other, "Slave below PRE_OP; requesting PRE_OP");
                    (NetworkState::PreOp, &mut pass.reconfigured)
                }
            };
            match bus.master.request_slave_state(position, target, error_indicated) {
                Ok(()) => bucket.push(position),
                Err(e) => warn!(slave = position, %target, error = %e, "Recovery request failed"),
            }
        }
        pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecat_fieldbus::frame::OutputFrame;
    use ecat_fieldbus::master::MasterStack;
    use ecat_fieldbus::simulated::SimulatedMaster;
    use ecat_fieldbus::wkc::WorkingCounterMonitor;
    use std::sync::Arc;
    use std::time::Duration;

    fn safeop_context(mut sim: SimulatedMaster) -> Arc<SessionContext> {
        sim.open("sim0").unwrap();
        sim.enumerate_and_initialize().unwrap();
        sim.apply_process_data_map().unwrap();
        sim.request_network_state(NetworkState::SafeOp).unwrap();
        sim.wait_for_state(NetworkState::SafeOp, Duration::from_millis(50))
            .unwrap();
        let ctx = SessionContext::new(Box::new(sim), WorkingCounterMonitor::new(0.1, 10));
        ctx.lock().reset_channels(OutputFrame::default());
        ctx
    }

    #[test]
    fn test_below_threshold_does_nothing() {
        let ctx = safeop_context(SimulatedMaster::new(1));
        let mut supervisor = LinkSupervisor::new(5);
        assert!(supervisor.check(&ctx).is_none());
        assert_eq!(supervisor.passes(), 0);
    }

    #[test]
    fn test_streak_triggers_pass() {
        let ctx = safeop_context(SimulatedMaster::new(2));
        for _ in 0..5 {
            ctx.lock().exchange(Duration::from_millis(1)).unwrap();
        }
        let mut supervisor = LinkSupervisor::new(5);
        let pass = supervisor.check(&ctx).unwrap();
        assert_eq!(pass.requested, vec![0, 1]);
        assert!(pass.acknowledged.is_empty());
        assert!(pass.lost.is_empty());
    }

    #[test]
    fn test_pass_consumes_streak() {
        // OP requests are refused, so every exchange keeps failing.
        let ctx = safeop_context(SimulatedMaster::new(1).refuse_op_without_outputs(u64::MAX));
        for _ in 0..5 {
            ctx.lock().exchange(Duration::from_millis(1)).unwrap();
        }
        let mut supervisor = LinkSupervisor::new(5);
        assert!(supervisor.check(&ctx).is_some());
        // Streak still at 5, but nothing new was exchanged.
        assert!(supervisor.check(&ctx).is_none());

        for _ in 0..4 {
            ctx.lock().exchange(Duration::from_millis(1)).unwrap();
        }
        assert!(supervisor.check(&ctx).is_none());
        ctx.lock().exchange(Duration::from_millis(1)).unwrap();
        assert!(supervisor.check(&ctx).is_some());
        assert_eq!(supervisor.passes(), 2);
    }

    #[test]
    fn test_slave_below_safeop_is_reconfigured() {
        let ctx = safeop_context(SimulatedMaster::new(2));
        ctx.lock()
            .master
            .request_slave_state(1, NetworkState::Init, false)
            .unwrap();

        let mut supervisor = LinkSupervisor::new(1);
        let pass = supervisor.recover(&ctx);
        assert_eq!(pass.requested, vec![0]);
        assert_eq!(pass.reconfigured, vec![1]);
        assert!(pass.lost.is_empty());
        assert!(supervisor.lost().is_empty());

        // INIT -> PRE_OP -> SAFE_OP, then OP is requested.
        let pass = supervisor.recover(&ctx);
        assert!(pass.requested.is_empty());
        assert_eq!(pass.reconfigured, vec![1]);
        let pass = supervisor.recover(&ctx);
        assert_eq!(pass.requested, vec![1]);
        assert!(pass.reconfigured.is_empty());
        assert!(supervisor.lost().is_empty());
    }

    #[test]
    fn test_lost_and_found() {
        let ctx = safeop_context(SimulatedMaster::new(1));
        ctx.lock().master.slaves_mut()[0].silent = true;

        let mut supervisor = LinkSupervisor::new(1);
        let pass = supervisor.recover(&ctx);
        assert_eq!(pass.lost, vec![0]);
        assert_eq!(supervisor.lost(), vec![0]);

        let again = supervisor.recover(&ctx);
        assert!(again.lost.is_empty());
        assert_eq!(supervisor.lost(), vec![0]);

        ctx.lock().master.slaves_mut()[0].silent = false;
        let back = supervisor.recover(&ctx);
        assert_eq!(back.found, vec![0]);
        assert_eq!(back.requested, vec![0]);
        assert!(supervisor.lost().is_empty());
    }

    #[test]
    fn test_unreadable_network_flags_all_lost() {
        let ctx = safeop_context(SimulatedMaster::new(2));
        ctx.lock().master.close().unwrap();
        let mut supervisor = LinkSupervisor::new(1);
        let pass = supervisor.recover(&ctx);
        assert_eq!(pass.lost, vec![0, 1]);
        assert!(!pass.is_empty());
    }
}
