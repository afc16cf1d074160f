//! One network session from adapter open to close.
//!
//! [`Session`] ties the pieces together: it builds the master stack from
//! the configuration, runs [`NetworkBringupController::bring_up`], then
//! drives the [`DriveSequencer`] in the foreground while the cyclic worker
//! exchanges process data in the background.

use crate::bringup::{BringupReport, NetworkBringupController};
use crate::context::SessionContext;
use crate::cyclic::StopOutcome;
use crate::drive::{diagnose_faults, DriveSequencer, FaultDiagnosis};
use crate::realtime::RealtimeStatus;
use crate::supervisor::LinkSupervisor;
use ecat_common::config::{MasterDriver, SessionConfig};
use ecat_common::error::{EcatError, EcatResult};
use ecat_common::metrics::TickSnapshot;
use ecat_common::state::SessionPhase;
use ecat_common::time::CycleClock;
use ecat_fieldbus::master::MasterStack;
use ecat_fieldbus::wkc::{self, WkcStats, WorkingCounterMonitor};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Floor of the pause between Operational and the first sequencer tick.
const SETTLE_FLOOR: Duration = Duration::from_millis(100);

/// Per-drive line of a [`SessionReport`].
#[derive(Debug, Clone, Serialize)]
pub struct DriveReport {
    /// Slave position.
    pub slave: u16,
    /// Sequencer state.
    pub state: String,
    /// Sequencer ticks evaluated.
    pub step: u64,
    /// Commanded torque.
    pub torque: i16,
    /// Fault bit was seen clearing during FaultReset.
    pub fault_cleared: bool,
    /// Last received status word.
    pub status_word: Option<u16>,
    /// Last received actual position.
    pub position: Option<i32>,
}

/// Diagnostics snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Lifecycle phase.
    pub phase: SessionPhase,
    /// Bring-up results.
    pub bringup: BringupReport,
    /// Working counter totals.
    pub wkc: WkcStats,
    /// Completed worker ticks.
    pub worker_cycles: u64,
    /// Worker timing.
    pub ticks: Option<TickSnapshot>,
    /// Real-time setup the worker got.
    pub realtime: Option<RealtimeStatus>,
    /// Drive sequencer state per slave.
    pub drives: Vec<DriveReport>,
    /// Latched faults found before the sequence started.
    pub faults: Vec<FaultDiagnosis>,
    /// Slaves flagged lost by the supervisor.
    pub lost_slaves: Vec<u16>,
    /// Supervisor recovery passes.
    pub recovery_passes: u64,
}

/// Build the master stack selected by `[network].driver`.
///
/// # Errors
///
/// [`EcatError::Config`] when the driver is not compiled in.
pub fn master_for(config: &SessionConfig) -> EcatResult<Box<dyn MasterStack>> {
    match config.network.driver {
        MasterDriver::Simulated => Ok(Box::new(ecat_fieldbus::simulated::SimulatedMaster::new(
            config.network.simulated_slaves,
        ))),
        #[cfg(all(feature = "soem", target_os = "linux"))]
        MasterDriver::Soem => Ok(Box::new(ecat_fieldbus::soem::SoemMaster::new())),
        #[cfg(not(all(feature = "soem", target_os = "linux")))]
        MasterDriver::Soem => Err(EcatError::Config(
            "SOEM driver requested but not compiled in (enable feature `soem` on Linux)".into(),
        )),
    }
}

/// A network session.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    context: Arc<SessionContext>,
    controller: NetworkBringupController,
    supervisor: LinkSupervisor,
    sequencer: Option<DriveSequencer>,
    faults: Vec<FaultDiagnosis>,
}

impl Session {
    /// Session over the master stack selected by the configuration.
    ///
    /// # Errors
    ///
    /// [`EcatError::Config`] for an invalid configuration or a driver that
    /// is not compiled in.
    pub fn open(config: SessionConfig) -> EcatResult<Self> {
        let master = master_for(&config)?;
        Self::with_master(config, master)
    }

    /// Session over an explicit master stack.
    ///
    /// # Errors
    ///
    /// [`EcatError::Config`] when the configuration does not validate.
    pub fn with_master(config: SessionConfig, master: Box<dyn MasterStack>) -> EcatResult<Self> {
        config
            .validate()
            .map_err(|e| EcatError::Config(e.to_string()))?;
        let monitor =
            WorkingCounterMonitor::new(config.monitor.warning_ratio, config.monitor.min_samples);
        let context = SessionContext::new(master, monitor);
        let controller = NetworkBringupController::new(Arc::clone(&context), config.clone());
        let supervisor = LinkSupervisor::new(config.monitor.recovery_threshold);
        Ok(Self {
            config,
            context,
            controller,
            supervisor,
            sequencer: None,
            faults: Vec::new(),
        })
    }

    /// Shared session state.
    #[must_use]
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.controller.phase()
    }

    /// Bring the network to Operational.
    ///
    /// A failed bring-up releases the network before returning.
    ///
    /// # Errors
    ///
    /// Whatever [`NetworkBringupController::bring_up`] reports.
    pub fn bring_up(&mut self) -> EcatResult<BringupReport> {
        match self.controller.bring_up() {
            Ok(report) => Ok(report),
            Err(e) => {
                self.controller.shutdown();
                Err(e)
            }
        }
    }

    /// Run the drive sequence in the foreground, one tick per period,
    /// while `keep_going(ticks)` returns true.
    ///
    /// Also supervises the link and logs the working counter report every
    /// `[monitor].report_interval`. Returns the number of ticks run.
    ///
    /// # Errors
    ///
    /// [`EcatError::InvalidStateTransition`] unless the network is
    /// Operational.
    pub fn run<F>(&mut self, mut keep_going: F) -> EcatResult<u64>
    where
        F: FnMut(u64) -> bool,
    {
        let clock = CycleClock::new(self.config.cycle.period);
        if self.sequencer.is_none() {
            self.controller.mark_running()?;
            let settle = SETTLE_FLOOR.max(clock.period() * 10);
            info!(settle_ms = settle.as_millis(), "Settling before drive sequence");
            thread::sleep(settle);

            self.faults = diagnose_faults(&self.context, &self.config.drive.non_critical_fault_codes);
            self.sequencer = Some(DriveSequencer::new(
                Arc::clone(&self.context),
                clock,
                &self.config.drive,
                &self.faults,
            ));
            info!(drives = self.context.channels().len(), "Drive sequence started");
        } else if self.phase() != SessionPhase::Running {
            return Err(EcatError::InvalidStateTransition {
                from: self.phase().to_string(),
                to: SessionPhase::Running.to_string(),
            });
        }

        let Some(sequencer) = self.sequencer.as_mut() else {
            return Ok(0);
        };
        let context = Arc::clone(&self.context);
        let supervisor = &mut self.supervisor;
        let report_interval = self.config.monitor.report_interval;
        let warning_ratio = self.config.monitor.warning_ratio;
        let mut next_report = Instant::now() + report_interval;

        let ticks = sequencer.run_until(|tick| {
            if !keep_going(tick) {
                return false;
            }
            if let Some(pass) = supervisor.check(&context) {
                if !pass.is_empty() {
                    warn!(?pass, "Link recovery pass");
                }
            }
            if Instant::now() >= next_report {
                wkc::report(&context.wkc_stats(), warning_ratio);
                next_report += report_interval;
            }
            true
        });
        Ok(ticks)
    }

    /// Run for a fixed wall-clock duration.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn run_for(&mut self, duration: Duration) -> EcatResult<u64> {
        let deadline = Instant::now() + duration;
        self.run(|_| Instant::now() < deadline)
    }

    /// Stop the worker and release the network.
    pub fn stop(&mut self) -> StopOutcome {
        let outcome = self.controller.shutdown();
        if outcome == StopOutcome::Leaked {
            error!("Session closed with a leaked cyclic worker");
        }
        outcome
    }

    /// Diagnostics snapshot.
    #[must_use]
    pub fn report(&self) -> SessionReport {
        let channels = self.context.channels();
        let drives = self
            .sequencer
            .as_ref()
            .map(|seq| {
                seq.machines()
                    .iter()
                    .zip(&channels)
                    .map(|(machine, channel)| DriveReport {
                        slave: channel.slave,
                        state: machine.state().to_string(),
                        step: machine.step(),
                        torque: machine.torque(),
                        fault_cleared: machine.fault_cleared(),
                        status_word: channel.input.map(|i| i.status_word.0),
                        position: channel.input.map(|i| i.position),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let worker = self.controller.worker();
        SessionReport {
            phase: self.phase(),
            bringup: self.controller.report().clone(),
            wkc: self.context.wkc_stats(),
            worker_cycles: self.context.cycles(),
            ticks: worker.map(crate::cyclic::CyclicExchangeWorker::metrics),
            realtime: worker.and_then(crate::cyclic::CyclicExchangeWorker::realtime_status),
            drives,
            faults: self.faults.clone(),
            lost_slaves: self.supervisor.lost(),
            recovery_passes: self.supervisor.passes(),
        }
    }

    /// Drive sequencer, once the run started.
    #[must_use]
    pub fn sequencer(&self) -> Option<&DriveSequencer> {
        self.sequencer.as_ref()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.phase().is_terminal() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecat_fieldbus::simulated::SimulatedMaster;

    fn fast_config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.bringup.base_transition_timeout = Duration::from_millis(10);
        config.bringup.backoff = Duration::from_millis(5);
        config.bringup.warmup_cycles = 20;
        config.cycle.receive_timeout = Duration::from_millis(1);
        config.drive.fault_reset = Duration::from_millis(20);
        config.drive.shutdown_hold = Duration::from_millis(10);
        config.drive.switch_on_hold = Duration::from_millis(10);
        config.drive.enable_hold = Duration::from_millis(10);
        config
    }

    #[test]
    fn test_open_builds_simulator() {
        let mut config = fast_config();
        config.network.simulated_slaves = 2;
        let mut session = Session::open(config).unwrap();
        assert_eq!(session.phase(), SessionPhase::Idle);
        let report = session.bring_up().unwrap();
        assert_eq!(report.slave_count, 2);
        session.stop();
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[cfg(not(feature = "soem"))]
    #[test]
    fn test_soem_not_compiled_in() {
        let mut config = fast_config();
        config.network.driver = MasterDriver::Soem;
        assert!(matches!(Session::open(config), Err(EcatError::Config(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = fast_config();
        config.cycle.period = Duration::ZERO;
        let result = Session::with_master(config, Box::new(SimulatedMaster::new(1)));
        assert!(matches!(result, Err(EcatError::Config(_))));
    }

    #[test]
    fn test_run_before_bring_up_rejected() {
        let mut session =
            Session::with_master(fast_config(), Box::new(SimulatedMaster::new(1))).unwrap();
        assert!(matches!(
            session.run(|_| false),
            Err(EcatError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_run_reaches_torque() {
        let sim = SimulatedMaster::new(1);
        let probe = sim.probe();
        let mut session = Session::with_master(fast_config(), Box::new(sim)).unwrap();
        session.bring_up().unwrap();

        // 20 + 10 + 10 + 10 ms at 2ms, plus headroom.
        let ticks = session.run(|tick| tick < 40).unwrap();
        assert_eq!(ticks, 40);
        assert!(session.sequencer().unwrap().all_running());
        assert_eq!(session.phase(), SessionPhase::Running);

        let report = session.report();
        assert_eq!(report.drives.len(), 1);
        assert_eq!(report.drives[0].state, "RUNNING");
        assert_eq!(report.drives[0].torque, 50);
        assert!(report.worker_cycles > 0);

        session.stop();
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(probe.lock().close_calls, 1);
    }

    #[test]
    fn test_failed_bring_up_closes() {
        let sim = SimulatedMaster::new(1).stuck_in_preop(0);
        let probe = sim.probe();
        let mut config = fast_config();
        config.bringup.max_attempts = 1;
        let mut session = Session::with_master(config, Box::new(sim)).unwrap();
        assert!(matches!(
            session.bring_up(),
            Err(EcatError::TransitionTimeout { .. })
        ));
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(probe.lock().close_calls, 1);
    }
}
