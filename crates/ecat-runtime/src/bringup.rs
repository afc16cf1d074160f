//! Network bring-up.
//!
//! Drives the network state machine from enumeration to Operational:
//!
//! ```text
//! open → enumerate → PRE_OP → PDO mapping → apply map (fallback) → DC
//!      → SAFE_OP → cyclic worker + warm-up → OP → drive mode objects
//! ```
//!
//! Every state request goes through a [`RetryPolicy`]. Before the worker
//! runs, waits happen under the session lock; afterwards the lock is only
//! taken for short polls so the worker keeps its cadence.

use crate::context::SessionContext;
use crate::cyclic::{CyclicExchangeWorker, StopOutcome, WorkerSettings};
use crate::drive::{DriveModeConfigurer, DriveStateMachine, ModeReport};
use ecat_common::config::{BringupConfig, SessionConfig};
use ecat_common::error::{EcatError, EcatResult};
use ecat_common::state::{PhaseTracker, SessionPhase};
use ecat_common::time::CycleClock;
use ecat_fieldbus::dc_sync::{DcReport, DistributedClockConfigurer};
use ecat_fieldbus::master::{describe_lagging, lagging_slaves};
use ecat_fieldbus::pdo_mapping::{clear_assignments, PdoMappingConfigurer};
use ecat_fieldbus::slave::{al_status_description, NetworkState};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll step for state checks while the worker runs.
const STATE_POLL: Duration = Duration::from_millis(5);

/// Bounded retry for one state request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Wait per attempt.
    pub attempt_timeout: Duration,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Policy for requesting `target`: the base timeout scaled per state.
    #[must_use]
    pub fn for_state(target: NetworkState, config: &BringupConfig) -> Self {
        let (factor, max_attempts) = match target {
            NetworkState::PreOp => (config.preop_timeout_factor, config.max_attempts),
            NetworkState::SafeOp => (config.safeop_timeout_factor, config.max_attempts),
            NetworkState::Op => (config.op_timeout_factor, config.op_max_attempts),
            NetworkState::Init | NetworkState::Bootstrap => (1, 1),
        };
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout: config.base_transition_timeout * factor.max(1),
            backoff: config.backoff,
        }
    }

    /// Single attempt bounded by `timeout`.
    #[must_use]
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout: timeout,
            backoff: Duration::ZERO,
        }
    }

    /// Worst-case time spent before reporting failure.
    #[must_use]
    pub fn budget(&self) -> Duration {
        (self.attempt_timeout + self.backoff) * self.max_attempts
    }

    /// Run `attempt` until it reports success or attempts run out.
    ///
    /// `attempt` receives the 1-based attempt number and the per-attempt
    /// timeout. Returns whether an attempt succeeded.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `attempt`.
    pub fn run<F>(&self, mut attempt: F) -> EcatResult<bool>
    where
        F: FnMut(u32, Duration) -> EcatResult<bool>,
    {
        for n in 1..=self.max_attempts {
            if attempt(n, self.attempt_timeout)? {
                return Ok(true);
            }
            if n < self.max_attempts && !self.backoff.is_zero() {
                thread::sleep(self.backoff);
            }
        }
        Ok(false)
    }
}

/// What bring-up produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BringupReport {
    /// Enumerated slaves.
    pub slave_count: usize,
    /// Process image size.
    pub io_bytes: usize,
    /// Expected working counter per exchange.
    pub expected_wkc: u16,
    /// Default mapping was used after the custom map failed.
    pub used_default_mapping: bool,
    /// Distributed clock outcome.
    pub dc: Option<DcReport>,
    /// Worker ticks before Operational was requested.
    pub warmup_cycles: u64,
    /// Drives whose mode readback did not match.
    pub mode_mismatches: Vec<u16>,
}

/// Orchestrates the network state machine for one session.
#[derive(Debug)]
pub struct NetworkBringupController {
    context: Arc<SessionContext>,
    config: SessionConfig,
    phase: PhaseTracker,
    mapping: PdoMappingConfigurer,
    worker: Option<CyclicExchangeWorker>,
    report: BringupReport,
}

impl NetworkBringupController {
    /// Controller for `context` with the given configuration.
    #[must_use]
    pub fn new(context: Arc<SessionContext>, config: SessionConfig) -> Self {
        Self {
            context,
            config,
            phase: PhaseTracker::new(),
            mapping: PdoMappingConfigurer::new(),
            worker: None,
            report: BringupReport::default(),
        }
    }

    /// Replace the mapping configurer.
    #[must_use]
    pub fn with_mapping(mut self, mapping: PdoMappingConfigurer) -> Self {
        self.mapping = mapping;
        self
    }

    /// Current session phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase.phase()
    }

    /// Bring-up results so far.
    #[must_use]
    pub fn report(&self) -> &BringupReport {
        &self.report
    }

    /// The cyclic worker, once started.
    #[must_use]
    pub fn worker(&self) -> Option<&CyclicExchangeWorker> {
        self.worker.as_ref()
    }

    fn adapter(&self) -> String {
        self.config
            .network
            .interface
            .clone()
            .unwrap_or_else(|| "sim0".to_string())
    }

    /// Run the whole sequence up to Operational.
    ///
    /// On failure the phase becomes FAULT and the error is returned;
    /// releasing the network is left to [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Fatal conditions: adapter open failure, no slaves, a state not
    /// reached after all retries, mapping rejected, worker spawn failure.
    pub fn bring_up(&mut self) -> EcatResult<BringupReport> {
        match self.run_sequence() {
            Ok(()) => Ok(self.report.clone()),
            Err(e) => {
                error!(phase = %self.phase(), error = %e, "Bring-up failed");
                self.phase.enter_fault();
                Err(e)
            }
        }
    }

    fn run_sequence(&mut self) -> EcatResult<()> {
        self.open()?;

        self.advance_to(NetworkState::PreOp)?;
        self.phase.transition(SessionPhase::PreOp)?;

        self.report.io_bytes = self.apply_map_with_fallback()?;
        self.configure_dc()?;
        self.phase.transition(SessionPhase::Mapped)?;

        self.advance_to(NetworkState::SafeOp)?;
        self.phase.transition(SessionPhase::SafeOp)?;

        self.start_worker()?;
        self.phase.transition(SessionPhase::Cyclic)?;

        self.enter_operational()?;
        self.phase.transition(SessionPhase::Operational)?;

        if self.config.drive.configure_mode {
            let reports = DriveModeConfigurer::new(&self.config.drive).configure(&self.context);
            self.record_mode_reports(&reports);
        }
        info!(
            slaves = self.report.slave_count,
            io_bytes = self.report.io_bytes,
            expected_wkc = self.report.expected_wkc,
            "Network operational"
        );
        Ok(())
    }

    /// Bind the adapter and enumerate.
    ///
    /// # Errors
    ///
    /// [`EcatError::Connection`] from the master stack, or
    /// [`EcatError::NoSlaves`] when the scan is empty.
    pub fn open(&mut self) -> EcatResult<usize> {
        let adapter = self.adapter();
        let mut bus = self.context.lock();
        info!(adapter = %adapter, "Opening network adapter");
        bus.master.open(&adapter)?;

        let count = bus.master.enumerate_and_initialize()?;
        if count == 0 {
            return Err(EcatError::NoSlaves);
        }
        for slave in bus.master.slaves() {
            info!(
                slave = slave.position,
                name = %slave.name,
                identity = %slave.identity,
                state = %slave.al_state(),
                al_status = format!("{:#06x} ({})", slave.al_status_code, al_status_description(slave.al_status_code)),
                dc = slave.dc_supported,
                "Slave found"
            );
        }
        drop(bus);

        self.report.slave_count = count;
        self.phase.transition(SessionPhase::Opened)?;
        Ok(count)
    }

    /// Request `target` for the whole network and wait for every slave
    /// under the target's [`RetryPolicy`].
    ///
    /// # Errors
    ///
    /// [`EcatError::TransitionTimeout`] naming the lagging slaves and their
    /// AL status codes once all attempts are spent.
    pub fn advance_to(&mut self, target: NetworkState) -> EcatResult<()> {
        let policy = RetryPolicy::for_state(target, &self.config.bringup);
        self.advance_with(target, policy)
    }

    /// [`advance_to`](Self::advance_to) with an explicit policy.
    ///
    /// # Errors
    ///
    /// See [`advance_to`](Self::advance_to).
    pub fn advance_with(&mut self, target: NetworkState, policy: RetryPolicy) -> EcatResult<()> {
        let worker_running = self.worker.as_ref().is_some_and(CyclicExchangeWorker::is_running);
        info!(
            %target,
            attempts = policy.max_attempts,
            attempt_timeout_ms = policy.attempt_timeout.as_millis(),
            "Requesting network state"
        );

        let context = Arc::clone(&self.context);
        let reached = policy.run(|attempt, timeout| {
            let wkc = context.lock().master.request_network_state(target)?;
            debug!(%target, attempt, wkc, "State request written");
            let reached = if worker_running {
                poll_state(&context, target, timeout)?
            } else {
                let mut bus = context.lock();
                bus.master.wait_for_state(target, timeout)?;
                lagging_slaves(bus.master.as_ref(), target).is_empty()
            };
            if !reached {
                let bus = context.lock();
                warn!(
                    %target,
                    attempt,
                    lagging = %describe_lagging(&lagging_slaves(bus.master.as_ref(), target)),
                    "State not reached"
                );
            }
            Ok(reached)
        })?;

        if reached {
            info!(%target, "Network state reached");
            return Ok(());
        }
        let bus = self.context.lock();
        Err(EcatError::TransitionTimeout {
            target: target.to_string(),
            lagging: describe_lagging(&lagging_slaves(bus.master.as_ref(), target)),
        })
    }

    /// Program the CST mapping and commit the process image.
    ///
    /// When the custom mapping is rejected, either by the object writes or
    /// by the master stack, clear the assignments, re-run initialization
    /// with the device defaults and try once more.
    ///
    /// # Errors
    ///
    /// [`EcatError::MappingRejected`] when the default mapping fails too
    /// or fallback is disabled.
    pub fn apply_map_with_fallback(&mut self) -> EcatResult<usize> {
        let first = {
            let mut bus = self.context.lock();
            self.mapping
                .configure_all(bus.master.as_mut())
                .and_then(|reports| {
                    debug!(slaves = reports.len(), "PDO mapping written");
                    bus.master.apply_process_data_map()
                })
        };

        let io_bytes = match first {
            Ok(bytes) => bytes,
            Err(e) if !self.config.bringup.map_fallback => return Err(e),
            Err(e) => {
                warn!(error = %e, "Custom PDO mapping failed; falling back to default mapping");
                self.fall_back_to_default_mapping()?
            }
        };

        let initial = DriveStateMachine::initial_frame(&self.config.drive);
        let mut bus = self.context.lock();
        bus.reset_channels(initial);
        self.report.expected_wkc = bus.master.expected_wkc();
        info!(io_bytes, expected_wkc = self.report.expected_wkc, "Process data map applied");
        Ok(io_bytes)
    }

    fn fall_back_to_default_mapping(&mut self) -> EcatResult<usize> {
        {
            let mut bus = self.context.lock();
            let positions: Vec<u16> = bus.master.slaves().iter().map(|s| s.position).collect();
            for slave in positions {
                if let Err(e) = clear_assignments(bus.master.as_mut(), slave) {
                    warn!(slave, error = %e, "Cannot clear PDO assignments");
                }
            }
            let count = bus.master.enumerate_and_initialize()?;
            if count != self.report.slave_count {
                warn!(before = self.report.slave_count, after = count, "Slave count changed on re-initialization");
                self.report.slave_count = count;
            }
        }

        self.advance_to(NetworkState::PreOp)?;

        let mut bus = self.context.lock();
        let io_bytes = bus.master.apply_process_data_map().map_err(|e| {
            EcatError::MappingRejected(format!("default mapping also failed: {e}"))
        })?;
        self.report.used_default_mapping = true;
        info!(io_bytes, "Default PDO mapping applied");
        Ok(io_bytes)
    }

    fn configure_dc(&mut self) -> EcatResult<()> {
        if !self.config.dc.enabled {
            info!("Distributed clocks disabled");
            return Ok(());
        }
        let mut configurer =
            DistributedClockConfigurer::new(self.config.cycle.period, self.config.dc.phase_shift);
        if !self.config.dc.verify {
            configurer = configurer.without_verification();
        }
        let report = {
            let mut bus = self.context.lock();
            configurer.configure(bus.master.as_mut())?
        };
        if report.defects() > 0 {
            warn!(
                defects = report.defects(),
                "Distributed clock verification found defects; Operational may be unstable"
            );
        }
        self.report.dc = Some(report);
        Ok(())
    }

    fn start_worker(&mut self) -> EcatResult<()> {
        let mut worker = CyclicExchangeWorker::new(
            Arc::clone(&self.context),
            WorkerSettings::from_config(&self.config),
        );
        worker.start()?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Warm the worker up, then request Operational.
    ///
    /// Slaves may refuse Operational until they have seen periodic
    /// outputs, so the request waits for the configured number of ticks
    /// (capped in wall time).
    ///
    /// # Errors
    ///
    /// [`EcatError::WorkerSpawn`] when no worker runs, otherwise as
    /// [`advance_to`](Self::advance_to).
    pub fn enter_operational(&mut self) -> EcatResult<()> {
        let Some(worker) = self.worker.as_ref().filter(|w| w.is_running()) else {
            return Err(EcatError::WorkerSpawn(
                "Operational requires a running cyclic worker".into(),
            ));
        };

        let clock = CycleClock::new(self.config.cycle.period);
        let bringup = &self.config.bringup;
        let wanted = clock.capped_ticks(bringup.warmup_cycles, bringup.warmup_cap);
        let done = worker.wait_for_cycles(wanted, bringup.warmup_cap);
        self.report.warmup_cycles = done;

        let stats = self.context.wkc_stats();
        info!(
            warmup_ticks = done,
            wanted,
            last_wkc = stats.last_wkc,
            expected_wkc = stats.expected_wkc,
            "Worker warm-up complete"
        );
        if stats.last_wkc < i32::from(stats.expected_wkc) {
            warn!(
                last_wkc = stats.last_wkc,
                expected_wkc = stats.expected_wkc,
                "Working counter below expected before Operational request"
            );
        }

        self.advance_to(NetworkState::Op)
    }

    fn record_mode_reports(&mut self, reports: &[ModeReport]) {
        self.report.mode_mismatches = reports
            .iter()
            .filter(|r| !r.policy_ok() || !r.mode_confirmed())
            .map(|r| r.slave)
            .collect();
    }

    /// Mark the hand-off to the drive sequencer.
    ///
    /// # Errors
    ///
    /// [`EcatError::InvalidStateTransition`] unless the network is Operational.
    pub fn mark_running(&mut self) -> EcatResult<()> {
        self.phase.transition(SessionPhase::Running)
    }

    /// Stop the worker, step the network down and release the adapter.
    ///
    /// Every step is best effort; failures are logged.
    pub fn shutdown(&mut self) -> StopOutcome {
        if self.phase().is_terminal() {
            return StopOutcome::NotRunning;
        }
        if self.phase() == SessionPhase::Idle {
            self.close_adapter();
            self.shutdown_phase(SessionPhase::Closed);
            return StopOutcome::NotRunning;
        }

        info!(phase = %self.phase(), "Shutting down network session");
        self.shutdown_phase(SessionPhase::Stopping);

        let outcome = self
            .worker
            .as_mut()
            .map_or(StopOutcome::NotRunning, CyclicExchangeWorker::stop);

        if outcome != StopOutcome::Leaked {
            let once = RetryPolicy::once(self.config.bringup.base_transition_timeout);
            for target in [NetworkState::SafeOp, NetworkState::Init] {
                if self.master_is_open_below(target) {
                    continue;
                }
                if let Err(e) = self.advance_with(target, once) {
                    debug!(%target, error = %e, "Step-down not confirmed");
                }
            }
            self.close_adapter();
        } else {
            error!("Cyclic worker still alive; leaving adapter open");
        }

        self.shutdown_phase(SessionPhase::Closed);
        info!("Network session closed");
        outcome
    }

    /// Phase change on the shutdown path; a refused change is logged.
    fn shutdown_phase(&mut self, target: SessionPhase) -> bool {
        match self.phase.transition(target) {
            Ok(()) => true,
            Err(e) => {
                warn!(from = %self.phase(), to = %target, error = %e, "Shutdown phase change refused");
                false
            }
        }
    }

    fn master_is_open_below(&self, target: NetworkState) -> bool {
        let bus = self.context.lock();
        let slaves = bus.master.slaves();
        slaves.is_empty() || slaves.iter().all(|s| s.state <= target)
    }

    fn close_adapter(&self) {
        if let Err(e) = self.context.lock().master.close() {
            warn!(error = %e, "Adapter close failed");
        }
    }
}

/// Poll the network state in short lock windows until every slave
/// reaches `target` or `timeout` elapses.
fn poll_state(context: &SessionContext, target: NetworkState, timeout: Duration) -> EcatResult<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let mut bus = context.lock();
            bus.master.read_network_state()?;
            if lagging_slaves(bus.master.as_ref(), target).is_empty() {
                return Ok(true);
            }
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(STATE_POLL);
    }
}
