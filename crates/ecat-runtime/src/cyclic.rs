//! Cyclic process data exchange.
//!
//! The worker runs on its own thread from the moment Safe-Operational is
//! reached until the session stops. Each tick:
//! 1. Lock the session
//! 2. Receive the returning frame and classify its working counter
//! 3. Encode every drive's output fields into its buffer
//! 4. Send
//! 5. Unlock, then sleep until the next deadline
//!
//! Slaves drop out of Operational when outputs stop arriving, so neither
//! an overrun nor a failed exchange ends the loop. Only the stop flag does.

use crate::context::SessionContext;
use crate::realtime::{self, RealtimeStatus};
use ecat_common::config::{RealtimeConfig, SessionConfig};
use ecat_common::error::{EcatError, EcatResult};
use ecat_common::metrics::{TickMetrics, TickSnapshot};
use ecat_common::time::CycleClock;
use ecat_fieldbus::dc_sync::DcPhaseLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Interval samples kept for percentile reporting.
const METRICS_WINDOW: usize = 1024;

/// Poll step while waiting for the worker to exit.
const JOIN_POLL: Duration = Duration::from_millis(1);

/// Worker parameters, fixed at start.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Tick period.
    pub period: Duration,
    /// Bounded wait for the returning frame.
    pub receive_timeout: Duration,
    /// Minimum ticks between two jitter warnings.
    pub jitter_warning_interval: u64,
    /// Bound on the join in [`CyclicExchangeWorker::stop`].
    pub join_timeout: Duration,
    /// Send one frame before the first receive.
    pub initial_frame: bool,
    /// Steer deadlines onto the reference clock with this SYNC0 shift.
    pub phase_lock: Option<Duration>,
    /// Scheduling setup applied inside the worker thread.
    pub realtime: RealtimeConfig,
}

impl WorkerSettings {
    /// Settings derived from a session configuration.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            period: config.cycle.period,
            receive_timeout: config.cycle.receive_timeout,
            jitter_warning_interval: config.cycle.jitter_warning_interval.max(1),
            join_timeout: config.cycle.join_timeout,
            initial_frame: config.cycle.initial_frame,
            phase_lock: (config.dc.enabled && config.dc.phase_lock).then_some(config.dc.phase_shift),
            realtime: config.realtime.clone(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Outcome of [`CyclicExchangeWorker::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker was not running.
    NotRunning,
    /// The thread exited and was joined.
    Joined,
    /// The thread did not exit within the join bound and was detached.
    Leaked,
}

/// Background exchange loop bound to one session.
#[derive(Debug)]
pub struct CyclicExchangeWorker {
    context: Arc<SessionContext>,
    settings: WorkerSettings,
    stop_requested: Arc<AtomicBool>,
    metrics: Arc<Mutex<TickMetrics>>,
    realtime_status: Arc<Mutex<Option<RealtimeStatus>>>,
    handle: Option<JoinHandle<()>>,
}

impl CyclicExchangeWorker {
    /// Create a stopped worker for `context`.
    #[must_use]
    pub fn new(context: Arc<SessionContext>, settings: WorkerSettings) -> Self {
        let metrics = TickMetrics::new(METRICS_WINDOW, settings.period);
        Self {
            context,
            settings,
            stop_requested: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(Mutex::new(metrics)),
            realtime_status: Arc::new(Mutex::new(None)),
            handle: None,
        }
    }

    /// Spawn the exchange thread.
    ///
    /// # Errors
    ///
    /// Returns [`EcatError::WorkerSpawn`] when a worker is already active
    /// on this session or the thread cannot be created.
    pub fn start(&mut self) -> EcatResult<()> {
        if !self.context.claim_worker() {
            return Err(EcatError::WorkerSpawn(
                "a cyclic worker is already active for this session".into(),
            ));
        }

        info!(
            period_us = self.settings.period.as_micros(),
            receive_timeout_us = self.settings.receive_timeout.as_micros(),
            phase_lock = self.settings.phase_lock.is_some(),
            "Starting cyclic exchange worker"
        );

        self.stop_requested.store(false, Ordering::Release);
        let run = WorkerLoop {
            context: Arc::clone(&self.context),
            settings: self.settings.clone(),
            stop_requested: Arc::clone(&self.stop_requested),
            metrics: Arc::clone(&self.metrics),
            realtime_status: Arc::clone(&self.realtime_status),
        };

        match thread::Builder::new()
            .name("ecat-cyclic".into())
            .spawn(move || run.run())
        {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.context.release_worker();
                Err(EcatError::WorkerSpawn(e.to_string()))
            }
        }
    }

    /// Request the loop to stop and join it within the configured bound.
    ///
    /// A thread still alive after the bound is logged and detached; the
    /// session slot stays claimed until it actually exits.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(handle) = self.handle.take() else {
            return StopOutcome::NotRunning;
        };

        info!("Stopping cyclic exchange worker");
        self.stop_requested.store(true, Ordering::Release);

        let deadline = Instant::now() + self.settings.join_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }

        if !handle.is_finished() {
            error!(
                join_timeout_ms = self.settings.join_timeout.as_millis(),
                "Cyclic worker did not exit in time; detaching thread"
            );
            return StopOutcome::Leaked;
        }

        if handle.join().is_err() {
            warn!("Cyclic worker thread panicked");
        }
        info!(cycles = self.context.cycles(), "Cyclic exchange worker stopped");
        StopOutcome::Joined
    }

    /// True while the thread has been started and has not exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Completed ticks on this session.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.context.cycles()
    }

    /// Tick timing snapshot.
    #[must_use]
    pub fn metrics(&self) -> TickSnapshot {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Recent inter-tick intervals, oldest first.
    #[must_use]
    pub fn intervals(&self) -> Vec<Duration> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .intervals()
    }

    /// Real-time setup the thread obtained, once it has started.
    #[must_use]
    pub fn realtime_status(&self) -> Option<RealtimeStatus> {
        self.realtime_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until `ticks` more cycles completed or `cap` elapsed.
    /// Returns the number of ticks actually observed.
    pub fn wait_for_cycles(&self, ticks: u64, cap: Duration) -> u64 {
        let start_cycles = self.cycles();
        let deadline = Instant::now() + cap;
        let poll = (self.settings.period / 2).max(Duration::from_micros(100));
        loop {
            let done = self.cycles().saturating_sub(start_cycles);
            if done >= ticks || Instant::now() >= deadline || !self.is_running() {
                return done;
            }
            thread::sleep(poll);
        }
    }
}

impl Drop for CyclicExchangeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved into the worker thread.
struct WorkerLoop {
    context: Arc<SessionContext>,
    settings: WorkerSettings,
    stop_requested: Arc<AtomicBool>,
    metrics: Arc<Mutex<TickMetrics>>,
    realtime_status: Arc<Mutex<Option<RealtimeStatus>>>,
}

impl WorkerLoop {
    fn run(self) {
        let status = match realtime::apply_to_current_thread(&self.settings.realtime) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Real-time setup failed; continuing with normal scheduling");
                RealtimeStatus::default()
            }
        };
        *self
            .realtime_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(status);

        let clock = CycleClock::new(self.settings.period);
        let period = clock.period();
        let mut phase_lock = self
            .settings
            .phase_lock
            .map(|shift| DcPhaseLock::new(period, shift));

        if self.settings.initial_frame && !self.stop_requested.load(Ordering::Acquire) {
            if let Err(e) = self.context.lock().prime() {
                warn!(error = %e, "Initial frame failed");
            }
        }

        let mut next_deadline = Instant::now() + period;
        let mut last_start: Option<Instant> = None;
        let mut last_jitter_warning: Option<u64> = None;

        while !self.stop_requested.load(Ordering::Acquire) {
            let start = Instant::now();
            let interval = last_start.map(|t| start.duration_since(t));
            last_start = Some(start);

            let outcome = {
                let mut bus = self.context.lock();
                bus.exchange(self.settings.receive_timeout)
                    .map(|class| (class, bus.master.dc_time()))
            };

            let (_, dc_time) = match outcome {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Cyclic exchange failed; backing off one period");
                    thread::sleep(period);
                    next_deadline = Instant::now() + period;
                    continue;
                }
            };

            let tick = self.context.count_cycle();
            let exec = start.elapsed();
            let overrun = self
                .metrics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(exec, interval);

            let now = Instant::now();
            if overrun || now >= next_deadline {
                let due = last_jitter_warning
                    .map_or(true, |at| tick - at >= self.settings.jitter_warning_interval);
                if due {
                    last_jitter_warning = Some(tick);
                    warn!(
                        tick,
                        exec_us = exec.as_micros(),
                        period_us = period.as_micros(),
                        "Cycle overran its period; skipping sleep"
                    );
                }
                // Restart the schedule from now instead of bursting to catch up.
                next_deadline = now + period;
                continue;
            }

            let mut deadline = next_deadline;
            if let (Some(lock), Some(dc)) = (phase_lock.as_mut(), dc_time) {
                let offset_ns = lock.update(dc);
                deadline = shift_deadline(deadline, offset_ns);
            }
            wait_until(deadline);
            next_deadline = deadline + period;
            trace!(tick, exec_us = exec.as_micros(), "Tick complete");
        }

        debug!(cycles = self.context.cycles(), "Cyclic worker loop exited");
        self.context.release_worker();
    }
}

/// Move `deadline` by a signed nanosecond offset.
fn shift_deadline(deadline: Instant, offset_ns: i64) -> Instant {
    let magnitude = Duration::from_nanos(offset_ns.unsigned_abs());
    if offset_ns >= 0 {
        deadline + magnitude
    } else {
        deadline.checked_sub(magnitude).unwrap_or(deadline)
    }
}

/// Sleep until `deadline` on the monotonic clock.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn wait_until(deadline: Instant) {
    let now = Instant::now();
    if deadline <= now {
        return;
    }
    let remaining = deadline - now;
    let ts = libc::timespec {
        tv_sec: libc::time_t::try_from(remaining.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::try_from(remaining.subsec_nanos()).unwrap_or(0),
    };
    // SAFETY: `ts` is a valid relative interval and the remainder pointer may be null.
    unsafe {
        libc::clock_nanosleep(libc::CLOCK_MONOTONIC, 0, &ts, std::ptr::null_mut());
    }
}

#[cfg(not(target_os = "linux"))]
fn wait_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecat_fieldbus::frame::OutputFrame;
    use ecat_fieldbus::simulated::SimulatedMaster;
    use ecat_fieldbus::wkc::WorkingCounterMonitor;

    fn context() -> Arc<SessionContext> {
        let ctx = SessionContext::new(
            Box::new(SimulatedMaster::new(1)),
            WorkingCounterMonitor::new(0.5, 10),
        );
        {
            let mut bus = ctx.lock();
            bus.master.open("sim0").unwrap();
            bus.master.enumerate_and_initialize().unwrap();
            bus.master.apply_process_data_map().unwrap();
            bus.reset_channels(OutputFrame::default());
        }
        ctx
    }

    fn settings(period_ms: u64) -> WorkerSettings {
        WorkerSettings {
            period: Duration::from_millis(period_ms),
            receive_timeout: Duration::from_millis(1),
            join_timeout: Duration::from_millis(500),
            ..WorkerSettings::default()
        }
    }

    #[test]
    fn test_start_counts_cycles() {
        let mut worker = CyclicExchangeWorker::new(context(), settings(2));
        worker.start().unwrap();
        assert!(worker.is_running());
        let done = worker.wait_for_cycles(20, Duration::from_secs(2));
        assert!(done >= 20);
        assert_eq!(worker.stop(), StopOutcome::Joined);
        assert!(!worker.is_running());
    }

    #[test]
    fn test_second_worker_rejected() {
        let ctx = context();
        let mut first = CyclicExchangeWorker::new(Arc::clone(&ctx), settings(2));
        let mut second = CyclicExchangeWorker::new(Arc::clone(&ctx), settings(2));
        first.start().unwrap();
        assert!(matches!(second.start(), Err(EcatError::WorkerSpawn(_))));
        first.stop();
        assert!(!ctx.worker_active());
        second.start().unwrap();
        second.stop();
    }

    #[test]
    fn test_stop_without_start() {
        let mut worker = CyclicExchangeWorker::new(context(), settings(2));
        assert_eq!(worker.stop(), StopOutcome::NotRunning);
    }

    #[test]
    fn test_shift_deadline() {
        let base = Instant::now() + Duration::from_millis(10);
        assert_eq!(shift_deadline(base, 1_000), base + Duration::from_micros(1));
        assert_eq!(shift_deadline(base, -1_000), base - Duration::from_micros(1));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = SessionConfig::default();
        config.dc.phase_lock = true;
        config.dc.phase_shift = Duration::from_micros(100);
        let settings = WorkerSettings::from_config(&config);
        assert_eq!(settings.phase_lock, Some(Duration::from_micros(100)));

        config.dc.enabled = false;
        assert!(WorkerSettings::from_config(&config).phase_lock.is_none());
    }
}
