//! Runtime integration tests against the simulated master.
//!
//! These tests run the real worker thread and the bring-up controller:
//! - Worker cadence, per-interval window and bounded stop
//! - Bring-up to Operational, with and without the mapping fallback
//! - Operational refused until periodic outputs were seen
//! - Control word progression and per-state frame counts on the wire

use ecat_common::config::SessionConfig;
use ecat_common::error::EcatError;
use ecat_common::state::SessionPhase;
use ecat_common::time::CycleClock;
use ecat_fieldbus::{
    MasterStack, NetworkState, OutputFrame, SimulatedMaster, WkcClass, WorkingCounterMonitor,
};
use ecat_runtime::{
    CyclicExchangeWorker, NetworkBringupController, Session, SessionContext, StopOutcome,
    WorkerSettings,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Test Helpers
// ============================================================================

const PERIOD: Duration = Duration::from_millis(2);

/// Intervals skipped while the thread and the simulator warm up.
const WARMUP_INTERVALS: usize = 5;

/// Slack on top of period + receive timeout for a stop to complete.
const STOP_EPSILON: Duration = Duration::from_millis(5);

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

fn safeop_context(sim: SimulatedMaster) -> Arc<SessionContext> {
    let mut sim = sim;
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

fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        period: PERIOD,
        receive_timeout: Duration::from_millis(1),
        ..WorkerSettings::default()
    }
}

// ============================================================================
// Cyclic worker
// ============================================================================

#[test]
fn test_worker_interval_within_half_period() {
    let ctx = safeop_context(SimulatedMaster::new(1));
    let mut worker = CyclicExchangeWorker::new(Arc::clone(&ctx), worker_settings());
    worker.start().unwrap();

    let done = worker.wait_for_cycles(100, Duration::from_secs(2));
    assert!(done >= 100, "only {done} ticks");

    let snapshot = worker.metrics();
    let mean = snapshot.mean_interval_ns.unwrap();
    let period = u64::try_from(PERIOD.as_nanos()).unwrap();
    assert!(mean >= period / 2, "mean interval {mean}ns too short");
    assert!(mean <= period * 3 / 2, "mean interval {mean}ns too long");

    let intervals = worker.intervals();
    assert!(intervals.len() > WARMUP_INTERVALS + 90);
    for (i, interval) in intervals.iter().enumerate().skip(WARMUP_INTERVALS) {
        assert!(
            *interval >= PERIOD / 2 && *interval <= PERIOD * 3 / 2,
            "interval {i} was {interval:?}"
        );
    }

    assert_eq!(worker.stop(), StopOutcome::Joined);
}

#[test]
fn test_stop_joins_within_period_and_receive_timeout() {
    // Every frame is dropped, so each tick spends the full receive timeout.
    let ctx = safeop_context(SimulatedMaster::new(1).drop_every(1));
    let settings = worker_settings();
    let bound = settings.period + settings.receive_timeout + STOP_EPSILON;
    let mut worker = CyclicExchangeWorker::new(Arc::clone(&ctx), settings);
    worker.start().unwrap();
    assert!(worker.wait_for_cycles(20, Duration::from_secs(1)) >= 20);

    let started = Instant::now();
    assert_eq!(worker.stop(), StopOutcome::Joined);
    let elapsed = started.elapsed();
    assert!(elapsed <= bound, "stop took {elapsed:?}, bound {bound:?}");
    assert!(!ctx.worker_active());
}

#[test]
fn test_no_frames_after_stop() {
    let sim = SimulatedMaster::new(2);
    let probe = sim.probe();
    let ctx = safeop_context(sim);
    let mut worker = CyclicExchangeWorker::new(Arc::clone(&ctx), worker_settings());
    worker.start().unwrap();
    worker.wait_for_cycles(20, Duration::from_secs(1));

    assert_eq!(worker.stop(), StopOutcome::Joined);
    assert!(!worker.is_running());
    assert!(!ctx.worker_active());

    let sent = probe.frames_sent();
    thread::sleep(PERIOD * 10);
    assert_eq!(probe.frames_sent(), sent);
}

#[test]
fn test_dropped_frames_do_not_stop_worker() {
    let ctx = safeop_context(SimulatedMaster::new(1).drop_every(5));
    let mut worker = CyclicExchangeWorker::new(Arc::clone(&ctx), worker_settings());
    worker.start().unwrap();
    let done = worker.wait_for_cycles(50, Duration::from_secs(2));
    assert!(done >= 50);
    assert!(worker.is_running());

    let stats = ctx.wkc_stats();
    assert!(stats.timeout >= 5, "timeouts {}", stats.timeout);
    assert!(stats.total() >= 50);
    worker.stop();
}

#[test]
fn test_safeop_exchange_is_degraded() {
    let ctx = safeop_context(SimulatedMaster::new(1));
    ctx.lock().prime().unwrap();
    let class = ctx.lock().exchange(Duration::from_millis(1)).unwrap();
    // Inputs only until Operational: 1 of 3.
    assert_eq!(class, WkcClass::Degraded);
    assert!(ctx.input(0).is_some());
}

// ============================================================================
// Bring-up
// ============================================================================

#[test]
fn test_bring_up_with_map_fallback() {
    let sim = SimulatedMaster::new(1).fail_map_attempts(1);
    let probe = sim.probe();
    let ctx = SessionContext::new(Box::new(sim), WorkingCounterMonitor::new(0.1, 100));
    let mut ctl = NetworkBringupController::new(ctx, fast_config());

    let report = ctl.bring_up().unwrap();
    assert!(report.used_default_mapping);
    assert_eq!(report.io_bytes, 18);
    assert_eq!(ctl.phase(), SessionPhase::Operational);

    {
        let record = probe.lock();
        assert_eq!(record.map_attempts, 2);
        assert_eq!(record.enumerations, 2);
        let states: Vec<NetworkState> = record
            .state_log
            .iter()
            .filter(|(slave, _)| *slave == 0)
            .map(|(_, state)| *state)
            .collect();
        assert_eq!(
            &states[..3],
            &[NetworkState::PreOp, NetworkState::SafeOp, NetworkState::Op]
        );
    }

    ctl.shutdown();
    assert_eq!(ctl.phase(), SessionPhase::Closed);
}

#[test]
fn test_op_waits_for_outputs() {
    let sim = SimulatedMaster::new(1).refuse_op_without_outputs(50);
    let mut config = fast_config();
    config.bringup.warmup_cycles = 100;
    let ctx = SessionContext::new(Box::new(sim), WorkingCounterMonitor::new(0.1, 100));
    let mut ctl = NetworkBringupController::new(ctx, config);

    let report = ctl.bring_up().unwrap();
    assert!(report.warmup_cycles >= 50);
    ctl.shutdown();
}

#[test]
fn test_op_refused_reports_al_status() {
    let sim = SimulatedMaster::new(1).refuse_op_without_outputs(1_000_000);
    let mut config = fast_config();
    config.bringup.warmup_cycles = 0;
    config.bringup.op_max_attempts = 1;
    let ctx = SessionContext::new(Box::new(sim), WorkingCounterMonitor::new(0.1, 100));
    let mut ctl = NetworkBringupController::new(ctx, config);

    match ctl.bring_up().unwrap_err() {
        EcatError::TransitionTimeout { target, lagging } => {
            assert_eq!(target, "OP");
            assert!(lagging.contains("0x001b"), "{lagging}");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(ctl.phase(), SessionPhase::Fault);
    assert_eq!(ctl.shutdown(), StopOutcome::Joined);
    assert_eq!(ctl.phase(), SessionPhase::Closed);
}

// ============================================================================
// Session
// ============================================================================

#[test]
fn test_control_word_progression_on_wire() {
    let sim = SimulatedMaster::new(1).with_wire_trace();
    let probe = sim.probe();
    let mut session = Session::with_master(fast_config(), Box::new(sim)).unwrap();
    session.bring_up().unwrap();
    session.run(|tick| tick < 40).unwrap();
    session.stop();

    let mut words = probe.control_words(0);
    words.dedup();
    assert_eq!(words, vec![0x0080, 0x0006, 0x0007, 0x000F]);

    let record = probe.lock();
    let torques: Vec<i16> = record
        .wire
        .iter()
        .filter(|s| s.output.control_word != 0x000F)
        .map(|s| s.output.target_torque)
        .collect();
    assert!(torques.iter().all(|t| *t == 0));
    assert!(record.wire.iter().any(|s| s.output.target_torque == 50));
    assert!(record.wire.iter().all(|s| s.output.mode == 10));
}

#[test]
fn test_frames_per_control_word_follow_dwell() {
    let mut config = fast_config();
    config.drive.shutdown_hold = Duration::from_millis(40);
    config.drive.switch_on_hold = Duration::from_millis(40);
    config.drive.enable_hold = Duration::from_millis(40);
    let clock = CycleClock::new(config.cycle.period);
    let fault_reset = clock.ticks_for(config.drive.fault_reset);
    let shutdown = clock.ticks_for(config.drive.shutdown_hold);
    let switch_on = clock.ticks_for(config.drive.switch_on_hold);
    let enable = clock.ticks_for(config.drive.enable_hold);

    let sim = SimulatedMaster::new(1).with_wire_trace();
    let probe = sim.probe();
    let mut session = Session::with_master(config, Box::new(sim)).unwrap();
    session.bring_up().unwrap();
    let until_running = fault_reset + shutdown + switch_on + enable;
    session.run(|tick| tick < until_running + 20).unwrap();
    session.stop();

    let record = probe.lock();
    let count = |cw: u16, torque: i16| {
        let frames = record
            .wire
            .iter()
            .filter(|s| s.slave == 0)
            .filter(|s| s.output.control_word == cw && s.output.target_torque == torque)
            .count();
        u64::try_from(frames).unwrap()
    };
    // Worker and sequencer run on separate clocks; allow a few frames of skew.
    let near = |got: u64, ticks: u64| got.abs_diff(ticks) <= ticks / 4 + 2;

    assert!(count(0x0080, 0) >= fault_reset);
    assert!(near(count(0x0006, 0), shutdown), "shutdown frames {}", count(0x0006, 0));
    assert!(near(count(0x0007, 0), switch_on), "switch-on frames {}", count(0x0007, 0));
    assert!(near(count(0x000F, 0), enable), "enable frames {}", count(0x000F, 0));
    assert!(count(0x000F, 50) > 0);
}

#[test]
fn test_latched_non_critical_fault_shortens_reset() {
    let sim = SimulatedMaster::new(1).with_latched_fault(0, 0x730F, true);
    let mut session = Session::with_master(fast_config(), Box::new(sim)).unwrap();
    session.bring_up().unwrap();
    session.run(|tick| tick < 1).unwrap();

    let report = session.report();
    assert_eq!(report.faults.len(), 1);
    assert_eq!(report.faults[0].error_code, Some(0x730F));
    assert!(report.faults[0].non_critical);
    let timings = session.sequencer().unwrap().machines()[0].timings();
    assert_eq!(timings.fault_reset, 5);

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"phase\":\"RUNNING\""));
    session.stop();
}
