//! Full sessions from config file to close.

use super::common::{fast_config, write_config, FAST_CONFIG, FAST_TICKS_TO_RUNNING};
use ecat_common::config::SessionConfig;
use ecat_common::state::SessionPhase;
use ecat_fieldbus::SimulatedMaster;
use ecat_runtime::{DriveControlState, Session, StopOutcome};
use std::time::Duration;

#[test]
fn test_config_file_values_reach_session() {
    let config = fast_config();
    assert_eq!(config.cycle.period, Duration::from_millis(2));
    assert_eq!(config.network.simulated_slaves, 2);
    assert_eq!(config.drive.fault_reset, Duration::from_millis(20));
    assert_eq!(config.drive.non_critical_fault_codes, vec![0x730F]);

    let round_trip = SessionConfig::from_toml(&config.to_toml().unwrap()).unwrap();
    assert_eq!(round_trip.bringup.warmup_cap, Duration::from_millis(200));
}

#[test]
fn test_invalid_config_file_rejected() {
    let (_dir, path) = write_config("[cycle]\nperiod = \"0s\"\n");
    assert!(SessionConfig::from_file(&path).is_err());
}

#[test]
fn test_two_drives_reach_torque() {
    let mut session = Session::open(fast_config()).unwrap();
    let bringup = session.bring_up().unwrap();
    assert_eq!(bringup.slave_count, 2);
    assert_eq!(bringup.expected_wkc, 6);
    assert_eq!(session.phase(), SessionPhase::Operational);

    let ticks = session.run(|tick| tick < FAST_TICKS_TO_RUNNING + 10).unwrap();
    assert_eq!(ticks, FAST_TICKS_TO_RUNNING + 10);
    assert_eq!(session.phase(), SessionPhase::Running);

    let machines = session.sequencer().unwrap().machines();
    assert!(machines
        .iter()
        .all(|m| m.state() == DriveControlState::Running && m.torque() == 50));

    // Operation enabled with the drive model in CST.
    for slave in 0..2 {
        let input = session.context().input(slave).unwrap();
        assert!(input.status_word.operation_enabled(), "slave {slave}: {}", input.status_word);
    }

    let report = session.report();
    assert!(report.wkc.success > 0);
    assert!(report.worker_cycles >= FAST_TICKS_TO_RUNNING);

    assert_eq!(session.stop(), StopOutcome::Joined);
    assert_eq!(session.phase(), SessionPhase::Closed);
}

#[test]
fn test_report_serializes() {
    let mut session = Session::open(fast_config()).unwrap();
    session.bring_up().unwrap();
    session.run(|tick| tick < 5).unwrap();
    session.stop();

    let json = serde_json::to_value(session.report()).unwrap();
    assert_eq!(json["phase"], "CLOSED");
    assert_eq!(json["bringup"]["slave_count"], 2);
    assert_eq!(json["drives"].as_array().unwrap().len(), 2);
    assert!(json["wkc"]["success"].as_u64().unwrap() > 0);
}

#[test]
fn test_dropped_frames_keep_session_running() {
    let mut config = fast_config();
    config.network.simulated_slaves = 1;
    let sim = SimulatedMaster::new(1).drop_every(7);
    let mut session = Session::with_master(config, Box::new(sim)).unwrap();
    session.bring_up().unwrap();
    session.run(|tick| tick < FAST_TICKS_TO_RUNNING + 20).unwrap();

    assert!(session.sequencer().unwrap().all_running());
    let report = session.report();
    assert!(report.wkc.timeout > 0);
    assert!(report.lost_slaves.is_empty());
    session.stop();
}

#[test]
#[ignore = "runs the 7s default enable sequence"]
fn test_default_timing_sequence() {
    let (_dir, path) = write_config("[network]\nsimulated_slaves = 1\n");
    let config = SessionConfig::from_file(&path).unwrap();
    let mut session = Session::open(config).unwrap();
    session.bring_up().unwrap();

    // 4000 + 1000 + 1000 + 1000 ms at 2ms.
    session.run(|tick| tick < 3499).unwrap();
    let machine = &session.sequencer().unwrap().machines()[0];
    assert_eq!(machine.state(), DriveControlState::EnableOperation);
    assert_eq!(machine.torque(), 0);

    session.run(|tick| tick < 3501).unwrap();
    let machine = &session.sequencer().unwrap().machines()[0];
    assert_eq!(machine.state(), DriveControlState::Running);
    assert_eq!(machine.torque(), 50);

    session.stop();
}

#[test]
fn test_fast_config_is_not_default_timing() {
    assert!(FAST_CONFIG.contains("fault_reset = \"20ms\""));
}
