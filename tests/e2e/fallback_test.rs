//! Mapping fallback and failed bring-up.

use super::common::fast_config;
use ecat_common::error::EcatError;
use ecat_common::state::SessionPhase;
use ecat_fieldbus::{objects, NetworkState, SimulatedMaster};
use ecat_runtime::Session;

#[test]
fn test_fallback_to_default_mapping() {
    let sim = SimulatedMaster::new(2).fail_map_attempts(1);
    let probe = sim.probe();
    let mut session = Session::with_master(fast_config(), Box::new(sim)).unwrap();

    let bringup = session.bring_up().unwrap();
    assert!(bringup.used_default_mapping);
    assert_eq!(bringup.io_bytes, 36);

    let record = probe.lock();
    assert_eq!(record.map_attempts, 2);
    // Assignments were cleared on both slaves before re-initialization.
    for slave in 0..2 {
        assert!(record.object_writes.iter().any(|w| w.slave == slave
            && w.address.index == objects::SM2_ASSIGN
            && w.data == vec![0]));
    }
    // Nobody left Pre-Operational until the map was accepted.
    let first_safeop = record
        .state_log
        .iter()
        .position(|(_, s)| *s == NetworkState::SafeOp)
        .unwrap();
    assert!(record.state_log[..first_safeop]
        .iter()
        .all(|(_, s)| *s == NetworkState::PreOp));
    drop(record);

    session.stop();
}

#[test]
fn test_fallback_disabled_fails_and_closes() {
    let mut config = fast_config();
    config.bringup.map_fallback = false;
    let sim = SimulatedMaster::new(1).fail_map_attempts(1);
    let probe = sim.probe();
    let mut session = Session::with_master(config, Box::new(sim)).unwrap();

    assert!(matches!(
        session.bring_up(),
        Err(EcatError::MappingRejected(_))
    ));
    assert_eq!(session.phase(), SessionPhase::Closed);
    assert_eq!(probe.lock().close_calls, 1);
}

#[test]
fn test_open_failure_reported() {
    let sim = SimulatedMaster::new(1).fail_open("no such device");
    let mut session = Session::with_master(fast_config(), Box::new(sim)).unwrap();
    match session.bring_up().unwrap_err() {
        EcatError::Connection { adapter, reason } => {
            assert_eq!(adapter, "sim0");
            assert_eq!(reason, "no such device");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(session.phase(), SessionPhase::Closed);
}
