//! Fieldbus integration tests against the simulated master.
//!
//! These tests cover the pre-cyclic bring-up path without the runtime:
//! - PDO map programming and readback
//! - Default-mapping fallback after a rejected process data map
//! - Distributed clock arming ahead of Safe-Operational
//! - Working counter classification under dropped and short frames

use ecat_common::error::EcatError;
use ecat_fieldbus::{
    clear_assignments, lagging_slaves, objects, DistributedClockConfigurer, InputFrame,
    MasterStack, NetworkState, ObjectAccess, OutputFrame, PdoMap, PdoMapEntry,
    PdoMappingConfigurer, SdoAddress, SimulatedMaster, WkcClass, WorkingCounterMonitor,
};
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

const TIMEOUT: Duration = Duration::from_millis(50);

fn preop(drives: u16) -> SimulatedMaster {
    let mut sim = SimulatedMaster::new(drives);
    sim.open("sim0").unwrap();
    assert_eq!(sim.enumerate_and_initialize().unwrap(), usize::from(drives));
    sim
}

fn to_safeop(sim: &mut SimulatedMaster) {
    PdoMappingConfigurer::new().configure_all(sim).unwrap();
    sim.apply_process_data_map().unwrap();
    sim.request_network_state(NetworkState::SafeOp).unwrap();
    assert_eq!(
        sim.wait_for_state(NetworkState::SafeOp, TIMEOUT).unwrap(),
        NetworkState::SafeOp
    );
}

fn exchange(sim: &mut SimulatedMaster) -> i32 {
    sim.send_output_frame().unwrap();
    sim.receive_input_frame(Duration::from_millis(1)).unwrap()
}

// ============================================================================
// Mapping
// ============================================================================

#[test]
fn test_mapping_readback_for_many_layouts() {
    let layouts: Vec<Vec<PdoMapEntry>> = vec![
        vec![PdoMapEntry::new(0x6040, 0, 16)],
        PdoMap::rx_cst().entries,
        vec![
            PdoMapEntry::new(0x6040, 0, 16),
            PdoMapEntry::new(0x607A, 0, 32),
            PdoMapEntry::new(0x60FE, 1, 32),
            PdoMapEntry::new(0x60B8, 0, 16),
            PdoMapEntry::padding(8),
            PdoMapEntry::new(0x6060, 0, 8),
        ],
    ];

    for entries in layouts {
        let mut sim = preop(1);
        let rx = PdoMap {
            entries: entries.clone(),
            ..PdoMap::rx_cst()
        };
        let report = PdoMappingConfigurer::new()
            .with_maps(rx, PdoMap::tx_cst())
            .configure(&mut sim, 0);
        assert!(report.policy_ok());

        let count = sim.read_u8(0, SdoAddress::new(0x1600, 0)).unwrap();
        assert_eq!(usize::from(count), entries.len());
        let read = PdoMappingConfigurer::read_back(&mut sim, 0, 0x1600).unwrap();
        assert_eq!(read, entries);
    }
}

#[test]
fn test_mapping_sizes_process_image() {
    let mut sim = preop(3);
    to_safeop(&mut sim);
    for slave in sim.slaves() {
        assert_eq!(slave.outputs.len(), 6);
        assert_eq!(slave.inputs.len(), 12);
    }
    assert_eq!(sim.expected_wkc(), 9);
}

#[test]
fn test_mapping_outside_preop_is_rejected() {
    let mut sim = preop(1);
    to_safeop(&mut sim);

    let reports = PdoMappingConfigurer::new().configure_all(&mut sim);
    assert!(matches!(reports, Err(EcatError::MappingRejected(_))));
}

#[test]
fn test_default_mapping_fallback_stays_in_preop() {
    let mut sim = preop(2).fail_map_attempts(1);
    let probe = sim.probe();

    PdoMappingConfigurer::new().configure_all(&mut sim).unwrap();
    let err = sim.apply_process_data_map().unwrap_err();
    assert!(matches!(err, EcatError::MappingRejected(_)));

    for position in 0..2 {
        clear_assignments(&mut sim, position).unwrap();
    }
    sim.enumerate_and_initialize().unwrap();
    assert_eq!(sim.read_network_state().unwrap(), NetworkState::PreOp);
    assert_eq!(sim.apply_process_data_map().unwrap(), 2 * 18);

    let record = probe.lock();
    assert_eq!(record.map_attempts, 2);
    assert_eq!(record.enumerations, 2);
    let preop_reached = record
        .state_log
        .iter()
        .position(|(_, s)| *s == NetworkState::PreOp)
        .unwrap();
    assert!(record.state_log[preop_reached..]
        .iter()
        .all(|(_, s)| *s >= NetworkState::PreOp));
}

// ============================================================================
// State machine
// ============================================================================

#[test]
fn test_op_requires_periodic_outputs() {
    let mut sim = preop(2).refuse_op_without_outputs(10);
    to_safeop(&mut sim);

    sim.request_network_state(NetworkState::Op).unwrap();
    assert_eq!(
        sim.wait_for_state(NetworkState::Op, Duration::from_millis(5)).unwrap(),
        NetworkState::SafeOp
    );
    let lagging = lagging_slaves(&sim, NetworkState::Op);
    assert_eq!(lagging.len(), 2);
    assert!(lagging[0].to_string().contains("sync manager watchdog"));

    for _ in 0..10 {
        exchange(&mut sim);
    }
    sim.request_network_state(NetworkState::Op).unwrap();
    assert_eq!(
        sim.wait_for_state(NetworkState::Op, TIMEOUT).unwrap(),
        NetworkState::Op
    );
    assert!(lagging_slaves(&sim, NetworkState::Op).is_empty());
}

#[test]
fn test_skipping_states_is_refused() {
    let mut sim = preop(1);
    sim.apply_process_data_map().unwrap();
    sim.request_network_state(NetworkState::Op).unwrap();
    assert_eq!(sim.read_network_state().unwrap(), NetworkState::PreOp);
    assert_eq!(sim.slaves()[0].al_status_code, 0x0011);
}

#[test]
fn test_transition_delay_honours_timeout() {
    let mut sim = preop(1).with_transition_delay(Duration::from_millis(30));
    sim.apply_process_data_map().unwrap();
    sim.request_network_state(NetworkState::SafeOp).unwrap();
    assert_eq!(
        sim.wait_for_state(NetworkState::SafeOp, Duration::from_millis(5)).unwrap(),
        NetworkState::PreOp
    );
    assert_eq!(
        sim.wait_for_state(NetworkState::SafeOp, Duration::from_millis(200)).unwrap(),
        NetworkState::SafeOp
    );
}

// ============================================================================
// Distributed clocks
// ============================================================================

#[test]
fn test_dc_after_mapping() {
    let mut sim = preop(2);
    PdoMappingConfigurer::new().configure_all(&mut sim).unwrap();
    sim.apply_process_data_map().unwrap();

    let report = DistributedClockConfigurer::new(Duration::from_millis(2), Duration::ZERO)
        .configure(&mut sim)
        .unwrap();
    assert_eq!(report.defects(), 0);
    assert!(sim.dc_time().is_some());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["armed"], serde_json::json!([0, 1]));
    assert_eq!(json["verifications"][0]["sync_type"], 2);
}

// ============================================================================
// Working counter
// ============================================================================

#[test]
fn test_wkc_classification_with_injected_faults() {
    let mut sim = preop(1).drop_every(4).degrade_every(5);
    to_safeop(&mut sim);
    for _ in 0..10 {
        exchange(&mut sim);
    }
    sim.request_network_state(NetworkState::Op).unwrap();
    sim.wait_for_state(NetworkState::Op, TIMEOUT).unwrap();

    let mut monitor = WorkingCounterMonitor::new(0.5, 10);
    let expected = sim.expected_wkc();
    let classes: Vec<WkcClass> = (0..20)
        .map(|_| monitor.observe(exchange(&mut sim), expected))
        .collect();

    let stats = monitor.snapshot();
    assert_eq!(stats.total(), 20);
    assert_eq!(stats.timeout, 5);
    assert!(stats.degraded >= 3);
    assert_eq!(
        classes.iter().filter(|c| **c == WkcClass::Success).count() as u64,
        stats.success
    );
    assert!(!monitor.warning_raised());
}

#[test]
fn test_inputs_follow_drive_model() {
    let mut sim = preop(1).refuse_op_without_outputs(1);
    to_safeop(&mut sim);
    exchange(&mut sim);
    sim.request_network_state(NetworkState::Op).unwrap();
    sim.wait_for_state(NetworkState::Op, TIMEOUT).unwrap();

    for control_word in [0x0006, 0x0007, 0x000F] {
        let frame = OutputFrame {
            control_word,
            target_torque: 50,
            mode: 10,
            padding: 0,
        };
        assert!(frame.encode_into(&mut sim.slaves_mut()[0].outputs));
        assert_eq!(exchange(&mut sim), 3);
    }
    let input = InputFrame::decode(&sim.slaves()[0].inputs).unwrap();
    assert!(input.status_word.operation_enabled());
    assert_eq!(input.torque, 50);
    assert_eq!(sim.read_u8(0, objects::MODES_DISPLAY).unwrap(), 10);
}
