//! Shared helpers for end-to-end tests.

use ecat_common::config::SessionConfig;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Short bring-up and enable timing on a 2ms cycle.
///
/// Enable sequence: 20ms FaultReset, then 10ms per state, so drives are
/// Running after 25 ticks.
pub const FAST_CONFIG: &str = r#"
[network]
driver = "simulated"
simulated_slaves = 2

[cycle]
period = "2ms"
receive_timeout = "1ms"
join_timeout = "500ms"

[bringup]
base_transition_timeout = "10ms"
backoff = "5ms"
warmup_cycles = 20
warmup_cap = "200ms"

[dc]
enabled = true
phase_shift = "0s"

[drive]
fault_reset = "20ms"
shutdown_hold = "10ms"
switch_on_hold = "10ms"
enable_hold = "10ms"
torque_setpoint = 50

[monitor]
report_interval = "50ms"
"#;

/// Ticks until every drive runs with [`FAST_CONFIG`].
pub const FAST_TICKS_TO_RUNNING: u64 = 25;

/// Config file in a fresh temp directory. Keep the `TempDir` alive.
pub fn write_config(content: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ecat-cst.toml");
    fs::write(&path, content).unwrap();
    (dir, path)
}

/// Load [`FAST_CONFIG`] through the file loader.
pub fn fast_config() -> SessionConfig {
    let (_dir, path) = write_config(FAST_CONFIG);
    SessionConfig::from_file(&path).unwrap()
}
