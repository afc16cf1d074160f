//! End-to-end tests for the CST bring-up workspace.
//!
//! These tests run complete sessions against the simulated master:
//! - Configuration loaded from a TOML file on disk
//! - Bring-up to Operational and the drive enable sequence into torque
//! - Mapping fallback and failure shutdown
//! - Diagnostics report rendering
//!
//! The full-timing sequence test is ignored by default; run it with
//! `--ignored` on an otherwise idle machine.

mod e2e;
