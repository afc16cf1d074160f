//! Fieldbus plane for cyclic synchronous torque drives.
//!
//! This crate provides:
//! - [`MasterStack`] trait abstracting the fieldbus master
//! - [`slave`] module with the network state machine, PDO maps and object addresses
//! - [`frame`] module with the fixed CST process data frames
//! - [`wkc`] module with working counter classification
//! - [`pdo_mapping`] module programming PDO maps and assignments
//! - [`dc_sync`] module with distributed clock configuration
//! - [`simulated`] module with an in-process master for tests and dry runs
//! - `soem` module (feature `soem`, Linux only) with the SOEM backend

pub mod dc_sync;
pub mod frame;
pub mod master;
pub mod pdo_mapping;
#[cfg(feature = "simulated")]
pub mod simulated;
pub mod slave;
#[cfg(all(feature = "soem", target_os = "linux"))]
pub mod soem;
pub mod wkc;

pub use dc_sync::*;
pub use frame::*;
pub use master::*;
pub use pdo_mapping::*;
#[cfg(feature = "simulated")]
pub use simulated::{SimProbe, SimulatedMaster};
pub use slave::*;
#[cfg(all(feature = "soem", target_os = "linux"))]
pub use soem::SoemMaster;
pub use wkc::*;
