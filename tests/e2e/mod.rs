//! End-to-end session scenarios.

mod common;
mod fallback_test;
mod session_test;
