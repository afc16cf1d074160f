//! Signal handling for the daemon.
//!
//! SIGTERM and SIGINT request a clean shutdown: the drive sequence stops,
//! the worker is joined and the network is stepped down before exit.
//! SIGHUP asks for a diagnostics report without stopping.
//!
//! Handlers only store into static atomics; everything else reads them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
static REPORT_FLAG: AtomicBool = AtomicBool::new(false);
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM.
    Terminate,
    /// SIGINT (Ctrl+C).
    Interrupt,
    /// SIGHUP, dumps a report.
    Hangup,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Flags set from outside the signal path (manual requests, tests).
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    report_requested: AtomicBool,
}

impl SignalState {
    /// Create a cleared state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Check if a report has been requested (and clear the flag).
    #[inline]
    pub fn take_report_request(&self) -> bool {
        self.report_requested.swap(false, Ordering::Relaxed)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    /// Request a report.
    pub fn request_report(&self) {
        self.report_requested.store(true, Ordering::Relaxed);
    }
}

/// Handle shared by the run loop.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Register SIGTERM, SIGINT and SIGHUP handlers.
    ///
    /// On non-Unix platforms only manual requests work.
    pub fn new() -> nix::Result<Self> {
        let handler = Self::detached();
        #[cfg(unix)]
        register_unix_handlers()?;
        Ok(handler)
    }

    /// Handle without OS signal registration.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    /// Check if shutdown has been requested by a signal or manually.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_FLAG.load(Ordering::Relaxed) || self.state.shutdown_requested()
    }

    /// Check if a report has been requested (clears the flag).
    #[inline]
    pub fn take_report_request(&self) -> bool {
        let signalled = REPORT_FLAG.swap(false, Ordering::Relaxed);
        let manual = self.state.take_report_request();
        signalled || manual
    }

    /// Manually request shutdown.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Signals received since start.
    pub fn signal_count(&self) -> u32 {
        SIGNAL_COUNT.load(Ordering::Relaxed)
    }

    /// Shared state.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn register_unix_handlers() -> nix::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::os::raw::c_int;

    extern "C" fn on_shutdown(_: c_int) {
        SIGNAL_COUNT.fetch_add(1, Ordering::Relaxed);
        SHUTDOWN_FLAG.store(true, Ordering::Relaxed);
    }

    extern "C" fn on_hangup(_: c_int) {
        SIGNAL_COUNT.fetch_add(1, Ordering::Relaxed);
        REPORT_FLAG.store(true, Ordering::Relaxed);
    }

    let shutdown = SigAction::new(
        SigHandler::Handler(on_shutdown),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let hangup = SigAction::new(
        SigHandler::Handler(on_hangup),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    // SAFETY: the handlers only touch static atomics, which is async-signal-safe.
    unsafe {
        sigaction(Signal::SIGTERM, &shutdown)?;
        sigaction(Signal::SIGINT, &shutdown)?;
        sigaction(Signal::SIGHUP, &hangup)?;
    }

    debug!(
        signals = %[SignalKind::Terminate, SignalKind::Interrupt, SignalKind::Hangup]
            .map(|k| k.to_string())
            .join(","),
        "Unix signal handlers registered"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_state_default() {
        let state = SignalState::new();
        assert!(!state.shutdown_requested());
        assert!(!state.take_report_request());
    }

    #[test]
    fn test_report_request_clears() {
        let state = SignalState::new();
        state.request_report();
        assert!(state.take_report_request());
        assert!(!state.take_report_request());
    }

    #[test]
    fn test_manual_shutdown() {
        let handler = SignalHandler::detached();
        handler.request_shutdown();
        assert!(handler.shutdown_requested());
        assert!(handler.state().shutdown_requested());
    }

    #[test]
    fn test_signal_kind_display() {
        assert_eq!(SignalKind::Hangup.to_string(), "SIGHUP");
    }
}
