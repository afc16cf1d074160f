//! CST bring-up daemon entry point.
//!
//! Opens the configured network, brings every drive to Operational,
//! runs the CiA-402 enable sequence into torque control and holds it
//! until a signal or the `--duration` limit ends the run.

mod diagnostics;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use ecat_common::config::{MasterDriver, SessionConfig};
use ecat_runtime::{check_rt_capabilities, Session};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::diagnostics::{render_json, DiagnosticsCollector};
use crate::signals::SignalHandler;

/// Environment variable naming a configuration file.
const CONFIG_ENV: &str = "ECAT_CST_CONFIG";

/// Daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "ecat-cstd",
    about = "EtherCAT CST bring-up daemon - drives a network into cyclic torque control",
    version,
    long_about = None
)]
struct Args {
    /// Path to a session configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Network adapter (overrides config file).
    #[arg(long, short = 'i', value_name = "IFACE")]
    interface: Option<String>,

    /// Cycle period, e.g. "2ms" (overrides config file).
    #[arg(long, short = 'p', value_parser = humantime::parse_duration)]
    period: Option<Duration>,

    /// Torque setpoint once Running (overrides config file).
    #[arg(long, short = 't', allow_negative_numbers = true)]
    torque: Option<i16>,

    /// Use the simulated master with this many drives.
    #[arg(long, short = 's', value_name = "DRIVES")]
    simulated: Option<u16>,

    /// Stop after this long, e.g. "30s" (default: until SIGTERM/SIGINT).
    #[arg(long, short = 'd', value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Print a JSON diagnostics report on exit.
    #[arg(long)]
    report: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ecat-cstd");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    info!(
        period = ?config.cycle.period,
        driver = ?config.network.driver,
        interface = ?config.network.interface,
        torque = config.drive.torque_setpoint,
        "Configuration loaded"
    );

    for issue in check_rt_capabilities().shortfalls(&config.realtime) {
        warn!(%issue, "Real-time capability missing");
    }

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;
    let diagnostics = DiagnosticsCollector::new(config.monitor.warning_ratio);

    run_daemon(config, &args, &signal_handler, &diagnostics)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "ecat_cstd={level},ecat_runtime={level},ecat_fieldbus={level},ecat_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `ECAT_CST_CONFIG` environment variable
/// 3. `/etc/ecat-cst/config.toml` (system path)
/// 4. `./ecat-cst.toml` (working directory)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<SessionConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return SessionConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from {CONFIG_ENV}");
            return SessionConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {CONFIG_ENV}={env_path}"));
        }
        warn!(
            path = %env_path,
            "{CONFIG_ENV} set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/ecat-cst/config.toml", "ecat-cst.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config");
            return SessionConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {path}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(SessionConfig::default())
}

/// Command-line flags win over file values.
fn apply_overrides(config: &mut SessionConfig, args: &Args) {
    if let Some(interface) = &args.interface {
        config.network.interface = Some(interface.clone());
    }
    if let Some(period) = args.period {
        config.cycle.period = period;
    }
    if let Some(torque) = args.torque {
        config.drive.torque_setpoint = torque;
    }
    if let Some(drives) = args.simulated {
        config.network.driver = MasterDriver::Simulated;
        config.network.simulated_slaves = drives;
    }
}

/// Bring up, run until stopped, shut down.
fn run_daemon(
    config: SessionConfig,
    args: &Args,
    signal_handler: &SignalHandler,
    diagnostics: &DiagnosticsCollector,
) -> Result<()> {
    let mut session = Session::open(config).context("Failed to create session")?;

    let bringup = match session.bring_up() {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Bring-up failed; network released");
            print_report(&session, diagnostics, args.report);
            return Err(e).context("Network bring-up failed");
        }
    };
    info!(
        slaves = bringup.slave_count,
        io_bytes = bringup.io_bytes,
        expected_wkc = bringup.expected_wkc,
        default_mapping = bringup.used_default_mapping,
        "Bring-up complete, starting drive sequence"
    );

    let deadline = args.duration.map(|d| Instant::now() + d);
    let context = Arc::clone(session.context());
    let ticks = session
        .run(|_| {
            if signal_handler.take_report_request() {
                let stats = context.wkc_stats();
                info!(
                    success = stats.success,
                    degraded = stats.degraded,
                    timeout = stats.timeout,
                    last_wkc = stats.last_wkc,
                    cycles = context.cycles(),
                    "Report requested"
                );
            }
            if signal_handler.shutdown_requested() {
                info!("Shutdown signal received, stopping drive sequence");
                return false;
            }
            deadline.map_or(true, |d| Instant::now() < d)
        })
        .context("Drive sequence failed")?;

    info!(ticks, "Drive sequence ended, shutting down");
    let outcome = session.stop();

    print_report(&session, diagnostics, args.report);
    let report = session.report();
    info!(
        worker_cycles = report.worker_cycles,
        wkc_success = report.wkc.success,
        wkc_degraded = report.wkc.degraded,
        wkc_timeout = report.wkc.timeout,
        signals = signal_handler.signal_count(),
        uptime_secs = diagnostics.uptime().as_secs(),
        ?outcome,
        final_phase = %report.phase,
        "Daemon shutdown complete"
    );
    Ok(())
}

fn print_report(session: &Session, diagnostics: &DiagnosticsCollector, enabled: bool) {
    if !enabled {
        return;
    }
    match render_json(&diagnostics.snapshot(session.report())) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "Cannot render diagnostics report"),
    }
}
