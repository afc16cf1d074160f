//! Session configuration.
//!
//! Supports TOML deserialization with defaults matching a single-drive
//! CST bench setup; every field can be overridden per deployment.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionConfig {
    /// Network adapter and master stack selection.
    pub network: NetworkConfig,

    /// Cyclic exchange timing.
    pub cycle: CycleConfig,

    /// Network state machine bring-up policy.
    pub bringup: BringupConfig,

    /// Distributed clock setup.
    pub dc: DcConfig,

    /// Drive enable sequence and CST parameters.
    pub drive: DriveConfig,

    /// Working counter monitoring and recovery.
    pub monitor: MonitorConfig,

    /// Real-time setup for the cyclic worker thread.
    pub realtime: RealtimeConfig,
}

/// Master stack backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MasterDriver {
    /// In-process simulated drives.
    #[default]
    Simulated,
    /// SOEM over a raw socket.
    Soem,
}

/// Network adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network interface name (e.g. "enp3s0").
    /// No default for real hardware to avoid binding the wrong port.
    pub interface: Option<String>,

    /// Master stack backend.
    pub driver: MasterDriver,

    /// Number of drives created by the simulated backend.
    pub simulated_slaves: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: None,
            driver: MasterDriver::Simulated,
            simulated_slaves: 1,
        }
    }
}

/// Cyclic exchange configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Exchange period. 2ms or more is recommended on non-RT hosts.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// Bounded wait for one input frame.
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// Minimum number of ticks between two jitter warnings.
    pub jitter_warning_interval: u64,

    /// Bound on waiting for the worker thread to exit.
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,

    /// Send one primed frame before the periodic loop starts.
    pub initial_frame: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(2),
            receive_timeout: Duration::from_millis(5),
            jitter_warning_interval: 1000,
            join_timeout: Duration::from_secs(1),
            initial_frame: true,
        }
    }
}

/// Network state machine bring-up policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BringupConfig {
    /// Base per-transition timeout; each target state multiplies it.
    #[serde(with = "humantime_serde")]
    pub base_transition_timeout: Duration,

    /// Attempts for PreOp and SafeOp requests.
    pub max_attempts: u32,

    /// Attempts for the Operational request.
    pub op_max_attempts: u32,

    /// Pause between two attempts.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,

    /// PreOp timeout as a multiple of the base timeout.
    pub preop_timeout_factor: u32,

    /// SafeOp timeout as a multiple of the base timeout.
    pub safeop_timeout_factor: u32,

    /// Operational timeout as a multiple of the base timeout.
    pub op_timeout_factor: u32,

    /// Worker cycles required before Operational is requested.
    pub warmup_cycles: u64,

    /// Wall-time cap on the warm-up wait.
    #[serde(with = "humantime_serde")]
    pub warmup_cap: Duration,

    /// Retry with the default mapping when the custom map is rejected.
    pub map_fallback: bool,
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self {
            base_transition_timeout: Duration::from_millis(50),
            max_attempts: 5,
            op_max_attempts: 10,
            backoff: Duration::from_millis(100),
            preop_timeout_factor: 3,
            safeop_timeout_factor: 4,
            op_timeout_factor: 5,
            warmup_cycles: 300,
            warmup_cap: Duration::from_secs(1),
            map_fallback: true,
        }
    }
}

/// Distributed clock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DcConfig {
    /// Enable distributed clocks and SYNC0 on every slave.
    pub enabled: bool,

    /// SYNC0 phase shift relative to the cycle start.
    #[serde(with = "humantime_serde")]
    pub phase_shift: Duration,

    /// Read back 0x1C32 after arming.
    pub verify: bool,

    /// Steer the worker deadline onto the reference clock.
    pub phase_lock: bool,
}

impl Default for DcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            phase_shift: Duration::ZERO,
            verify: true,
            phase_lock: false,
        }
    }
}

/// Drive enable sequence and CST parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// FaultReset dwell before any non-critical halving.
    #[serde(with = "humantime_serde")]
    pub fault_reset: Duration,

    /// Shutdown dwell.
    #[serde(with = "humantime_serde")]
    pub shutdown_hold: Duration,

    /// SwitchOn dwell.
    #[serde(with = "humantime_serde")]
    pub switch_on_hold: Duration,

    /// EnableOperation dwell at zero torque.
    #[serde(with = "humantime_serde")]
    pub enable_hold: Duration,

    /// Torque setpoint once Running, in per-mille of rated torque.
    pub torque_setpoint: i16,

    /// Max torque written to 0x6072 after Operational.
    pub max_torque: i16,

    /// Torque slope written to 0x6087 after Operational.
    pub torque_slope: u32,

    /// Mode of operation (10 = cyclic synchronous torque).
    pub mode: i8,

    /// Error codes (0x603F) that halve the FaultReset dwell.
    pub non_critical_fault_codes: Vec<u16>,

    /// Ticks between two diagnostics lines.
    pub diagnostics_interval: u64,

    /// Write mode and torque limits via objects after Operational.
    pub configure_mode: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            fault_reset: Duration::from_secs(4),
            shutdown_hold: Duration::from_secs(1),
            switch_on_hold: Duration::from_secs(1),
            enable_hold: Duration::from_secs(1),
            torque_setpoint: 50,
            max_torque: 100,
            torque_slope: 100,
            mode: 10,
            non_critical_fault_codes: vec![0x730F],
            diagnostics_interval: 100,
            configure_mode: true,
        }
    }
}

/// Working counter monitoring and recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Non-success ratio above which a warning is raised.
    pub warning_ratio: f64,

    /// Observations required before the ratio is evaluated.
    pub min_samples: u64,

    /// Interval between two statistics reports.
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,

    /// Consecutive failed cycles that trigger a network check.
    pub recovery_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warning_ratio: 0.10,
            min_samples: 100,
            report_interval: Duration::from_secs(5),
            recovery_threshold: 5,
        }
    }
}

/// Real-time scheduling configuration for the cyclic worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enable real-time scheduling (requires privileges).
    pub enabled: bool,

    /// Scheduler policy: "fifo", "rr" or "other".
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// CPU affinity for the worker thread.
    pub cpu_affinity: CpuAffinity,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: SchedPolicy::Fifo,
            priority: 90,
            cpu_affinity: CpuAffinity::None,
            lock_memory: true,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

/// CPU affinity specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CpuAffinity::None => serializer.serialize_none(),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("CPU index cannot be negative"));
                }
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                Ok(CpuAffinity::Set(cpus))
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Reject values the cyclic engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle.period.is_zero() {
            return Err(ConfigError::Invalid("cycle.period must be non-zero".into()));
        }
        if self.cycle.receive_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "cycle.receive_timeout must be non-zero".into(),
            ));
        }
        if self.bringup.max_attempts == 0 || self.bringup.op_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "bringup attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.monitor.warning_ratio) {
            return Err(ConfigError::Invalid(
                "monitor.warning_ratio must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
