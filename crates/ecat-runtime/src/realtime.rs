//! Real-time setup for the cyclic worker thread.
//!
//! Everything here acts on the calling thread, so the worker calls
//! [`apply_to_current_thread`] as the first thing it does:
//! - Memory locking (mlockall) to keep the process image resident
//! - SCHED_FIFO/SCHED_RR priority for the exchange loop
//! - CPU affinity to keep the loop off housekeeping cores
//!
//! Missing privileges (EPERM) degrade to a warning; the loop then runs
//! with normal scheduling rather than not at all.

use ecat_common::config::{CpuAffinity, RealtimeConfig, SchedPolicy};
use ecat_common::error::{EcatError, EcatResult};
use serde::Serialize;
use tracing::{debug, info, warn};

/// What the worker thread actually got.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RealtimeStatus {
    /// Whether memory was locked.
    pub memory_locked: bool,
    /// Applied scheduler policy.
    pub scheduler_policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub scheduler_priority: Option<u8>,
    /// CPUs the worker is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
}

/// Apply the real-time configuration to the calling thread.
///
/// # Errors
///
/// Returns [`EcatError::Config`] for invalid settings (e.g. a CPU index
/// outside the CPU set). Missing privileges are only logged.
pub fn apply_to_current_thread(config: &RealtimeConfig) -> EcatResult<RealtimeStatus> {
    if !config.enabled {
        debug!("Real-time scheduling disabled for the cyclic worker");
        return Ok(RealtimeStatus::default());
    }

    let memory_locked = if config.lock_memory {
        lock_memory()?
    } else {
        false
    };
    let (scheduler_policy, scheduler_priority) = set_scheduler(config.policy, config.priority)?;
    let cpu_affinity = set_cpu_affinity(&config.cpu_affinity)?;

    let status = RealtimeStatus {
        memory_locked,
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
    };
    info!(?status, "Cyclic worker real-time setup complete");
    Ok(status)
}

/// Lock all current and future memory pages.
#[cfg(target_os = "linux")]
fn lock_memory() -> EcatResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked");
            Ok(true)
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!("mlockall failed with EPERM (no CAP_IPC_LOCK); page faults may delay cycles");
            Ok(false)
        }
        Err(e) => Err(EcatError::Config(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> EcatResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Set the scheduler policy and priority of the calling thread.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> EcatResult<(Option<SchedPolicy>, Option<u8>)> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => return Ok((Some(SchedPolicy::Other), None)),
    };

    let clamped = priority.clamp(1, 99);
    if clamped != priority {
        warn!(requested = priority, clamped, "Scheduler priority clamped to 1..=99");
    }

    let param = libc::sched_param {
        sched_priority: i32::from(clamped),
    };
    // SAFETY: pid 0 addresses the calling thread and `param` outlives the call.
    let result = unsafe { libc::sched_setscheduler(0, linux_policy, &param) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!("sched_setscheduler failed with EPERM (no CAP_SYS_NICE); worker runs with normal priority");
            return Ok((None, None));
        }
        return Err(EcatError::Config(format!("sched_setscheduler failed: {err}")));
    }

    info!(?policy, priority = clamped, "Worker scheduler configured");
    Ok((Some(policy), Some(clamped)))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> EcatResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(?policy, priority, "Real-time scheduling not available on this platform");
    Ok((None, None))
}

/// Pin the calling thread to the configured CPUs.
#[cfg(target_os = "linux")]
fn set_cpu_affinity(affinity: &CpuAffinity) -> EcatResult<Option<Vec<usize>>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = match affinity {
        CpuAffinity::None => return Ok(None),
        CpuAffinity::Single(cpu) => vec![*cpu],
        CpuAffinity::Set(cpus) if cpus.is_empty() => return Ok(None),
        CpuAffinity::Set(cpus) => cpus.clone(),
    };

    let mut cpu_set = CpuSet::new();
    for &cpu in &cpus {
        cpu_set
            .set(cpu)
            .map_err(|e| EcatError::Config(format!("invalid CPU index {cpu}: {e}")))?;
    }

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            info!(?cpus, "Worker CPU affinity set");
            Ok(Some(cpus))
        }
        Err(nix::errno::Errno::EINVAL) => {
            warn!(?cpus, "CPU set rejected; some CPUs may not exist");
            Ok(None)
        }
        Err(e) => Err(EcatError::Config(format!("sched_setaffinity failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(affinity: &CpuAffinity) -> EcatResult<Option<Vec<usize>>> {
    if *affinity != CpuAffinity::None {
        warn!("CPU affinity not available on this platform");
    }
    Ok(None)
}

/// Real-time related limits of the current process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RtCapabilities {
    /// Running as root.
    pub is_root: bool,
    /// RLIMIT_RTPRIO soft limit.
    pub rtprio_limit: Option<u64>,
    /// RLIMIT_MEMLOCK soft limit.
    pub memlock_limit: Option<u64>,
    /// Kernel reports PREEMPT_RT.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// RT scheduling is likely to succeed.
    #[must_use]
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }

    /// Memory locking is likely to succeed.
    #[must_use]
    pub fn can_lock_memory(&self) -> bool {
        #[cfg(target_family = "unix")]
        {
            self.is_root || self.memlock_limit.is_some_and(|l| l == libc::RLIM_INFINITY)
        }
        #[cfg(not(target_family = "unix"))]
        {
            self.is_root
        }
    }

    /// Describe settings in `config` this process will not get.
    #[must_use]
    pub fn shortfalls(&self, config: &RealtimeConfig) -> Vec<String> {
        let mut issues = Vec::new();
        if !config.enabled {
            return issues;
        }
        if !self.preempt_rt {
            issues.push("kernel is not PREEMPT_RT".to_string());
        }
        if config.policy != SchedPolicy::Other && !self.can_use_rt_scheduling() {
            issues.push(format!(
                "no RT scheduling (RLIMIT_RTPRIO={:?}, root={})",
                self.rtprio_limit, self.is_root
            ));
        }
        if config.lock_memory && !self.can_lock_memory() {
            issues.push(format!(
                "no memory locking (RLIMIT_MEMLOCK={:?}, root={})",
                self.memlock_limit, self.is_root
            ));
        }
        issues
    }
}

/// Probe the real-time limits of the current process.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    // SAFETY: geteuid has no preconditions.
    let mut caps = RtCapabilities {
        is_root: unsafe { libc::geteuid() } == 0,
        ..RtCapabilities::default()
    };

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is a valid out-pointer for the duration of each call.
    if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut rlim) } == 0 {
        caps.rtprio_limit = Some(rlim.rlim_cur);
    }
    // SAFETY: as above.
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) } == 0 {
        caps.memlock_limit = Some(rlim.rlim_cur);
    }

    if let Ok(version) = std::fs::read_to_string("/proc/version") {
        caps.preempt_rt = version.contains("PREEMPT_RT") || version.contains("PREEMPT RT");
    }
    caps
}

/// Probe the real-time limits of the current process.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}
