//! Session lifecycle state machine.
//!
//! Phases follow the bring-up order:
//! IDLE → OPENED → PRE_OP → MAPPED → SAFE_OP → CYCLIC → OPERATIONAL → RUNNING → STOPPING → CLOSED
//!
//! FAULT is reachable from every active phase so a failed bring-up can
//! still be shut down cleanly.

use crate::error::{EcatError, EcatResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phases of one network session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    /// Nothing opened yet.
    #[default]
    Idle,
    /// Adapter bound and slaves enumerated.
    Opened,
    /// All slaves in Pre-Operational.
    PreOp,
    /// PDO mapping written and applied, DC armed.
    Mapped,
    /// All slaves in Safe-Operational.
    SafeOp,
    /// Cyclic worker running, Operational not yet requested.
    Cyclic,
    /// All slaves in Operational.
    Operational,
    /// Drive sequencer active.
    Running,
    /// Shutdown in progress.
    Stopping,
    /// Adapter released.
    Closed,
    /// Bring-up or runtime failure.
    Fault,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Opened => write!(f, "OPENED"),
            Self::PreOp => write!(f, "PRE_OP"),
            Self::Mapped => write!(f, "MAPPED"),
            Self::SafeOp => write!(f, "SAFE_OP"),
            Self::Cyclic => write!(f, "CYCLIC"),
            Self::Operational => write!(f, "OPERATIONAL"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Fault => write!(f, "FAULT"),
        }
    }
}

impl SessionPhase {
    /// Check if a transition to `target` is valid from the current phase.
    #[must_use]
    pub fn can_transition_to(&self, target: SessionPhase) -> bool {
        use SessionPhase::{
            Closed, Cyclic, Fault, Idle, Mapped, Opened, Operational, PreOp, Running, SafeOp,
            Stopping,
        };

        matches!(
            (self, target),
            // Forward bring-up
            (Idle, Opened)
                | (Opened, PreOp)
                | (PreOp, Mapped)
                | (Mapped, SafeOp)
                | (SafeOp, Cyclic)
                | (Cyclic, Operational)
                | (Operational, Running)
                // Any active phase can fail or be stopped
                | (Opened | PreOp | Mapped | SafeOp | Cyclic | Operational | Running, Fault)
                | (Opened | PreOp | Mapped | SafeOp | Cyclic | Operational | Running | Fault, Stopping)
                | (Stopping, Closed)
                // Open failure releases immediately
                | (Idle, Closed)
        )
    }

    /// Attempt to transition to `target`, returning error if invalid.
    pub fn transition_to(&mut self, target: SessionPhase) -> EcatResult<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(EcatError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Returns true while the cyclic worker is expected to be alive.
    #[must_use]
    pub fn is_cyclic(&self) -> bool {
        matches!(self, Self::Cyclic | Self::Operational | Self::Running)
    }

    /// Returns true once the session can no longer make progress.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Phase tracker with transition history.
#[derive(Debug, Clone, Default)]
pub struct PhaseTracker {
    current: SessionPhase,
    previous: Option<SessionPhase>,
    transition_count: u64,
}

impl PhaseTracker {
    /// Create a tracker starting in IDLE.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.current
    }

    /// Get the previous phase (if any transition occurred).
    #[must_use]
    pub fn previous_phase(&self) -> Option<SessionPhase> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a phase transition.
    pub fn transition(&mut self, target: SessionPhase) -> EcatResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(EcatError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Enter FAULT if the current phase allows it.
    pub fn enter_fault(&mut self) {
        if self.current.can_transition_to(SessionPhase::Fault) {
            self.previous = Some(self.current);
            self.current = SessionPhase::Fault;
            self.transition_count += 1;
        }
    }
}
