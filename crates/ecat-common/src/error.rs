use thiserror::Error;

/// Error types covering bring-up, object access, process data and session faults.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EcatError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The network adapter could not be opened.
    #[error("cannot open adapter {adapter}: {reason}")]
    Connection {
        /// Adapter name passed to the master stack.
        adapter: String,
        /// Reason reported by the master stack.
        reason: String,
    },

    /// Enumeration finished without finding any slave.
    #[error("no slaves found on the network")]
    NoSlaves,

    /// A requested network state was not reached in time.
    #[error("transition to {target} timed out; lagging slaves: {lagging}")]
    TransitionTimeout {
        /// Requested state.
        target: String,
        /// Human-readable list of slaves below the requested state.
        lagging: String,
    },

    /// Raw state bits did not decode to a known network state.
    #[error("unknown network state bits {0:#06x}")]
    UnknownNetworkState(u16),

    /// Addressed object read or write failed.
    #[error("object access {index:#06x}:{subindex} on slave {slave} failed: {reason}")]
    ObjectAccess {
        /// Slave position.
        slave: u16,
        /// Object index.
        index: u16,
        /// Object subindex.
        subindex: u8,
        /// Failure reason.
        reason: String,
    },

    /// PDO mapping or assignment was rejected by the slaves or the master stack.
    #[error("process data mapping rejected: {0}")]
    MappingRejected(String),

    /// Per-cycle process data exchange failed.
    #[error("process data exchange failed: {0}")]
    ProcessData(String),

    /// The cyclic worker thread could not be started.
    #[error("failed to start cyclic worker: {0}")]
    WorkerSpawn(String),

    /// Generic fieldbus error from the master stack.
    #[error("fieldbus error: {0}")]
    Fieldbus(String),

    /// Invalid session phase transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source phase.
        from: String,
        /// Attempted target phase.
        to: String,
    },
}

impl EcatError {
    /// Returns true for failures that must end the session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::NoSlaves
                | Self::TransitionTimeout { .. }
                | Self::MappingRejected(_)
                | Self::WorkerSpawn(_)
        )
    }
}

/// Convenience type alias for bring-up and cyclic operations.
pub type EcatResult<T> = Result<T, EcatError>;
