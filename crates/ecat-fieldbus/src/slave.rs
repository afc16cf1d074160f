//! Slave model, network states and object dictionary addresses.
//!
//! Provides structures for:
//! - Slave identification and the network state machine
//! - PDO map entries and the fixed CST maps
//! - Addressed object (SDO) access and well-known CiA-402 objects
//! - AL status code decoding for diagnostics

use ecat_common::error::{EcatError, EcatResult};
use serde::{Deserialize, Serialize};

/// Network state machine states, ordered for transition purposes.
///
/// Bootstrap is only reachable from Init and sorts directly above it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum NetworkState {
    /// Uninitialized; no mailbox, no process data.
    #[default]
    Init,
    /// Bootstrap: firmware update mode.
    Bootstrap,
    /// Pre-operational: mailbox (SDO) communication available.
    PreOp,
    /// Safe-operational: inputs valid, outputs held safe.
    SafeOp,
    /// Operational: full process data exchange.
    Op,
}

/// Error indicator bit in the AL status register.
pub const AL_STATE_ERROR: u16 = 0x10;

/// Acknowledge bit in the AL control register.
pub const AL_CONTROL_ACK: u16 = 0x10;

impl NetworkState {
    /// Raw AL control/status value for this state.
    #[must_use]
    pub fn as_raw(self) -> u16 {
        match self {
            Self::Init => 0x01,
            Self::PreOp => 0x02,
            Self::Bootstrap => 0x03,
            Self::SafeOp => 0x04,
            Self::Op => 0x08,
        }
    }

    /// Decode a raw AL status value into the state and its error indicator.
    ///
    /// # Errors
    ///
    /// Returns [`EcatError::UnknownNetworkState`] for unknown bit combinations.
    pub fn from_raw(raw: u16) -> EcatResult<(Self, bool)> {
        let al = AlState::decode(raw)?;
        Ok((al.state, al.error))
    }

    /// Decode the state part of a raw AL status value.
    #[must_use]
    pub fn from_al_status(raw: u16) -> Option<Self> {
        match raw & 0x0F {
            0x01 => Some(Self::Init),
            0x02 => Some(Self::PreOp),
            0x03 => Some(Self::Bootstrap),
            0x04 => Some(Self::SafeOp),
            0x08 => Some(Self::Op),
            _ => None,
        }
    }
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::PreOp => write!(f, "PRE_OP"),
            Self::Bootstrap => write!(f, "BOOTSTRAP"),
            Self::SafeOp => write!(f, "SAFE_OP"),
            Self::Op => write!(f, "OP"),
        }
    }
}

/// Decoded AL status register: state plus error indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlState {
    /// Current state.
    pub state: NetworkState,
    /// Error indicator (e.g. SAFE_OP + ERROR).
    pub error: bool,
}

impl AlState {
    /// Decode a raw AL status value.
    ///
    /// # Errors
    ///
    /// Returns [`EcatError::UnknownNetworkState`] for bit combinations
    /// that are not a state.
    pub fn decode(raw: u16) -> EcatResult<Self> {
        let state = NetworkState::from_al_status(raw).ok_or(EcatError::UnknownNetworkState(raw))?;
        Ok(Self {
            state,
            error: raw & AL_STATE_ERROR != 0,
        })
    }

    /// Re-encode to the raw register value.
    #[must_use]
    pub fn as_raw(self) -> u16 {
        self.state.as_raw() | if self.error { AL_STATE_ERROR } else { 0 }
    }
}

impl std::fmt::Display for AlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.error {
            write!(f, "{}+ERROR", self.state)
        } else {
            write!(f, "{}", self.state)
        }
    }
}

/// Slave identification from the ESC EEPROM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlaveIdentity {
    /// Vendor ID.
    pub vendor_id: u32,
    /// Product code (device type id).
    pub product_code: u32,
    /// Revision number.
    pub revision: u32,
}

impl SlaveIdentity {
    /// Create a new slave identity.
    #[must_use]
    pub fn new(vendor_id: u32, product_code: u32, revision: u32) -> Self {
        Self {
            vendor_id,
            product_code,
            revision,
        }
    }
}

impl std::fmt::Display for SlaveIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "V:{:#010x} P:{:#010x} R:{:#010x}",
            self.vendor_id, self.product_code, self.revision
        )
    }
}

/// One slave as seen by the master stack.
///
/// The master stack owns the process buffers; `outputs` is written by the
/// cyclic worker only, `inputs` is refreshed by each received frame.
#[derive(Debug, Clone, Default)]
pub struct Slave {
    /// Position on the bus (0-based).
    pub position: u16,
    /// Device name from the EEPROM.
    pub name: String,
    /// Vendor/product/revision.
    pub identity: SlaveIdentity,
    /// Last read AL state.
    pub state: NetworkState,
    /// Error indicator from the last read.
    pub error_indicated: bool,
    /// Last read AL status code.
    pub al_status_code: u16,
    /// No AL state answered on the last read.
    pub silent: bool,
    /// Distributed clock support.
    pub dc_supported: bool,
    /// Raw input process data (device to controller).
    pub inputs: Vec<u8>,
    /// Raw output process data (controller to device).
    pub outputs: Vec<u8>,
}

impl Slave {
    /// Create an unmapped slave at `position`.
    #[must_use]
    pub fn new(position: u16, name: impl Into<String>, identity: SlaveIdentity) -> Self {
        Self {
            position,
            name: name.into(),
            identity,
            ..Self::default()
        }
    }

    /// Current state with the error indicator.
    #[must_use]
    pub fn al_state(&self) -> AlState {
        AlState {
            state: self.state,
            error: self.error_indicated,
        }
    }
}

/// One packed field of a PDO map: index, subindex and bit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PdoMapEntry {
    /// Object index (0 for padding).
    pub index: u16,
    /// Object subindex.
    pub subindex: u8,
    /// Field width in bits.
    pub bit_length: u8,
}

impl PdoMapEntry {
    /// Create an entry.
    #[must_use]
    pub const fn new(index: u16, subindex: u8, bit_length: u8) -> Self {
        Self {
            index,
            subindex,
            bit_length,
        }
    }

    /// Padding entry of `bit_length` bits.
    #[must_use]
    pub const fn padding(bit_length: u8) -> Self {
        Self::new(0, 0, bit_length)
    }

    /// Descriptor as written to a mapping sub-slot: `index:subindex:bits`.
    #[must_use]
    pub const fn packed(self) -> u32 {
        ((self.index as u32) << 16) | ((self.subindex as u32) << 8) | self.bit_length as u32
    }

    /// Decode a mapping sub-slot descriptor.
    #[must_use]
    pub const fn from_packed(raw: u32) -> Self {
        Self {
            index: (raw >> 16) as u16,
            subindex: (raw >> 8) as u8,
            bit_length: raw as u8,
        }
    }
}

impl std::fmt::Display for PdoMapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}:{}/{}", self.index, self.subindex, self.bit_length)
    }
}

/// An ordered PDO map addressed by its mapping object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdoMap {
    /// Mapping object index (0x1600.. or 0x1A00..).
    pub index: u16,
    /// Sync manager assignment object the map is assigned to.
    pub assignment: u16,
    /// Entries in frame order.
    pub entries: Vec<PdoMapEntry>,
}

impl PdoMap {
    /// Receive map for cyclic synchronous torque:
    /// control word, target torque, mode of operation, padding.
    #[must_use]
    pub fn rx_cst() -> Self {
        Self {
            index: objects::RXPDO_MAP,
            assignment: objects::SM2_ASSIGN,
            entries: vec![
                PdoMapEntry::new(objects::CONTROL_WORD.index, 0, 16),
                PdoMapEntry::new(objects::TARGET_TORQUE.index, 0, 16),
                PdoMapEntry::new(objects::MODES_OF_OPERATION.index, 0, 8),
                PdoMapEntry::padding(8),
            ],
        }
    }

    /// Transmit map for cyclic synchronous torque:
    /// status word, actual position, actual velocity, actual torque.
    #[must_use]
    pub fn tx_cst() -> Self {
        Self {
            index: objects::TXPDO_MAP,
            assignment: objects::SM3_ASSIGN,
            entries: vec![
                PdoMapEntry::new(objects::STATUS_WORD.index, 0, 16),
                PdoMapEntry::new(objects::POSITION_ACTUAL.index, 0, 32),
                PdoMapEntry::new(objects::VELOCITY_ACTUAL.index, 0, 32),
                PdoMapEntry::new(objects::TORQUE_ACTUAL.index, 0, 16),
            ],
        }
    }

    /// Total width in bits.
    #[must_use]
    pub fn bit_length(&self) -> u32 {
        self.entries.iter().map(|e| u32::from(e.bit_length)).sum()
    }

    /// Total width in bytes (rounded up).
    #[must_use]
    pub fn byte_length(&self) -> usize {
        (self.bit_length() as usize).div_ceil(8)
    }
}

/// Object dictionary address (index:subindex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SdoAddress {
    /// Object index.
    pub index: u16,
    /// Object subindex.
    pub subindex: u8,
}

impl SdoAddress {
    /// Create a new object address.
    #[must_use]
    pub const fn new(index: u16, subindex: u8) -> Self {
        Self { index, subindex }
    }

    /// Same object, different subindex.
    #[must_use]
    pub const fn sub(self, subindex: u8) -> Self {
        Self::new(self.index, subindex)
    }
}

impl std::fmt::Display for SdoAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}:{}", self.index, self.subindex)
    }
}

/// Well-known object addresses.
pub mod objects {
    use super::SdoAddress;

    /// Device name.
    pub const DEVICE_NAME: SdoAddress = SdoAddress::new(0x1008, 0);
    /// First receive PDO mapping object.
    pub const RXPDO_MAP: u16 = 0x1600;
    /// First transmit PDO mapping object.
    pub const TXPDO_MAP: u16 = 0x1A00;
    /// SM2 (outputs) PDO assignment.
    pub const SM2_ASSIGN: u16 = 0x1C12;
    /// SM3 (inputs) PDO assignment.
    pub const SM3_ASSIGN: u16 = 0x1C13;
    /// SM2 synchronization type (0 free run, 1 SM, 2 DC SYNC0, 3 DC SYNC1).
    pub const SM2_SYNC_TYPE: SdoAddress = SdoAddress::new(0x1C32, 1);
    /// SM2 cycle time in ns.
    pub const SM2_CYCLE_TIME: SdoAddress = SdoAddress::new(0x1C32, 2);

    /// Error code of the last drive fault.
    pub const ERROR_CODE: SdoAddress = SdoAddress::new(0x603F, 0);
    /// Control word.
    pub const CONTROL_WORD: SdoAddress = SdoAddress::new(0x6040, 0);
    /// Status word.
    pub const STATUS_WORD: SdoAddress = SdoAddress::new(0x6041, 0);
    /// Modes of operation.
    pub const MODES_OF_OPERATION: SdoAddress = SdoAddress::new(0x6060, 0);
    /// Modes of operation display.
    pub const MODES_DISPLAY: SdoAddress = SdoAddress::new(0x6061, 0);
    /// Position actual value.
    pub const POSITION_ACTUAL: SdoAddress = SdoAddress::new(0x6064, 0);
    /// Velocity actual value.
    pub const VELOCITY_ACTUAL: SdoAddress = SdoAddress::new(0x606C, 0);
    /// Target torque.
    pub const TARGET_TORQUE: SdoAddress = SdoAddress::new(0x6071, 0);
    /// Max torque.
    pub const MAX_TORQUE: SdoAddress = SdoAddress::new(0x6072, 0);
    /// Torque actual value.
    pub const TORQUE_ACTUAL: SdoAddress = SdoAddress::new(0x6077, 0);
    /// Torque slope.
    pub const TORQUE_SLOPE: SdoAddress = SdoAddress::new(0x6087, 0);
    /// Positive torque limit.
    pub const POSITIVE_TORQUE_LIMIT: SdoAddress = SdoAddress::new(0x60E0, 0);
    /// Negative torque limit.
    pub const NEGATIVE_TORQUE_LIMIT: SdoAddress = SdoAddress::new(0x60E1, 0);
}

/// Text for an AL status code.
#[must_use]
pub fn al_status_description(code: u16) -> &'static str {
    match code {
        0x0000 => "no error",
        0x0001 => "unspecified error",
        0x0002 => "no memory",
        0x0011 => "invalid requested state change",
        0x0012 => "unknown requested state",
        0x0013 => "bootstrap not supported",
        0x0014 => "no valid firmware",
        0x0015 => "invalid mailbox configuration (bootstrap)",
        0x0016 => "invalid mailbox configuration",
        0x0017 => "invalid sync manager configuration",
        0x0018 => "no valid inputs available",
        0x0019 => "no valid outputs",
        0x001A => "synchronization error",
        0x001B => "sync manager watchdog",
        0x001C => "invalid sync manager types",
        0x001D => "invalid output configuration",
        0x001E => "invalid input configuration",
        0x001F => "invalid watchdog configuration",
        0x0020 => "slave needs cold start",
        0x0021 => "slave needs INIT",
        0x0022 => "slave needs PREOP",
        0x0023 => "slave needs SAFEOP",
        0x0024 => "invalid input mapping",
        0x0025 => "invalid output mapping",
        0x0026 => "inconsistent settings",
        0x0027 => "freerun not supported",
        0x0028 => "synchronization not supported",
        0x0029 => "freerun needs 3 buffer mode",
        0x002A => "background watchdog",
        0x002B => "no valid inputs and outputs",
        0x002C => "fatal sync error",
        0x002D => "no sync error",
        0x0030 => "invalid DC SYNC configuration",
        0x0031 => "invalid DC latch configuration",
        0x0032 => "PLL error",
        0x0033 => "DC sync IO error",
        0x0034 => "DC sync timeout error",
        0x0035 => "DC invalid sync cycle time",
        0x0036 => "DC invalid sync0 cycle time",
        0x0037 => "DC invalid sync1 cycle time",
        0x0050 => "EEPROM no access",
        0x0051 => "EEPROM error",
        0x0060 => "slave restarted locally",
        _ => "unknown AL status code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(NetworkState::Init < NetworkState::PreOp);
        assert!(NetworkState::PreOp < NetworkState::SafeOp);
        assert!(NetworkState::SafeOp < NetworkState::Op);
        assert!(NetworkState::Bootstrap < NetworkState::PreOp);
    }

    #[test]
    fn test_al_state_decoding() {
        assert_eq!(NetworkState::from_al_status(0x01), Some(NetworkState::Init));
        assert_eq!(NetworkState::from_al_status(0x08), Some(NetworkState::Op));

        let safeop_error = AlState::decode(0x14).unwrap();
        assert_eq!(safeop_error.state, NetworkState::SafeOp);
        assert!(safeop_error.error);
        assert_eq!(safeop_error.to_string(), "SAFE_OP+ERROR");
        assert_eq!(safeop_error.as_raw(), 0x14);
        assert_eq!(NetworkState::from_raw(0x12), Ok((NetworkState::PreOp, true)));

        assert_eq!(
            AlState::decode(0x06),
            Err(EcatError::UnknownNetworkState(0x06))
        );
        assert_eq!(
            AlState::decode(0x00),
            Err(EcatError::UnknownNetworkState(0x00))
        );
    }

    #[test]
    fn test_entry_packing() {
        let control_word = PdoMapEntry::new(0x6040, 0, 16);
        assert_eq!(control_word.packed(), 0x6040_0010);
        assert_eq!(PdoMapEntry::padding(8).packed(), 0x0000_0008);
        assert_eq!(PdoMapEntry::from_packed(0x6064_0020), PdoMapEntry::new(0x6064, 0, 32));
    }

    #[test]
    fn test_cst_maps() {
        let rx = PdoMap::rx_cst();
        assert_eq!(rx.entries.len(), 4);
        assert_eq!(rx.bit_length(), 48);
        assert_eq!(rx.byte_length(), 6);
        let packed: Vec<u32> = rx.entries.iter().map(|e| e.packed()).collect();
        assert_eq!(packed, vec![0x6040_0010, 0x6071_0010, 0x6060_0008, 0x0000_0008]);

        let tx = PdoMap::tx_cst();
        assert_eq!(tx.bit_length(), 96);
        assert_eq!(tx.byte_length(), 12);
        assert_eq!(tx.assignment, 0x1C13);
    }

    #[test]
    fn test_slave_identity_display() {
        let id = SlaveIdentity::new(0x0000_0002, 0x044C_2C52, 0x0011_0001);
        let display = format!("{id}");
        assert!(display.contains("0x00000002"));
        assert!(display.contains("0x044c2c52"));
    }

    #[test]
    fn test_al_status_description() {
        assert_eq!(al_status_description(0x001B), "sync manager watchdog");
        assert_eq!(al_status_description(0xBEEF), "unknown AL status code");
    }
}
