//! Fixed-layout CST process data frames.
//!
//! Output frame (controller → drive), little-endian:
//!
//! | offset | field            | type |
//! |--------|------------------|------|
//! | 0      | control word     | u16  |
//! | 2      | target torque    | i16  |
//! | 4      | mode of operation| i8   |
//! | 5      | padding          | u8   |
//!
//! Input frame (drive → controller), little-endian:
//!
//! | offset | field            | type |
//! |--------|------------------|------|
//! | 0      | status word      | u16  |
//! | 2      | actual position  | i32  |
//! | 6      | actual velocity  | i32  |
//! | 10     | actual torque    | i16  |

use serde::Serialize;
use static_assertions::const_assert_eq;
use std::fmt;

/// Encoded size of [`OutputFrame`].
pub const OUTPUT_FRAME_SIZE: usize = 6;
/// Encoded size of [`InputFrame`].
pub const INPUT_FRAME_SIZE: usize = 12;

const_assert_eq!(OUTPUT_FRAME_SIZE * 8, 16 + 16 + 8 + 8);
const_assert_eq!(INPUT_FRAME_SIZE * 8, 16 + 32 + 32 + 16);

/// Control word commands for the CiA-402 enable sequence.
pub struct ControlWord;

impl ControlWord {
    /// Disable voltage.
    pub const DISABLE_VOLTAGE: u16 = 0x0000;
    /// Shutdown: go to Ready to switch on.
    pub const SHUTDOWN: u16 = 0x0006;
    /// Switch on.
    pub const SWITCH_ON: u16 = 0x0007;
    /// Switch on and enable operation.
    pub const ENABLE_OPERATION: u16 = 0x000F;
    /// Fault reset (rising edge of bit 7).
    pub const FAULT_RESET: u16 = 0x0080;
}

/// Modes of operation (0x6060).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i8)]
pub enum ModeOfOperation {
    /// Profile position.
    ProfilePosition = 1,
    /// Profile velocity.
    ProfileVelocity = 3,
    /// Profile torque.
    ProfileTorque = 4,
    /// Homing.
    Homing = 6,
    /// Interpolated position.
    InterpolatedPosition = 7,
    /// Cyclic synchronous position.
    CyclicSyncPosition = 8,
    /// Cyclic synchronous velocity.
    CyclicSyncVelocity = 9,
    /// Cyclic synchronous torque.
    CyclicSyncTorque = 10,
}

impl ModeOfOperation {
    /// Decode a raw mode value.
    #[must_use]
    pub fn from_raw(raw: i8) -> Option<Self> {
        match raw {
            1 => Some(Self::ProfilePosition),
            3 => Some(Self::ProfileVelocity),
            4 => Some(Self::ProfileTorque),
            6 => Some(Self::Homing),
            7 => Some(Self::InterpolatedPosition),
            8 => Some(Self::CyclicSyncPosition),
            9 => Some(Self::CyclicSyncVelocity),
            10 => Some(Self::CyclicSyncTorque),
            _ => None,
        }
    }

    /// Raw value.
    #[must_use]
    pub fn as_raw(self) -> i8 {
        self as i8
    }
}

impl fmt::Display for ModeOfOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProfilePosition => "PP",
            Self::ProfileVelocity => "PV",
            Self::ProfileTorque => "PT",
            Self::Homing => "HM",
            Self::InterpolatedPosition => "IP",
            Self::CyclicSyncPosition => "CSP",
            Self::CyclicSyncVelocity => "CSV",
            Self::CyclicSyncTorque => "CST",
        };
        write!(f, "{name}")
    }
}

/// Status word (0x6041) with named bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusWord(pub u16);

impl StatusWord {
    const NAMES: [(u16, &'static str); 12] = [
        (0, "ready_to_switch_on"),
        (1, "switched_on"),
        (2, "operation_enabled"),
        (3, "fault"),
        (4, "voltage_enabled"),
        (5, "quick_stop"),
        (6, "switch_on_disabled"),
        (7, "warning"),
        (8, "manufacturer"),
        (9, "remote"),
        (10, "target_reached"),
        (11, "internal_limit"),
    ];

    fn bit(self, n: u16) -> bool {
        self.0 & (1 << n) != 0
    }

    /// Bit 0.
    #[must_use]
    pub fn ready_to_switch_on(self) -> bool {
        self.bit(0)
    }

    /// Bit 1.
    #[must_use]
    pub fn switched_on(self) -> bool {
        self.bit(1)
    }

    /// Bit 2.
    #[must_use]
    pub fn operation_enabled(self) -> bool {
        self.bit(2)
    }

    /// Bit 3.
    #[must_use]
    pub fn fault(self) -> bool {
        self.bit(3)
    }

    /// Bit 4.
    #[must_use]
    pub fn voltage_enabled(self) -> bool {
        self.bit(4)
    }

    /// Bit 5. Active low: false means quick stop is engaged.
    #[must_use]
    pub fn quick_stop(self) -> bool {
        self.bit(5)
    }

    /// Bit 6.
    #[must_use]
    pub fn switch_on_disabled(self) -> bool {
        self.bit(6)
    }

    /// Bit 7.
    #[must_use]
    pub fn warning(self) -> bool {
        self.bit(7)
    }

    /// Bit 9.
    #[must_use]
    pub fn remote(self) -> bool {
        self.bit(9)
    }

    /// Bit 10.
    #[must_use]
    pub fn target_reached(self) -> bool {
        self.bit(10)
    }

    /// Bit 11.
    #[must_use]
    pub fn internal_limit(self) -> bool {
        self.bit(11)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x} [", self.0)?;
        let mut first = true;
        for (bit, name) in Self::NAMES {
            if self.bit(bit) {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, "]")
    }
}

/// Semantic output fields for one drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OutputFrame {
    /// Control word (0x6040).
    pub control_word: u16,
    /// Target torque (0x6071).
    pub target_torque: i16,
    /// Mode of operation (0x6060).
    pub mode: i8,
    /// Padding byte.
    pub padding: u8,
}

impl OutputFrame {
    /// Encode to the wire layout.
    #[must_use]
    pub fn encode(&self) -> [u8; OUTPUT_FRAME_SIZE] {
        let mut buf = [0u8; OUTPUT_FRAME_SIZE];
        buf[0..2].copy_from_slice(&self.control_word.to_le_bytes());
        buf[2..4].copy_from_slice(&self.target_torque.to_le_bytes());
        buf[4] = self.mode.to_le_bytes()[0];
        buf[5] = self.padding;
        buf
    }

    /// Encode into the head of `buf`. Returns false, leaving `buf`
    /// untouched, when it is shorter than [`OUTPUT_FRAME_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) -> bool {
        match buf.get_mut(..OUTPUT_FRAME_SIZE) {
            Some(head) => {
                head.copy_from_slice(&self.encode());
                true
            }
            None => false,
        }
    }

    /// Decode from the wire layout.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let b = buf.get(..OUTPUT_FRAME_SIZE)?;
        Some(Self {
            control_word: u16::from_le_bytes([b[0], b[1]]),
            target_torque: i16::from_le_bytes([b[2], b[3]]),
            mode: i8::from_le_bytes([b[4]]),
            padding: b[5],
        })
    }
}

/// Decoded input fields for one drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct InputFrame {
    /// Status word (0x6041).
    pub status_word: StatusWord,
    /// Position actual value (0x6064).
    pub position: i32,
    /// Velocity actual value (0x606C).
    pub velocity: i32,
    /// Torque actual value (0x6077).
    pub torque: i16,
}

impl InputFrame {
    /// Decode from the wire layout. Returns `None` for short buffers.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let b = buf.get(..INPUT_FRAME_SIZE)?;
        Some(Self {
            status_word: StatusWord(u16::from_le_bytes([b[0], b[1]])),
            position: i32::from_le_bytes([b[2], b[3], b[4], b[5]]),
            velocity: i32::from_le_bytes([b[6], b[7], b[8], b[9]]),
            torque: i16::from_le_bytes([b[10], b[11]]),
        })
    }

    /// Encode to the wire layout.
    #[must_use]
    pub fn encode(&self) -> [u8; INPUT_FRAME_SIZE] {
        let mut buf = [0u8; INPUT_FRAME_SIZE];
        buf[0..2].copy_from_slice(&self.status_word.0.to_le_bytes());
        buf[2..6].copy_from_slice(&self.position.to_le_bytes());
        buf[6..10].copy_from_slice(&self.velocity.to_le_bytes());
        buf[10..12].copy_from_slice(&self.torque.to_le_bytes());
        buf
    }
}
