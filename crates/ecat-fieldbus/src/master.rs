//! Master stack abstraction.
//!
//! The master stack owns the raw socket, the frame format and the slave
//! process buffers. Everything above it talks to the bus only through
//! [`MasterStack`], so the same bring-up and cyclic code runs against
//! SOEM or the in-process simulator.

use crate::slave::{al_status_description, AlState, NetworkState, SdoAddress, Slave};
use ecat_common::error::{EcatError, EcatResult};
use std::fmt;
use std::time::{Duration, Instant};

/// Working counter value returned when no frame came back in time.
pub const WKC_NO_FRAME: i32 = -1;

/// Poll interval used by the default [`MasterStack::wait_for_state`].
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Operations consumed from the fieldbus master stack.
///
/// Implementations must tolerate `close()` at any point, including after
/// a failed `open()`.
pub trait MasterStack: Send {
    /// Bind to a network adapter.
    fn open(&mut self, adapter: &str) -> EcatResult<()>;

    /// Scan the bus, load the default configuration and bring slaves to
    /// Pre-Operational. Returns the slave count.
    fn enumerate_and_initialize(&mut self) -> EcatResult<usize>;

    /// Enumerated slaves.
    fn slaves(&self) -> &[Slave];

    /// Enumerated slaves, mutable for output buffer writes.
    fn slaves_mut(&mut self) -> &mut [Slave];

    /// Refresh every slave's AL state and status code and return the lowest state.
    fn read_network_state(&mut self) -> EcatResult<NetworkState>;

    /// Request `state` for all slaves in one write. Returns the write's working counter.
    fn request_network_state(&mut self, state: NetworkState) -> EcatResult<u16>;

    /// Request `state` for one slave, optionally acknowledging a latched error.
    fn request_slave_state(
        &mut self,
        position: u16,
        state: NetworkState,
        acknowledge: bool,
    ) -> EcatResult<()>;

    /// Poll until every slave reports `state` or `timeout` elapses.
    /// Returns the lowest state seen by the last poll.
    fn wait_for_state(
        &mut self,
        state: NetworkState,
        timeout: Duration,
    ) -> EcatResult<NetworkState> {
        let deadline = Instant::now() + timeout;
        loop {
            let lowest = self.read_network_state()?;
            if self.slaves().iter().all(|s| s.state == state) {
                return Ok(lowest);
            }
            if Instant::now() >= deadline {
                return Ok(lowest);
            }
            std::thread::sleep(STATE_POLL_INTERVAL);
        }
    }

    /// Commit PDO mappings into the process image. Returns the total I/O size in bytes.
    fn apply_process_data_map(&mut self) -> EcatResult<usize>;

    /// Expected working counter for one process data exchange.
    fn expected_wkc(&self) -> u16;

    /// Enable distributed clocks network-wide. Returns false when no slave supports DC.
    fn enable_distributed_clock(&mut self) -> EcatResult<bool>;

    /// Arm SYNC0 on one slave.
    fn arm_slave_sync(
        &mut self,
        position: u16,
        period: Duration,
        phase_shift: Duration,
    ) -> EcatResult<()>;

    /// Reference clock time in ns from the last received frame, if DC is active.
    fn dc_time(&self) -> Option<i64>;

    /// Send the current output buffers.
    fn send_output_frame(&mut self) -> EcatResult<()>;

    /// Wait up to `timeout` for the returning frame and refresh input buffers.
    /// Returns the working counter or [`WKC_NO_FRAME`].
    fn receive_input_frame(&mut self, timeout: Duration) -> EcatResult<i32>;

    /// Read `len` bytes from an object.
    fn read_object(&mut self, slave: u16, address: SdoAddress, len: usize) -> EcatResult<Vec<u8>>;

    /// Write bytes to an object.
    fn write_object(&mut self, slave: u16, address: SdoAddress, data: &[u8]) -> EcatResult<()>;

    /// Release the adapter.
    fn close(&mut self) -> EcatResult<()>;
}

/// Typed object access on top of [`MasterStack`].
pub trait ObjectAccess {
    /// Write an unsigned 8-bit value.
    fn write_u8(&mut self, slave: u16, address: SdoAddress, value: u8) -> EcatResult<()>;
    /// Write an unsigned 16-bit value.
    fn write_u16(&mut self, slave: u16, address: SdoAddress, value: u16) -> EcatResult<()>;
    /// Write a signed 16-bit value.
    fn write_i16(&mut self, slave: u16, address: SdoAddress, value: i16) -> EcatResult<()>;
    /// Write an unsigned 32-bit value.
    fn write_u32(&mut self, slave: u16, address: SdoAddress, value: u32) -> EcatResult<()>;
    /// Read an unsigned 8-bit value.
    fn read_u8(&mut self, slave: u16, address: SdoAddress) -> EcatResult<u8>;
    /// Read an unsigned 16-bit value.
    fn read_u16(&mut self, slave: u16, address: SdoAddress) -> EcatResult<u16>;
    /// Read a signed 32-bit value.
    fn read_i32(&mut self, slave: u16, address: SdoAddress) -> EcatResult<i32>;
}

fn short_read(slave: u16, address: SdoAddress, wanted: usize, got: usize) -> EcatError {
    EcatError::ObjectAccess {
        slave,
        index: address.index,
        subindex: address.subindex,
        reason: format!("short read: expected {wanted} bytes, got {got}"),
    }
}

impl<M: MasterStack + ?Sized> ObjectAccess for M {
    fn write_u8(&mut self, slave: u16, address: SdoAddress, value: u8) -> EcatResult<()> {
        self.write_object(slave, address, &[value])
    }

    fn write_u16(&mut self, slave: u16, address: SdoAddress, value: u16) -> EcatResult<()> {
        self.write_object(slave, address, &value.to_le_bytes())
    }

    fn write_i16(&mut self, slave: u16, address: SdoAddress, value: i16) -> EcatResult<()> {
        self.write_object(slave, address, &value.to_le_bytes())
    }

    fn write_u32(&mut self, slave: u16, address: SdoAddress, value: u32) -> EcatResult<()> {
        self.write_object(slave, address, &value.to_le_bytes())
    }

    fn read_u8(&mut self, slave: u16, address: SdoAddress) -> EcatResult<u8> {
        let data = self.read_object(slave, address, 1)?;
        data.first()
            .copied()
            .ok_or_else(|| short_read(slave, address, 1, 0))
    }

    fn read_u16(&mut self, slave: u16, address: SdoAddress) -> EcatResult<u16> {
        let data = self.read_object(slave, address, 2)?;
        match data.as_slice() {
            [a, b, ..] => Ok(u16::from_le_bytes([*a, *b])),
            _ => Err(short_read(slave, address, 2, data.len())),
        }
    }

    fn read_i32(&mut self, slave: u16, address: SdoAddress) -> EcatResult<i32> {
        let data = self.read_object(slave, address, 4)?;
        match data.as_slice() {
            [a, b, c, d, ..] => Ok(i32::from_le_bytes([*a, *b, *c, *d])),
            _ => Err(short_read(slave, address, 4, data.len())),
        }
    }
}

/// A slave that did not reach a requested state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaggingSlave {
    /// Bus position.
    pub position: u16,
    /// Device name.
    pub name: String,
    /// Last read state.
    pub state: AlState,
    /// Last read AL status code.
    pub al_status_code: u16,
}

impl fmt::Display for LaggingSlave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slave {} ({}) in {} AL {:#06x} ({})",
            self.position,
            self.name,
            self.state,
            self.al_status_code,
            al_status_description(self.al_status_code)
        )
    }
}

/// Slaves whose last read state differs from `target`.
pub fn lagging_slaves<M: MasterStack + ?Sized>(master: &M, target: NetworkState) -> Vec<LaggingSlave> {
    master
        .slaves()
        .iter()
        .filter(|s| s.state != target || s.error_indicated)
        .map(|s| LaggingSlave {
            position: s.position,
            name: s.name.clone(),
            state: s.al_state(),
            al_status_code: s.al_status_code,
        })
        .collect()
}

/// Render lagging slaves for an error message.
#[must_use]
pub fn describe_lagging(lagging: &[LaggingSlave]) -> String {
    if lagging.is_empty() {
        return "none".to_string();
    }
    lagging
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
