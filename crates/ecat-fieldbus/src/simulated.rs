//! In-process simulated master stack.
//!
//! Models a line of CiA-402 drives well enough to exercise bring-up and
//! cyclic exchange without hardware:
//! - per-slave object dictionary with the CST mapping objects
//! - network state machine with transition rules and AL status codes
//! - distributed clock arming visible through 0x1C32
//! - a drive state machine driven by the received control word
//! - failure injection and a shared [`SimProbe`] for test assertions

use crate::frame::{ControlWord, InputFrame, OutputFrame, StatusWord};
use crate::master::{MasterStack, WKC_NO_FRAME};
use crate::slave::{objects, NetworkState, PdoMap, SdoAddress, Slave, SlaveIdentity};
use ecat_common::error::{EcatError, EcatResult};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Vendor id reported by simulated drives.
pub const SIM_VENDOR_ID: u32 = 0x0000_0539;
/// Product code reported by simulated drives.
pub const SIM_PRODUCT_CODE: u32 = 0x0000_0402;

const ABORT_NO_OBJECT: &str = "abort 0x06020000: object does not exist";
const ABORT_WRONG_STATE: &str = "abort 0x08000022: not writable in current state";

/// Drive-level CiA-402 states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    /// Switch on disabled.
    SwitchOnDisabled,
    /// Ready to switch on.
    ReadyToSwitchOn,
    /// Switched on.
    SwitchedOn,
    /// Operation enabled.
    OperationEnabled,
    /// Fault latched.
    Fault,
}

impl DriveState {
    fn status_word(self) -> u16 {
        match self {
            Self::SwitchOnDisabled => 0x0250,
            Self::ReadyToSwitchOn => 0x0231,
            Self::SwitchedOn => 0x0233,
            Self::OperationEnabled => 0x0237,
            Self::Fault => 0x0218,
        }
    }
}

/// One output frame as it left the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireSample {
    /// Sequence number of the frame.
    pub frame: u64,
    /// Slave the output was addressed to.
    pub slave: u16,
    /// Decoded output fields.
    pub output: OutputFrame,
    /// Slave state when the frame was sent.
    pub state: NetworkState,
}

/// One object write seen by a slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectWrite {
    /// Slave position.
    pub slave: u16,
    /// Object address.
    pub address: SdoAddress,
    /// Written bytes.
    pub data: Vec<u8>,
    /// Whether the slave accepted the write.
    pub accepted: bool,
}

/// Everything the simulator records for assertions.
#[derive(Debug, Default)]
pub struct SimRecord {
    /// Output frames (only with tracing enabled).
    pub wire: Vec<WireSample>,
    /// Object writes in order.
    pub object_writes: Vec<ObjectWrite>,
    /// Slave state changes in order.
    pub state_log: Vec<(u16, NetworkState)>,
    /// Frames sent.
    pub frames_sent: u64,
    /// Calls to `apply_process_data_map`.
    pub map_attempts: u32,
    /// Calls to `enumerate_and_initialize`.
    pub enumerations: u32,
    /// Calls to `close`.
    pub close_calls: u32,
}

/// Shared view on a [`SimulatedMaster`]'s record, usable after the master
/// has been moved into a session.
#[derive(Debug, Clone, Default)]
pub struct SimProbe(Arc<Mutex<SimRecord>>);

impl SimProbe {
    /// Lock the record.
    pub fn lock(&self) -> MutexGuard<'_, SimRecord> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Control words sent to `slave`, in order.
    #[must_use]
    pub fn control_words(&self, slave: u16) -> Vec<u16> {
        self.lock()
            .wire
            .iter()
            .filter(|s| s.slave == slave)
            .map(|s| s.output.control_word)
            .collect()
    }

    /// Frames sent so far.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.lock().frames_sent
    }
}

/// Injected failures.
#[derive(Debug, Clone, Default)]
struct Faults {
    open_error: Option<String>,
    map_failures: u32,
    op_min_frames: u64,
    drop_every: u64,
    degrade_every: u64,
    rejected: HashSet<(u16, SdoAddress)>,
    stuck_in_preop: HashSet<u16>,
}

#[derive(Debug)]
struct SimDrive {
    od: BTreeMap<SdoAddress, Vec<u8>>,
    state: DriveState,
    last_control: u16,
    mode: i8,
    position: i32,
    velocity: i32,
    torque: i16,
    fault_sticky: bool,
}

impl SimDrive {
    fn new() -> Self {
        let mut drive = Self {
            od: BTreeMap::new(),
            state: DriveState::SwitchOnDisabled,
            last_control: 0,
            mode: 0,
            position: 0,
            velocity: 0,
            torque: 0,
            fault_sticky: false,
        };
        drive.load_factory_defaults();
        drive
    }

    fn load_factory_defaults(&mut self) {
        for map in [PdoMap::rx_cst(), PdoMap::tx_cst()] {
            let count = u8::try_from(map.entries.len()).unwrap_or(u8::MAX);
            self.od.insert(SdoAddress::new(map.index, 0), vec![count]);
            for (i, entry) in map.entries.iter().enumerate() {
                let sub = u8::try_from(i + 1).unwrap_or(u8::MAX);
                self.od.insert(
                    SdoAddress::new(map.index, sub),
                    entry.packed().to_le_bytes().to_vec(),
                );
            }
            self.od.insert(SdoAddress::new(map.assignment, 0), vec![1]);
            self.od.insert(
                SdoAddress::new(map.assignment, 1),
                map.index.to_le_bytes().to_vec(),
            );
        }
        for (address, value) in [
            (objects::SM2_SYNC_TYPE, 0u16.to_le_bytes().to_vec()),
            (objects::SM2_CYCLE_TIME, 0u32.to_le_bytes().to_vec()),
            (objects::ERROR_CODE, 0u16.to_le_bytes().to_vec()),
            (objects::CONTROL_WORD, 0u16.to_le_bytes().to_vec()),
            (objects::MODES_OF_OPERATION, vec![0]),
            (objects::MODES_DISPLAY, vec![0]),
            (objects::TARGET_TORQUE, 0i16.to_le_bytes().to_vec()),
            (objects::MAX_TORQUE, 1000i16.to_le_bytes().to_vec()),
            (objects::TORQUE_SLOPE, 1000u32.to_le_bytes().to_vec()),
            (objects::POSITIVE_TORQUE_LIMIT, 3000i16.to_le_bytes().to_vec()),
            (objects::NEGATIVE_TORQUE_LIMIT, 3000i16.to_le_bytes().to_vec()),
            (objects::DEVICE_NAME, b"SIM-CST".to_vec()),
        ] {
            self.od.entry(address).or_insert(value);
        }
    }

    /// Restore the factory mapping, dropping any extra mapping sub-slots.
    fn reload_mapping(&mut self) {
        self.od
            .retain(|addr, _| !matches!(addr.index, 0x1600 | 0x1A00 | 0x1C12 | 0x1C13));
        self.load_factory_defaults();
    }

    fn read_u8(&self, address: SdoAddress) -> u8 {
        self.od
            .get(&address)
            .and_then(|v| v.first().copied())
            .unwrap_or(0)
    }

    fn read_u16(&self, address: SdoAddress) -> u16 {
        match self.od.get(&address).map(Vec::as_slice) {
            Some([a, b, ..]) => u16::from_le_bytes([*a, *b]),
            Some([a]) => u16::from(*a),
            _ => 0,
        }
    }

    fn read_u32(&self, address: SdoAddress) -> u32 {
        let mut raw = [0u8; 4];
        if let Some(bytes) = self.od.get(&address) {
            for (dst, src) in raw.iter_mut().zip(bytes) {
                *dst = *src;
            }
        }
        u32::from_le_bytes(raw)
    }

    /// Assigned PDO bit length for one sync manager, or `None` when an
    /// assigned map references an object the drive cannot map.
    fn assigned_bits(&self, assignment: u16) -> Option<u32> {
        let assigned = self.read_u8(SdoAddress::new(assignment, 0));
        let mut bits = 0u32;
        for slot in 1..=assigned {
            let map_index = self.read_u16(SdoAddress::new(assignment, slot));
            let count = self.read_u8(SdoAddress::new(map_index, 0));
            for sub in 1..=count {
                let entry = self.read_u32(SdoAddress::new(map_index, sub));
                let index = (entry >> 16) as u16;
                if index != 0 && !self.od.contains_key(&SdoAddress::new(index, 0)) {
                    return None;
                }
                bits += entry & 0xFF;
            }
        }
        Some(bits)
    }

    fn latch_fault(&mut self, error_code: u16, sticky: bool) {
        self.state = DriveState::Fault;
        self.fault_sticky = sticky;
        self.od
            .insert(objects::ERROR_CODE, error_code.to_le_bytes().to_vec());
    }

    fn status_word(&self) -> StatusWord {
        StatusWord(self.state.status_word())
    }

    fn apply_output(&mut self, output: OutputFrame) {
        let cw = output.control_word;
        let rising_reset = cw & ControlWord::FAULT_RESET != 0
            && self.last_control & ControlWord::FAULT_RESET == 0;
        self.last_control = cw;
        self.mode = output.mode;
        self.od
            .insert(objects::MODES_DISPLAY, output.mode.to_le_bytes().to_vec());

        self.state = match (self.state, cw & 0x008F) {
            (DriveState::Fault, _) if rising_reset && !self.fault_sticky => {
                self.od.insert(objects::ERROR_CODE, vec![0, 0]);
                DriveState::SwitchOnDisabled
            }
            (DriveState::Fault, _) => DriveState::Fault,
            (_, 0x0006) => DriveState::ReadyToSwitchOn,
            (
                DriveState::ReadyToSwitchOn | DriveState::SwitchedOn | DriveState::OperationEnabled,
                0x0007,
            ) => DriveState::SwitchedOn,
            (
                DriveState::ReadyToSwitchOn | DriveState::SwitchedOn | DriveState::OperationEnabled,
                0x000F,
            ) => DriveState::OperationEnabled,
            (_, 0x0000) => DriveState::SwitchOnDisabled,
            (state, _) => state,
        };

        if self.state == DriveState::OperationEnabled && self.mode == 10 {
            self.torque = output.target_torque;
        } else {
            self.torque = 0;
        }
        self.velocity = self.velocity.saturating_add(i32::from(self.torque) / 10);
        if self.torque == 0 {
            self.velocity -= self.velocity / 8;
        }
        self.position = self.position.wrapping_add(self.velocity / 100);
    }

    fn input_frame(&self) -> InputFrame {
        InputFrame {
            status_word: self.status_word(),
            position: self.position,
            velocity: self.velocity,
            torque: self.torque,
        }
    }
}

/// Simulated master stack.
#[derive(Debug)]
pub struct SimulatedMaster {
    adapter: Option<String>,
    open: bool,
    drive_count: u16,
    slaves: Vec<Slave>,
    drives: Vec<SimDrive>,
    pending: Vec<Option<(NetworkState, Instant)>>,
    latched_faults: Vec<(u16, u16, bool)>,
    expected_wkc: u16,
    mapped: bool,
    dc_enabled: bool,
    dc_supported: bool,
    started: Instant,
    in_flight: Option<bool>,
    frames_in_safeop: u64,
    transition_delay: Duration,
    record_wire: bool,
    faults: Faults,
    probe: SimProbe,
}

impl SimulatedMaster {
    /// Create a simulator with `drive_count` CST drives.
    #[must_use]
    pub fn new(drive_count: u16) -> Self {
        Self {
            adapter: None,
            open: false,
            drive_count,
            slaves: Vec::new(),
            drives: Vec::new(),
            pending: Vec::new(),
            latched_faults: Vec::new(),
            expected_wkc: 0,
            mapped: false,
            dc_enabled: false,
            dc_supported: true,
            started: Instant::now(),
            in_flight: None,
            frames_in_safeop: 0,
            transition_delay: Duration::ZERO,
            record_wire: false,
            faults: Faults::default(),
            probe: SimProbe::default(),
        }
    }

    /// Shared record for assertions.
    #[must_use]
    pub fn probe(&self) -> SimProbe {
        self.probe.clone()
    }

    /// Record every output frame.
    #[must_use]
    pub fn with_wire_trace(mut self) -> Self {
        self.record_wire = true;
        self
    }

    /// Drive at `position` starts with a latched fault and `error_code` in 0x603F.
    /// A sticky fault never clears on reset.
    #[must_use]
    pub fn with_latched_fault(mut self, position: u16, error_code: u16, sticky: bool) -> Self {
        self.latched_faults.push((position, error_code, sticky));
        self
    }

    /// Fail `open` with a connection error.
    #[must_use]
    pub fn fail_open(mut self, reason: impl Into<String>) -> Self {
        self.faults.open_error = Some(reason.into());
        self
    }

    /// Reject the next `attempts` calls to `apply_process_data_map`.
    #[must_use]
    pub fn fail_map_attempts(mut self, attempts: u32) -> Self {
        self.faults.map_failures = attempts;
        self
    }

    /// Refuse Operational until `frames` outputs were received in Safe-Operational.
    #[must_use]
    pub fn refuse_op_without_outputs(mut self, frames: u64) -> Self {
        self.faults.op_min_frames = frames;
        self
    }

    /// Lose every `n`th frame.
    #[must_use]
    pub fn drop_every(mut self, n: u64) -> Self {
        self.faults.drop_every = n;
        self
    }

    /// Return a short working counter every `n`th frame.
    #[must_use]
    pub fn degrade_every(mut self, n: u64) -> Self {
        self.faults.degrade_every = n;
        self
    }

    /// Abort writes and reads of one object on one slave.
    #[must_use]
    pub fn reject_object(mut self, slave: u16, address: SdoAddress) -> Self {
        self.faults.rejected.insert((slave, address));
        self
    }

    /// Slave never leaves Pre-Operational.
    #[must_use]
    pub fn stuck_in_preop(mut self, slave: u16) -> Self {
        self.faults.stuck_in_preop.insert(slave);
        self
    }

    /// Slaves report no DC support.
    #[must_use]
    pub fn without_dc(mut self) -> Self {
        self.dc_supported = false;
        self
    }

    /// Delay before a requested state is reported.
    #[must_use]
    pub fn with_transition_delay(mut self, delay: Duration) -> Self {
        self.transition_delay = delay;
        self
    }

    /// Current CiA-402 state of a drive.
    #[must_use]
    pub fn drive_state(&self, position: u16) -> Option<DriveState> {
        self.drives.get(usize::from(position)).map(|d| d.state)
    }

    fn ensure_open(&self) -> EcatResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(EcatError::Fieldbus("simulated master is not open".into()))
        }
    }

    fn set_slave_state(&mut self, idx: usize, state: NetworkState) {
        let slave = &mut self.slaves[idx];
        if slave.state != state {
            slave.state = state;
            self.probe.lock().state_log.push((slave.position, state));
            debug!(slave = slave.position, %state, "Simulated slave state change");
        }
    }

    fn refuse(&mut self, idx: usize, al_status_code: u16) {
        let slave = &mut self.slaves[idx];
        slave.error_indicated = true;
        slave.al_status_code = al_status_code;
    }

    /// Apply pending state requests whose delay has elapsed.
    fn settle(&mut self) {
        let now = Instant::now();
        for idx in 0..self.slaves.len() {
            let Some((target, at)) = self.pending[idx] else {
                continue;
            };
            if now < at + self.transition_delay {
                continue;
            }
            self.pending[idx] = None;
            let position = self.slaves[idx].position;
            let current = self.slaves[idx].state;

            if target == NetworkState::Bootstrap {
                self.refuse(idx, 0x0013);
                continue;
            }
            if target <= current || target == NetworkState::Init {
                if target != current {
                    self.slaves[idx].error_indicated = false;
                    self.slaves[idx].al_status_code = 0;
                }
                self.set_slave_state(idx, target);
                continue;
            }

            match target {
                NetworkState::PreOp => {
                    self.slaves[idx].error_indicated = false;
                    self.set_slave_state(idx, NetworkState::PreOp);
                }
                NetworkState::SafeOp if self.faults.stuck_in_preop.contains(&position) => {
                    self.refuse(idx, 0x0017);
                }
                NetworkState::SafeOp if current != NetworkState::PreOp => self.refuse(idx, 0x0011),
                NetworkState::SafeOp if !self.mapped => self.refuse(idx, 0x001D),
                NetworkState::SafeOp => {
                    self.slaves[idx].error_indicated = false;
                    self.slaves[idx].al_status_code = 0;
                    self.set_slave_state(idx, NetworkState::SafeOp);
                }
                NetworkState::Op if current != NetworkState::SafeOp => self.refuse(idx, 0x0011),
                NetworkState::Op if self.frames_in_safeop < self.faults.op_min_frames => {
                    self.refuse(idx, 0x001B);
                }
                NetworkState::Op => {
                    self.slaves[idx].error_indicated = false;
                    self.slaves[idx].al_status_code = 0;
                    self.set_slave_state(idx, NetworkState::Op);
                }
                NetworkState::Init | NetworkState::Bootstrap => {}
            }
        }
    }

    fn drive_object_writable(&self, idx: usize, address: SdoAddress) -> bool {
        let mapping = matches!(address.index, 0x1600..=0x17FF | 0x1A00..=0x1BFF)
            || address.index == objects::SM2_ASSIGN
            || address.index == objects::SM3_ASSIGN;
        !mapping || self.slaves[idx].state == NetworkState::PreOp
    }

    fn slave_index(&self, slave: u16) -> EcatResult<usize> {
        let idx = usize::from(slave);
        if idx < self.slaves.len() {
            Ok(idx)
        } else {
            Err(EcatError::Fieldbus(format!("no slave at position {slave}")))
        }
    }
}

impl MasterStack for SimulatedMaster {
    fn open(&mut self, adapter: &str) -> EcatResult<()> {
        if let Some(reason) = &self.faults.open_error {
            return Err(EcatError::Connection {
                adapter: adapter.to_string(),
                reason: reason.clone(),
            });
        }
        info!(adapter, drives = self.drive_count, "Opening simulated master");
        self.adapter = Some(adapter.to_string());
        self.open = true;
        self.started = Instant::now();
        Ok(())
    }

    fn enumerate_and_initialize(&mut self) -> EcatResult<usize> {
        self.ensure_open()?;
        self.probe.lock().enumerations += 1;

        if self.slaves.is_empty() {
            for position in 0..self.drive_count {
                let mut slave = Slave::new(
                    position,
                    format!("SIM-CST-{position}"),
                    SlaveIdentity::new(SIM_VENDOR_ID, SIM_PRODUCT_CODE, 1),
                );
                slave.dc_supported = self.dc_supported;
                self.slaves.push(slave);
                let mut drive = SimDrive::new();
                if let Some((_, code, sticky)) =
                    self.latched_faults.iter().find(|(p, _, _)| *p == position)
                {
                    drive.latch_fault(*code, *sticky);
                }
                self.drives.push(drive);
                self.pending.push(None);
            }
        }

        // Reload the default mapping; slaves end up in Pre-Operational.
        for drive in &mut self.drives {
            drive.reload_mapping();
        }
        for idx in 0..self.slaves.len() {
            if self.slaves[idx].state != NetworkState::PreOp {
                self.set_slave_state(idx, NetworkState::PreOp);
            }
            self.slaves[idx].error_indicated = false;
            self.slaves[idx].al_status_code = 0;
            self.slaves[idx].inputs.clear();
            self.slaves[idx].outputs.clear();
        }
        self.mapped = false;
        self.expected_wkc = 0;
        self.frames_in_safeop = 0;
        Ok(self.slaves.len())
    }

    fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    fn slaves_mut(&mut self) -> &mut [Slave] {
        &mut self.slaves
    }

    fn read_network_state(&mut self) -> EcatResult<NetworkState> {
        self.ensure_open()?;
        self.settle();
        Ok(self
            .slaves
            .iter()
            .map(|s| s.state)
            .min()
            .unwrap_or(NetworkState::Init))
    }

    fn request_network_state(&mut self, state: NetworkState) -> EcatResult<u16> {
        self.ensure_open()?;
        let now = Instant::now();
        for pending in &mut self.pending {
            *pending = Some((state, now));
        }
        Ok(u16::try_from(self.slaves.len()).unwrap_or(u16::MAX))
    }

    fn request_slave_state(
        &mut self,
        position: u16,
        state: NetworkState,
        acknowledge: bool,
    ) -> EcatResult<()> {
        self.ensure_open()?;
        let idx = self.slave_index(position)?;
        if acknowledge {
            self.slaves[idx].error_indicated = false;
            self.slaves[idx].al_status_code = 0;
        }
        self.pending[idx] = Some((state, Instant::now()));
        Ok(())
    }

    fn apply_process_data_map(&mut self) -> EcatResult<usize> {
        self.ensure_open()?;
        self.probe.lock().map_attempts += 1;

        if self.faults.map_failures > 0 {
            self.faults.map_failures -= 1;
            warn!("Simulated master rejecting process data map");
            return Err(EcatError::MappingRejected(
                "simulated mapping failure".into(),
            ));
        }

        let mut total = 0usize;
        let mut outputs_wkc = 0u16;
        let mut inputs_wkc = 0u16;
        for idx in 0..self.slaves.len() {
            let drive = &self.drives[idx];
            let (Some(rx_bits), Some(tx_bits)) = (
                drive.assigned_bits(objects::SM2_ASSIGN),
                drive.assigned_bits(objects::SM3_ASSIGN),
            ) else {
                self.refuse(idx, 0x001D);
                return Err(EcatError::MappingRejected(format!(
                    "slave {idx} maps an unknown object"
                )));
            };
            let out_bytes = (rx_bits as usize).div_ceil(8);
            let in_bytes = (tx_bits as usize).div_ceil(8);
            self.slaves[idx].outputs = vec![0; out_bytes];
            self.slaves[idx].inputs = vec![0; in_bytes];
            outputs_wkc += u16::from(out_bytes > 0);
            inputs_wkc += u16::from(in_bytes > 0);
            total += out_bytes + in_bytes;
        }
        self.expected_wkc = outputs_wkc * 2 + inputs_wkc;
        self.mapped = true;
        info!(
            io_bytes = total,
            expected_wkc = self.expected_wkc,
            "Simulated process data mapped"
        );
        Ok(total)
    }

    fn expected_wkc(&self) -> u16 {
        self.expected_wkc
    }

    fn enable_distributed_clock(&mut self) -> EcatResult<bool> {
        self.ensure_open()?;
        self.dc_enabled = self.dc_supported && !self.slaves.is_empty();
        Ok(self.dc_enabled)
    }

    fn arm_slave_sync(
        &mut self,
        position: u16,
        period: Duration,
        _phase_shift: Duration,
    ) -> EcatResult<()> {
        self.ensure_open()?;
        let idx = self.slave_index(position)?;
        if !self.slaves[idx].dc_supported {
            return Err(EcatError::Fieldbus(format!(
                "slave {position} has no distributed clock"
            )));
        }
        // Arming without the network-wide enable leaves SYNC0 inactive.
        let sync_type: u16 = if self.dc_enabled { 2 } else { 1 };
        let cycle_ns = u32::try_from(period.as_nanos()).unwrap_or(u32::MAX);
        let od = &mut self.drives[idx].od;
        od.insert(objects::SM2_SYNC_TYPE, sync_type.to_le_bytes().to_vec());
        od.insert(objects::SM2_CYCLE_TIME, cycle_ns.to_le_bytes().to_vec());
        Ok(())
    }

    fn dc_time(&self) -> Option<i64> {
        self.dc_enabled
            .then(|| i64::try_from(self.started.elapsed().as_nanos()).unwrap_or(i64::MAX))
    }

    fn send_output_frame(&mut self) -> EcatResult<()> {
        self.ensure_open()?;
        self.settle();

        let frame = {
            let mut record = self.probe.lock();
            record.frames_sent += 1;
            record.frames_sent
        };
        let lowest = self.slaves.iter().map(|s| s.state).min();
        if lowest >= Some(NetworkState::SafeOp) {
            self.frames_in_safeop += 1;
        }

        let dropped = self.faults.drop_every > 0 && frame % self.faults.drop_every == 0;
        self.in_flight = Some(dropped);
        if dropped {
            return Ok(());
        }

        let mut samples = Vec::new();
        for (slave, drive) in self.slaves.iter().zip(self.drives.iter_mut()) {
            let Some(output) = OutputFrame::decode(&slave.outputs) else {
                continue;
            };
            if self.record_wire {
                samples.push(WireSample {
                    frame,
                    slave: slave.position,
                    output,
                    state: slave.state,
                });
            }
            if slave.state == NetworkState::Op {
                drive.apply_output(output);
            }
        }
        if !samples.is_empty() {
            self.probe.lock().wire.extend(samples);
        }
        trace!(frame, "Simulated frame sent");
        Ok(())
    }

    fn receive_input_frame(&mut self, timeout: Duration) -> EcatResult<i32> {
        self.ensure_open()?;
        match self.in_flight.take() {
            None => Ok(WKC_NO_FRAME),
            Some(true) => {
                std::thread::sleep(timeout);
                Ok(WKC_NO_FRAME)
            }
            Some(false) => {
                let mut wkc = 0i32;
                for (slave, drive) in self.slaves.iter_mut().zip(self.drives.iter()) {
                    if slave.state < NetworkState::SafeOp {
                        continue;
                    }
                    let frame = drive.input_frame().encode();
                    let n = slave.inputs.len().min(frame.len());
                    slave.inputs[..n].copy_from_slice(&frame[..n]);
                    if !slave.inputs.is_empty() {
                        wkc += 1;
                    }
                    if slave.state == NetworkState::Op && !slave.outputs.is_empty() {
                        wkc += 2;
                    }
                }
                let frames = self.probe.lock().frames_sent;
                if self.faults.degrade_every > 0 && frames % self.faults.degrade_every == 0 {
                    wkc = (wkc - 1).max(0);
                }
                Ok(wkc)
            }
        }
    }

    fn read_object(&mut self, slave: u16, address: SdoAddress, len: usize) -> EcatResult<Vec<u8>> {
        self.ensure_open()?;
        let idx = self.slave_index(slave)?;
        let abort = |reason: &str| EcatError::ObjectAccess {
            slave,
            index: address.index,
            subindex: address.subindex,
            reason: reason.to_string(),
        };
        if self.faults.rejected.contains(&(slave, address)) {
            return Err(abort(ABORT_NO_OBJECT));
        }
        let drive = &self.drives[idx];
        let mut value = if address == objects::STATUS_WORD {
            drive.status_word().0.to_le_bytes().to_vec()
        } else {
            drive
                .od
                .get(&address)
                .cloned()
                .ok_or_else(|| abort(ABORT_NO_OBJECT))?
        };
        value.resize(len, 0);
        Ok(value)
    }

    fn write_object(&mut self, slave: u16, address: SdoAddress, data: &[u8]) -> EcatResult<()> {
        self.ensure_open()?;
        let idx = self.slave_index(slave)?;
        let rejection = if self.faults.rejected.contains(&(slave, address)) {
            Some(ABORT_NO_OBJECT)
        } else if !self.drive_object_writable(idx, address) {
            Some(ABORT_WRONG_STATE)
        } else {
            None
        };

        self.probe.lock().object_writes.push(ObjectWrite {
            slave,
            address,
            data: data.to_vec(),
            accepted: rejection.is_none(),
        });

        if let Some(reason) = rejection {
            return Err(EcatError::ObjectAccess {
                slave,
                index: address.index,
                subindex: address.subindex,
                reason: reason.to_string(),
            });
        }

        let drive = &mut self.drives[idx];
        if address == objects::MODES_OF_OPERATION {
            drive.od.insert(objects::MODES_DISPLAY, data.to_vec());
        }
        drive.od.insert(address, data.to_vec());
        Ok(())
    }

    fn close(&mut self) -> EcatResult<()> {
        self.probe.lock().close_calls += 1;
        if self.open {
            info!(adapter = ?self.adapter, "Closing simulated master");
        }
        self.open = false;
        self.in_flight = None;
        Ok(())
    }
}
