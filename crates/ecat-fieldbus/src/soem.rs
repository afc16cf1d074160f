//! SOEM-backed master stack.
//!
//! Uses the `soem` crate, which wraps the Simple Open EtherCAT Master
//! library.
//!
//! # Requirements
//!
//! - Linux with raw socket capabilities (`CAP_NET_RAW`) or root privileges
//! - libsoem-dev installed or SOEM built from source
//!
//! SOEM lays out the group 0 process image as all slave outputs followed by
//! all slave inputs, in bus order. The per-slave buffers in [`Slave`] are
//! copied into that image before each send and out of it after each receive.

use crate::master::{MasterStack, WKC_NO_FRAME};
use crate::slave::{objects, NetworkState, SdoAddress, Slave, SlaveIdentity};
use ecat_common::error::{EcatError, EcatResult};
use std::ffi::c_int;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Timeout for object access in microseconds.
const SDO_TIMEOUT_US: c_int = 50_000;

/// Maximum number of slaves supported.
const MAX_SLAVES: usize = 128;

/// Maximum number of groups.
const MAX_GROUPS: usize = 2;

/// I/O map size (fixed by the SOEM API).
const IO_MAP_SIZE: usize = 4096;

/// Linux capability bit for `CAP_NET_RAW`.
const CAP_NET_RAW_BIT: u32 = 13;

fn duration_us(d: Duration) -> c_int {
    c_int::try_from(d.as_micros()).unwrap_or(c_int::MAX)
}

fn to_soem_state(state: NetworkState) -> soem::EtherCatState {
    match state {
        NetworkState::Init => soem::EtherCatState::Init,
        NetworkState::PreOp => soem::EtherCatState::PreOp,
        NetworkState::SafeOp => soem::EtherCatState::SafeOp,
        NetworkState::Op => soem::EtherCatState::Op,
        NetworkState::Bootstrap => soem::EtherCatState::Boot,
    }
}

fn from_soem_state(state: soem::EtherCatState) -> Option<NetworkState> {
    match state {
        soem::EtherCatState::Init => Some(NetworkState::Init),
        soem::EtherCatState::PreOp => Some(NetworkState::PreOp),
        soem::EtherCatState::SafeOp => Some(NetworkState::SafeOp),
        soem::EtherCatState::Op => Some(NetworkState::Op),
        soem::EtherCatState::Boot => Some(NetworkState::Bootstrap),
        _ => None,
    }
}

fn first_error<E: std::fmt::Debug>(
    what: &str,
    mut errors: impl Iterator<Item = E>,
) -> EcatError {
    match errors.next() {
        Some(e) => EcatError::Fieldbus(format!("{what}: {e:?}")),
        None => EcatError::Fieldbus(format!("{what}: unknown error")),
    }
}

/// Master stack on top of SOEM.
pub struct SoemMaster {
    interface: String,
    port: soem::Port,
    soem_slaves: Vec<soem::Slave>,
    slave_count: c_int,
    groups: Vec<soem::Group>,
    esibuf: Vec<soem::ESIBuf>,
    esimap: Vec<soem::ESIMap>,
    elist: Vec<soem::ERing>,
    idxstack: Vec<soem::IdxStack>,
    ecaterror: Vec<soem::Boolean>,
    dc_time: i64,
    sm_commtype: Vec<soem::SMCommType>,
    pdo_assign: Vec<soem::PDOAssign>,
    pdo_desc: Vec<soem::PDODesc>,
    eep_sm: Vec<soem::EEPROMSM>,
    eep_fmmu: Vec<soem::EEPROMFMMU>,
    io_map: Box<[u8; IO_MAP_SIZE]>,
    slaves: Vec<Slave>,
    expected_wkc: u16,
    dc_enabled: bool,
    opened: bool,
}

// The SOEM buffers are only touched through `&mut self`, and the session
// keeps the master behind a mutex.
#[allow(unsafe_code)]
unsafe impl Send for SoemMaster {}

impl SoemMaster {
    /// Create an unopened master.
    #[must_use]
    pub fn new() -> Self {
        Self {
            interface: String::new(),
            port: soem::Port::default(),
            soem_slaves: vec![soem::Slave::default(); MAX_SLAVES + 1],
            slave_count: 0,
            groups: vec![soem::Group::default(); MAX_GROUPS],
            esibuf: vec![soem::ESIBuf::default(); MAX_SLAVES],
            esimap: vec![soem::ESIMap::default(); MAX_SLAVES],
            elist: vec![soem::ERing::default(); MAX_SLAVES],
            idxstack: vec![soem::IdxStack::default(); MAX_SLAVES],
            ecaterror: vec![soem::Boolean::default(); MAX_SLAVES],
            dc_time: 0,
            sm_commtype: vec![soem::SMCommType::default(); MAX_SLAVES],
            pdo_assign: vec![soem::PDOAssign::default(); MAX_SLAVES],
            pdo_desc: vec![soem::PDODesc::default(); MAX_SLAVES],
            eep_sm: vec![soem::EEPROMSM::default(); MAX_SLAVES],
            eep_fmmu: vec![soem::EEPROMFMMU::default(); MAX_SLAVES],
            io_map: Box::new([0u8; IO_MAP_SIZE]),
            slaves: Vec::new(),
            expected_wkc: 0,
            dc_enabled: false,
            opened: false,
        }
    }

    fn check_interface_exists(interface: &str) -> Result<(), String> {
        let path = format!("/sys/class/net/{interface}");
        if Path::new(&path).exists() {
            Ok(())
        } else {
            Err(format!("interface not found (expected {path})"))
        }
    }

    fn has_cap_net_raw() -> bool {
        let Ok(status) = fs::read_to_string("/proc/self/status") else {
            return false;
        };
        status
            .lines()
            .find_map(|line| line.strip_prefix("CapEff:\t"))
            .and_then(|value| u64::from_str_radix(value.trim(), 16).ok())
            .is_some_and(|bits| bits & (1u64 << CAP_NET_RAW_BIT) != 0)
    }

    fn check_raw_socket_privilege() -> Result<(), String> {
        #[allow(unsafe_code)]
        let is_root = unsafe { libc::geteuid() == 0 };
        if is_root || Self::has_cap_net_raw() {
            Ok(())
        } else {
            Err("raw sockets need CAP_NET_RAW or root".to_string())
        }
    }

    /// Run `f` against a SOEM context borrowing this master's buffers.
    fn with_context<F, T>(&mut self, f: F) -> EcatResult<T>
    where
        F: FnOnce(&mut soem::Context<'_>) -> EcatResult<T>,
    {
        let mut context = soem::Context::new(
            &[&self.interface],
            &mut self.port,
            &mut self.soem_slaves,
            &mut self.slave_count,
            &mut self.groups,
            &mut self.esibuf,
            &mut self.esimap,
            &mut self.elist,
            &mut self.idxstack,
            &mut self.ecaterror,
            &mut self.dc_time,
            &mut self.sm_commtype,
            &mut self.pdo_assign,
            &mut self.pdo_desc,
            &mut self.eep_sm,
            &mut self.eep_fmmu,
        )
        .map_err(|e| EcatError::Fieldbus(format!("SOEM context on {}: {e:?}", self.interface)))?;

        f(&mut context)
    }

    fn refresh_slaves(&mut self) {
        let count = usize::try_from(self.slave_count).unwrap_or(0);
        self.slaves = (1..=count)
            .filter_map(|idx| self.soem_slaves.get(idx).map(|s| (idx, s)))
            .map(|(idx, s)| {
                let position = u16::try_from(idx - 1).unwrap_or(u16::MAX);
                let mut slave = Slave::new(
                    position,
                    s.name().to_string(),
                    SlaveIdentity::new(s.eep_manufacturer(), s.eep_id(), s.eep_revision()),
                );
                slave.dc_supported = s.has_dc();
                match from_soem_state(s.state()) {
                    Some(state) => slave.state = state,
                    None => slave.silent = true,
                }
                slave
            })
            .collect();
    }

    /// Output and input offsets of each slave in the process image.
    fn layout(&self) -> Vec<(usize, usize, usize, usize)> {
        let total_out: usize = self.slaves.iter().map(|s| s.outputs.len()).sum();
        let mut out_offset = 0;
        let mut in_offset = total_out;
        self.slaves
            .iter()
            .map(|s| {
                let entry = (out_offset, s.outputs.len(), in_offset, s.inputs.len());
                out_offset += s.outputs.len();
                in_offset += s.inputs.len();
                entry
            })
            .collect()
    }
}

impl Default for SoemMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterStack for SoemMaster {
    fn open(&mut self, adapter: &str) -> EcatResult<()> {
        let connection = |reason: String| EcatError::Connection {
            adapter: adapter.to_string(),
            reason,
        };
        if adapter.is_empty() {
            return Err(connection("adapter name is empty".into()));
        }
        Self::check_interface_exists(adapter).map_err(connection)?;
        Self::check_raw_socket_privilege().map_err(connection)?;

        self.interface = adapter.to_string();
        self.with_context(|_| Ok(()))
            .map_err(|e| connection(e.to_string()))?;
        self.opened = true;
        info!(interface = %self.interface, "SOEM master opened");
        Ok(())
    }

    fn enumerate_and_initialize(&mut self) -> EcatResult<usize> {
        let count = self.with_context(|ctx| {
            ctx.config_init(false)
                .map_err(|e| EcatError::Fieldbus(format!("slave scan failed: {e:?}")))
        })?;
        self.refresh_slaves();
        for slave in &self.slaves {
            debug!(
                position = slave.position,
                name = %slave.name,
                identity = %slave.identity,
                dc = slave.dc_supported,
                "Discovered slave"
            );
        }
        info!(count, "SOEM enumeration complete");
        Ok(self.slaves.len())
    }

    fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    fn slaves_mut(&mut self) -> &mut [Slave] {
        &mut self.slaves
    }

    fn read_network_state(&mut self) -> EcatResult<NetworkState> {
        let count = u16::try_from(self.slaves.len()).unwrap_or(u16::MAX);
        let states = self.with_context(|ctx| {
            Ok((1..=count)
                .map(|idx| ctx.check_state(idx, soem::EtherCatState::Init, 0))
                .collect::<Vec<_>>())
        })?;
        for (slave, raw) in self.slaves.iter_mut().zip(states) {
            match from_soem_state(raw) {
                Some(state) => {
                    slave.state = state;
                    slave.error_indicated = false;
                    slave.silent = false;
                }
                None => slave.silent = true,
            }
        }
        Ok(self
            .slaves
            .iter()
            .map(|s| s.state)
            .min()
            .unwrap_or(NetworkState::Init))
    }

    fn request_network_state(&mut self, state: NetworkState) -> EcatResult<u16> {
        let soem_state = to_soem_state(state);
        debug!(%state, "Requesting network state");
        self.with_context(|ctx| {
            ctx.set_state(soem_state, 0);
            ctx.write_state(0)
                .map(|_| ())
                .map_err(|e| EcatError::Fieldbus(format!("state write {state} failed: {e:?}")))
        })?;
        Ok(u16::try_from(self.slaves.len()).unwrap_or(u16::MAX))
    }

    fn request_slave_state(
        &mut self,
        position: u16,
        state: NetworkState,
        acknowledge: bool,
    ) -> EcatResult<()> {
        let soem_state = to_soem_state(state);
        let idx = position + 1;
        if acknowledge {
            // The wrapper exposes no acknowledge bit; a fresh request clears
            // the error indicator on compliant slaves.
            debug!(slave = position, "Acknowledging by re-request");
        }
        self.with_context(|ctx| {
            ctx.set_state(soem_state, idx);
            ctx.write_state(idx).map(|_| ()).map_err(|e| {
                EcatError::Fieldbus(format!("state write {state} to slave {position} failed: {e:?}"))
            })
        })
    }

    fn wait_for_state(&mut self, state: NetworkState, timeout: Duration) -> EcatResult<NetworkState> {
        let soem_state = to_soem_state(state);
        let timeout_us = duration_us(timeout);
        self.with_context(|ctx| {
            ctx.check_state(0, soem_state, timeout_us);
            Ok(())
        })?;
        self.read_network_state()
    }

    fn apply_process_data_map(&mut self) -> EcatResult<usize> {
        let io_map: &mut [u8; IO_MAP_SIZE] = &mut self.io_map;
        let io_map: *mut [u8; IO_MAP_SIZE] = io_map;
        let expected_wkc = self.with_context(|ctx| {
            // SAFETY: io_map is boxed, owned by this master and outlives the context.
            #[allow(unsafe_code)]
            let io_map = unsafe { &mut *io_map };
            ctx.config_map_group(io_map, 0)
                .map_err(|errors| first_error("process data map failed", errors))?;
            Ok(ctx.groups()[0].expected_wkc())
        })?;
        self.expected_wkc = expected_wkc;

        let sizes: Vec<(usize, usize)> = self
            .soem_slaves
            .iter()
            .skip(1)
            .take(self.slaves.len())
            .map(|s| (s.output_size() as usize, s.input_size() as usize))
            .collect();
        let mut total = 0;
        for (slave, (outputs, inputs)) in self.slaves.iter_mut().zip(sizes) {
            slave.outputs = vec![0; outputs];
            slave.inputs = vec![0; inputs];
            total += outputs + inputs;
        }
        if total > IO_MAP_SIZE {
            return Err(EcatError::MappingRejected(format!(
                "process image of {total} bytes exceeds {IO_MAP_SIZE}"
            )));
        }
        info!(io_bytes = total, expected_wkc, "Process data mapped");
        Ok(total)
    }

    fn expected_wkc(&self) -> u16 {
        self.expected_wkc
    }

    fn enable_distributed_clock(&mut self) -> EcatResult<bool> {
        self.dc_enabled = self.with_context(|ctx| {
            ctx.config_dc()
                .map_err(|errors| first_error("DC configuration failed", errors))
        })?;
        Ok(self.dc_enabled)
    }

    fn arm_slave_sync(
        &mut self,
        position: u16,
        period: Duration,
        phase_shift: Duration,
    ) -> EcatResult<()> {
        let cycle_ns = u32::try_from(period.as_nanos()).unwrap_or(u32::MAX);
        self.write_object(position, objects::SM2_SYNC_TYPE, &2u16.to_le_bytes())?;
        self.write_object(position, objects::SM2_CYCLE_TIME, &cycle_ns.to_le_bytes())?;
        debug!(slave = position, cycle_ns, shift = ?phase_shift, "SYNC0 parameters written");
        Ok(())
    }

    fn dc_time(&self) -> Option<i64> {
        self.dc_enabled.then_some(self.dc_time)
    }

    fn send_output_frame(&mut self) -> EcatResult<()> {
        for ((offset, len, _, _), slave) in self.layout().into_iter().zip(&self.slaves) {
            if let Some(dst) = self.io_map.get_mut(offset..offset + len) {
                dst.copy_from_slice(&slave.outputs);
            }
        }
        self.with_context(|ctx| {
            ctx.send_processdata();
            Ok(())
        })
    }

    fn receive_input_frame(&mut self, timeout: Duration) -> EcatResult<i32> {
        let timeout_us = duration_us(timeout);
        let wkc = self.with_context(|ctx| Ok(ctx.receive_processdata(timeout_us)))?;
        if wkc == 0 {
            trace!(wkc, "No process data returned");
            return Ok(WKC_NO_FRAME);
        }
        let layout = self.layout();
        for ((_, _, offset, len), slave) in layout.into_iter().zip(self.slaves.iter_mut()) {
            if let Some(src) = self.io_map.get(offset..offset + len) {
                slave.inputs.copy_from_slice(src);
            }
        }
        Ok(i32::from(wkc))
    }

    fn read_object(&mut self, slave: u16, address: SdoAddress, len: usize) -> EcatResult<Vec<u8>> {
        let idx = slave + 1;
        let abort = |reason: String| EcatError::ObjectAccess {
            slave,
            index: address.index,
            subindex: address.subindex,
            reason,
        };
        self.with_context(|ctx| {
            let bytes = match len {
                1 => ctx
                    .read_sdo::<u8>(idx, address.index, address.subindex, SDO_TIMEOUT_US)
                    .map(|v| vec![v]),
                2 => ctx
                    .read_sdo::<u16>(idx, address.index, address.subindex, SDO_TIMEOUT_US)
                    .map(|v| v.to_le_bytes().to_vec()),
                4 => ctx
                    .read_sdo::<u32>(idx, address.index, address.subindex, SDO_TIMEOUT_US)
                    .map(|v| v.to_le_bytes().to_vec()),
                other => return Err(abort(format!("unsupported read length {other}"))),
            };
            bytes.map_err(|e| abort(format!("{e:?}")))
        })
    }

    fn write_object(&mut self, slave: u16, address: SdoAddress, data: &[u8]) -> EcatResult<()> {
        let idx = slave + 1;
        let abort = |reason: String| EcatError::ObjectAccess {
            slave,
            index: address.index,
            subindex: address.subindex,
            reason,
        };
        trace!(slave, %address, len = data.len(), "Object write");
        self.with_context(|ctx| {
            let written = match *data {
                [a] => ctx.write_sdo(idx, address.index, address.subindex, &a, SDO_TIMEOUT_US),
                [a, b] => {
                    let value = u16::from_le_bytes([a, b]);
                    ctx.write_sdo(idx, address.index, address.subindex, &value, SDO_TIMEOUT_US)
                }
                [a, b, c, d] => {
                    let value = u32::from_le_bytes([a, b, c, d]);
                    ctx.write_sdo(idx, address.index, address.subindex, &value, SDO_TIMEOUT_US)
                }
                _ => return Err(abort(format!("unsupported write length {}", data.len()))),
            };
            written.map_err(|errors| abort(format!("{:?}", first_error("write", errors))))
        })
    }

    fn close(&mut self) -> EcatResult<()> {
        if !self.opened {
            return Ok(());
        }
        info!(interface = %self.interface, "Closing SOEM master");
        self.opened = false;
        self.dc_enabled = false;
        self.expected_wkc = 0;
        self.slave_count = 0;
        self.slaves.clear();
        Ok(())
    }
}

impl std::fmt::Debug for SoemMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoemMaster")
            .field("interface", &self.interface)
            .field("opened", &self.opened)
            .field("slave_count", &self.slave_count)
            .field("expected_wkc", &self.expected_wkc)
            .finish_non_exhaustive()
    }
}
