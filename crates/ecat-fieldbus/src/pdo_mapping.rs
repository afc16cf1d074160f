//! Process data mapping configuration.
//!
//! Programs one receive map and one transmit map into a slave's object
//! dictionary and assigns them to their sync managers. Every write is
//! attempted independently; the outcome of each one is collected into a
//! [`MappingReport`] and a policy function decides whether the slave is
//! usable.
//!
//! Write order per slave:
//! 1. receive map: count = 0, entries 1..N, count = N
//! 2. SM2 assignment: count = 0, sub 1 = map index, count = 1
//! 3. transmit map, then SM3 assignment, in the same pattern
//! 4. torque limits (0x60E0 / 0x60E1) = 0

use crate::master::{MasterStack, ObjectAccess};
use crate::slave::{objects, PdoMap, PdoMapEntry, SdoAddress};
use ecat_common::error::{EcatError, EcatResult};
use std::fmt;
use tracing::{debug, info, warn};

/// What a single mapping write does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Zero the entry count of a mapping object.
    ClearMap,
    /// Write one packed entry descriptor.
    MapEntry,
    /// Publish the entry count of a mapping object.
    MapCount,
    /// Zero a sync manager assignment.
    ClearAssignment,
    /// Write the assigned mapping object index.
    AssignEntry,
    /// Publish the assignment count.
    AssignCount,
    /// Static torque limit.
    TorqueLimit,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ClearMap => "clear map",
            Self::MapEntry => "map entry",
            Self::MapCount => "map count",
            Self::ClearAssignment => "clear assignment",
            Self::AssignEntry => "assign entry",
            Self::AssignCount => "assign count",
            Self::TorqueLimit => "torque limit",
        };
        write!(f, "{name}")
    }
}

/// Result of one object write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Written object.
    pub address: SdoAddress,
    /// Purpose of the write.
    pub kind: WriteKind,
    /// Whether a failure of this write makes the mapping unusable.
    pub mandatory: bool,
    /// Write result.
    pub result: EcatResult<()>,
}

impl WriteOutcome {
    /// Whether the write succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Decides whether a slave's mapping is usable.
pub type MappingPolicy = fn(&MappingReport) -> bool;

/// Default policy: every mandatory write succeeded.
#[must_use]
pub fn mandatory_writes_succeeded(report: &MappingReport) -> bool {
    report.outcomes.iter().all(|o| !o.mandatory || o.succeeded())
}

/// Strict policy: every write succeeded.
#[must_use]
pub fn all_writes_succeeded(report: &MappingReport) -> bool {
    report.outcomes.iter().all(WriteOutcome::succeeded)
}

/// Per-slave collection of write outcomes.
#[derive(Debug, Clone)]
pub struct MappingReport {
    /// Slave position.
    pub slave: u16,
    /// Outcomes in write order.
    pub outcomes: Vec<WriteOutcome>,
    policy: MappingPolicy,
}

impl MappingReport {
    fn new(slave: u16, policy: MappingPolicy) -> Self {
        Self {
            slave,
            outcomes: Vec::new(),
            policy,
        }
    }

    /// Outcomes that failed.
    pub fn failures(&self) -> impl Iterator<Item = &WriteOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    /// Number of failed writes.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.failures().count()
    }

    /// Apply the configured policy.
    #[must_use]
    pub fn policy_ok(&self) -> bool {
        (self.policy)(self)
    }

    /// Convert into an error when the policy rejects the report.
    ///
    /// # Errors
    ///
    /// Returns [`EcatError::MappingRejected`] listing the failed writes.
    pub fn into_result(self) -> EcatResult<Self> {
        if self.policy_ok() {
            return Ok(self);
        }
        let failed = self
            .failures()
            .map(|o| format!("{} {}", o.kind, o.address))
            .collect::<Vec<_>>()
            .join(", ");
        Err(EcatError::MappingRejected(format!(
            "slave {}: {} failed write(s): {failed}",
            self.slave,
            self.error_count()
        )))
    }
}

/// Writes PDO maps and sync manager assignments.
#[derive(Debug, Clone)]
pub struct PdoMappingConfigurer {
    rx: PdoMap,
    tx: PdoMap,
    torque_limits: bool,
    policy: MappingPolicy,
}

impl Default for PdoMappingConfigurer {
    fn default() -> Self {
        Self::new()
    }
}

impl PdoMappingConfigurer {
    /// Configurer for the fixed CST maps.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rx: PdoMap::rx_cst(),
            tx: PdoMap::tx_cst(),
            torque_limits: true,
            policy: mandatory_writes_succeeded,
        }
    }

    /// Use custom maps.
    #[must_use]
    pub fn with_maps(mut self, rx: PdoMap, tx: PdoMap) -> Self {
        self.rx = rx;
        self.tx = tx;
        self
    }

    /// Replace the acceptance policy.
    #[must_use]
    pub fn with_policy(mut self, policy: MappingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Skip the torque limit writes.
    #[must_use]
    pub fn without_torque_limits(mut self) -> Self {
        self.torque_limits = false;
        self
    }

    /// Receive map.
    #[must_use]
    pub fn rx_map(&self) -> &PdoMap {
        &self.rx
    }

    /// Transmit map.
    #[must_use]
    pub fn tx_map(&self) -> &PdoMap {
        &self.tx
    }

    /// Program both maps, their assignments and the torque limits on one slave.
    pub fn configure<M: MasterStack + ?Sized>(&self, master: &mut M, slave: u16) -> MappingReport {
        let mut report = MappingReport::new(slave, self.policy);

        for map in [&self.rx, &self.tx] {
            write_map(master, slave, map, &mut report);
            write_assignment(master, slave, map, &mut report);
        }

        if self.torque_limits {
            for address in [objects::POSITIVE_TORQUE_LIMIT, objects::NEGATIVE_TORQUE_LIMIT] {
                let result = master.write_i16(slave, address, 0);
                record(&mut report, address, WriteKind::TorqueLimit, false, result);
            }
        }

        if report.error_count() == 0 {
            info!(slave, writes = report.outcomes.len(), "PDO mapping configured");
        } else {
            warn!(
                slave,
                failed = report.error_count(),
                accepted = report.policy_ok(),
                "PDO mapping configured with failures"
            );
        }
        report
    }

    /// Configure every enumerated slave.
    ///
    /// # Errors
    ///
    /// Returns [`EcatError::MappingRejected`] for the first slave whose
    /// report fails the policy. All slaves are still written.
    pub fn configure_all<M: MasterStack + ?Sized>(
        &self,
        master: &mut M,
    ) -> EcatResult<Vec<MappingReport>> {
        let positions: Vec<u16> = master.slaves().iter().map(|s| s.position).collect();
        let reports: Vec<MappingReport> = positions
            .into_iter()
            .map(|slave| self.configure(master, slave))
            .collect();

        if let Some(rejected) = reports.iter().find(|r| !r.policy_ok()) {
            rejected.clone().into_result()?;
        }
        Ok(reports)
    }

    /// Read a map back from a slave.
    ///
    /// # Errors
    ///
    /// Propagates object access failures.
    pub fn read_back<M: MasterStack + ?Sized>(
        master: &mut M,
        slave: u16,
        map_index: u16,
    ) -> EcatResult<Vec<PdoMapEntry>> {
        let count = master.read_u8(slave, SdoAddress::new(map_index, 0))?;
        (1..=count)
            .map(|sub| {
                let raw = master.read_object(slave, SdoAddress::new(map_index, sub), 4)?;
                let mut bytes = [0u8; 4];
                for (dst, src) in bytes.iter_mut().zip(&raw) {
                    *dst = *src;
                }
                Ok(PdoMapEntry::from_packed(u32::from_le_bytes(bytes)))
            })
            .collect()
    }
}

/// Zero both sync manager assignments so the next initialization falls
/// back to the device's default mapping.
///
/// # Errors
///
/// Returns the first failed write; both writes are attempted.
pub fn clear_assignments<M: MasterStack + ?Sized>(master: &mut M, slave: u16) -> EcatResult<()> {
    let sm2 = master.write_u8(slave, SdoAddress::new(objects::SM2_ASSIGN, 0), 0);
    let sm3 = master.write_u8(slave, SdoAddress::new(objects::SM3_ASSIGN, 0), 0);
    debug!(slave, sm2_ok = sm2.is_ok(), sm3_ok = sm3.is_ok(), "Cleared PDO assignments");
    sm2.and(sm3)
}

fn record(
    report: &mut MappingReport,
    address: SdoAddress,
    kind: WriteKind,
    mandatory: bool,
    result: EcatResult<()>,
) {
    match &result {
        Ok(()) => debug!(slave = report.slave, %address, %kind, "Object write ok"),
        Err(e) if mandatory => warn!(slave = report.slave, %address, %kind, error = %e, "Mandatory object write failed"),
        Err(e) => debug!(slave = report.slave, %address, %kind, error = %e, "Optional object write failed"),
    }
    report.outcomes.push(WriteOutcome {
        address,
        kind,
        mandatory,
        result,
    });
}

fn write_map<M: MasterStack + ?Sized>(
    master: &mut M,
    slave: u16,
    map: &PdoMap,
    report: &mut MappingReport,
) {
    let count_address = SdoAddress::new(map.index, 0);
    let result = master.write_u8(slave, count_address, 0);
    record(report, count_address, WriteKind::ClearMap, false, result);

    for (sub, entry) in (1u8..).zip(&map.entries) {
        let address = SdoAddress::new(map.index, sub);
        let result = master.write_u32(slave, address, entry.packed());
        record(report, address, WriteKind::MapEntry, true, result);
    }

    let count = u8::try_from(map.entries.len()).unwrap_or(u8::MAX);
    let result = master.write_u8(slave, count_address, count);
    record(report, count_address, WriteKind::MapCount, true, result);
}

fn write_assignment<M: MasterStack + ?Sized>(
    master: &mut M,
    slave: u16,
    map: &PdoMap,
    report: &mut MappingReport,
) {
    let count_address = SdoAddress::new(map.assignment, 0);
    let result = master.write_u8(slave, count_address, 0);
    record(report, count_address, WriteKind::ClearAssignment, false, result);

    let entry_address = count_address.sub(1);
    let result = master.write_u16(slave, entry_address, map.index);
    record(report, entry_address, WriteKind::AssignEntry, true, result);

    let result = master.write_u8(slave, count_address, 1);
    record(report, count_address, WriteKind::AssignCount, true, result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedMaster;

    fn preop_sim() -> SimulatedMaster {
        let mut sim = SimulatedMaster::new(1);
        sim.open("sim0").unwrap();
        sim.enumerate_and_initialize().unwrap();
        sim
    }

    #[test]
    fn test_write_order() {
        let mut sim = preop_sim();
        let probe = sim.probe();
        let report = PdoMappingConfigurer::new().configure(&mut sim, 0);
        assert!(report.policy_ok());
        assert_eq!(report.outcomes.len(), 2 * (1 + 4 + 1 + 3) + 2);

        let writes: Vec<(u16, u8, Vec<u8>)> = probe
            .lock()
            .object_writes
            .iter()
            .map(|w| (w.address.index, w.address.subindex, w.data.clone()))
            .collect();
        assert_eq!(writes[0], (0x1600, 0, vec![0]));
        assert_eq!(writes[1], (0x1600, 1, vec![0x10, 0x00, 0x40, 0x60]));
        assert_eq!(writes[5], (0x1600, 0, vec![4]));
        assert_eq!(writes[6], (0x1C12, 0, vec![0]));
        assert_eq!(writes[7], (0x1C12, 1, vec![0x00, 0x16]));
        assert_eq!(writes[8], (0x1C12, 0, vec![1]));
        assert_eq!(writes[9], (0x1A00, 0, vec![0]));
        assert_eq!(writes[17], (0x1C13, 0, vec![1]));
        assert_eq!(writes[18].0, 0x60E0);
    }

    #[test]
    fn test_map_round_trip() {
        let mut sim = preop_sim();
        let custom = PdoMap {
            index: 0x1600,
            assignment: 0x1C12,
            entries: vec![
                PdoMapEntry::new(0x6040, 0, 16),
                PdoMapEntry::new(0x607A, 0, 32),
                PdoMapEntry::new(0x60B2, 0, 16),
            ],
        };
        let configurer = PdoMappingConfigurer::new().with_maps(custom.clone(), PdoMap::tx_cst());
        let report = configurer.configure(&mut sim, 0);
        assert!(report.policy_ok());

        let read = PdoMappingConfigurer::read_back(&mut sim, 0, 0x1600).unwrap();
        assert_eq!(read, custom.entries);
    }

    #[test]
    fn test_optional_failure_is_tolerated() {
        let mut sim = preop_sim().reject_object(0, objects::POSITIVE_TORQUE_LIMIT);
        let report = PdoMappingConfigurer::new().configure(&mut sim, 0);
        assert_eq!(report.error_count(), 1);
        assert!(report.policy_ok());
        assert!(report.clone().into_result().is_ok());

        let strict = PdoMappingConfigurer::new()
            .with_policy(all_writes_succeeded)
            .configure(&mut sim, 0);
        assert!(!strict.policy_ok());
    }

    #[test]
    fn test_mandatory_failure_continues_and_rejects() {
        let mut sim = preop_sim().reject_object(0, SdoAddress::new(0x1600, 2));
        let report = PdoMappingConfigurer::new().configure(&mut sim, 0);

        // the remaining writes are still attempted
        assert_eq!(report.outcomes.len(), 20);
        assert_eq!(report.error_count(), 1);
        assert!(!report.policy_ok());
        let err = report.into_result().unwrap_err();
        assert!(matches!(err, EcatError::MappingRejected(_)));
        assert!(err.to_string().contains("map entry 0x1600:2"));
    }

    #[test]
    fn test_clear_assignments() {
        let mut sim = preop_sim();
        clear_assignments(&mut sim, 0).unwrap();
        assert_eq!(sim.read_u8(0, SdoAddress::new(0x1C12, 0)).unwrap(), 0);
        assert_eq!(sim.read_u8(0, SdoAddress::new(0x1C13, 0)).unwrap(), 0);
    }
}
