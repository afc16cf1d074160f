//! CiA-402 enable sequence for cyclic synchronous torque drives.
//!
//! The sequence is time based. Each state holds for a dwell configured
//! as a duration and converted to ticks once, at state entry:
//!
//! | State           | Control word | Torque   |
//! |-----------------|--------------|----------|
//! | FaultReset      | 0x0080       | 0        |
//! | Shutdown        | 0x0006       | 0        |
//! | SwitchOn        | 0x0007       | 0        |
//! | EnableOperation | 0x000F       | 0        |
//! | Running         | 0x000F       | setpoint |
//!
//! The status word is observed, not obeyed: a cleared fault bit during
//! FaultReset is recorded but does not shorten the dwell.

use crate::context::SessionContext;
use ecat_common::config::DriveConfig;
use ecat_common::error::EcatResult;
use ecat_common::time::CycleClock;
use ecat_fieldbus::frame::{ControlWord, InputFrame, OutputFrame, StatusWord};
use ecat_fieldbus::master::ObjectAccess;
use ecat_fieldbus::slave::{objects, SdoAddress};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Stage of the enable sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DriveControlState {
    /// Acknowledge latched faults.
    FaultReset,
    /// Ready to switch on.
    Shutdown,
    /// Switched on, power stage not yet enabled.
    SwitchOn,
    /// Operation enabled at zero torque.
    EnableOperation,
    /// Operation enabled with the torque setpoint.
    Running,
}

impl DriveControlState {
    /// Control word sent while in this state.
    #[must_use]
    pub fn control_word(self) -> u16 {
        match self {
            Self::FaultReset => ControlWord::FAULT_RESET,
            Self::Shutdown => ControlWord::SHUTDOWN,
            Self::SwitchOn => ControlWord::SWITCH_ON,
            Self::EnableOperation | Self::Running => ControlWord::ENABLE_OPERATION,
        }
    }

    fn next(self) -> Self {
        match self {
            Self::FaultReset => Self::Shutdown,
            Self::Shutdown => Self::SwitchOn,
            Self::SwitchOn => Self::EnableOperation,
            Self::EnableOperation | Self::Running => Self::Running,
        }
    }
}

impl fmt::Display for DriveControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FaultReset => "FAULT_RESET",
            Self::Shutdown => "SHUTDOWN",
            Self::SwitchOn => "SWITCH_ON",
            Self::EnableOperation => "ENABLE_OPERATION",
            Self::Running => "RUNNING",
        };
        write!(f, "{name}")
    }
}

/// Dwell of each timed state, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveTimings {
    /// FaultReset dwell.
    pub fault_reset: u64,
    /// Shutdown dwell.
    pub shutdown: u64,
    /// SwitchOn dwell.
    pub switch_on: u64,
    /// EnableOperation dwell.
    pub enable: u64,
}

impl DriveTimings {
    /// Convert the configured durations; a non-critical fault halves FaultReset.
    #[must_use]
    pub fn new(clock: &CycleClock, config: &DriveConfig, non_critical_fault: bool) -> Self {
        let fault_reset = clock.ticks_for(config.fault_reset);
        Self {
            fault_reset: if non_critical_fault {
                fault_reset / 2
            } else {
                fault_reset
            },
            shutdown: clock.ticks_for(config.shutdown_hold),
            switch_on: clock.ticks_for(config.switch_on_hold),
            enable: clock.ticks_for(config.enable_hold),
        }
    }

    /// Ticks spent before Running.
    #[must_use]
    pub fn until_running(&self) -> u64 {
        self.fault_reset + self.shutdown + self.switch_on + self.enable
    }

    fn dwell(&self, state: DriveControlState) -> Option<u64> {
        match state {
            DriveControlState::FaultReset => Some(self.fault_reset),
            DriveControlState::Shutdown => Some(self.shutdown),
            DriveControlState::SwitchOn => Some(self.switch_on),
            DriveControlState::EnableOperation => Some(self.enable),
            DriveControlState::Running => None,
        }
    }
}

/// Enable sequence of one drive.
///
/// Pure: [`tick`](Self::tick) consumes the latest status word and returns
/// the frame to send, without touching the session.
#[derive(Debug, Clone)]
pub struct DriveStateMachine {
    state: DriveControlState,
    ticks_remaining: u64,
    timings: DriveTimings,
    torque_setpoint: i16,
    mode: i8,
    step: u64,
    non_critical_fault: bool,
    fault_cleared: bool,
    output: OutputFrame,
}

impl DriveStateMachine {
    /// Start in FaultReset.
    #[must_use]
    pub fn new(clock: &CycleClock, config: &DriveConfig, non_critical_fault: bool) -> Self {
        let timings = DriveTimings::new(clock, config, non_critical_fault);
        let mut machine = Self {
            state: DriveControlState::FaultReset,
            ticks_remaining: timings.fault_reset,
            timings,
            torque_setpoint: config.torque_setpoint,
            mode: config.mode,
            step: 0,
            non_critical_fault,
            fault_cleared: false,
            output: OutputFrame::default(),
        };
        machine.skip_empty_states();
        machine.output = machine.frame();
        machine
    }

    /// Frame sent before the first tick.
    #[must_use]
    pub fn initial_frame(config: &DriveConfig) -> OutputFrame {
        OutputFrame {
            control_word: ControlWord::FAULT_RESET,
            target_torque: 0,
            mode: config.mode,
            padding: 0,
        }
    }

    /// Advance one tick and return the frame for this tick.
    pub fn tick(&mut self, status: Option<StatusWord>) -> OutputFrame {
        if self.state == DriveControlState::FaultReset {
            self.observe_fault(status);
        }

        self.output = self.frame();
        self.step += 1;

        if self.state != DriveControlState::Running {
            self.ticks_remaining = self.ticks_remaining.saturating_sub(1);
            if self.ticks_remaining == 0 {
                self.enter(self.state.next());
                self.skip_empty_states();
            }
        }
        self.output
    }

    fn observe_fault(&mut self, status: Option<StatusWord>) {
        if self.fault_cleared {
            return;
        }
        let Some(status) = status else {
            return;
        };
        if !status.fault() {
            self.fault_cleared = true;
            info!(step = self.step, status = %status, "Drive fault cleared");
        } else if self.non_critical_fault && self.step > self.timings.fault_reset / 2 {
            self.fault_cleared = true;
            info!(
                step = self.step,
                status = %status,
                "Non-critical fault still latched; continuing enable sequence"
            );
        }
    }

    fn enter(&mut self, state: DriveControlState) {
        debug!(step = self.step, from = %self.state, to = %state, "Drive state change");
        self.state = state;
        self.ticks_remaining = self.timings.dwell(state).unwrap_or(0);
    }

    fn skip_empty_states(&mut self) {
        while self.state != DriveControlState::Running && self.ticks_remaining == 0 {
            self.enter(self.state.next());
        }
    }

    fn frame(&self) -> OutputFrame {
        OutputFrame {
            control_word: self.state.control_word(),
            target_torque: if self.state == DriveControlState::Running {
                self.torque_setpoint
            } else {
                0
            },
            mode: self.mode,
            padding: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DriveControlState {
        self.state
    }

    /// Torque of the last returned frame.
    #[must_use]
    pub fn torque(&self) -> i16 {
        self.output.target_torque
    }

    /// Control word of the last returned frame.
    #[must_use]
    pub fn control_word(&self) -> u16 {
        self.output.control_word
    }

    /// Ticks consumed so far.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Whether the fault was observed cleared (or waived as non-critical).
    #[must_use]
    pub fn fault_cleared(&self) -> bool {
        self.fault_cleared
    }

    /// Dwell table in use.
    #[must_use]
    pub fn timings(&self) -> DriveTimings {
        self.timings
    }
}

/// Latched fault found on a drive before the sequence starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultDiagnosis {
    /// Slave position.
    pub slave: u16,
    /// Status word at diagnosis time.
    pub status_word: u16,
    /// Error code (0x603F) if readable.
    pub error_code: Option<u16>,
    /// Error code is on the non-critical list.
    pub non_critical: bool,
}

/// Read 0x603F for every drive whose last status word shows a fault.
pub fn diagnose_faults(context: &SessionContext, non_critical_codes: &[u16]) -> Vec<FaultDiagnosis> {
    let mut bus = context.lock();
    let faulted: Vec<(u16, StatusWord)> = bus
        .drives
        .iter()
        .zip(bus.master.slaves())
        .filter_map(|(channel, slave)| {
            let status = channel.input?.status_word;
            status.fault().then_some((slave.position, status))
        })
        .collect();

    faulted
        .into_iter()
        .map(|(slave, status)| {
            let error_code = match bus.master.read_u16(slave, objects::ERROR_CODE) {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!(slave, error = %e, "Cannot read error code");
                    None
                }
            };
            let non_critical = error_code.is_some_and(|c| non_critical_codes.contains(&c));
            if non_critical {
                info!(slave, status = %status, error_code = ?error_code.map(|c| format!("{c:#06x}")), "Non-critical drive fault latched");
            } else {
                warn!(slave, status = %status, error_code = ?error_code.map(|c| format!("{c:#06x}")), "Drive fault latched");
            }
            FaultDiagnosis {
                slave,
                status_word: status.0,
                error_code,
                non_critical,
            }
        })
        .collect()
}

/// One mode/limit object write.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeWrite {
    /// Written object.
    pub address: SdoAddress,
    /// Failure makes the drive unusable in CST.
    pub mandatory: bool,
    /// Write result.
    pub result: EcatResult<()>,
}

/// Outcome of mode configuration on one drive.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeReport {
    /// Slave position.
    pub slave: u16,
    /// Writes in order.
    pub writes: Vec<ModeWrite>,
    /// Mode read back from 0x6061.
    pub mode_display: Option<i8>,
    /// Requested mode.
    pub requested_mode: i8,
}

impl ModeReport {
    /// Every mandatory write succeeded.
    #[must_use]
    pub fn policy_ok(&self) -> bool {
        self.writes.iter().all(|w| !w.mandatory || w.result.is_ok())
    }

    /// Readback matched the requested mode.
    #[must_use]
    pub fn mode_confirmed(&self) -> bool {
        self.mode_display == Some(self.requested_mode)
    }
}

/// Writes operation mode and torque limits once slaves are Operational.
#[derive(Debug, Clone)]
pub struct DriveModeConfigurer {
    mode: i8,
    max_torque: i16,
    torque_slope: u32,
}

impl DriveModeConfigurer {
    /// Configurer from the drive section.
    #[must_use]
    pub fn new(config: &DriveConfig) -> Self {
        Self {
            mode: config.mode,
            max_torque: config.max_torque,
            torque_slope: config.torque_slope,
        }
    }

    /// Configure every drive. Each write takes the session lock on its own
    /// so the worker keeps its cadence.
    pub fn configure(&self, context: &SessionContext) -> Vec<ModeReport> {
        let positions: Vec<u16> = context
            .lock()
            .master
            .slaves()
            .iter()
            .map(|s| s.position)
            .collect();
        positions
            .into_iter()
            .map(|slave| self.configure_slave(context, slave))
            .collect()
    }

    fn configure_slave(&self, context: &SessionContext, slave: u16) -> ModeReport {
        let mode_byte = self.mode.to_le_bytes()[0];
        let writes = vec![
            Self::write(context, slave, objects::CONTROL_WORD, true, |m| {
                m.write_u16(slave, objects::CONTROL_WORD, 0)
            }),
            Self::write(context, slave, objects::MODES_OF_OPERATION, true, |m| {
                m.write_u8(slave, objects::MODES_OF_OPERATION, mode_byte)
            }),
            Self::write(context, slave, objects::MAX_TORQUE, true, |m| {
                m.write_i16(slave, objects::MAX_TORQUE, self.max_torque)
            }),
            Self::write(context, slave, objects::TORQUE_SLOPE, false, |m| {
                m.write_u32(slave, objects::TORQUE_SLOPE, self.torque_slope)
            }),
        ];

        let mode_display = match context.lock().master.read_u8(slave, objects::MODES_DISPLAY) {
            Ok(raw) => Some(i8::from_le_bytes([raw])),
            Err(e) => {
                warn!(slave, error = %e, "Cannot read mode display");
                None
            }
        };

        let report = ModeReport {
            slave,
            writes,
            mode_display,
            requested_mode: self.mode,
        };
        if report.mode_confirmed() {
            info!(slave, mode = self.mode, max_torque = self.max_torque, "Drive mode configured");
        } else {
            warn!(slave, requested = self.mode, reported = ?mode_display, "Drive mode readback mismatch");
        }
        report
    }

    fn write<F>(
        context: &SessionContext,
        slave: u16,
        address: SdoAddress,
        mandatory: bool,
        op: F,
    ) -> ModeWrite
    where
        F: FnOnce(&mut dyn ecat_fieldbus::master::MasterStack) -> EcatResult<()>,
    {
        let result = {
            let mut bus = context.lock();
            op(bus.master.as_mut())
        };
        match &result {
            Ok(()) => debug!(slave, %address, "Mode object written"),
            Err(e) if mandatory => warn!(slave, %address, error = %e, "Mode object write failed"),
            Err(e) => debug!(slave, %address, error = %e, "Optional mode object not written"),
        }
        ModeWrite {
            address,
            mandatory,
            result,
        }
    }
}

/// Foreground driver running one [`DriveStateMachine`] per drive.
#[derive(Debug)]
pub struct DriveSequencer {
    context: Arc<SessionContext>,
    clock: CycleClock,
    slaves: Vec<u16>,
    machines: Vec<DriveStateMachine>,
    diagnostics_interval: u64,
    ticks: u64,
}

impl DriveSequencer {
    /// Build one machine per channel; drives listed as non-critical in
    /// `diagnoses` get the halved FaultReset dwell.
    #[must_use]
    pub fn new(
        context: Arc<SessionContext>,
        clock: CycleClock,
        config: &DriveConfig,
        diagnoses: &[FaultDiagnosis],
    ) -> Self {
        let slaves: Vec<u16> = context.channels().iter().map(|c| c.slave).collect();
        let machines = slaves
            .iter()
            .map(|&slave| {
                let non_critical = diagnoses
                    .iter()
                    .any(|d| d.slave == slave && d.non_critical);
                DriveStateMachine::new(&clock, config, non_critical)
            })
            .collect();
        Self {
            context,
            clock,
            slaves,
            machines,
            diagnostics_interval: config.diagnostics_interval.max(1),
            ticks: 0,
        }
    }

    /// One sequencer tick: read status words, evaluate, publish outputs.
    pub fn step(&mut self) {
        let inputs: Vec<Option<InputFrame>> =
            self.context.channels().into_iter().map(|c| c.input).collect();

        let outputs: Vec<OutputFrame> = self
            .machines
            .iter_mut()
            .enumerate()
            .map(|(idx, machine)| {
                let status = inputs.get(idx).copied().flatten().map(|i| i.status_word);
                machine.tick(status)
            })
            .collect();

        self.context.set_outputs(&outputs);
        self.ticks += 1;

        if self.ticks % self.diagnostics_interval == 0 {
            self.log_diagnostics(&outputs, &inputs);
        }
    }

    fn log_diagnostics(&self, outputs: &[OutputFrame], inputs: &[Option<InputFrame>]) {
        for (idx, (output, machine)) in outputs.iter().zip(&self.machines).enumerate() {
            let slave = self.slaves.get(idx).copied().unwrap_or(u16::MAX);
            match inputs.get(idx).copied().flatten() {
                Some(input) => info!(
                    slave,
                    step = machine.step(),
                    state = %machine.state(),
                    tx_cw = format!("{:#06x}", output.control_word),
                    tx_torque = output.target_torque,
                    tx_mode = output.mode,
                    rx_status = %input.status_word,
                    position = input.position,
                    velocity = input.velocity,
                    torque = input.torque,
                    "Drive diagnostics"
                ),
                None => info!(
                    slave,
                    step = machine.step(),
                    state = %machine.state(),
                    tx_cw = format!("{:#06x}", output.control_word),
                    tx_torque = output.target_torque,
                    "Drive diagnostics (no inputs yet)"
                ),
            }
        }
    }

    /// Tick once per period while `keep_going(ticks)` returns true.
    /// Returns the number of ticks run.
    pub fn run_until<F>(&mut self, mut keep_going: F) -> u64
    where
        F: FnMut(u64) -> bool,
    {
        let period = self.clock.period();
        let first = self.ticks;
        let mut deadline = Instant::now();
        while keep_going(self.ticks) {
            self.step();
            deadline += period;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            } else {
                deadline = now;
            }
        }
        self.ticks - first
    }

    /// State machines, one per drive.
    #[must_use]
    pub fn machines(&self) -> &[DriveStateMachine] {
        &self.machines
    }

    /// Bus positions, aligned with [`machines`](Self::machines).
    #[must_use]
    pub fn slaves(&self) -> &[u16] {
        &self.slaves
    }

    /// Ticks run so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// True once every drive is Running.
    #[must_use]
    pub fn all_running(&self) -> bool {
        self.machines
            .iter()
            .all(|m| m.state() == DriveControlState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn run_sequence(machine: &mut DriveStateMachine, ticks: u64) -> Vec<OutputFrame> {
        (0..ticks).map(|_| machine.tick(Some(StatusWord(0x0218)))).collect()
    }

    #[test]
    fn test_two_ms_sequence_counts() {
        let clock = CycleClock::from_millis(2);
        let mut machine = DriveStateMachine::new(&clock, &DriveConfig::default(), false);
        let frames = run_sequence(&mut machine, 4000);

        let count = |cw: u16, torque: i16| {
            frames
                .iter()
                .filter(|f| f.control_word == cw && f.target_torque == torque)
                .count()
        };
        assert_eq!(count(0x0080, 0), 2000);
        assert_eq!(count(0x0006, 0), 500);
        assert_eq!(count(0x0007, 0), 500);
        assert_eq!(count(0x000F, 0), 500);
        assert_eq!(count(0x000F, 50), 500);
        assert!(frames.iter().all(|f| f.mode == 10));
        assert_eq!(machine.state(), DriveControlState::Running);
    }

    #[test]
    fn test_no_torque_before_enable_threshold() {
        let config = DriveConfig::default();
        for period_ms in 1..=10 {
            let clock = CycleClock::from_millis(period_ms);
            let mut machine = DriveStateMachine::new(&clock, &config, false);
            let threshold = machine.timings().until_running();
            for tick in 0..threshold + 10 {
                let frame = machine.tick(None);
                if tick < threshold {
                    assert_eq!(frame.target_torque, 0, "period {period_ms}ms tick {tick}");
                } else {
                    assert_eq!(frame.target_torque, 50);
                }
            }
        }
    }

    #[test]
    fn test_non_critical_halves_fault_reset() {
        let clock = CycleClock::from_millis(2);
        let config = DriveConfig::default();
        let normal = DriveStateMachine::new(&clock, &config, false);
        let halved = DriveStateMachine::new(&clock, &config, true);
        assert_eq!(normal.timings().fault_reset, 2000);
        assert_eq!(halved.timings().fault_reset, 1000);
        assert_eq!(halved.timings().shutdown, 500);
    }

    #[test]
    fn test_early_clear_does_not_shorten_dwell() {
        let clock = CycleClock::from_millis(2);
        let mut machine = DriveStateMachine::new(&clock, &DriveConfig::default(), false);
        machine.tick(Some(StatusWord(0x0250)));
        assert!(machine.fault_cleared());
        for _ in 1..2000 {
            assert_eq!(machine.tick(Some(StatusWord(0x0250))).control_word, 0x0080);
        }
        assert_eq!(machine.state(), DriveControlState::Shutdown);
    }

    #[test]
    fn test_non_critical_fault_waived_after_half_dwell() {
        let clock = CycleClock::from_millis(2);
        let mut machine = DriveStateMachine::new(&clock, &DriveConfig::default(), true);
        let faulted = Some(StatusWord(0x0218));
        for _ in 0..=500 {
            machine.tick(faulted);
        }
        assert!(!machine.fault_cleared());
        machine.tick(faulted);
        assert!(machine.fault_cleared());
    }

    #[test]
    fn test_zero_dwell_states_skipped() {
        let config = DriveConfig {
            fault_reset: Duration::ZERO,
            shutdown_hold: Duration::ZERO,
            switch_on_hold: Duration::from_millis(4),
            enable_hold: Duration::ZERO,
            ..DriveConfig::default()
        };
        let clock = CycleClock::from_millis(2);
        let mut machine = DriveStateMachine::new(&clock, &config, false);
        assert_eq!(machine.state(), DriveControlState::SwitchOn);
        assert_eq!(machine.tick(None).control_word, 0x0007);
        assert_eq!(machine.tick(None).control_word, 0x0007);
        assert_eq!(machine.tick(None).target_torque, 50);
    }

    #[test]
    fn test_initial_frame_is_fault_reset() {
        let frame = DriveStateMachine::initial_frame(&DriveConfig::default());
        assert_eq!(frame.control_word, 0x0080);
        assert_eq!(frame.target_torque, 0);
        assert_eq!(frame.mode, 10);
    }

    #[test]
    fn test_sequencer_keys_drives_by_position() {
        use ecat_fieldbus::master::MasterStack;
        use ecat_fieldbus::simulated::SimulatedMaster;
        use ecat_fieldbus::wkc::WorkingCounterMonitor;

        let mut sim = SimulatedMaster::new(2);
        sim.open("sim0").unwrap();
        sim.enumerate_and_initialize().unwrap();
        let context = SessionContext::new(Box::new(sim), WorkingCounterMonitor::new(0.1, 10));
        {
            let mut bus = context.lock();
            bus.reset_channels(OutputFrame::default());
            bus.drives.reverse();
        }

        let diagnoses = [FaultDiagnosis {
            slave: 0,
            status_word: 0x0218,
            error_code: Some(0x730F),
            non_critical: true,
        }];
        let sequencer = DriveSequencer::new(
            Arc::clone(&context),
            CycleClock::from_millis(2),
            &DriveConfig::default(),
            &diagnoses,
        );
        assert_eq!(sequencer.slaves(), &[1, 0]);
        assert_eq!(sequencer.machines()[0].timings().fault_reset, 2000);
        assert_eq!(sequencer.machines()[1].timings().fault_reset, 1000);
    }
}
