//! Shared session state.
//!
//! One [`SessionContext`] exists per network session. It owns the master
//! stack together with the semantic output/input shadows of every drive,
//! all behind a single mutex. The cyclic worker holds the lock for one
//! receive/encode/send; the foreground only for a field update or a read.

use crossbeam_utils::CachePadded;
use ecat_fieldbus::frame::{InputFrame, OutputFrame};
use ecat_fieldbus::master::{MasterStack, WKC_NO_FRAME};
use ecat_fieldbus::wkc::{WkcClass, WkcStats, WorkingCounterMonitor};
use ecat_common::error::EcatResult;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Semantic process data of one drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveChannel {
    /// Bus position of the slave this channel feeds.
    pub slave: u16,
    /// Fields encoded into the output buffer every tick.
    pub output: OutputFrame,
    /// Latest decoded inputs; `None` until a frame has returned.
    pub input: Option<InputFrame>,
}

/// Everything guarded by the session lock.
pub struct Bus {
    /// Master stack; only the worker touches process buffers once it runs.
    pub master: Box<dyn MasterStack>,
    /// One channel per slave, in the master's slave order.
    pub drives: Vec<DriveChannel>,
    /// Working counter classification for every exchange.
    pub monitor: WorkingCounterMonitor,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("slaves", &self.master.slaves().len())
            .field("drives", &self.drives)
            .field("monitor", &self.monitor.snapshot())
            .finish()
    }
}

impl Bus {
    /// Size the channel list to the enumerated slaves, every channel
    /// starting from `initial`.
    pub fn reset_channels(&mut self, initial: OutputFrame) {
        self.drives = self
            .master
            .slaves()
            .iter()
            .map(|slave| DriveChannel {
                slave: slave.position,
                output: initial,
                input: None,
            })
            .collect();
    }

    /// One process data exchange: receive, classify, decode, encode, send.
    ///
    /// Inputs are refreshed only when a frame came back. Drives whose
    /// output buffer is too small for the frame are skipped.
    ///
    /// # Errors
    ///
    /// Propagates master stack failures from receive or send.
    pub fn exchange(&mut self, receive_timeout: Duration) -> EcatResult<WkcClass> {
        let Bus {
            master,
            drives,
            monitor,
        } = self;

        let wkc = master.receive_input_frame(receive_timeout)?;
        let class = monitor.observe(wkc, master.expected_wkc());

        let slaves = master.slaves_mut();
        if wkc != WKC_NO_FRAME {
            for (slave, channel) in slaves.iter().zip(drives.iter_mut()) {
                if let Some(input) = InputFrame::decode(&slave.inputs) {
                    channel.input = Some(input);
                }
            }
        }
        for (slave, channel) in slaves.iter_mut().zip(drives.iter()) {
            channel.output.encode_into(&mut slave.outputs);
        }

        master.send_output_frame()?;
        trace!(wkc, ?class, "Process data exchanged");
        Ok(class)
    }

    /// Encode the current outputs and send without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Propagates master stack send failures.
    pub fn prime(&mut self) -> EcatResult<()> {
        let Bus { master, drives, .. } = self;
        for (slave, channel) in master.slaves_mut().iter_mut().zip(drives.iter()) {
            channel.output.encode_into(&mut slave.outputs);
        }
        master.send_output_frame()
    }
}

/// Session-scoped shared state handed to the worker and the sequencer.
#[derive(Debug)]
pub struct SessionContext {
    bus: Mutex<Bus>,
    cycles: CachePadded<AtomicU64>,
    worker_claimed: AtomicBool,
}

impl SessionContext {
    /// Wrap a master stack. Channels are sized after enumeration.
    pub fn new(master: Box<dyn MasterStack>, monitor: WorkingCounterMonitor) -> Arc<Self> {
        Arc::new(Self {
            bus: Mutex::new(Bus {
                master,
                drives: Vec::new(),
                monitor,
            }),
            cycles: CachePadded::new(AtomicU64::new(0)),
            worker_claimed: AtomicBool::new(false),
        })
    }

    /// Acquire the session lock.
    ///
    /// A panic while holding the lock does not stop the exchange; the
    /// guard is recovered from the poisoned mutex.
    pub fn lock(&self) -> MutexGuard<'_, Bus> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completed worker ticks.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    pub(crate) fn count_cycle(&self) -> u64 {
        self.cycles.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Claim the single worker slot. Returns false when a worker is active.
    pub(crate) fn claim_worker(&self) -> bool {
        self.worker_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_worker(&self) {
        self.worker_claimed.store(false, Ordering::Release);
    }

    /// True while a worker thread holds the slot.
    #[must_use]
    pub fn worker_active(&self) -> bool {
        self.worker_claimed.load(Ordering::Acquire)
    }

    /// Replace the output fields of one drive.
    pub fn set_output(&self, slave: usize, output: OutputFrame) {
        if let Some(channel) = self.lock().drives.get_mut(slave) {
            channel.output = output;
        }
    }

    /// Replace the output fields of every drive.
    pub fn set_all_outputs(&self, output: OutputFrame) {
        for channel in &mut self.lock().drives {
            channel.output = output;
        }
    }

    /// Replace output fields drive by drive in one critical section.
    pub fn set_outputs(&self, outputs: &[OutputFrame]) {
        let mut bus = self.lock();
        for (channel, output) in bus.drives.iter_mut().zip(outputs) {
            channel.output = *output;
        }
    }

    /// Latest inputs of the drive in channel `index`.
    #[must_use]
    pub fn input(&self, index: usize) -> Option<InputFrame> {
        self.lock().drives.get(index).and_then(|c| c.input)
    }

    /// Copy of every drive channel.
    #[must_use]
    pub fn channels(&self) -> Vec<DriveChannel> {
        self.lock().drives.clone()
    }

    /// Working counter snapshot.
    #[must_use]
    pub fn wkc_stats(&self) -> WkcStats {
        self.lock().monitor.snapshot()
    }

    /// Operator reset of the working counter totals.
    pub fn reset_wkc(&self) {
        self.lock().monitor.reset();
    }
}
