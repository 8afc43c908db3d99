//! Tick-driven harness that joins the device halves.
//!
//! [`Simulation`] owns the disk model, the DMA engine, and both streaming
//! channels, and shares the [`RegisterFile`] with the guest driver. Each
//! call to [`Simulation::tick`] runs one bridge step:
//!
//! 1. advance latency countdowns and post fired completions to the
//!    register file
//! 2. admit requests submitted through REQUEST since the last tick
//! 3. stream write payload from guest memory into the disk model
//! 4. deliver read data from the disk model into guest memory
//! 5. raise the interrupt line once if any completion was posted
//!
//! A request whose guest buffer lies outside guest memory is refused at
//! admission and completes with an I/O error. Any other fault in a step
//! means the register file and the disk model have diverged: the simulation
//! halts and every later tick fails with [`DiskError::Halted`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::backing::{BackingStore, open_store};
use crate::channel::DataChannel;
use crate::config::SimConfig;
use crate::disk::{Admission, DiskModel, DiskStats};
use crate::dma::{DmaEngine, GuestMemory};
use crate::error::{DiskError, Result};
use crate::register_file::RegisterFile;
use crate::request::Completion;

type Handler = Arc<dyn Fn() + Send + Sync>;

/// Level-free interrupt line with registered handlers.
///
/// Cloning yields another handle to the same line.
#[derive(Clone, Default)]
pub struct InterruptLine {
    handlers: Arc<Mutex<Vec<Handler>>>,
    raised: Arc<AtomicU64>,
}

impl fmt::Debug for InterruptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptLine")
            .field("handlers", &self.handler_count())
            .field("raised", &self.raised_count())
            .finish()
    }
}

impl InterruptLine {
    /// Creates a line with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler run on every raise.
    pub fn register<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Runs every registered handler in registration order.
    ///
    /// Handlers run without the line's lock held, so a handler may register
    /// further handlers.
    pub fn raise(&self) {
        self.raised.fetch_add(1, Ordering::AcqRel);
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler();
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Times the line has been raised.
    pub fn raised_count(&self) -> u64 {
        self.raised.load(Ordering::Acquire)
    }
}

/// Outcome of one [`Simulation::tick`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Tick number, starting at 1.
    pub tick: u64,
    /// Completions posted to the register file this tick.
    pub completions: Vec<Completion>,
    /// Whether the interrupt line was raised.
    pub interrupt_raised: bool,
}

/// The simulated device and its bridge loop.
#[derive(Debug)]
pub struct Simulation {
    registers: Arc<RegisterFile>,
    disk: DiskModel,
    dma: DmaEngine,
    inbound: DataChannel,
    outbound: DataChannel,
    interrupts: InterruptLine,
    halted: bool,
}

impl Simulation {
    /// Builds a simulation, opening the backing image named in `config`.
    ///
    /// # Errors
    ///
    /// Returns a config error if `config` is invalid and
    /// [`crate::error::StorageError`] if the image cannot be opened.
    pub fn new(config: &SimConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.disk)?;
        Self::with_store(config, store)
    }

    /// Builds a simulation over an already opened store.
    ///
    /// # Errors
    ///
    /// Returns a config error if `config` is invalid and
    /// [`crate::error::DmaError::Setup`] if guest memory cannot be mapped.
    pub fn with_store(config: &SimConfig, store: Option<Box<dyn BackingStore>>) -> Result<Self> {
        config.validate()?;
        let disk = DiskModel::new(&config.disk, store)?;
        let registers = Arc::new(RegisterFile::new(
            config.disk.ntags,
            disk.nsectors(),
            disk.max_request_length(),
        ));

        tracing::info!(
            nsectors = disk.nsectors(),
            ntags = config.disk.ntags,
            max_request_length = disk.max_request_length(),
            words_per_tick = config.words_per_tick,
            "simulated block device ready"
        );

        Ok(Self {
            registers,
            disk,
            dma: DmaEngine::new(GuestMemory::new(config.guest_memory_bytes)?),
            inbound: DataChannel::new(config.words_per_tick),
            outbound: DataChannel::new(config.words_per_tick),
            interrupts: InterruptLine::new(),
            halted: false,
        })
    }

    /// The device's control region, for binding a driver.
    pub fn registers(&self) -> Arc<RegisterFile> {
        Arc::clone(&self.registers)
    }

    /// Guest memory served by the DMA engine.
    pub fn memory(&self) -> &GuestMemory {
        self.dma.memory()
    }

    /// The completion interrupt line.
    pub fn interrupts(&self) -> &InterruptLine {
        &self.interrupts
    }

    /// The host disk model.
    pub fn disk(&self) -> &DiskModel {
        &self.disk
    }

    /// Disk model counters.
    pub fn stats(&self) -> &DiskStats {
        self.disk.stats()
    }

    /// Ticks run so far.
    pub fn now(&self) -> u64 {
        self.disk.now()
    }

    /// Returns `true` once a fault has stopped the simulation.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Returns `true` when no request is submitted, in service, or moving
    /// data. Completions waiting for the driver do not count.
    pub fn is_idle(&self) -> bool {
        self.registers.submitted_len() == 0
            && self.disk.is_idle()
            && self.dma.is_idle()
            && self.inbound.is_empty()
            && self.outbound.is_empty()
    }

    /// Runs one bridge step.
    ///
    /// # Errors
    ///
    /// Returns the fault that halted the simulation, or
    /// [`DiskError::Halted`] if it was already halted.
    pub fn tick(&mut self) -> Result<TickReport> {
        if self.halted {
            return Err(DiskError::Halted.into());
        }
        self.step().inspect_err(|error| {
            self.halted = true;
            tracing::error!(tick = self.disk.now(), %error, "simulation halted");
        })
    }

    fn step(&mut self) -> Result<TickReport> {
        self.disk.tick();
        let mut completions = Vec::new();
        while let Some(completion) = self.disk.pop_completion() {
            self.registers.post_completion(completion)?;
            completions.push(completion);
        }

        for descriptor in self.registers.take_submitted() {
            if !self.dma.reaches(&descriptor) {
                tracing::warn!(
                    tag = %descriptor.request.tag,
                    addr = descriptor.addr,
                    bytes = descriptor.request.byte_len(),
                    "refusing transfer outside guest memory"
                );
                self.disk.accept_unreachable(descriptor.request)?;
                continue;
            }
            match self.disk.accept_request(descriptor.request)? {
                Admission::AwaitingData => self.dma.begin_write(&descriptor)?,
                Admission::Streaming => self.dma.begin_read(&descriptor)?,
                Admission::Rejected(_) => {}
            }
        }

        self.dma.stream_payload(&mut self.inbound)?;
        while let Some(word) = self.inbound.pull() {
            self.disk.accept_data(word)?;
        }

        self.disk.drain_outbound(&mut self.outbound);
        while let Some(word) = self.outbound.pull() {
            self.dma.deliver(word)?;
        }

        let interrupt_raised = !completions.is_empty();
        if interrupt_raised {
            self.interrupts.raise();
        }

        Ok(TickReport {
            tick: self.disk.now(),
            completions,
            interrupt_raised,
        })
    }

    /// Ticks until [`Simulation::is_idle`] or `limit` ticks have run.
    /// Returns the number of ticks run.
    ///
    /// # Errors
    ///
    /// Returns the first fault, as [`Simulation::tick`] does.
    pub fn run_until_idle(&mut self, limit: u64) -> Result<u64> {
        let mut ran = 0;
        while ran < limit && !self.is_idle() {
            self.tick()?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Runs exactly `ticks` ticks and returns their reports.
    ///
    /// # Errors
    ///
    /// Returns the first fault, as [`Simulation::tick`] does.
    pub fn run(&mut self, ticks: u64) -> Result<Vec<TickReport>> {
        (0..ticks).map(|_| self.tick()).collect()
    }

    /// Flushes the backing store.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::StorageError::SyncFailed`] if the flush fails.
    pub fn sync(&mut self) -> Result<()> {
        self.disk.sync()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::backing::create_image;
    use crate::config::DiskConfig;
    use crate::error::SimBlkError;
    use crate::regs::{ADDR, COMPLETE, LEN, NCOMPLETE, OFFSET, REQUEST, WRITE};
    use crate::request::CompletionStatus;
    use crate::tags::TagId;

    fn sim_with_image(latency: u64) -> (tempfile::TempDir, Simulation) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        create_image(&path, 64).unwrap();

        let mut disk = DiskConfig::with_backing(&path);
        disk.read_latency = latency;
        disk.write_latency = latency;
        let config = SimConfig {
            disk,
            words_per_tick: 64,
            ..SimConfig::default()
        };
        (dir, Simulation::new(&config).unwrap())
    }

    #[test]
    fn test_interrupt_line_runs_handlers() {
        let line = InterruptLine::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        line.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        line.raise();
        line.clone().raise();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(line.raised_count(), 2);
        assert_eq!(line.handler_count(), 1);
    }

    #[test]
    fn test_idle_simulation_raises_nothing() {
        let (_dir, mut sim) = sim_with_image(5);
        let report = sim.tick().unwrap();
        assert_eq!(report.tick, 1);
        assert!(report.completions.is_empty());
        assert!(!report.interrupt_raised);
        assert!(sim.is_idle());
        assert_eq!(sim.registers().nsectors(), 64);
    }

    #[test]
    fn test_raw_register_write_completes() {
        let (_dir, mut sim) = sim_with_image(3);
        let regs = sim.registers();
        sim.memory().write(0x100, &[0xAB; 512]).unwrap();

        ADDR.write(&*regs, 0x100);
        OFFSET.write(&*regs, 7);
        LEN.write(&*regs, 1);
        WRITE.write(&*regs, 1);
        assert_eq!(REQUEST.read(&*regs), 0);

        let reports = sim.run(4).unwrap();
        assert!(reports[..3].iter().all(|r| r.completions.is_empty()));
        assert_eq!(reports[3].completions.len(), 1);
        assert!(reports[3].interrupt_raised);
        assert_eq!(sim.interrupts().raised_count(), 1);

        assert_eq!(NCOMPLETE.read(&*regs), 1);
        assert_eq!(COMPLETE.read(&*regs), 0);
        assert_eq!(sim.stats().sectors_written, 1);
        assert_eq!(sim.stats().words_in, 64);
    }

    #[test]
    fn test_guest_buffer_outside_memory_completes_with_error() {
        let (_dir, mut sim) = sim_with_image(2);
        let regs = sim.registers();

        // A valid write, then a read into a buffer far outside guest memory.
        sim.memory().write(0x1000, &[0x3C; 512]).unwrap();
        ADDR.write(&*regs, 0x1000);
        OFFSET.write(&*regs, 4);
        LEN.write(&*regs, 1);
        WRITE.write(&*regs, 1);
        let good = REQUEST.read(&*regs);

        ADDR.write(&*regs, u64::MAX - 8);
        OFFSET.write(&*regs, 0);
        LEN.write(&*regs, 1);
        WRITE.write(&*regs, 0);
        let bad = REQUEST.read(&*regs);

        let reports = sim.run(4).unwrap();
        assert!(!sim.is_halted());
        assert_eq!(sim.stats().dma_faults, 1);

        let posted: Vec<_> = reports.iter().flat_map(|r| r.completions.clone()).collect();
        assert_eq!(
            posted,
            vec![
                Completion {
                    tag: TagId(bad),
                    status: CompletionStatus::IoError,
                },
                Completion {
                    tag: TagId(good),
                    status: CompletionStatus::Ok,
                },
            ]
        );
        assert_eq!(sim.stats().sectors_written, 1);
        assert_eq!(sim.stats().reads, 0);
        assert!(sim.is_idle());
    }

    #[test]
    fn test_desync_halts() {
        let (_dir, mut sim) = sim_with_image(1);
        // Read data for a tag the disk model never admitted.
        sim.outbound
            .push(crate::request::DataWord {
                tag: TagId(1),
                payload: 0,
            })
            .unwrap();

        assert!(matches!(sim.tick(), Err(SimBlkError::Dma(_))));
        assert!(sim.is_halted());
        assert!(matches!(
            sim.tick(),
            Err(SimBlkError::Disk(DiskError::Halted))
        ));
    }

    #[test]
    fn test_empty_slot_rejects_everything() {
        let config = SimConfig::default();
        let mut sim = Simulation::with_store(&config, None).unwrap();
        let regs = sim.registers();
        assert_eq!(regs.nsectors(), 0);

        LEN.write(&*regs, 1);
        let tag = TagId(REQUEST.read(&*regs));
        sim.run_until_idle(10).unwrap();
        sim.tick().unwrap();
        assert_eq!(sim.stats().bounds_violations, 1);
        assert_eq!(regs.tag_lease(tag), Some(crate::tags::TagLease::Completed));
    }
}
