//! Drives a driver and a simulation together for the CLI commands.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use simblk::block::{BlockOp, BlockRequest, IoStatus, RecordingLayer};
use simblk::config::{DriverConfig, SimConfig};
use simblk::driver::{BlockDriver, DispatchOutcome};
use simblk::request::SECTOR_SIZE;
use simblk::{RegisterFile, Simulation, TickReport};

type Driver = BlockDriver<Arc<RegisterFile>, Arc<RecordingLayer<usize>>>;

/// How a request ended, as reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    IoError,
    OutOfRange,
    NotSupported,
}

impl From<IoStatus> for Outcome {
    fn from(status: IoStatus) -> Self {
        match status {
            IoStatus::Ok => Self::Ok,
            IoStatus::IoError => Self::IoError,
            IoStatus::OutOfRange => Self::OutOfRange,
        }
    }
}

/// One finished request.
#[derive(Debug, Clone, Serialize)]
pub struct Finished {
    /// Caller-chosen request id.
    pub request: usize,
    pub outcome: Outcome,
    /// Tick the driver saw the completion in.
    pub tick: u64,
}

/// A guest buffer handed out for one request.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    pub addr: u64,
    pub len: usize,
}

pub struct Runner {
    sim: Simulation,
    driver: Arc<Driver>,
    layer: Arc<RecordingLayer<usize>>,
    held: VecDeque<BlockRequest<usize>>,
    next_addr: u64,
    finished: Vec<Finished>,
}

impl Runner {
    pub fn new(config: &SimConfig, driver_config: DriverConfig) -> simblk::Result<Self> {
        let sim = Simulation::new(config)?;
        let layer = Arc::new(RecordingLayer::new());
        let driver = Arc::new(BlockDriver::probe(
            sim.registers(),
            Arc::clone(&layer),
            driver_config,
        )?);
        sim.interrupts().register(driver.interrupt_handler());

        Ok(Self {
            sim,
            driver,
            layer,
            held: VecDeque::new(),
            next_addr: 0,
            finished: Vec::new(),
        })
    }

    pub fn sim(&self) -> &Simulation {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut Simulation {
        &mut self.sim
    }

    pub fn nsectors(&self) -> u32 {
        self.driver.geometry().nsectors
    }

    pub fn max_request_length(&self) -> u32 {
        self.driver.geometry().max_request_length
    }

    /// Takes a guest buffer of `sectors` sectors, wrapping to the bottom of
    /// guest memory when the top is reached.
    pub fn alloc(&mut self, sectors: u32) -> Buffer {
        let len = sectors as usize * SECTOR_SIZE;
        let size = self.sim.memory().size() as u64;
        if self.next_addr + len as u64 > size {
            self.next_addr = 0;
        }
        let addr = self.next_addr;
        self.next_addr += len as u64;
        Buffer { addr, len }
    }

    /// Hands a request to the driver, or queues it behind earlier held
    /// requests.
    pub fn submit(&mut self, request: BlockRequest<usize>) -> simblk::Result<()> {
        if self.held.is_empty() {
            self.dispatch(request)?;
        } else {
            self.held.push_back(request);
        }
        self.collect();
        Ok(())
    }

    /// Dispatches one request. Returns `false` if the device was full.
    fn dispatch(&mut self, request: BlockRequest<usize>) -> simblk::Result<bool> {
        match self.driver.dispatch(request)? {
            DispatchOutcome::Issued(_) | DispatchOutcome::Completed => Ok(true),
            DispatchOutcome::Busy(request) => {
                self.held.push_front(request);
                Ok(false)
            }
            DispatchOutcome::NotSupported(request) => {
                self.finished.push(Finished {
                    request: request.handle,
                    outcome: Outcome::NotSupported,
                    tick: self.sim.now(),
                });
                Ok(true)
            }
        }
    }

    fn collect(&mut self) {
        let tick = self.sim.now();
        self.finished.extend(
            self.layer
                .take_completed()
                .into_iter()
                .map(|(request, status)| Finished {
                    request,
                    outcome: status.into(),
                    tick,
                }),
        );
    }

    /// Runs one tick, then re-presents held requests.
    pub fn tick(&mut self) -> simblk::Result<TickReport> {
        let report = self.sim.tick()?;
        self.collect();
        while let Some(request) = self.held.pop_front() {
            if !self.dispatch(request)? {
                break;
            }
        }
        self.collect();
        Ok(report)
    }

    /// Returns `true` when nothing is held, in flight, or moving.
    pub fn is_settled(&self) -> bool {
        self.held.is_empty() && self.driver.inflight_len() == 0 && self.sim.is_idle()
    }

    /// Ticks until settled or `limit` ticks have run. Returns the ticks run.
    pub fn drain(&mut self, limit: u64) -> simblk::Result<u64> {
        let mut ran = 0;
        while ran < limit && !self.is_settled() {
            self.tick()?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Takes every request finished so far.
    pub fn take_finished(&mut self) -> Vec<Finished> {
        std::mem::take(&mut self.finished)
    }

    /// Builds a read or write request for `sectors` sectors at `sector`.
    pub fn request(
        op: BlockOp,
        id: usize,
        sector: u32,
        sectors: u32,
        buffer: Buffer,
    ) -> BlockRequest<usize> {
        BlockRequest {
            op,
            sector,
            nr_sectors: sectors,
            buffer_addr: buffer.addr,
            handle: id,
        }
    }
}
