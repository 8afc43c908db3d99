//! # simblk
//!
//! Register-level model of an FPGA-backed block device.
//!
//! simblk pairs a guest block driver with a tick-driven host model of the
//! device behind it. The two halves talk only through a small control region
//! of memory-mapped registers, a streaming data channel, and an interrupt
//! line, the way a real driver talks to real hardware.
//!
//! ## Key Properties
//!
//! - Finite tag pool: a tag returns to the pool only after the driver drains
//!   its completion
//! - Backpressure instead of errors when the device runs out of tags
//! - Deterministic latency counted in ticks, never wall-clock time
//! - Bounds violations and backing-store failures complete with an error
//!   status instead of executing
//! - Protocol desyncs are detected and stop the affected instance
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use simblk::{
//!     BlockDriver, BlockRequest, DiskConfig, DriverConfig, RecordingLayer, SimConfig, Simulation,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! simblk::backing::create_image("./disk.img", 2048)?;
//! let config = SimConfig {
//!     disk: DiskConfig::with_backing("./disk.img"),
//!     ..SimConfig::default()
//! };
//! let mut sim = Simulation::new(&config)?;
//!
//! // Bind the driver and route the completion interrupt to it
//! let layer = Arc::new(RecordingLayer::<u32>::new());
//! let driver = Arc::new(BlockDriver::probe(
//!     sim.registers(),
//!     Arc::clone(&layer),
//!     DriverConfig::default(),
//! )?);
//! sim.interrupts().register(driver.interrupt_handler());
//!
//! // Write sector 10 from guest address 0x1000
//! sim.memory().write(0x1000, &[0x5A; 512])?;
//! driver.dispatch(BlockRequest::write(10, 1, 0x1000, 1))?;
//!
//! sim.run_until_idle(1_000)?;
//! for (handle, status) in layer.take_completed() {
//!     println!("request {handle}: {status:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`BlockDriver`]: Guest driver; dispatches block requests, handles completions
//! - [`RegisterFile`]: Host side of the control region; owns the tag pool
//! - [`DiskModel`]: Per-tag service state machines over a [`BackingStore`]
//! - [`Simulation`]: Bridge tick loop joining the halves
//!
//! ## Modules
//!
//! - [`regs`]: Register layout, typed field handles, barriers, MMIO bus
//! - [`register_file`]: Simulated control region
//! - [`tags`]: Tag identifiers and the tag pool
//! - [`request`]: Requests, data words, completions
//! - [`channel`]: Bounded streaming channel
//! - [`tracker`]: Write payload reassembly
//! - [`latency`]: Tick-based completion scheduler
//! - [`backing`]: Backing stores over image files
//! - [`disk`]: Host disk model
//! - [`dma`]: Guest memory and DMA engine
//! - [`block`]: Block layer boundary
//! - [`inflight`]: Driver-side in-flight table
//! - [`driver`]: Guest block driver
//! - [`sim`]: Simulation harness and interrupt line
//! - [`config`]: Configuration
//! - [`error`]: Error types

pub mod backing;
pub mod block;
pub mod channel;
pub mod config;
pub mod disk;
pub mod dma;
pub mod driver;
pub mod error;
pub mod inflight;
pub mod latency;
pub mod register_file;
pub mod regs;
pub mod request;
pub mod sim;
pub mod tags;
pub mod tracker;

// Re-export primary API types at crate root for convenience.
pub use backing::BackingStore;
pub use block::{BlockLayer, BlockOp, BlockRequest, IoStatus, RecordingLayer};
pub use config::{BackendKind, DiskConfig, DriverConfig, SimConfig};
pub use disk::{DiskModel, DiskStats};
pub use driver::{BlockDriver, DispatchOutcome, QueueState};
pub use error::{Result, SimBlkError};
pub use register_file::RegisterFile;
pub use request::{Completion, CompletionStatus};
pub use sim::{InterruptLine, Simulation, TickReport};
pub use tags::TagId;
