//! Guest block driver.
//!
//! [`BlockDriver`] sits between the block layer and the device's control
//! region. Dispatch and completion handling share one lock per device, so
//! the interrupt path never observes a half-programmed descriptor.
//!
//! Block layer upcalls are collected under the lock and made after it is
//! released. A block layer may therefore dispatch again from inside
//! `end_request` or `start_queue`.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use simblk::block::{BlockRequest, RecordingLayer};
//! use simblk::config::DriverConfig;
//! use simblk::driver::{BlockDriver, DispatchOutcome};
//! use simblk::register_file::RegisterFile;
//!
//! let regs = Arc::new(RegisterFile::new(4, 128, 8));
//! let layer = Arc::new(RecordingLayer::<u32>::new());
//! let driver = BlockDriver::probe(regs, Arc::clone(&layer), DriverConfig::default()).unwrap();
//!
//! let outcome = driver.dispatch(BlockRequest::write(10, 1, 0x1000, 7)).unwrap();
//! assert!(matches!(outcome, DispatchOutcome::Issued(_)));
//! assert_eq!(driver.inflight_len(), 1);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::block::{BlockLayer, BlockOp, BlockRequest, IoStatus};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result, SimBlkError};
use crate::inflight::{InFlightEntry, InFlightTable};
use crate::regs::{
    ADDR, COMPLETE, COMPLETE_STATUS, LEN, MAX_REQUEST_LENGTH, NCOMPLETE, NREQUEST, NSECTORS,
    OFFSET, REQUEST, RegisterBus, WRITE, read_barrier, write_barrier,
};
use crate::request::CompletionStatus;
use crate::tags::{INVALID_TAG, TagId};

/// Dispatch state of one driver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueueState {
    /// Accepting requests.
    Dispatching,
    /// The device ran out of tags; waiting for a completion.
    QueueStopped,
    /// A protocol desync was detected. Terminal.
    Failed,
}

/// Device geometry read at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    /// Capacity in sectors.
    pub nsectors: u32,
    /// Largest request the device accepts, in sectors.
    pub max_request_length: u32,
}

/// Result of handing a request to the driver.
#[derive(Debug)]
pub enum DispatchOutcome<H> {
    /// The device accepted the request under this tag.
    Issued(TagId),
    /// The request finished without device interaction.
    Completed,
    /// The device is full. Present the request again after `start_queue`.
    Busy(BlockRequest<H>),
    /// The operation kind is not supported.
    NotSupported(BlockRequest<H>),
}

#[derive(Debug)]
struct DriverState<H> {
    queue: QueueState,
    inflight: InFlightTable<H>,
}

/// Block driver bound to one device's control region.
pub struct BlockDriver<B, L: BlockLayer> {
    bus: B,
    layer: L,
    config: DriverConfig,
    geometry: Geometry,
    state: Mutex<DriverState<L::Handle>>,
}

impl<B, L: BlockLayer> fmt::Debug for BlockDriver<B, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDriver")
            .field("name", &self.config.name)
            .field("geometry", &self.geometry)
            .field(
                "queue",
                &self.state.lock().unwrap_or_else(PoisonError::into_inner).queue,
            )
            .finish_non_exhaustive()
    }
}

impl<B: RegisterBus, L: BlockLayer> BlockDriver<B, L> {
    /// Binds a driver to the device behind `bus`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError`] if `config` is invalid and
    /// [`DriverError::NoDevice`] if the device reports zero sectors.
    pub fn probe(bus: B, layer: L, config: DriverConfig) -> Result<Self> {
        config.validate()?;

        let geometry = Geometry {
            nsectors: NSECTORS.read(&bus),
            max_request_length: MAX_REQUEST_LENGTH.read(&bus),
        };
        if geometry.nsectors == 0 {
            tracing::warn!(name = %config.name, "probe found no device");
            return Err(DriverError::NoDevice { name: config.name }.into());
        }

        tracing::info!(
            name = %config.name,
            nsectors = geometry.nsectors,
            max_request_length = geometry.max_request_length,
            "block device attached"
        );

        let inflight = InFlightTable::new(config.max_entries_per_tag);
        Ok(Self {
            bus,
            layer,
            config,
            geometry,
            state: Mutex::new(DriverState {
                queue: QueueState::Dispatching,
                inflight,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DriverState<L::Handle>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn halted(&self) -> SimBlkError {
        DriverError::Halted {
            name: self.config.name.clone(),
        }
        .into()
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Geometry read at probe time.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Current dispatch state.
    pub fn queue_state(&self) -> QueueState {
        self.lock().queue
    }

    /// Requests issued to the device and not yet completed.
    pub fn inflight_len(&self) -> usize {
        self.lock().inflight.len()
    }

    /// Hands one request to the device.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Halted`] once the driver has failed. Returns
    /// [`DriverError::NoTagIssued`] or [`DriverError::TagReissued`] when the
    /// device breaks the tag protocol; the driver then fails and every
    /// in-flight request, including this one, ends with an I/O error.
    pub fn dispatch(&self, request: BlockRequest<L::Handle>) -> Result<DispatchOutcome<L::Handle>> {
        match request.op {
            BlockOp::Read | BlockOp::Write => {}
            BlockOp::Discard | BlockOp::Flush => {
                if self.lock().queue == QueueState::Failed {
                    return Err(self.halted());
                }
                self.layer.end_request(request.handle, IoStatus::Ok);
                return Ok(DispatchOutcome::Completed);
            }
            BlockOp::WriteZeroes | BlockOp::SecureErase => {
                tracing::debug!(name = %self.config.name, op = ?request.op, "operation not supported");
                return Ok(DispatchOutcome::NotSupported(request));
            }
        }

        let mut state = self.lock();
        match state.queue {
            QueueState::Failed => return Err(self.halted()),
            QueueState::QueueStopped => return Ok(DispatchOutcome::Busy(request)),
            QueueState::Dispatching => {}
        }

        let available = NREQUEST.read(&self.bus);
        if available == 0 {
            state.queue = QueueState::QueueStopped;
            drop(state);
            tracing::debug!(name = %self.config.name, "device full, stopping queue");
            self.layer.stop_queue();
            return Ok(DispatchOutcome::Busy(request));
        }

        ADDR.write(&self.bus, request.buffer_addr);
        OFFSET.write(&self.bus, request.sector);
        LEN.write(&self.bus, request.nr_sectors);
        WRITE.write(&self.bus, u8::from(request.op == BlockOp::Write));
        write_barrier();
        let raw = REQUEST.read(&self.bus);
        read_barrier();

        if raw == INVALID_TAG {
            tracing::error!(name = %self.config.name, available, "device issued no tag");
            let error = DriverError::NoTagIssued {
                name: self.config.name.clone(),
                available,
            };
            return Err(self.fail(state, Vec::new(), Some(request.handle), error));
        }

        let tag = TagId(raw);
        let entry = InFlightEntry {
            handle: request.handle,
            tag,
            op: request.op,
            sector: request.sector,
            nr_sectors: request.nr_sectors,
        };
        if let Err((entry, queued)) = state.inflight.insert(entry) {
            tracing::error!(name = %self.config.name, %tag, queued, "tag reissued while in flight");
            let error = DriverError::TagReissued {
                name: self.config.name.clone(),
                tag,
                queued,
            };
            return Err(self.fail(state, Vec::new(), Some(entry.handle), error));
        }

        tracing::debug!(
            name = %self.config.name,
            %tag,
            op = ?request.op,
            sector = request.sector,
            nr_sectors = request.nr_sectors,
            "request issued"
        );
        Ok(DispatchOutcome::Issued(tag))
    }

    /// Drains every completion the device has posted.
    ///
    /// Called from the interrupt handler, or directly to poll. Returns the
    /// number of requests completed.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Halted`] once the driver has failed, and
    /// [`DriverError::UnknownCompletion`] if the device completes a tag with
    /// no request in flight. Completions drained before the fault are still
    /// reported to the block layer.
    pub fn on_completion_event(&self) -> Result<usize> {
        let mut state = self.lock();
        if state.queue == QueueState::Failed {
            return Err(self.halted());
        }

        let pending = NCOMPLETE.read(&self.bus);
        let mut finished = Vec::with_capacity(usize::from(pending));
        for _ in 0..pending {
            let tag = TagId(COMPLETE.read(&self.bus));
            let status = CompletionStatus::from_raw(COMPLETE_STATUS.read(&self.bus));

            let Some(entry) = state.inflight.pop(tag) else {
                let outstanding = state.inflight.len();
                tracing::error!(name = %self.config.name, %tag, outstanding, "completion for unknown tag");
                let error = DriverError::UnknownCompletion {
                    name: self.config.name.clone(),
                    tag,
                    outstanding,
                };
                return Err(self.fail(state, finished, None, error));
            };

            if !status.is_ok() {
                tracing::warn!(name = %self.config.name, %tag, ?status, sector = entry.sector, "request failed");
            }
            finished.push((entry.handle, IoStatus::from(status)));
        }

        let resumed = !finished.is_empty() && state.queue == QueueState::QueueStopped;
        if resumed {
            state.queue = QueueState::Dispatching;
        }
        drop(state);

        let count = finished.len();
        self.finish(finished, resumed);
        Ok(count)
    }

    fn finish(&self, finished: Vec<(L::Handle, IoStatus)>, resumed: bool) {
        for (handle, status) in finished {
            self.layer.end_request(handle, status);
        }
        if resumed {
            tracing::debug!(name = %self.config.name, "restarting queue");
            self.layer.start_queue();
        }
    }

    /// Enters `Failed`, reports `finished`, then ends every outstanding
    /// request with an I/O error.
    fn fail(
        &self,
        mut state: MutexGuard<'_, DriverState<L::Handle>>,
        finished: Vec<(L::Handle, IoStatus)>,
        current: Option<L::Handle>,
        error: DriverError,
    ) -> SimBlkError {
        state.queue = QueueState::Failed;
        let abandoned = state.inflight.drain();
        drop(state);

        self.finish(finished, false);
        for entry in abandoned {
            self.layer.end_request(entry.handle, IoStatus::IoError);
        }
        if let Some(handle) = current {
            self.layer.end_request(handle, IoStatus::IoError);
        }
        error.into()
    }
}

impl<B, L> BlockDriver<B, L>
where
    B: RegisterBus + Send + Sync + 'static,
    L: BlockLayer + 'static,
    L::Handle: 'static,
{
    /// Returns a closure that runs the completion path, suitable for
    /// registering on an interrupt line.
    pub fn interrupt_handler(self: &Arc<Self>) -> impl Fn() + Send + Sync + 'static {
        let driver = Arc::clone(self);
        move || {
            if let Err(error) = driver.on_completion_event() {
                tracing::error!(name = %driver.config.name, %error, "completion interrupt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::block::RecordingLayer;
    use crate::error::SimBlkError;
    use crate::register_file::RegisterFile;
    use crate::request::Completion;

    type TestDriver = BlockDriver<Arc<RegisterFile>, Arc<RecordingLayer<u32>>>;

    fn setup(ntags: u8) -> (Arc<RegisterFile>, Arc<RecordingLayer<u32>>, TestDriver) {
        let regs = Arc::new(RegisterFile::new(ntags, 128, 8));
        let layer = Arc::new(RecordingLayer::new());
        let driver = BlockDriver::probe(
            Arc::clone(&regs),
            Arc::clone(&layer),
            DriverConfig::default(),
        )
        .unwrap();
        (regs, layer, driver)
    }

    fn complete_all(regs: &RegisterFile, status: CompletionStatus) {
        for descriptor in regs.take_submitted() {
            regs.post_completion(Completion {
                tag: descriptor.request.tag,
                status,
            })
            .unwrap();
        }
    }

    #[test]
    fn test_probe_without_device() {
        let regs = Arc::new(RegisterFile::new(4, 0, 8));
        let layer = Arc::new(RecordingLayer::<u32>::new());
        let err = BlockDriver::probe(regs, layer, DriverConfig::default()).unwrap_err();
        assert!(matches!(err, SimBlkError::Driver(DriverError::NoDevice { .. })));
    }

    #[test]
    fn test_probe_reads_geometry() {
        let (_, _, driver) = setup(4);
        assert_eq!(
            driver.geometry(),
            Geometry {
                nsectors: 128,
                max_request_length: 8
            }
        );
        assert_eq!(driver.name(), "simblk0");
    }

    #[test]
    fn test_flush_and_discard_complete_immediately() {
        let (regs, layer, driver) = setup(4);
        let flush = driver.dispatch(BlockRequest::control(BlockOp::Flush, 1)).unwrap();
        let discard = driver.dispatch(BlockRequest::control(BlockOp::Discard, 2)).unwrap();
        assert!(matches!(flush, DispatchOutcome::Completed));
        assert!(matches!(discard, DispatchOutcome::Completed));
        assert_eq!(
            layer.take_completed(),
            vec![(1, IoStatus::Ok), (2, IoStatus::Ok)]
        );
        assert!(regs.take_submitted().is_empty());
        assert_eq!(regs.free_tags(), 4);
    }

    #[test]
    fn test_unsupported_ops_returned() {
        let (regs, layer, driver) = setup(4);
        for op in [BlockOp::WriteZeroes, BlockOp::SecureErase] {
            match driver.dispatch(BlockRequest::control(op, 9)).unwrap() {
                DispatchOutcome::NotSupported(request) => assert_eq!(request.op, op),
                other => panic!("expected NotSupported, got {other:?}"),
            }
        }
        assert_eq!(layer.completed_len(), 0);
        assert!(regs.take_submitted().is_empty());
    }

    #[test]
    fn test_backpressure_and_resume() {
        let (regs, layer, driver) = setup(2);
        assert!(matches!(
            driver.dispatch(BlockRequest::write(0, 1, 0, 1)).unwrap(),
            DispatchOutcome::Issued(TagId(0))
        ));
        assert!(matches!(
            driver.dispatch(BlockRequest::write(1, 1, 0, 2)).unwrap(),
            DispatchOutcome::Issued(TagId(1))
        ));

        let busy = driver.dispatch(BlockRequest::write(2, 1, 0, 3)).unwrap();
        assert!(matches!(busy, DispatchOutcome::Busy(ref r) if r.handle == 3));
        assert_eq!(driver.queue_state(), QueueState::QueueStopped);
        assert_eq!(layer.stops(), 1);

        // Stopped queue answers without reading NREQUEST again.
        assert!(matches!(
            driver.dispatch(BlockRequest::write(2, 1, 0, 3)).unwrap(),
            DispatchOutcome::Busy(_)
        ));

        complete_all(&regs, CompletionStatus::Ok);
        assert_eq!(driver.on_completion_event().unwrap(), 2);
        assert_eq!(driver.queue_state(), QueueState::Dispatching);
        assert_eq!(layer.starts(), 1);
        assert_eq!(
            layer.take_completed(),
            vec![(1, IoStatus::Ok), (2, IoStatus::Ok)]
        );

        assert!(matches!(
            driver.dispatch(BlockRequest::write(2, 1, 0, 3)).unwrap(),
            DispatchOutcome::Issued(TagId(0))
        ));
    }

    #[test]
    fn test_error_status_reported() {
        let (regs, layer, driver) = setup(4);
        driver.dispatch(BlockRequest::read(200, 1, 0, 5)).unwrap();
        complete_all(&regs, CompletionStatus::BoundsError);
        driver.on_completion_event().unwrap();
        assert_eq!(layer.take_completed(), vec![(5, IoStatus::OutOfRange)]);
    }

    #[test]
    fn test_descriptor_programmed() {
        let (regs, _, driver) = setup(4);
        driver.dispatch(BlockRequest::read(10, 4, 0x8000, 1)).unwrap();
        let submitted = regs.take_submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].addr, 0x8000);
        assert!(!submitted[0].request.is_write);
        assert_eq!(submitted[0].request.start_sector, 10);
        assert_eq!(submitted[0].request.length_sectors, 4);
    }

    #[test]
    fn test_no_pending_completions() {
        let (_, layer, driver) = setup(4);
        assert_eq!(driver.on_completion_event().unwrap(), 0);
        assert_eq!(layer.completed_len(), 0);
    }

    #[test]
    fn test_interrupt_handler_drains() {
        let (regs, layer, driver) = setup(4);
        let driver = Arc::new(driver);
        driver.dispatch(BlockRequest::write(0, 1, 0, 11)).unwrap();
        complete_all(&regs, CompletionStatus::Ok);

        let handler = driver.interrupt_handler();
        handler();
        assert_eq!(layer.take_completed(), vec![(11, IoStatus::Ok)]);
        assert_eq!(driver.inflight_len(), 0);
    }
}
