//! Host-side disk model.
//!
//! The model owns the backing store and services one request per tag. Each
//! tag moves through its own state machine:
//!
//! ```text
//! write: Idle -> Receiving -> Committing -> CompletionPending -> Idle
//! read:  Idle -> Fetching  -> StreamingOut -> CompletionPending -> Idle
//! ```
//!
//! Requests that violate the device geometry, and transfers the backing
//! store fails, are never executed; they complete with an error status
//! instead. A request or data word that names a tag in the wrong state means
//! the register file and the model have diverged, which is reported as a
//! [`DiskError`] and is fatal for the model instance.
//!
//! All timing is in ticks. The surrounding bridge calls [`DiskModel::tick`]
//! once per simulated tick, then feeds newly visible requests and data.

use std::collections::VecDeque;

use serde::Serialize;

use crate::backing::{BackingStore, open_store};
use crate::channel::DataChannel;
use crate::config::DiskConfig;
use crate::error::{DiskError, Result, StorageError};
use crate::latency::LatencyScheduler;
use crate::request::{Completion, CompletionStatus, DataWord, Request, WORD_BYTES};
use crate::tags::TagId;
use crate::tracker::WriteTracker;

/// Service state of one tag inside the disk model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TagState {
    /// Not servicing anything.
    Idle,
    /// Waiting for write payload words.
    Receiving,
    /// Writing the reassembled payload to the store.
    Committing,
    /// Reading from the store.
    Fetching,
    /// Read data queued for the outbound channel.
    StreamingOut,
    /// Counting down to the completion signal.
    CompletionPending,
}

/// What the bridge should do after a request is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A write tracker is open; stream the payload in.
    AwaitingData,
    /// Read data is queued for [`DiskModel::drain_outbound`].
    Streaming,
    /// The request was not executed and will complete with this status.
    Rejected(CompletionStatus),
}

/// Counters for one disk model instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskStats {
    /// Read requests admitted.
    pub reads: u64,
    /// Write requests admitted.
    pub writes: u64,
    /// Sectors fetched from the store.
    pub sectors_read: u64,
    /// Sectors committed to the store.
    pub sectors_written: u64,
    /// Requests rejected for violating the device geometry.
    pub bounds_violations: u64,
    /// Transfers failed by the backing store.
    pub io_errors: u64,
    /// Requests refused because their guest buffer lies outside guest memory.
    pub dma_faults: u64,
    /// Completions signaled.
    pub completions: u64,
    /// Payload words accepted from the inbound channel.
    pub words_in: u64,
    /// Read words pushed to the outbound channel.
    pub words_out: u64,
}

/// Functional model of the block device.
#[derive(Debug)]
pub struct DiskModel {
    store: Option<Box<dyn BackingStore>>,
    nsectors: u32,
    max_request_length: u32,
    read_latency: u64,
    write_latency: u64,
    /// Service state, indexed by tag.
    states: Vec<TagState>,
    /// Open write trackers, indexed by tag.
    trackers: Vec<Option<WriteTracker>>,
    /// Read words not yet pushed to the outbound channel, indexed by tag.
    words_outstanding: Vec<u64>,
    /// Read data waiting for the outbound channel, in fetch order.
    read_responses: VecDeque<DataWord>,
    scheduler: LatencyScheduler,
    /// Completions signaled but not yet taken by the bridge.
    completions: VecDeque<Completion>,
    stats: DiskStats,
}

impl DiskModel {
    /// Creates a model over an already opened store.
    ///
    /// `None` models an empty slot: the device reports zero sectors and every
    /// request fails its bounds check.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError`] if `config` is invalid.
    pub fn new(config: &DiskConfig, store: Option<Box<dyn BackingStore>>) -> Result<Self> {
        config.validate()?;

        let ntags = usize::from(config.ntags);
        let nsectors = store.as_ref().map_or(0, |s| s.nsectors());

        Ok(Self {
            store,
            nsectors,
            max_request_length: config.max_request_length,
            read_latency: config.read_latency,
            write_latency: config.write_latency,
            states: vec![TagState::Idle; ntags],
            trackers: (0..ntags).map(|_| None).collect(),
            words_outstanding: vec![0; ntags],
            read_responses: VecDeque::new(),
            scheduler: LatencyScheduler::new(),
            completions: VecDeque::new(),
            stats: DiskStats::default(),
        })
    }

    /// Opens the backing store named by `config` and creates a model over it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the image cannot be opened, or a config
    /// error if `config` is invalid.
    pub fn open(config: &DiskConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(config)?;
        Self::new(config, store)
    }

    /// Addressable sectors.
    pub fn nsectors(&self) -> u32 {
        self.nsectors
    }

    /// Per-request sector bound.
    pub fn max_request_length(&self) -> u32 {
        self.max_request_length
    }

    /// Service state of `tag`, or `None` outside the pool.
    pub fn state(&self, tag: TagId) -> Option<TagState> {
        self.states.get(tag.index()).copied()
    }

    /// Counters since construction.
    pub fn stats(&self) -> &DiskStats {
        &self.stats
    }

    /// Current tick of the latency scheduler.
    pub fn now(&self) -> u64 {
        self.scheduler.now()
    }

    /// Returns `true` while read data is still waiting for the channel.
    pub fn resp_data_pending(&self) -> bool {
        !self.read_responses.is_empty()
    }

    /// Returns `true` when no tag is being serviced and nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.states.iter().all(|s| *s == TagState::Idle) && self.completions.is_empty()
    }

    /// Admits a request newly visible on the register file.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError`] if the tag is outside the pool or still being
    /// serviced. Geometry violations and store failures are not errors here:
    /// they yield [`Admission::Rejected`] and an error completion.
    pub fn accept_request(&mut self, req: Request) -> Result<Admission> {
        self.admit(req, true)
    }

    /// Admits a request whose guest buffer the DMA engine cannot reach.
    ///
    /// The tag and geometry are checked as in [`DiskModel::accept_request`].
    /// A request that passes both never executes and completes with
    /// [`CompletionStatus::IoError`].
    ///
    /// # Errors
    ///
    /// Returns [`DiskError`] if the tag is outside the pool or still being
    /// serviced.
    pub fn accept_unreachable(&mut self, req: Request) -> Result<Admission> {
        self.admit(req, false)
    }

    fn admit(&mut self, req: Request, reachable: bool) -> Result<Admission> {
        let idx = self.check_tag(req.tag)?;
        let state = self.states[idx];
        if state != TagState::Idle {
            tracing::error!(tag = %req.tag, ?state, "request for busy tag");
            return Err(DiskError::TagBusy {
                tag: req.tag,
                state,
            }
            .into());
        }

        if let Some(reason) = self.bounds_violation(&req) {
            self.stats.bounds_violations += 1;
            tracing::warn!(
                tag = %req.tag,
                start_sector = req.start_sector,
                length_sectors = req.length_sectors,
                nsectors = self.nsectors,
                max_request_length = self.max_request_length,
                reason,
                "rejecting request"
            );
            self.fail(req.tag, CompletionStatus::BoundsError);
            return Ok(Admission::Rejected(CompletionStatus::BoundsError));
        }

        if !reachable {
            self.stats.dma_faults += 1;
            tracing::warn!(
                tag = %req.tag,
                is_write = req.is_write,
                length_sectors = req.length_sectors,
                "guest buffer outside guest memory"
            );
            self.fail(req.tag, CompletionStatus::IoError);
            return Ok(Admission::Rejected(CompletionStatus::IoError));
        }

        if req.is_write {
            self.stats.writes += 1;
            self.trackers[idx] = Some(WriteTracker::new(&req));
            self.states[idx] = TagState::Receiving;
            tracing::debug!(
                tag = %req.tag,
                start_sector = req.start_sector,
                length_sectors = req.length_sectors,
                "write admitted"
            );
            return Ok(Admission::AwaitingData);
        }

        self.stats.reads += 1;
        self.states[idx] = TagState::Fetching;
        match self.do_read(&req) {
            Ok(()) => {
                self.stats.sectors_read += u64::from(req.length_sectors);
                self.words_outstanding[idx] = req.word_count();
                self.states[idx] = TagState::StreamingOut;
                tracing::debug!(
                    tag = %req.tag,
                    start_sector = req.start_sector,
                    length_sectors = req.length_sectors,
                    "read fetched"
                );
                Ok(Admission::Streaming)
            }
            Err(e) => {
                self.stats.io_errors += 1;
                tracing::error!(tag = %req.tag, error = %e, "read failed");
                self.fail(req.tag, CompletionStatus::IoError);
                Ok(Admission::Rejected(CompletionStatus::IoError))
            }
        }
    }

    /// Accepts one inbound payload word.
    ///
    /// The word that completes a write triggers the commit and schedules the
    /// completion `write_latency` ticks out.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError::UnexpectedData`] if the tag is not receiving.
    pub fn accept_data(&mut self, word: DataWord) -> Result<()> {
        let idx = self.check_tag(word.tag)?;
        let state = self.states[idx];
        let tracker = match (state, self.trackers[idx].as_mut()) {
            (TagState::Receiving, Some(tracker)) => tracker,
            _ => {
                tracing::error!(tag = %word.tag, ?state, "data word for tag not receiving");
                return Err(DiskError::UnexpectedData {
                    tag: word.tag,
                    state,
                }
                .into());
            }
        };

        self.stats.words_in += 1;
        if !tracker.append(word) {
            return Ok(());
        }

        if let Some(tracker) = self.trackers[idx].take() {
            self.states[idx] = TagState::Committing;
            self.commit(tracker);
        }
        Ok(())
    }

    /// Pushes queued read data until the channel refuses.
    ///
    /// A read whose last word leaves the queue schedules its completion
    /// `read_latency` ticks out. Returns the number of words pushed.
    pub fn drain_outbound(&mut self, channel: &mut DataChannel) -> usize {
        let mut pushed = 0;
        while let Some(&word) = self.read_responses.front() {
            if channel.push(word).is_err() {
                break;
            }
            self.read_responses.pop_front();
            pushed += 1;
            self.stats.words_out += 1;

            let idx = word.tag.index();
            self.words_outstanding[idx] -= 1;
            if self.words_outstanding[idx] == 0 {
                self.states[idx] = TagState::CompletionPending;
                let due = self.scheduler.schedule(
                    Completion {
                        tag: word.tag,
                        status: CompletionStatus::Ok,
                    },
                    self.read_latency,
                );
                tracing::debug!(tag = %word.tag, due, "read drained");
            }
        }
        pushed
    }

    /// Advances latency countdowns by one tick.
    ///
    /// Each tag whose countdown expires returns to `Idle` and its completion
    /// joins the signal queue. Returns the number of completions signaled.
    pub fn tick(&mut self) -> usize {
        let fired = self.scheduler.advance();
        let count = fired.len();
        for completion in fired {
            self.states[completion.tag.index()] = TagState::Idle;
            self.stats.completions += 1;
            tracing::debug!(
                tag = %completion.tag,
                status = ?completion.status,
                tick = self.scheduler.now(),
                "completion signaled"
            );
            self.completions.push_back(completion);
        }
        count
    }

    /// Takes the oldest signaled completion.
    pub fn pop_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    /// Flushes the backing store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SyncFailed`] if the flush fails.
    pub fn sync(&mut self) -> Result<()> {
        match self.store.as_mut() {
            Some(store) => store.sync(),
            None => Ok(()),
        }
    }

    fn check_tag(&self, tag: TagId) -> Result<usize> {
        let idx = tag.index();
        if idx >= self.states.len() {
            #[allow(clippy::cast_possible_truncation)] // Pool size comes from a u8
            let ntags = self.states.len() as u8;
            tracing::error!(%tag, ntags, "tag outside pool");
            return Err(DiskError::TagOutOfRange { tag, ntags }.into());
        }
        Ok(idx)
    }

    fn bounds_violation(&self, req: &Request) -> Option<&'static str> {
        if req.length_sectors == 0 {
            Some("zero-length request")
        } else if req.length_sectors > self.max_request_length {
            Some("longer than max_request_length")
        } else if req.end_sector() > u64::from(self.nsectors) {
            Some("past the end of the device")
        } else {
            None
        }
    }

    /// Schedules an error completion for a request that will not execute.
    fn fail(&mut self, tag: TagId, status: CompletionStatus) {
        self.states[tag.index()] = TagState::CompletionPending;
        self.scheduler.schedule(Completion { tag, status }, 0);
    }

    #[allow(clippy::cast_possible_truncation)] // Bounded by max_request_length * 512
    fn do_read(&mut self, req: &Request) -> Result<()> {
        let offset = req.byte_offset();
        let mut buf = vec![0u8; req.byte_len() as usize];
        match self.store.as_mut() {
            Some(store) => store.read_at(offset, &mut buf)?,
            None => {
                return Err(StorageError::OutOfRange {
                    offset,
                    length: req.byte_len(),
                    size: 0,
                }
                .into());
            }
        }

        self.read_responses.extend(
            buf.chunks(WORD_BYTES)
                .map(|chunk| DataWord::from_bytes(req.tag, chunk)),
        );
        Ok(())
    }

    fn commit(&mut self, tracker: WriteTracker) {
        let tag = tracker.tag();
        let (offset, payload) = tracker.into_commit();
        let result = match self.store.as_mut() {
            Some(store) => store.write_at(offset, &payload),
            None => Err(StorageError::OutOfRange {
                offset,
                length: payload.len() as u64,
                size: 0,
            }
            .into()),
        };

        match result {
            Ok(()) => {
                let sectors = (payload.len() / crate::request::SECTOR_SIZE) as u64;
                self.stats.sectors_written += sectors;
                self.states[tag.index()] = TagState::CompletionPending;
                let due = self.scheduler.schedule(
                    Completion {
                        tag,
                        status: CompletionStatus::Ok,
                    },
                    self.write_latency,
                );
                tracing::debug!(%tag, offset, sectors, due, "write committed");
            }
            Err(e) => {
                self.stats.io_errors += 1;
                tracing::error!(%tag, offset, error = %e, "write commit failed");
                self.fail(tag, CompletionStatus::IoError);
            }
        }
    }
}
