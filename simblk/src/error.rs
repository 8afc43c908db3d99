//! Error types for the simblk device model and guest driver.

use std::path::PathBuf;

use thiserror::Error;

use crate::disk::TagState;
use crate::tags::{TagId, TagLease};

/// The main error type for all simblk operations.
///
/// Each variant wraps the error enum of one area of the crate. Protocol
/// desyncs surface as [`DriverError`] or [`DiskError`] and are fatal for the
/// device instance that raised them.
#[derive(Error, Debug)]
pub enum SimBlkError {
    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Backing store I/O failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Host-side disk model fault.
    #[error("disk model error: {0}")]
    Disk(#[from] DiskError),

    /// Guest driver fault.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Guest memory transfer fault.
    #[error("dma error: {0}")]
    Dma(#[from] DmaError),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The tag pool size is outside `1..=254`.
    #[error("invalid tag count {ntags}: must be between 1 and 254")]
    InvalidTagCount {
        /// The rejected tag count.
        ntags: u8,
    },

    /// The per-request sector bound is zero.
    #[error("invalid max_request_length {max}: must be > 0")]
    InvalidMaxRequestLength {
        /// The rejected bound.
        max: u32,
    },

    /// The streaming channel would carry no words per tick.
    #[error("invalid words_per_tick {words}: must be > 0")]
    InvalidWordsPerTick {
        /// The rejected capacity.
        words: usize,
    },

    /// The driver's per-tag queue depth is zero.
    #[error("invalid max_entries_per_tag {depth}: must be > 0")]
    InvalidQueueDepth {
        /// The rejected depth.
        depth: usize,
    },

    /// Guest memory cannot hold a single maximum-length transfer.
    #[error("guest memory of {bytes} bytes cannot hold a {needed}-byte transfer")]
    GuestMemoryTooSmall {
        /// Configured guest memory size.
        bytes: usize,
        /// Bytes needed for one maximum-length request.
        needed: u64,
    },

    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for this schema.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by a backing store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backing file could not be opened.
    #[error("failed to open backing file '{path}': {source}")]
    Open {
        /// The backing file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The backing file could not be created or sized.
    #[error("failed to create backing file '{path}': {source}")]
    Create {
        /// The backing file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A read from the backing file failed.
    #[error("failed to read '{path}' at offset {offset}: {source}")]
    ReadFailed {
        /// The backing file path.
        path: String,
        /// Byte offset of the failed read.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A write to the backing file failed.
    #[error("failed to write '{path}' at offset {offset}: {source}")]
    WriteFailed {
        /// The backing file path.
        path: String,
        /// Byte offset of the failed write.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Flushing the backing file failed.
    #[error("failed to sync '{path}' to disk: {source}")]
    SyncFailed {
        /// The backing file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping the backing file failed.
    #[error("memory mapping failed for '{path}': {source}")]
    MemoryMap {
        /// The backing file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An access reached past the end of the store.
    #[error("access beyond store bounds: offset {offset} + length {length} > size {size}")]
    OutOfRange {
        /// Starting byte offset.
        offset: u64,
        /// Access length in bytes.
        length: u64,
        /// Store size in bytes.
        size: u64,
    },

    /// A write was attempted on read-only media.
    #[error("backing store '{path}' is read-only")]
    ReadOnly {
        /// The backing file path.
        path: String,
    },
}

/// Host-side disk model faults.
///
/// These indicate that the register file and the disk model disagree about
/// a tag. They are not recoverable.
#[derive(Error, Debug)]
pub enum DiskError {
    /// A request or data word named a tag outside the pool.
    #[error("tag {tag} is outside the pool of {ntags} tags")]
    TagOutOfRange {
        /// The offending tag.
        tag: TagId,
        /// Size of the tag pool.
        ntags: u8,
    },

    /// A request arrived for a tag that is still being serviced.
    #[error("request for tag {tag} arrived while the tag is {state:?}")]
    TagBusy {
        /// The offending tag.
        tag: TagId,
        /// State the tag was in.
        state: TagState,
    },

    /// A completion was posted for a tag the register file has not issued.
    #[error("completion for tag {tag} which is not outstanding (lease {lease:?})")]
    CompletionNotOutstanding {
        /// The offending tag.
        tag: TagId,
        /// Lease the tag was in, `None` if outside the pool.
        lease: Option<TagLease>,
    },

    /// A data word arrived for a tag that is not receiving write payload.
    #[error("data word for tag {tag} arrived while the tag is {state:?}")]
    UnexpectedData {
        /// The offending tag.
        tag: TagId,
        /// State the tag was in.
        state: TagState,
    },

    /// The simulation was stopped by an earlier fatal fault.
    #[error("device halted after a fatal fault")]
    Halted,
}

/// Guest driver faults.
#[derive(Error, Debug)]
pub enum DriverError {
    /// NSECTORS reads zero at probe time.
    #[error("{name}: no device attached (NSECTORS = 0)")]
    NoDevice {
        /// Device instance name.
        name: String,
    },

    /// The device reported a completion for a tag with no queued request.
    #[error("{name}: completion for tag {tag} has no in-flight request ({outstanding} requests outstanding)")]
    UnknownCompletion {
        /// Device instance name.
        name: String,
        /// The completed tag.
        tag: TagId,
        /// Requests still in flight on other tags.
        outstanding: usize,
    },

    /// The device handed out a tag whose queue is already full.
    #[error("{name}: tag {tag} issued while {queued} request(s) are still in flight on it")]
    TagReissued {
        /// Device instance name.
        name: String,
        /// The reissued tag.
        tag: TagId,
        /// Requests already queued on the tag.
        queued: usize,
    },

    /// REQUEST returned no tag although NREQUEST was non-zero.
    #[error("{name}: REQUEST returned no tag although NREQUEST reported {available}")]
    NoTagIssued {
        /// Device instance name.
        name: String,
        /// The NREQUEST value observed before submitting.
        available: u8,
    },

    /// The driver instance was stopped by an earlier fatal fault.
    #[error("{name}: driver halted after a protocol desync")]
    Halted {
        /// Device instance name.
        name: String,
    },
}

/// Guest memory transfer faults.
#[derive(Error, Debug)]
pub enum DmaError {
    /// A transfer reached outside guest memory.
    #[error("guest access at {addr:#x} + {len} bytes exceeds guest memory of {size} bytes")]
    OutOfRange {
        /// Guest physical address.
        addr: u64,
        /// Transfer length in bytes.
        len: u64,
        /// Guest memory size in bytes.
        size: usize,
    },

    /// Guest memory could not be mapped.
    #[error("failed to map {size} bytes of guest memory: {reason}")]
    Setup {
        /// Requested size in bytes.
        size: usize,
        /// Mapping failure reported by vm-memory.
        reason: String,
    },

    /// An in-range guest access failed.
    #[error("guest access at {addr:#x} + {len} bytes failed")]
    Access {
        /// Guest physical address.
        addr: u64,
        /// Transfer length in bytes.
        len: u64,
        /// Underlying guest memory error.
        #[source]
        source: vm_memory::GuestMemoryError,
    },

    /// A read response word arrived for a tag with no open transfer.
    #[error("read data for tag {tag} has no open transfer")]
    UnknownTag {
        /// The offending tag.
        tag: TagId,
    },
}

/// Type alias for `Result<T, SimBlkError>`.
pub type Result<T> = std::result::Result<T, SimBlkError>;
