//! Boundary with the operating system's block layer.
//!
//! The block layer hands the driver one [`BlockRequest`] at a time. It owns
//! the request handle: the driver returns it through
//! [`BlockLayer::end_request`] when the device finishes, or gives the whole
//! request back when it cannot take it yet.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::request::CompletionStatus;

/// Operation kinds the block layer may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOp {
    /// Read sectors into the buffer.
    Read,
    /// Write sectors from the buffer.
    Write,
    /// Drop sector contents. Accepted without device interaction.
    Discard,
    /// Persist prior writes. Accepted without device interaction.
    Flush,
    /// Zero sectors without a payload. Not supported.
    WriteZeroes,
    /// Securely erase sectors. Not supported.
    SecureErase,
}

/// Final status of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoStatus {
    /// Success.
    Ok,
    /// The device failed the transfer.
    IoError,
    /// The request fell outside the device geometry.
    OutOfRange,
}

impl From<CompletionStatus> for IoStatus {
    fn from(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Ok => Self::Ok,
            CompletionStatus::IoError => Self::IoError,
            CompletionStatus::BoundsError => Self::OutOfRange,
        }
    }
}

/// One request from the block layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest<H> {
    /// Operation kind.
    pub op: BlockOp,
    /// First sector.
    pub sector: u32,
    /// Sector count.
    pub nr_sectors: u32,
    /// Guest physical address of the data buffer.
    pub buffer_addr: u64,
    /// Block layer handle, returned on completion.
    pub handle: H,
}

impl<H> BlockRequest<H> {
    /// Builds a read request.
    pub fn read(sector: u32, nr_sectors: u32, buffer_addr: u64, handle: H) -> Self {
        Self {
            op: BlockOp::Read,
            sector,
            nr_sectors,
            buffer_addr,
            handle,
        }
    }

    /// Builds a write request.
    pub fn write(sector: u32, nr_sectors: u32, buffer_addr: u64, handle: H) -> Self {
        Self {
            op: BlockOp::Write,
            sector,
            nr_sectors,
            buffer_addr,
            handle,
        }
    }

    /// Builds a request with no data buffer (flush, discard, ...).
    pub fn control(op: BlockOp, handle: H) -> Self {
        Self {
            op,
            sector: 0,
            nr_sectors: 0,
            buffer_addr: 0,
            handle,
        }
    }
}

/// Upcalls from the driver into the block layer.
pub trait BlockLayer: Send + Sync {
    /// Request handle type.
    type Handle: Send;

    /// Reports a finished request.
    fn end_request(&self, handle: Self::Handle, status: IoStatus);

    /// The driver stopped accepting requests because the device is full.
    fn stop_queue(&self) {}

    /// The driver can accept requests again; re-present held requests.
    fn start_queue(&self);
}

impl<L: BlockLayer + ?Sized> BlockLayer for Arc<L> {
    type Handle = L::Handle;

    fn end_request(&self, handle: Self::Handle, status: IoStatus) {
        (**self).end_request(handle, status);
    }

    fn stop_queue(&self) {
        (**self).stop_queue();
    }

    fn start_queue(&self) {
        (**self).start_queue();
    }
}

/// Block layer that records every upcall.
#[derive(Debug)]
pub struct RecordingLayer<H> {
    completed: Mutex<Vec<(H, IoStatus)>>,
    stops: AtomicUsize,
    starts: AtomicUsize,
}

impl<H> Default for RecordingLayer<H> {
    fn default() -> Self {
        Self {
            completed: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        }
    }
}

impl<H> RecordingLayer<H> {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every completion recorded so far, in completion order.
    pub fn take_completed(&self) -> Vec<(H, IoStatus)> {
        std::mem::take(&mut *self.completed.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of completions recorded and not yet taken.
    pub fn completed_len(&self) -> usize {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of `stop_queue` upcalls.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::Acquire)
    }

    /// Number of `start_queue` upcalls.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::Acquire)
    }
}

impl<H: Send> BlockLayer for RecordingLayer<H> {
    type Handle = H;

    fn end_request(&self, handle: H, status: IoStatus) {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, status));
    }

    fn stop_queue(&self) {
        self.stops.fetch_add(1, Ordering::AcqRel);
    }

    fn start_queue(&self) {
        self.starts.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(IoStatus::from(CompletionStatus::Ok), IoStatus::Ok);
        assert_eq!(IoStatus::from(CompletionStatus::IoError), IoStatus::IoError);
        assert_eq!(
            IoStatus::from(CompletionStatus::BoundsError),
            IoStatus::OutOfRange
        );
    }

    #[test]
    fn test_recording_layer_through_arc() {
        let layer = Arc::new(RecordingLayer::new());
        let shared: Arc<RecordingLayer<&str>> = Arc::clone(&layer);

        shared.end_request("a", IoStatus::Ok);
        shared.end_request("b", IoStatus::IoError);
        shared.stop_queue();
        shared.start_queue();

        assert_eq!(layer.completed_len(), 2);
        assert_eq!(
            layer.take_completed(),
            vec![("a", IoStatus::Ok), ("b", IoStatus::IoError)]
        );
        assert_eq!(layer.completed_len(), 0);
        assert_eq!((layer.stops(), layer.starts()), (1, 1));
    }
}
