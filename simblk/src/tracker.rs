//! Write payload reassembly.

use crate::request::{DataWord, Request, WORD_BYTES};
use crate::tags::TagId;

/// Accumulates the streamed payload of one write request.
///
/// The tracker is created when the disk model admits a write and is consumed
/// by [`WriteTracker::into_commit`] once every byte has arrived.
#[derive(Debug)]
pub struct WriteTracker {
    tag: TagId,
    destination_offset: u64,
    bytes_received: usize,
    total_bytes: usize,
    buffer: Vec<u8>,
}

impl WriteTracker {
    /// Creates a tracker sized for `request`.
    #[allow(clippy::cast_possible_truncation)] // Bounded by max_request_length * 512
    pub fn new(request: &Request) -> Self {
        let total_bytes = request.byte_len() as usize;
        Self {
            tag: request.tag,
            destination_offset: request.byte_offset(),
            bytes_received: 0,
            total_bytes,
            buffer: vec![0; total_bytes],
        }
    }

    /// Tag of the write being reassembled.
    pub fn tag(&self) -> TagId {
        self.tag
    }

    /// Byte offset the payload will be written to.
    pub fn destination_offset(&self) -> u64 {
        self.destination_offset
    }

    /// Payload bytes received so far.
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Payload bytes expected in total.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Returns `true` once every payload byte has arrived.
    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.total_bytes
    }

    /// Appends one word and returns `true` if the payload is now complete.
    ///
    /// Words arriving after completion are ignored.
    pub fn append(&mut self, word: DataWord) -> bool {
        let remaining = self.total_bytes - self.bytes_received;
        let n = remaining.min(WORD_BYTES);
        let start = self.bytes_received;
        self.buffer[start..start + n].copy_from_slice(&word.to_bytes()[..n]);
        self.bytes_received += n;
        self.is_complete()
    }

    /// Releases the tracker, yielding the destination offset and payload.
    pub fn into_commit(self) -> (u64, Vec<u8>) {
        (self.destination_offset, self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::WORDS_PER_SECTOR;

    fn write_request(start_sector: u32, length_sectors: u32) -> Request {
        Request {
            is_write: true,
            start_sector,
            length_sectors,
            tag: TagId(2),
        }
    }

    #[test]
    fn test_reassembles_in_order() {
        let mut tracker = WriteTracker::new(&write_request(3, 1));
        assert_eq!(tracker.destination_offset(), 1536);
        assert_eq!(tracker.total_bytes(), 512);

        for i in 0..WORDS_PER_SECTOR as u64 {
            let done = tracker.append(DataWord {
                tag: TagId(2),
                payload: i,
            });
            assert_eq!(done, i == WORDS_PER_SECTOR as u64 - 1);
        }

        let (offset, buffer) = tracker.into_commit();
        assert_eq!(offset, 1536);
        assert_eq!(&buffer[0..8], &0u64.to_le_bytes());
        assert_eq!(&buffer[504..512], &63u64.to_le_bytes());
    }

    #[test]
    fn test_progress_counters() {
        let mut tracker = WriteTracker::new(&write_request(0, 2));
        assert!(!tracker.is_complete());
        tracker.append(DataWord {
            tag: TagId(2),
            payload: u64::MAX,
        });
        assert_eq!(tracker.bytes_received(), 8);
        assert_eq!(tracker.tag(), TagId(2));
    }

    #[test]
    fn test_extra_words_ignored() {
        let mut tracker = WriteTracker::new(&write_request(0, 1));
        for _ in 0..WORDS_PER_SECTOR {
            tracker.append(DataWord {
                tag: TagId(2),
                payload: 7,
            });
        }
        assert!(tracker.append(DataWord {
            tag: TagId(2),
            payload: 9,
        }));
        assert_eq!(tracker.bytes_received(), 512);
    }
}
