//! Shared data model: request descriptors, data words, and completions.

use serde::{Deserialize, Serialize};

use crate::tags::TagId;

/// Size of one addressable sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of one streamed [`DataWord`] payload in bytes.
pub const WORD_BYTES: usize = 8;

/// Number of data words that carry one sector.
pub const WORDS_PER_SECTOR: usize = SECTOR_SIZE / WORD_BYTES;

/// A request descriptor as seen by the disk model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// `true` for a write, `false` for a read.
    pub is_write: bool,
    /// First sector of the transfer.
    pub start_sector: u32,
    /// Number of sectors to transfer.
    pub length_sectors: u32,
    /// Tag assigned by the register file.
    pub tag: TagId,
}

impl Request {
    /// Byte offset of the first sector in the backing store.
    #[inline]
    pub fn byte_offset(&self) -> u64 {
        u64::from(self.start_sector) * SECTOR_SIZE as u64
    }

    /// Transfer length in bytes.
    #[inline]
    pub fn byte_len(&self) -> u64 {
        u64::from(self.length_sectors) * SECTOR_SIZE as u64
    }

    /// One past the last sector, computed without overflow.
    #[inline]
    pub fn end_sector(&self) -> u64 {
        u64::from(self.start_sector) + u64::from(self.length_sectors)
    }

    /// Number of data words this request moves over the streaming channel.
    #[inline]
    pub fn word_count(&self) -> u64 {
        u64::from(self.length_sectors) * WORDS_PER_SECTOR as u64
    }
}

/// A submitted request together with the guest buffer address it targets.
///
/// The address never reaches the disk model; only the DMA engine uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Guest physical address of the transfer buffer.
    pub addr: u64,
    /// The request itself.
    pub request: Request,
}

/// One unit of the streaming data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataWord {
    /// Tag of the request this word belongs to.
    pub tag: TagId,
    /// Eight payload bytes, little-endian.
    pub payload: u64,
}

impl DataWord {
    /// Packs up to eight bytes into a word, zero-padding short chunks.
    pub fn from_bytes(tag: TagId, bytes: &[u8]) -> Self {
        let mut raw = [0u8; WORD_BYTES];
        let n = bytes.len().min(WORD_BYTES);
        raw[..n].copy_from_slice(&bytes[..n]);
        Self {
            tag,
            payload: u64::from_le_bytes(raw),
        }
    }

    /// Returns the payload as bytes.
    #[inline]
    pub fn to_bytes(self) -> [u8; WORD_BYTES] {
        self.payload.to_le_bytes()
    }
}

/// Outcome of one request, reported through COMPLETE_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The transfer finished.
    #[default]
    Ok,
    /// The backing store failed the transfer, or the media is read-only.
    IoError,
    /// The request exceeded the device geometry and was never executed.
    BoundsError,
}

impl CompletionStatus {
    /// Register encoding of this status.
    pub fn as_raw(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::IoError => 1,
            Self::BoundsError => 2,
        }
    }

    /// Decodes a register value; unknown codes are treated as I/O errors.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Ok,
            2 => Self::BoundsError,
            _ => Self::IoError,
        }
    }

    /// Returns `true` for [`CompletionStatus::Ok`].
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// A finished request, queued for the driver to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Tag of the finished request.
    pub tag: TagId,
    /// Its outcome.
    pub status: CompletionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_geometry() {
        let req = Request {
            is_write: true,
            start_sector: 10,
            length_sectors: 4,
            tag: TagId(0),
        };
        assert_eq!(req.byte_offset(), 5120);
        assert_eq!(req.byte_len(), 2048);
        assert_eq!(req.end_sector(), 14);
        assert_eq!(req.word_count(), 256);
    }

    #[test]
    fn test_end_sector_does_not_overflow() {
        let req = Request {
            is_write: false,
            start_sector: u32::MAX,
            length_sectors: u32::MAX,
            tag: TagId(1),
        };
        assert_eq!(req.end_sector(), 2 * u64::from(u32::MAX));
    }

    #[test]
    fn test_data_word_byte_order() {
        let word = DataWord::from_bytes(TagId(3), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(word.payload, 0x0807_0605_0403_0201);
        assert_eq!(word.to_bytes(), [1, 2, 3, 4, 5, 6, 7, 8]);

        let short = DataWord::from_bytes(TagId(3), &[0xAA]);
        assert_eq!(short.payload, 0xAA);
    }

    #[test]
    fn test_status_codes() {
        for status in [
            CompletionStatus::Ok,
            CompletionStatus::IoError,
            CompletionStatus::BoundsError,
        ] {
            assert_eq!(CompletionStatus::from_raw(status.as_raw()), status);
        }
        assert_eq!(CompletionStatus::from_raw(0x7F), CompletionStatus::IoError);
    }
}
