//! Guest memory and the DMA engine that streams it.
//!
//! The device never touches guest memory directly. For an admitted write,
//! the DMA engine reads the guest buffer at ADDR and feeds it to the
//! inbound channel one word at a time. For a read, it takes words off the
//! outbound channel and stores them at ADDR plus the bytes delivered so far.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use vm_memory::{Bytes, GuestAddress, GuestMemory as _, GuestMemoryMmap};

use crate::channel::DataChannel;
use crate::error::{DmaError, Result};
use crate::request::{DataWord, Descriptor, WORD_BYTES};
use crate::tags::TagId;

/// Guest RAM shared between the guest and the DMA engine.
///
/// A single anonymous mapping starting at guest physical address 0. Clones
/// share the same mapping.
#[derive(Clone)]
pub struct GuestMemory {
    mem: GuestMemoryMmap,
    size: usize,
}

impl fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestMemory")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl GuestMemory {
    /// Maps `size` bytes of zeroed guest memory.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::Setup`] if the mapping cannot be created.
    pub fn new(size: usize) -> Result<Self> {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)]).map_err(|e| {
            DmaError::Setup {
                size,
                reason: e.to_string(),
            }
        })?;
        Ok(Self { mem, size })
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copies guest bytes at `addr` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::OutOfRange`] if the range leaves guest memory and
    /// [`DmaError::Access`] if the mapping refuses the copy.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        self.check(addr, len)?;
        self.mem
            .read_slice(buf, GuestAddress(addr))
            .map_err(|source| DmaError::Access { addr, len, source })?;
        Ok(())
    }

    /// Copies `data` into guest memory at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::OutOfRange`] if the range leaves guest memory.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        self.check(addr, len)?;
        self.mem
            .write_slice(data, GuestAddress(addr))
            .map_err(|source| DmaError::Access { addr, len, source })?;
        Ok(())
    }

    /// Checks that `len` bytes at `addr` lie inside guest memory.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::OutOfRange`] otherwise.
    pub fn check(&self, addr: u64, len: u64) -> Result<()> {
        let inside = addr.checked_add(len).is_some()
            && usize::try_from(len).is_ok_and(|len| self.mem.check_range(GuestAddress(addr), len));
        if inside {
            Ok(())
        } else {
            Err(DmaError::OutOfRange {
                addr,
                len,
                size: self.size,
            }
            .into())
        }
    }
}

/// One guest buffer being streamed in either direction.
#[derive(Debug, Clone, Copy)]
struct Transfer {
    tag: TagId,
    addr: u64,
    len: u64,
    done: u64,
}

impl Transfer {
    fn new(descriptor: &Descriptor) -> Self {
        Self {
            tag: descriptor.request.tag,
            addr: descriptor.addr,
            len: descriptor.request.byte_len(),
            done: 0,
        }
    }

    /// Bytes the next word covers.
    fn next_chunk(&self) -> u64 {
        (self.len - self.done).min(WORD_BYTES as u64)
    }

    fn is_done(&self) -> bool {
        self.done >= self.len
    }
}

/// Moves payload between guest memory and the streaming channels.
#[derive(Debug)]
pub struct DmaEngine {
    memory: GuestMemory,
    /// Write payloads to stream in, in admission order.
    outgoing: VecDeque<Transfer>,
    /// Read buffers being filled, by tag.
    incoming: HashMap<TagId, Transfer>,
}

impl DmaEngine {
    /// Creates an engine over `memory`.
    pub fn new(memory: GuestMemory) -> Self {
        Self {
            memory,
            outgoing: VecDeque::new(),
            incoming: HashMap::new(),
        }
    }

    /// The guest memory this engine serves.
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Returns `true` if the guest buffer named by `descriptor` lies inside
    /// guest memory.
    pub fn reaches(&self, descriptor: &Descriptor) -> bool {
        self.memory
            .check(descriptor.addr, descriptor.request.byte_len())
            .is_ok()
    }

    /// Returns `true` when no transfer is open.
    pub fn is_idle(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.is_empty()
    }

    /// Opens a write payload transfer for an admitted write.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::OutOfRange`] if the guest buffer leaves memory.
    pub fn begin_write(&mut self, descriptor: &Descriptor) -> Result<()> {
        let transfer = Transfer::new(descriptor);
        self.memory.check(transfer.addr, transfer.len)?;
        self.outgoing.push_back(transfer);
        Ok(())
    }

    /// Opens a read delivery transfer for an admitted read.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::OutOfRange`] if the guest buffer leaves memory.
    pub fn begin_read(&mut self, descriptor: &Descriptor) -> Result<()> {
        let transfer = Transfer::new(descriptor);
        self.memory.check(transfer.addr, transfer.len)?;
        self.incoming.insert(transfer.tag, transfer);
        Ok(())
    }

    /// Feeds write payload into `channel` until it is full or nothing is
    /// left. Returns the number of words pushed.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError`] if guest memory cannot be read.
    #[allow(clippy::cast_possible_truncation)] // Chunks are at most one word
    pub fn stream_payload(&mut self, channel: &mut DataChannel) -> Result<usize> {
        let mut pushed = 0;
        while !channel.is_full() {
            let Some(transfer) = self.outgoing.front_mut() else {
                break;
            };

            let mut raw = [0u8; WORD_BYTES];
            let n = transfer.next_chunk() as usize;
            self.memory.read(transfer.addr + transfer.done, &mut raw[..n])?;
            let word = DataWord::from_bytes(transfer.tag, &raw[..n]);
            if channel.push(word).is_err() {
                break;
            }
            transfer.done += n as u64;
            pushed += 1;

            if transfer.is_done() {
                self.outgoing.pop_front();
            }
        }
        Ok(pushed)
    }

    /// Stores one read word in its guest buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::UnknownTag`] if no read transfer is open for the
    /// word's tag.
    #[allow(clippy::cast_possible_truncation)] // Chunks are at most one word
    pub fn deliver(&mut self, word: DataWord) -> Result<()> {
        let Some(transfer) = self.incoming.get_mut(&word.tag) else {
            return Err(DmaError::UnknownTag { tag: word.tag }.into());
        };

        let n = transfer.next_chunk() as usize;
        self.memory
            .write(transfer.addr + transfer.done, &word.to_bytes()[..n])?;
        transfer.done += n as u64;

        if transfer.is_done() {
            self.incoming.remove(&word.tag);
        }
        Ok(())
    }
}
