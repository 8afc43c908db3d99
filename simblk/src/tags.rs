//! Tag identifiers and the host-side tag pool.
//!
//! A tag names one in-flight request. The pool hands tags out in FIFO order
//! and takes one back only after the driver has drained its completion, so
//! a tag can never be issued twice while the driver still references it.
//!
//! ```text
//! Free --allocate--> Issued --complete--> Completed --release--> Free
//! ```

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Raw REQUEST value meaning "no tag available".
///
/// Tag pools are limited to 254 entries so this value never names a tag.
pub const INVALID_TAG: u8 = u8::MAX;

/// Identifier of one in-flight request, in `0..ntags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagId(pub u8);

impl TagId {
    /// Returns the tag as a table index.
    #[inline]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle position of one tag inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagLease {
    /// Available for the next REQUEST read.
    Free,
    /// Handed to the driver; the disk model is servicing it.
    Issued,
    /// Completion posted; waiting for the driver to drain it.
    Completed,
}

/// Finite pool of tags owned by the register file.
#[derive(Debug)]
pub struct TagPool {
    /// Free tags in the order they will be handed out.
    free: VecDeque<TagId>,
    /// Lease state per tag, indexed by tag.
    leases: Vec<TagLease>,
}

impl TagPool {
    /// Creates a pool of `ntags` tags, all free, handed out lowest first.
    pub fn new(ntags: u8) -> Self {
        Self {
            free: (0..ntags).map(TagId).collect(),
            leases: vec![TagLease::Free; usize::from(ntags)],
        }
    }

    /// Returns the pool size.
    #[cfg(test)]
    #[allow(clippy::cast_possible_truncation)] // Built from a u8 count
    pub fn capacity(&self) -> u8 {
        self.leases.len() as u8
    }

    /// Returns the number of tags that can be allocated right now.
    #[allow(clippy::cast_possible_truncation)] // Bounded by capacity()
    pub fn available(&self) -> u8 {
        self.free.len() as u8
    }

    /// Returns the lease state of `tag`, or `None` if it is outside the pool.
    pub fn lease(&self, tag: TagId) -> Option<TagLease> {
        self.leases.get(tag.index()).copied()
    }

    /// Takes the oldest free tag.
    pub fn allocate(&mut self) -> Option<TagId> {
        let tag = self.free.pop_front()?;
        self.leases[tag.index()] = TagLease::Issued;
        Some(tag)
    }

    /// Marks an issued tag as having a posted completion.
    ///
    /// # Errors
    ///
    /// Returns the tag's current lease if it was not `Issued`.
    pub fn complete(&mut self, tag: TagId) -> Result<(), Option<TagLease>> {
        self.transition(tag, TagLease::Issued, TagLease::Completed)
    }

    /// Returns a drained tag to the free list.
    ///
    /// # Errors
    ///
    /// Returns the tag's current lease if it was not `Completed`.
    pub fn release(&mut self, tag: TagId) -> Result<(), Option<TagLease>> {
        self.transition(tag, TagLease::Completed, TagLease::Free)?;
        self.free.push_back(tag);
        Ok(())
    }

    fn transition(
        &mut self,
        tag: TagId,
        from: TagLease,
        to: TagLease,
    ) -> Result<(), Option<TagLease>> {
        match self.leases.get_mut(tag.index()) {
            Some(lease) if *lease == from => {
                *lease = to;
                Ok(())
            }
            Some(lease) => Err(Some(*lease)),
            None => Err(None),
        }
    }
}
