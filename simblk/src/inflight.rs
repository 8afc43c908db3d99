//! Driver-side table of requests the device is working on.
//!
//! Each issued tag owns a FIFO of [`InFlightEntry`]s. A completion for a tag
//! always retires the head of that tag's FIFO.

use std::collections::{HashMap, VecDeque};

use crate::block::BlockOp;
use crate::tags::TagId;

/// A request handed to the device and not yet completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightEntry<H> {
    /// Block layer handle to return on completion.
    pub handle: H,
    /// Tag the device issued for the request.
    pub tag: TagId,
    /// Operation kind.
    pub op: BlockOp,
    /// First sector.
    pub sector: u32,
    /// Sector count.
    pub nr_sectors: u32,
}

/// Per-tag FIFOs of in-flight requests with a bounded depth.
#[derive(Debug)]
pub struct InFlightTable<H> {
    queues: HashMap<TagId, VecDeque<InFlightEntry<H>>>,
    max_per_tag: usize,
    len: usize,
}

impl<H> InFlightTable<H> {
    /// Creates an empty table allowing `max_per_tag` entries per tag.
    pub fn new(max_per_tag: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_per_tag,
            len: 0,
        }
    }

    /// Appends `entry` to its tag's FIFO.
    ///
    /// On failure the entry is handed back together with the number of
    /// entries already queued on the tag.
    pub fn insert(&mut self, entry: InFlightEntry<H>) -> Result<(), (InFlightEntry<H>, usize)> {
        let queue = self.queues.entry(entry.tag).or_default();
        if queue.len() >= self.max_per_tag {
            return Err((entry, queue.len()));
        }
        queue.push_back(entry);
        self.len += 1;
        Ok(())
    }

    /// Removes the oldest entry queued on `tag`.
    pub fn pop(&mut self, tag: TagId) -> Option<InFlightEntry<H>> {
        let queue = self.queues.get_mut(&tag)?;
        let entry = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(&tag);
        }
        self.len -= 1;
        Some(entry)
    }

    /// Entries queued on `tag`.
    #[cfg(test)]
    pub fn queued(&self, tag: TagId) -> usize {
        self.queues.get(&tag).map_or(0, VecDeque::len)
    }

    /// Total entries across all tags.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes every entry, oldest first within each tag.
    pub fn drain(&mut self) -> Vec<InFlightEntry<H>> {
        self.len = 0;
        self.queues.drain().flat_map(|(_, queue)| queue).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(handle: u32, tag: u8) -> InFlightEntry<u32> {
        InFlightEntry {
            handle,
            tag: TagId(tag),
            op: BlockOp::Write,
            sector: handle,
            nr_sectors: 1,
        }
    }

    #[test]
    fn test_fifo_per_tag() {
        let mut table = InFlightTable::new(3);
        table.insert(entry(1, 0)).unwrap();
        table.insert(entry(2, 1)).unwrap();
        table.insert(entry(3, 0)).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.queued(TagId(0)), 2);

        assert_eq!(table.pop(TagId(0)).map(|e| e.handle), Some(1));
        assert_eq!(table.pop(TagId(0)).map(|e| e.handle), Some(3));
        assert_eq!(table.pop(TagId(0)), None);
        assert_eq!(table.pop(TagId(1)).map(|e| e.handle), Some(2));
        assert!(table.is_empty());
    }

    #[test]
    fn test_depth_bound() {
        let mut table = InFlightTable::new(1);
        table.insert(entry(1, 2)).unwrap();
        let (rejected, queued) = table.insert(entry(2, 2)).unwrap_err();
        assert_eq!(rejected.handle, 2);
        assert_eq!(queued, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = InFlightTable::new(2);
        table.insert(entry(1, 0)).unwrap();
        table.insert(entry(2, 1)).unwrap();
        let mut handles: Vec<u32> = table.drain().into_iter().map(|e| e.handle).collect();
        handles.sort_unstable();
        assert_eq!(handles, vec![1, 2]);
        assert!(table.is_empty());
        assert_eq!(table.queued(TagId(0)), 0);
    }
}
