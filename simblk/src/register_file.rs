//! Host side of the control region.
//!
//! [`RegisterFile`] answers the driver's register accesses the way the
//! device hardware does. It latches descriptor writes, owns the tag pool, and
//! queues submitted requests for the disk model and completions for the
//! driver.
//!
//! Side-effecting reads:
//!
//! - REQUEST takes a free tag and queues the latched descriptor under it
//! - COMPLETE pops the oldest completion, latches its status into
//!   COMPLETE_STATUS, and returns the tag to the pool
//!
//! A tag therefore becomes reusable only once the driver has drained its
//! completion. Both reads return [`INVALID_TAG`] when there is nothing to
//! take.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{DiskError, Result};
use crate::regs::{Field, RegisterBus};
use crate::request::{Completion, CompletionStatus, Descriptor, Request};
use crate::tags::{INVALID_TAG, TagId, TagLease, TagPool};

#[derive(Debug)]
struct RegisterState {
    addr: u64,
    offset: u32,
    len: u32,
    write: u8,
    tags: TagPool,
    /// Requests submitted through REQUEST, not yet taken by the bridge.
    submitted: VecDeque<Descriptor>,
    /// Completions posted by the bridge, not yet drained by the driver.
    completions: VecDeque<Completion>,
    last_status: CompletionStatus,
    nsectors: u32,
    max_request_length: u32,
}

/// The simulated device's control region.
#[derive(Debug)]
pub struct RegisterFile {
    state: Mutex<RegisterState>,
}

impl RegisterFile {
    /// Creates a register file advertising the given geometry.
    pub fn new(ntags: u8, nsectors: u32, max_request_length: u32) -> Self {
        Self {
            state: Mutex::new(RegisterState {
                addr: 0,
                offset: 0,
                len: 0,
                write: 0,
                tags: TagPool::new(ntags),
                submitted: VecDeque::new(),
                completions: VecDeque::new(),
                last_status: CompletionStatus::Ok,
                nsectors,
                max_request_length,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegisterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes every request submitted since the last call, oldest first.
    pub fn take_submitted(&self) -> Vec<Descriptor> {
        self.lock().submitted.drain(..).collect()
    }

    /// Queues a completion for the driver.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError::CompletionNotOutstanding`] if `completion.tag`
    /// was not issued or already has a completion posted.
    pub fn post_completion(&self, completion: Completion) -> Result<()> {
        let mut state = self.lock();
        state.tags.complete(completion.tag).map_err(|lease| {
            tracing::error!(tag = %completion.tag, ?lease, "completion for tag not outstanding");
            DiskError::CompletionNotOutstanding {
                tag: completion.tag,
                lease,
            }
        })?;
        state.completions.push_back(completion);
        Ok(())
    }

    /// Requests submitted and not yet taken.
    pub fn submitted_len(&self) -> usize {
        self.lock().submitted.len()
    }

    /// Completions waiting for the driver.
    pub fn pending_completions(&self) -> usize {
        self.lock().completions.len()
    }

    /// Tags available to REQUEST.
    pub fn free_tags(&self) -> u8 {
        self.lock().tags.available()
    }

    /// Lease state of `tag`.
    pub fn tag_lease(&self, tag: TagId) -> Option<TagLease> {
        self.lock().tags.lease(tag)
    }

    /// Advertised capacity in sectors.
    pub fn nsectors(&self) -> u32 {
        self.lock().nsectors
    }
}

impl RegisterState {
    fn submit(&mut self) -> u8 {
        let Some(tag) = self.tags.allocate() else {
            tracing::warn!("REQUEST read with no free tag");
            return INVALID_TAG;
        };
        let descriptor = Descriptor {
            addr: self.addr,
            request: Request {
                is_write: self.write != 0,
                start_sector: self.offset,
                length_sectors: self.len,
                tag,
            },
        };
        tracing::debug!(%tag, ?descriptor, "request submitted");
        self.submitted.push_back(descriptor);
        tag.0
    }

    fn pop_completion(&mut self) -> u8 {
        let Some(completion) = self.completions.pop_front() else {
            tracing::warn!("COMPLETE read with no pending completion");
            return INVALID_TAG;
        };
        if let Err(lease) = self.tags.release(completion.tag) {
            tracing::error!(tag = %completion.tag, ?lease, "drained tag was not completed");
        }
        self.last_status = completion.status;
        completion.tag.0
    }
}

impl RegisterBus for RegisterFile {
    fn read(&self, offset: usize, width: usize) -> u64 {
        let Some(field) = Field::decode(offset, width) else {
            tracing::warn!(offset, width, "read of unmapped register");
            return 0;
        };

        let mut state = self.lock();
        match field {
            Field::Addr => state.addr,
            Field::Offset => u64::from(state.offset),
            Field::Len => u64::from(state.len),
            Field::Write => u64::from(state.write),
            Field::Request => u64::from(state.submit()),
            Field::NRequest => u64::from(state.tags.available()),
            Field::Complete => u64::from(state.pop_completion()),
            Field::NComplete => state.completions.len().min(usize::from(u8::MAX)) as u64,
            Field::CompleteStatus => u64::from(state.last_status.as_raw()),
            Field::NSectors => u64::from(state.nsectors),
            Field::MaxRequestLength => u64::from(state.max_request_length),
        }
    }

    #[allow(clippy::cast_possible_truncation)] // Field::decode matched the access width
    fn write(&self, offset: usize, width: usize, value: u64) {
        let field = match Field::decode(offset, width) {
            Some(field) if field.driver_writes() => field,
            other => {
                tracing::warn!(offset, width, field = ?other, "write to read-only or unmapped register ignored");
                return;
            }
        };

        let mut state = self.lock();
        match field {
            Field::Addr => state.addr = value,
            Field::Offset => state.offset = value as u32,
            Field::Len => state.len = value as u32,
            Field::Write => state.write = value as u8,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{
        ADDR, COMPLETE, COMPLETE_STATUS, LEN, MAX_REQUEST_LENGTH, NCOMPLETE, NREQUEST, NSECTORS,
        OFFSET, REQUEST, WRITE,
    };

    fn submit(regs: &RegisterFile, addr: u64, sector: u32, len: u32, write: bool) -> u8 {
        ADDR.write(regs, addr);
        OFFSET.write(regs, sector);
        LEN.write(regs, len);
        WRITE.write(regs, u8::from(write));
        REQUEST.read(regs)
    }

    #[test]
    fn test_geometry_registers() {
        let regs = RegisterFile::new(4, 128, 8);
        assert_eq!(NSECTORS.read(&regs), 128);
        assert_eq!(MAX_REQUEST_LENGTH.read(&regs), 8);
        assert_eq!(NREQUEST.read(&regs), 4);
        assert_eq!(NCOMPLETE.read(&regs), 0);
    }

    #[test]
    fn test_request_read_latches_descriptor() {
        let regs = RegisterFile::new(2, 128, 8);
        let tag = submit(&regs, 0x4000, 10, 4, true);
        assert_eq!(tag, 0);
        assert_eq!(NREQUEST.read(&regs), 1);

        let submitted = regs.take_submitted();
        assert_eq!(
            submitted,
            vec![Descriptor {
                addr: 0x4000,
                request: Request {
                    is_write: true,
                    start_sector: 10,
                    length_sectors: 4,
                    tag: TagId(0),
                },
            }]
        );
        assert!(regs.take_submitted().is_empty());
    }

    #[test]
    fn test_exhausted_pool_returns_invalid_tag() {
        let regs = RegisterFile::new(1, 128, 8);
        assert_eq!(submit(&regs, 0, 0, 1, false), 0);
        assert_eq!(NREQUEST.read(&regs), 0);
        assert_eq!(submit(&regs, 0, 1, 1, false), INVALID_TAG);
        assert_eq!(regs.take_submitted().len(), 1);
    }

    #[test]
    fn test_tag_reusable_only_after_drain() {
        let regs = RegisterFile::new(1, 128, 8);
        let tag = TagId(submit(&regs, 0, 0, 1, true));

        regs.post_completion(Completion {
            tag,
            status: CompletionStatus::BoundsError,
        })
        .unwrap();
        assert_eq!(NREQUEST.read(&regs), 0, "posted but undrained tag must stay leased");
        assert_eq!(regs.tag_lease(tag), Some(TagLease::Completed));
        assert_eq!(NCOMPLETE.read(&regs), 1);

        assert_eq!(COMPLETE.read(&regs), tag.0);
        assert_eq!(COMPLETE_STATUS.read(&regs), CompletionStatus::BoundsError.as_raw());
        assert_eq!(NREQUEST.read(&regs), 1);
        assert_eq!(COMPLETE.read(&regs), INVALID_TAG);
    }

    #[test]
    fn test_post_completion_for_free_tag_fails() {
        let regs = RegisterFile::new(2, 128, 8);
        let err = regs
            .post_completion(Completion {
                tag: TagId(1),
                status: CompletionStatus::Ok,
            })
            .unwrap_err();
        assert!(err.to_string().contains("tag 1"));
    }

    #[test]
    fn test_host_fields_ignore_writes() {
        let regs = RegisterFile::new(2, 128, 8);
        regs.write(Field::NSectors.offset(), 4, 1);
        regs.write(Field::NRequest.offset(), 1, 0);
        regs.write(0x16, 1, 0xFF);
        assert_eq!(NSECTORS.read(&regs), 128);
        assert_eq!(NREQUEST.read(&regs), 2);
        assert_eq!(regs.read(0x16, 1), 0);
    }
}
