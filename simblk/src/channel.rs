//! Streaming data channel between the DMA fabric and the disk model.
//!
//! A channel carries at most `capacity` [`DataWord`]s per tick. The producer
//! pushes until the channel refuses; the consumer pulls everything that made
//! it through, which frees the channel for the next tick.

use std::collections::VecDeque;

use crate::request::DataWord;

/// Bounded FIFO of data words.
#[derive(Debug)]
pub struct DataChannel {
    queue: VecDeque<DataWord>,
    capacity: usize,
}

impl DataChannel {
    /// Creates a channel that accepts up to `capacity` words between pulls.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum words in flight.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Words currently queued.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no words are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns `true` if the next push would be refused.
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// Offers a word to the channel.
    ///
    /// # Errors
    ///
    /// Hands the word back when the channel is full. This is backpressure,
    /// not a failure: retry on a later tick.
    pub fn push(&mut self, word: DataWord) -> Result<(), DataWord> {
        if self.is_full() {
            return Err(word);
        }
        self.queue.push_back(word);
        Ok(())
    }

    /// Takes the oldest word.
    pub fn pull(&mut self) -> Option<DataWord> {
        self.queue.pop_front()
    }
}
