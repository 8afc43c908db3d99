//! Tick-based completion delay.
//!
//! Device latency is counted in simulated ticks, never wall-clock time. A
//! completion scheduled with delay `d` during tick `T` fires during tick
//! `T + d`; a delay of zero still waits for the next tick, so a completion is
//! never signaled in the tick that produced it. Completions due in the same
//! tick fire in the order they were scheduled.

use std::collections::BTreeMap;

use crate::request::Completion;

/// Deterministic countdown of pending completions.
#[derive(Debug, Default)]
pub struct LatencyScheduler {
    /// Ticks advanced so far.
    now: u64,
    /// Tie-breaker preserving schedule order within one due tick.
    seq: u64,
    /// Pending completions keyed by (due tick, sequence).
    pending: BTreeMap<(u64, u64), Completion>,
}

impl LatencyScheduler {
    /// Creates an empty scheduler at tick zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tick.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Number of completions still counting down.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is counting down.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Tick at which the next completion fires.
    #[cfg(test)]
    pub fn next_due(&self) -> Option<u64> {
        self.pending.keys().next().map(|&(due, _)| due)
    }

    /// Schedules `completion` to fire `delay` ticks from now and returns the
    /// due tick.
    pub fn schedule(&mut self, completion: Completion, delay: u64) -> u64 {
        let due = self.now.saturating_add(delay.max(1));
        self.pending.insert((due, self.seq), completion);
        self.seq += 1;
        due
    }

    /// Advances one tick and returns every completion that is now due.
    pub fn advance(&mut self) -> Vec<Completion> {
        self.now += 1;
        let mut fired = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > self.now {
                break;
            }
            fired.push(entry.remove());
        }
        fired
    }
}
