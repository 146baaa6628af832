//! Simulated time and latency-modeled links.
//!
//! All routers advance in lock step; [`Clock`] is a shared cycle counter
//! handed to every component so tests can drive time directly. A
//! [`Channel`] models a point-to-point link with an integer cycle latency:
//! an item sent during the write phase of cycle `t` becomes visible to the
//! receiver's read phase at cycle `t + latency`, never earlier.
//!
//! Channels are strictly single-producer/single-consumer; the phase
//! barrier of the surrounding cycle loop provides the mutual exclusion, so
//! no locking is involved.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Shared monotonic cycle counter.
///
/// Cloning yields another handle onto the same counter.
#[derive(Debug, Clone, Default)]
pub struct Clock(Rc<Cell<u64>>);

impl Clock {
    /// New clock starting at cycle 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cycle.
    #[inline]
    pub fn now(&self) -> u64 {
        self.0.get()
    }

    /// Advance by one cycle.
    #[inline]
    pub fn tick(&self) {
        self.0.set(self.0.get() + 1);
    }
}

/// One-way link carrying `T` with a fixed cycle latency.
#[derive(Debug)]
pub struct Channel<T> {
    latency: u64,
    queue: VecDeque<(u64, T)>,
}

impl<T> Channel<T> {
    /// Create a channel with the given latency (at least 1 cycle).
    pub fn new(latency: u64) -> Self {
        assert!(latency >= 1, "channel latency must be at least 1 cycle");
        Self { latency, queue: VecDeque::new() }
    }

    /// Link latency in cycles.
    #[inline]
    pub fn latency(&self) -> u64 {
        self.latency
    }

    /// Send `item` during cycle `now`; it arrives at `now + latency`.
    pub fn send(&mut self, item: T, now: u64) {
        if let Some(&(last, _)) = self.queue.back() {
            debug_assert!(last <= now + self.latency, "sends must be time ordered");
        }
        self.queue.push_back((now + self.latency, item));
    }

    /// Receive the item due at or before `now`, if any.
    ///
    /// At most one item is delivered per call; the cycle loop calls this
    /// once per cycle, matching the one-item-per-cycle link model.
    pub fn receive(&mut self, now: u64) -> Option<T> {
        match self.queue.front() {
            Some(&(due, _)) if due <= now => self.queue.pop_front().map(|(_, item)| item),
            _ => None,
        }
    }

    /// True if nothing is in flight.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of items in flight.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_handles_share_state() {
        let a = Clock::new();
        let b = a.clone();
        a.tick();
        a.tick();
        assert_eq!(b.now(), 2);
    }

    #[test]
    fn test_channel_latency() {
        let mut ch = Channel::new(2);
        ch.send(7u32, 10);
        assert_eq!(ch.receive(10), None);
        assert_eq!(ch.receive(11), None);
        assert_eq!(ch.receive(12), Some(7));
        assert_eq!(ch.receive(13), None);
        assert!(ch.is_empty());
    }

    #[test]
    fn test_channel_one_item_per_cycle() {
        let mut ch = Channel::new(1);
        ch.send(1u32, 0);
        ch.send(2u32, 1);
        assert_eq!(ch.receive(1), Some(1));
        assert_eq!(ch.receive(1), None);
        assert_eq!(ch.receive(2), Some(2));
    }
}
