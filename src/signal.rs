//! Continuation signals for the page cache loops.
//!
//! Every background loop of the page cache is driven by a tagged signal
//! which the loop handler re-sends to itself, either immediately or after
//! a delay, until its work queue drains. A signal which is already pending
//! is not queued a second time, so each loop runs at most once per pass of
//! the driver no matter how many events woke it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
/// The loops of the page cache.
pub enum Signal {
    /// Assign cache slots to requested pages.
    Bind = 0,
    /// Read bound pages in from disk.
    Map = 1,
    /// Hand resident pages to the requests waiting on them.
    Callback = 2,
    /// Write back cold dirty pages ahead of eviction.
    Cleanup = 3,
    /// Write back pages for a running checkpoint.
    Lcp = 4,
    /// Report cache statistics.
    Stats = 5,
}

impl Signal {
    #[inline]
    fn bit(self) -> u8 {
        1 << self as u8
    }
}

#[derive(Default)]
/// A queue of ready and delayed signals.
pub struct SignalQueue {
    ready: VecDeque<Signal>,
    ready_mask: u8,
    delayed: BinaryHeap<Reverse<(Instant, u64, Signal)>>,
    delayed_mask: u8,
    sequence: u64,
}

impl SignalQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a signal to run as soon as possible.
    ///
    /// Returns `false` if the signal was already ready.
    pub fn send(&mut self, signal: Signal) -> bool {
        if self.ready_mask & signal.bit() != 0 {
            return false;
        }
        self.ready_mask |= signal.bit();
        self.ready.push_back(signal);
        true
    }

    /// Queue a signal to run once `delay` has elapsed since `now`.
    ///
    /// A signal which is already ready or already delayed is not queued again.
    pub fn send_delayed(&mut self, signal: Signal, delay: Duration, now: Instant) -> bool {
        if (self.ready_mask | self.delayed_mask) & signal.bit() != 0 {
            return false;
        }
        self.delayed_mask |= signal.bit();
        self.sequence += 1;
        self.delayed
            .push(Reverse((now + delay, self.sequence, signal)));
        true
    }

    /// Returns if the signal is waiting to run, ready or delayed.
    pub fn is_pending(&self, signal: Signal) -> bool {
        (self.ready_mask | self.delayed_mask) & signal.bit() != 0
    }

    /// Pop the next signal which is due at `now`.
    ///
    /// Delayed signals which have become due are promoted to the ready queue
    /// first, unless the same signal is already ready.
    pub fn pop_ready(&mut self, now: Instant) -> Option<Signal> {
        while let Some(Reverse((deadline, _, signal))) = self.delayed.peek().copied() {
            if deadline > now {
                break;
            }
            self.delayed.pop();
            self.delayed_mask &= !signal.bit();
            self.send(signal);
        }

        let signal = self.ready.pop_front()?;
        self.ready_mask &= !signal.bit();
        Some(signal)
    }

    /// Returns if any signal is ready to run without waiting.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// The time the earliest delayed signal becomes due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((deadline, _, _))| *deadline)
    }
}

#[cfg(all(test, not(feature = "test-miri")))]
mod tests {
    use super::*;

    #[test]
    fn test_ready_signals_are_deduplicated() {
        let now = Instant::now();
        let mut queue = SignalQueue::new();
        assert!(queue.send(Signal::Bind));
        assert!(queue.send(Signal::Map));
        assert!(!queue.send(Signal::Bind));

        assert_eq!(queue.pop_ready(now), Some(Signal::Bind));
        assert!(queue.send(Signal::Bind));
        assert_eq!(queue.pop_ready(now), Some(Signal::Map));
        assert_eq!(queue.pop_ready(now), Some(Signal::Bind));
        assert_eq!(queue.pop_ready(now), None);
    }

    #[test]
    fn test_delayed_signal_becomes_ready() {
        let now = Instant::now();
        let mut queue = SignalQueue::new();
        assert!(queue.send_delayed(Signal::Cleanup, Duration::from_millis(50), now));
        assert!(!queue.send_delayed(Signal::Cleanup, Duration::from_millis(1), now));
        assert!(queue.is_pending(Signal::Cleanup));
        assert!(!queue.has_ready());

        assert_eq!(queue.pop_ready(now), None);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(50)));

        let later = now + Duration::from_millis(50);
        assert_eq!(queue.pop_ready(later), Some(Signal::Cleanup));
        assert!(!queue.is_pending(Signal::Cleanup));
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_delayed_signal_skipped_when_ready() {
        let now = Instant::now();
        let mut queue = SignalQueue::new();
        queue.send(Signal::Lcp);
        assert!(!queue.send_delayed(Signal::Lcp, Duration::ZERO, now));

        queue.send_delayed(Signal::Stats, Duration::ZERO, now);
        queue.send(Signal::Stats);
        assert_eq!(queue.pop_ready(now), Some(Signal::Lcp));
        assert_eq!(queue.pop_ready(now), Some(Signal::Stats));
        assert_eq!(queue.pop_ready(now), None);
    }

    #[test]
    fn test_delayed_signals_ordered_by_deadline() {
        let now = Instant::now();
        let mut queue = SignalQueue::new();
        queue.send_delayed(Signal::Stats, Duration::from_millis(30), now);
        queue.send_delayed(Signal::Cleanup, Duration::from_millis(10), now);
        queue.send_delayed(Signal::Lcp, Duration::from_millis(20), now);

        let later = now + Duration::from_millis(30);
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_ready(later)).collect();
        assert_eq!(order, vec![Signal::Cleanup, Signal::Lcp, Signal::Stats]);
    }
}
