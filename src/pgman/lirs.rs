//! The LIRS replacement policy.
//!
//! Entries are classified as hot (low inter-reference recency) or cold. The
//! stack orders hot entries and recently seen cold entries by recency, with
//! the most recent reference at the back and the oldest at the front. The
//! queue holds the resident cold entries in FIFO order, victims are taken
//! from its front.
//!
//! The front of the stack is always a hot entry. A hot entry is never on the
//! queue, and locked entries are on neither list.

use slab::Slab;

use super::entry::{
    BOUND,
    HOT,
    LOCKED,
    ONQUEUE,
    ONSTACK,
    PageEntry,
    QUEUE_LINK,
    STACK_LINK,
};
use super::list::ListHead;

/// The LIRS stack and queue over the page entries.
pub(crate) struct Lirs {
    stack: ListHead,
    queue: ListHead,
    num_hot: usize,
    hot_quota: usize,
    /// The next queue entry the cleanup loop inspects.
    cleanup_cursor: Option<u32>,
}

impl Lirs {
    pub(crate) fn new(hot_quota: usize) -> Self {
        Self {
            stack: ListHead::new(STACK_LINK),
            queue: ListHead::new(QUEUE_LINK),
            num_hot: 0,
            hot_quota,
            cleanup_cursor: None,
        }
    }

    #[inline]
    pub(crate) fn num_hot(&self) -> usize {
        self.num_hot
    }

    #[inline]
    pub(crate) fn stack(&self) -> &ListHead {
        &self.stack
    }

    #[inline]
    pub(crate) fn queue(&self) -> &ListHead {
        &self.queue
    }

    /// Record a reference to the entry.
    ///
    /// Entries pruned from the stack which have no other reason to exist are
    /// pushed to `released`, the caller removes them from the table.
    pub(crate) fn reference(
        &mut self,
        entries: &mut Slab<PageEntry>,
        id: u32,
        released: &mut Vec<u32>,
    ) {
        let state = entries[id as usize].state;
        if state.any(LOCKED) {
            return;
        }

        if state.any(HOT) {
            let was_bottom = self.stack.first() == Some(id);
            self.stack.move_to_back(entries, id);
            if was_bottom {
                self.prune(entries, released);
            }
            return;
        }

        // Until the hot set is full every referenced entry becomes hot.
        if self.num_hot < self.hot_quota {
            self.remove_from_queue(entries, id);
            if state.any(ONSTACK) {
                self.stack.move_to_back(entries, id);
            } else {
                self.stack.push_back(entries, id);
            }
            self.set_bits(entries, id, HOT | ONSTACK);
            self.num_hot += 1;
            return;
        }

        if state.any(ONSTACK) {
            // Cold entry with a short reuse distance, it swaps places with
            // the coldest hot entry.
            self.remove_from_queue(entries, id);
            self.stack.move_to_back(entries, id);
            self.set_bits(entries, id, HOT);
            self.num_hot += 1;
            self.demote_bottom(entries);
            self.prune(entries, released);
            return;
        }

        self.stack.push_back(entries, id);
        self.set_bits(entries, id, ONSTACK);
        if state.any(ONQUEUE) {
            self.queue.move_to_back(entries, id);
        }
    }

    /// Register a newly bound entry, resident cold entries join the queue.
    pub(crate) fn bound(&mut self, entries: &mut Slab<PageEntry>, id: u32) {
        let state = entries[id as usize].state;
        debug_assert!(state.any(BOUND));
        if state.any(HOT | LOCKED | ONQUEUE) {
            return;
        }
        self.queue.push_back(entries, id);
        self.set_bits(entries, id, ONQUEUE);
    }

    /// Remove the entry from both lists, for example when it is locked or dropped.
    pub(crate) fn remove(
        &mut self,
        entries: &mut Slab<PageEntry>,
        id: u32,
        released: &mut Vec<u32>,
    ) {
        let state = entries[id as usize].state;
        self.remove_from_queue(entries, id);

        if state.any(ONSTACK) {
            let was_bottom = self.stack.first() == Some(id);
            self.stack.remove(entries, id);
            self.clear_bits(entries, id, ONSTACK);
            if state.any(HOT) {
                self.clear_bits(entries, id, HOT);
                self.num_hot -= 1;
            }
            if was_bottom {
                self.prune(entries, released);
            }
        }
    }

    /// Remove an evicted entry from the queue, it stays on the stack as history.
    pub(crate) fn evicted(&mut self, entries: &mut Slab<PageEntry>, id: u32) {
        debug_assert!(!entries[id as usize].state.any(HOT));
        self.remove_from_queue(entries, id);
    }

    /// The eviction candidate at the front of the queue.
    pub(crate) fn victim(&self) -> Option<u32> {
        self.queue.first()
    }

    /// Find the oldest cold entry on the stack which holds no cache slot.
    ///
    /// These entries only carry reference history and are given up first when
    /// the table runs out of entries.
    pub(crate) fn oldest_history_entry(&self, entries: &Slab<PageEntry>) -> Option<u32> {
        self.stack.iter(entries).find(|id| {
            let entry = &entries[*id as usize];
            !entry.state.any(HOT) && entry.state.sublist().is_none()
        })
    }

    /// Take the next queue entry for the cleanup loop.
    ///
    /// The cursor wraps around to the front of the queue once it falls off the end.
    pub(crate) fn next_cleanup(&mut self, entries: &Slab<PageEntry>) -> Option<u32> {
        let id = self.cleanup_cursor.or_else(|| self.queue.first())?;
        self.cleanup_cursor = self.queue.next(entries, id);
        Some(id)
    }

    fn demote_bottom(&mut self, entries: &mut Slab<PageEntry>) {
        let Some(bottom) = self.stack.first() else {
            return;
        };
        debug_assert!(entries[bottom as usize].state.any(HOT));
        self.stack.remove(entries, bottom);
        self.clear_bits(entries, bottom, HOT | ONSTACK);
        self.num_hot -= 1;
        if entries[bottom as usize].state.any(BOUND) {
            self.queue.push_back(entries, bottom);
            self.set_bits(entries, bottom, ONQUEUE);
        }
    }

    fn prune(&mut self, entries: &mut Slab<PageEntry>, released: &mut Vec<u32>) {
        while let Some(bottom) = self.stack.first() {
            let state = entries[bottom as usize].state;
            if state.any(HOT) {
                break;
            }
            self.stack.remove(entries, bottom);
            self.clear_bits(entries, bottom, ONSTACK);
            if state.sublist().is_none() {
                released.push(bottom);
            }
        }
    }

    fn remove_from_queue(&mut self, entries: &mut Slab<PageEntry>, id: u32) {
        if !entries[id as usize].state.any(ONQUEUE) {
            return;
        }
        if self.cleanup_cursor == Some(id) {
            self.cleanup_cursor = self.queue.next(entries, id);
        }
        self.queue.remove(entries, id);
        self.clear_bits(entries, id, ONQUEUE);
    }

    #[inline]
    fn set_bits(&self, entries: &mut Slab<PageEntry>, id: u32, bits: u16) {
        let entry = &mut entries[id as usize];
        entry.state = entry.state.with(bits);
    }

    #[inline]
    fn clear_bits(&self, entries: &mut Slab<PageEntry>, id: u32, bits: u16) {
        let entry = &mut entries[id as usize];
        entry.state = entry.state.without(bits);
    }

    /// Check the structural invariants of the stack and queue.
    pub(crate) fn check(&self, entries: &Slab<PageEntry>) -> Result<(), String> {
        if let Some(bottom) = self.stack.first()
            && !entries[bottom as usize].state.any(HOT)
        {
            return Err(format!("stack bottom {bottom} is not hot"));
        }

        let mut num_hot = 0;
        let mut stack_len = 0;
        let mut queue_len = 0;
        for (id, entry) in entries.iter() {
            let state = entry.state;
            if state.any(HOT) {
                num_hot += 1;
                if !state.any(ONSTACK) {
                    return Err(format!("hot entry {id} is not on the stack"));
                }
                if state.any(ONQUEUE) {
                    return Err(format!("hot entry {id} is on the queue"));
                }
            }
            if state.any(LOCKED) && state.any(ONSTACK | ONQUEUE) {
                return Err(format!("locked entry {id} is on the LIRS lists: {state:?}"));
            }
            if state.any(ONQUEUE) && !state.any(BOUND) {
                return Err(format!("queued entry {id} is not resident"));
            }
            stack_len += state.any(ONSTACK) as usize;
            queue_len += state.any(ONQUEUE) as usize;
        }

        if num_hot != self.num_hot {
            return Err(format!("hot count {} != {num_hot}", self.num_hot));
        }
        if num_hot > self.hot_quota {
            return Err(format!("hot count {num_hot} exceeds quota {}", self.hot_quota));
        }
        if stack_len != self.stack.len() || stack_len != self.stack.iter(entries).count() {
            return Err(format!("stack length mismatch {stack_len} != {}", self.stack.len()));
        }
        if queue_len != self.queue.len() || queue_len != self.queue.iter(entries).count() {
            return Err(format!("queue length mismatch {queue_len} != {}", self.queue.len()));
        }
        Ok(())
    }
}

#[cfg(feature = "bench-internal")]
/// Replays references against the LIRS engine over a set of resident pages.
pub struct LirsSimulation {
    entries: Slab<PageEntry>,
    lirs: Lirs,
    released: Vec<u32>,
}

#[cfg(feature = "bench-internal")]
impl LirsSimulation {
    /// Create a simulation of `num_pages` resident pages.
    pub fn new(num_pages: u32, hot_quota: usize) -> Self {
        let mut entries = Slab::with_capacity(num_pages as usize);
        let mut lirs = Lirs::new(hot_quota);
        for page_no in 0..num_pages {
            let key = crate::layout::PageKey::new(0, page_no);
            let mut entry = PageEntry::new(key, page_no as u64);
            entry.state = entry.state.with(BOUND | super::entry::MAPPED);
            let id = entries.insert(entry) as u32;
            lirs.bound(&mut entries, id);
        }
        Self {
            entries,
            lirs,
            released: Vec::new(),
        }
    }

    /// Reference a page.
    pub fn reference(&mut self, page_no: u32) {
        self.lirs
            .reference(&mut self.entries, page_no, &mut self.released);
        self.released.clear();
    }

    /// The number of hot pages.
    pub fn num_hot(&self) -> usize {
        self.lirs.num_hot()
    }
}
