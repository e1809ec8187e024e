//! The synchronous state machine of the page cache.
//!
//! Every operation runs under the cache lock and never blocks. Work which
//! must leave the lock, reads, writes, handing pages to waiters and
//! checkpoint syncs, is queued as an [Action] for the driver to execute.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::entry::{
    BOUND,
    BUSY,
    DIRTY,
    EMPTY,
    LOCKED,
    MAPPED,
    PAGEIN,
    PAGEOUT,
    PageRequest,
    PageState,
    REQUEST,
    RequestFlags,
    SUBLIST_LINK,
    Sublist,
};
use super::files::DataFileTable;
use super::lirs::Lirs;
use super::list::ListHead;
use super::table::PageTable;
use super::{PageCacheError, PageHandle, PgmanStats};
use crate::config::PgmanConfig;
use crate::file::{ROFile, RWFile};
use crate::layout::{Lsn, PAGE_SIZE, PageKey};
use crate::signal::{Signal, SignalQueue};

/// A cache slot, one page worth of memory.
pub(crate) type PageBuffer = Arc<RwLock<Box<[u8]>>>;

/// Work the driver executes outside the cache lock.
pub(crate) enum Action {
    /// Hand a resident page to a waiting request.
    Serve {
        waiter: oneshot::Sender<PageHandle>,
        id: u32,
        key: PageKey,
        buffer: PageBuffer,
    },
    /// Read a page into its cache slot.
    Read(PageRead),
    /// Write a snapshot of a page to its data file.
    Write(PageWrite),
    /// Sync the data files and complete a checkpoint.
    LcpComplete(LcpComplete),
}

pub(crate) struct PageRead {
    pub(crate) id: u32,
    pub(crate) key: PageKey,
    pub(crate) file: ROFile,
    pub(crate) buffer: PageBuffer,
}

pub(crate) struct PageWrite {
    pub(crate) id: u32,
    pub(crate) key: PageKey,
    pub(crate) lsn: Lsn,
    pub(crate) file: RWFile,
    /// A copy of the page taken while no handle was live.
    pub(crate) data: Vec<u8>,
    pub(crate) dirty_count: u32,
}

pub(crate) struct LcpComplete {
    pub(crate) lcp_id: u32,
    pub(crate) waiter: oneshot::Sender<()>,
    pub(crate) files: Vec<RWFile>,
}

/// The progress of a running checkpoint.
pub(crate) struct LcpState {
    pub(crate) lcp_id: u32,
    /// The next entry ID the walk visits.
    pub(crate) cursor: u32,
    /// Checkpoint writes which have not completed.
    pub(crate) outstanding: usize,
    pub(crate) pages_written: u64,
    pub(crate) waiter: oneshot::Sender<()>,
    pub(crate) started: Instant,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    pub(crate) page_hits: u64,
    pub(crate) page_faults: u64,
    pub(crate) page_reads: u64,
    pub(crate) page_writes: u64,
    pub(crate) log_waits: u64,
    pub(crate) stalls: u64,
    pub(crate) lcp_pages_written: u64,
}

/// The outcome of [PgmanCore::get_page].
pub(crate) enum PageAccess {
    /// The page was resident and is now busy on behalf of the caller.
    Ready { id: u32, buffer: PageBuffer },
    /// The request was queued.
    Queued(oneshot::Receiver<PageHandle>),
}

/// The page cache state.
pub(crate) struct PgmanCore {
    pub(crate) config: PgmanConfig,
    pub(crate) table: PageTable,
    pub(crate) lirs: Lirs,
    pub(crate) sublists: [ListHead; Sublist::COUNT],
    pub(crate) slots: Vec<PageBuffer>,
    pub(crate) free_slots: Vec<u32>,
    pub(crate) files: DataFileTable,
    pub(crate) signals: SignalQueue,
    pub(crate) actions: Vec<Action>,
    pub(crate) io_waits: usize,
    pub(crate) lcp: Option<LcpState>,
    pub(crate) counters: Counters,
    /// Entries pruned from the LIRS stack waiting to be released.
    pub(crate) released: Vec<u32>,
}

impl PgmanCore {
    pub(crate) fn new(config: PgmanConfig, now: Instant) -> Self {
        let max_pages = config.max_pages.max(1);
        let slots = (0..max_pages)
            .map(|_| Arc::new(RwLock::new(vec![0; PAGE_SIZE].into_boxed_slice())))
            .collect();
        let free_slots = (0..max_pages as u32).rev().collect();

        let mut signals = SignalQueue::new();
        signals.send_delayed(Signal::Stats, config.stats_loop_delay, now);
        signals.send_delayed(Signal::Cleanup, config.cleanup_loop_delay, now);

        tracing::info!(
            max_pages = max_pages,
            hot_page_quota = config.hot_page_quota(),
            max_page_entries = config.page_entry_limit(),
            cache_size = %humansize::format_size(max_pages * PAGE_SIZE, humansize::DECIMAL),
            "page cache allocated",
        );

        Self {
            table: PageTable::with_limit(config.page_entry_limit()),
            lirs: Lirs::new(config.hot_page_quota()),
            sublists: Sublist::ALL.map(|_| ListHead::new(SUBLIST_LINK)),
            slots,
            free_slots,
            files: DataFileTable::default(),
            signals,
            actions: Vec::new(),
            io_waits: 0,
            lcp: None,
            counters: Counters::default(),
            released: Vec::new(),
            config,
        }
    }

    /// Move the entry to a new state, relinking it on the matching sublist.
    ///
    /// Every change of the work bits goes through here so the sublists
    /// always partition the entries by their state.
    pub(crate) fn set_state(&mut self, id: u32, state: PageState) {
        let entries = self.table.entries_mut();
        let old = entries[id as usize].state.sublist();
        let new = state.sublist();
        if old != new {
            if let Some(sublist) = old {
                self.sublists[sublist as usize].remove(entries, id);
            }
            if let Some(sublist) = new {
                self.sublists[sublist as usize].push_back(entries, id);
            }
        }
        entries[id as usize].state = state;

        match new {
            Some(Sublist::Bind) => self.signals.send(Signal::Bind),
            Some(Sublist::Map) => self.signals.send(Signal::Map),
            Some(Sublist::Callback) => self.signals.send(Signal::Callback),
            _ => false,
        };
    }

    #[inline]
    pub(crate) fn add_bits(&mut self, id: u32, bits: u16) {
        let state = self.table.get(id).state.with(bits);
        self.set_state(id, state);
    }

    #[inline]
    pub(crate) fn clear_bits(&mut self, id: u32, bits: u16) {
        let state = self.table.get(id).state.without(bits);
        self.set_state(id, state);
    }

    /// Drain the actions queued for the driver.
    pub(crate) fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Request a page.
    pub(crate) fn get_page(
        &mut self,
        key: PageKey,
        flags: RequestFlags,
    ) -> Result<PageAccess, PageCacheError> {
        let file = self
            .files
            .get(key.file_no)
            .ok_or(PageCacheError::UnknownFile(key.file_no))?;
        if key.page_no == 0 || key.page_no >= file.num_pages {
            return Err(PageCacheError::NoSuchPage(key));
        }

        let id = match self.table.find(key) {
            Some(id) => id,
            None => self.seize_entry(key)?,
        };

        if !flags.intersects(RequestFlags::CORR_REQ) {
            self.lirs
                .reference(self.table.entries_mut(), id, &mut self.released);
            self.release_pruned();
        }

        let entry = self.table.get(id);
        let state = entry.state;
        let is_resident =
            state.any(MAPPED) && !state.any(PAGEIN) && entry.requests.is_empty();
        let blocked_by_pageout =
            state.any(PAGEOUT) && flags.intersects(RequestFlags::DIRTY_FLAGS);
        if is_resident && !blocked_by_pageout {
            self.counters.page_hits += 1;
            let buffer = self.serve(id, flags);
            return Ok(PageAccess::Ready { id, buffer });
        }

        if !state.any(MAPPED) {
            self.counters.page_faults += 1;
        }

        let (tx, rx) = oneshot::channel();
        self.table.get_mut(id).requests.push_back(PageRequest {
            flags,
            waiter: tx,
        });

        let mut state = state.with(REQUEST);
        if flags.contains(RequestFlags::EMPTY_PAGE) && !state.any(MAPPED | PAGEIN) {
            state = state.with(EMPTY);
        }
        self.set_state(id, state);

        tracing::trace!(key = ?key, flags = ?flags, state = ?state, "page request queued");
        Ok(PageAccess::Queued(rx))
    }

    /// Find room for a new entry, giving up the oldest history entry if
    /// the table is full.
    fn seize_entry(&mut self, key: PageKey) -> Result<u32, PageCacheError> {
        if self.table.is_full() {
            let id = self
                .lirs
                .oldest_history_entry(self.table.entries())
                .ok_or(PageCacheError::OutOfPageEntries)?;
            self.lirs
                .remove(self.table.entries_mut(), id, &mut self.released);
            self.table.remove(id);
            self.release_pruned();
        }
        self.table.insert(key).ok_or(PageCacheError::OutOfPageEntries)
    }

    /// Mark the page busy on behalf of a request and apply its flags.
    pub(crate) fn serve(&mut self, id: u32, flags: RequestFlags) -> PageBuffer {
        if flags.contains(RequestFlags::LOCK_PAGE) && !self.table.get(id).state.any(LOCKED) {
            self.lirs
                .remove(self.table.entries_mut(), id, &mut self.released);
            self.add_bits(id, LOCKED);
            self.release_pruned();
        }

        if flags.contains(RequestFlags::UNLOCK_PAGE) && self.table.get(id).state.any(LOCKED) {
            self.clear_bits(id, LOCKED);
            let entries = self.table.entries_mut();
            self.lirs.reference(entries, id, &mut self.released);
            self.lirs.bound(entries, id);
            self.release_pruned();
        }

        let entry = self.table.get_mut(id);
        entry.busy_count += 1;
        let mut state = entry.state.with(BUSY);
        if flags.intersects(RequestFlags::DIRTY_FLAGS) {
            entry.dirty_count += 1;
            state = state.with(DIRTY);
        }
        self.set_state(id, state);

        let slot = self.table.get(id).slot.unwrap_or_else(|| {
            crate::utils::abort_system("served page is not bound", Some(&id))
        });
        self.slots[slot as usize].clone()
    }

    /// Release a handle of the page.
    pub(crate) fn release_handle(&mut self, id: u32) {
        let entry = self.table.get_mut(id);
        debug_assert!(entry.busy_count > 0);
        entry.busy_count -= 1;
        if entry.busy_count > 0 {
            return;
        }
        self.clear_bits(id, BUSY);
        self.wake_bind();
        if self.lcp.is_some() {
            self.signals.send(Signal::Lcp);
        }
    }

    /// Record a change to a resident page.
    pub(crate) fn update_lsn(&mut self, key: PageKey, lsn: Lsn) -> Result<(), PageCacheError> {
        let id = self
            .table
            .find(key)
            .filter(|id| self.table.get(*id).state.any(MAPPED))
            .ok_or(PageCacheError::NoSuchPage(key))?;
        self.update_lsn_by_id(id, lsn);
        Ok(())
    }

    pub(crate) fn update_lsn_by_id(&mut self, id: u32, lsn: Lsn) {
        let entry = self.table.get_mut(id);
        entry.lsn = entry.lsn.max(lsn);
        entry.dirty_count += 1;
        if !entry.state.any(DIRTY) {
            self.add_bits(id, DIRTY);
        }
    }

    /// Remove a page from the cache without writing it out.
    pub(crate) fn drop_page(&mut self, key: PageKey) -> Result<(), PageCacheError> {
        let id = self.table.find(key).ok_or(PageCacheError::NoSuchPage(key))?;
        let entry = self.table.get(id);
        if entry.state.any(REQUEST | BUSY | PAGEIN | PAGEOUT) || !entry.requests.is_empty() {
            return Err(PageCacheError::PageBusy(key));
        }

        self.lirs
            .remove(self.table.entries_mut(), id, &mut self.released);
        self.unbind(id);
        self.clear_bits(id, LOCKED | DIRTY);
        self.table.remove(id);
        self.release_pruned();
        self.wake_bind();

        tracing::debug!(key = ?key, "dropped page");
        Ok(())
    }

    /// Give up the cache slot of the entry.
    pub(crate) fn unbind(&mut self, id: u32) {
        let Some(slot) = self.table.get_mut(id).slot.take() else {
            return;
        };
        self.free_slots.push(slot);
        self.clear_bits(id, BOUND | MAPPED | EMPTY);
    }

    /// Remove the entry from the table if nothing references it anymore.
    pub(crate) fn release_if_unused(&mut self, id: u32) {
        let entry = self.table.get(id);
        let in_lirs = entry
            .state
            .any(super::entry::ONSTACK | super::entry::ONQUEUE);
        if entry.state.sublist().is_none() && !in_lirs && entry.requests.is_empty() {
            self.table.remove(id);
        }
    }

    fn release_pruned(&mut self) {
        while let Some(id) = self.released.pop() {
            if self.table.entries().contains(id as usize) {
                self.release_if_unused(id);
            }
        }
    }

    /// Wake the bind loop if any request waits for a slot.
    pub(crate) fn wake_bind(&mut self) {
        if !self.sublists[Sublist::Bind as usize].is_empty() {
            self.signals.send(Signal::Bind);
        }
    }

    /// Start a checkpoint writing every page dirtied before it.
    pub(crate) fn start_lcp(
        &mut self,
        lcp_id: u32,
        now: Instant,
    ) -> Result<oneshot::Receiver<()>, PageCacheError> {
        if let Some(lcp) = self.lcp.as_ref() {
            return Err(PageCacheError::LcpInProgress(lcp.lcp_id));
        }
        let (tx, rx) = oneshot::channel();
        self.lcp = Some(LcpState {
            lcp_id,
            cursor: 0,
            outstanding: 0,
            pages_written: 0,
            waiter: tx,
            started: now,
        });
        self.signals.send(Signal::Lcp);
        tracing::info!(lcp_id = lcp_id, "checkpoint started");
        Ok(rx)
    }

    /// Returns if any page of the file holds a cache slot or has work pending.
    pub(crate) fn file_in_use(&self, file_no: u32) -> bool {
        self.table.entries().iter().any(|(_, entry)| {
            entry.key.file_no == file_no && entry.state.sublist().is_some()
        })
    }

    /// Forget the history entries of a file.
    pub(crate) fn forget_file(&mut self, file_no: u32) {
        let ids: Vec<u32> = self
            .table
            .entries()
            .iter()
            .filter(|(_, entry)| entry.key.file_no == file_no)
            .map(|(id, _)| id as u32)
            .collect();
        for id in ids {
            if !self.table.entries().contains(id as usize) {
                continue;
            }
            self.lirs
                .remove(self.table.entries_mut(), id, &mut self.released);
            self.table.remove(id);
        }
        self.release_pruned();
    }

    pub(crate) fn page_state(&self, key: PageKey) -> Option<PageState> {
        self.table.find(key).map(|id| self.table.get(id).state)
    }

    pub(crate) fn stats(&self) -> PgmanStats {
        PgmanStats {
            num_pages: self.slots.len(),
            num_free_pages: self.free_slots.len(),
            num_hot_pages: self.lirs.num_hot(),
            num_entries: self.table.len(),
            stack_len: self.lirs.stack().len(),
            queue_len: self.lirs.queue().len(),
            current_io_waits: self.io_waits,
            page_hits: self.counters.page_hits,
            page_faults: self.counters.page_faults,
            page_reads: self.counters.page_reads,
            page_writes: self.counters.page_writes,
            log_waits: self.counters.log_waits,
            stalls: self.counters.stalls,
            lcp_pages_written: self.counters.lcp_pages_written,
        }
    }

    /// Check the consistency of the entries, sublists and LIRS lists.
    pub(crate) fn check(&self) -> Result<(), String> {
        let entries = self.table.entries();
        self.lirs.check(entries)?;

        let mut num_bound = 0;
        let mut num_io = 0;
        for (id, entry) in entries.iter() {
            let state = entry.state;
            if state.any(MAPPED) && !state.any(BOUND) {
                return Err(format!("entry {id} is mapped but not bound: {state:?}"));
            }
            if state.any(BOUND) != entry.slot.is_some() {
                return Err(format!("entry {id} slot does not match state: {state:?}"));
            }
            if state.any(BUSY) != (entry.busy_count > 0) {
                return Err(format!(
                    "entry {id} busy count {} does not match state: {state:?}",
                    entry.busy_count,
                ));
            }
            if state.any(REQUEST) != !entry.requests.is_empty() {
                return Err(format!("entry {id} request queue does not match state: {state:?}"));
            }
            if state.sublist().is_none() && !state.any(super::entry::ONSTACK) {
                return Err(format!("entry {id} is unreferenced: {state:?}"));
            }
            num_bound += state.any(BOUND) as usize;
            num_io += state.any(PAGEIN | PAGEOUT) as usize;
        }

        let mut num_listed = 0;
        for sublist in Sublist::ALL {
            for id in self.sublists[sublist as usize].iter(entries) {
                let actual = entries[id as usize].state.sublist();
                if actual != Some(sublist) {
                    return Err(format!("entry {id} on {sublist:?} belongs on {actual:?}"));
                }
                num_listed += 1;
            }
        }
        let expected_listed = entries
            .iter()
            .filter(|(_, entry)| entry.state.sublist().is_some())
            .count();
        if num_listed != expected_listed {
            return Err(format!("{num_listed} entries on sublists expected {expected_listed}"));
        }

        if num_bound + self.free_slots.len() != self.slots.len() {
            return Err(format!(
                "{num_bound} bound entries and {} free slots for {} slots",
                self.free_slots.len(),
                self.slots.len(),
            ));
        }
        if num_io != self.io_waits {
            return Err(format!("{num_io} entries doing io but io waits is {}", self.io_waits));
        }
        Ok(())
    }
}
