use std::time::Duration;

use tokio::time::Instant;

use super::engine::{Action, LcpComplete, PageRead, PageWrite, PgmanCore};
use super::entry::{
    BOUND,
    DIRTY,
    EMPTY,
    LCP,
    LOGSYNC,
    MAPPED,
    PAGEIN,
    PAGEOUT,
    REQUEST,
    Sublist,
};
use crate::signal::Signal;
use crate::utils::abort_system;

/// The maximum number of pages bound per bind loop pass.
const BIND_BATCH: usize = 32;
/// The delay before a stalled bind loop retries.
const BIND_RETRY_DELAY: Duration = Duration::from_millis(10);

impl PgmanCore {
    /// Run every signal which is due.
    pub(crate) fn run(&mut self, now: Instant) {
        while let Some(signal) = self.signals.pop_ready(now) {
            match signal {
                Signal::Bind => self.process_bind(now),
                Signal::Map => self.process_map(),
                Signal::Callback => self.process_callback(),
                Signal::Cleanup => self.process_cleanup(now),
                Signal::Lcp => self.process_lcp(now),
                Signal::Stats => self.process_stats(now),
            }
        }
    }

    /// The time the next delayed loop becomes due.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.signals.next_deadline()
    }

    fn process_bind(&mut self, now: Instant) {
        for _ in 0..BIND_BATCH {
            let Some(id) = self.sublists[Sublist::Bind as usize].first() else {
                return;
            };
            let Some(slot) = self.seize_slot() else {
                self.counters.stalls += 1;
                self.signals.send_delayed(Signal::Bind, BIND_RETRY_DELAY, now);
                tracing::trace!("bind stalled, no evictable page");
                return;
            };

            self.table.get_mut(id).slot = Some(slot);
            self.add_bits(id, BOUND);
            self.lirs.bound(self.table.entries_mut(), id);
        }
        self.wake_bind();
    }

    /// Take a free slot or evict the coldest resident page.
    ///
    /// A dirty victim is written out first and the caller has to retry.
    fn seize_slot(&mut self) -> Option<u32> {
        if let Some(slot) = self.free_slots.pop() {
            return Some(slot);
        }

        let victim = self.lirs.victim()?;
        let entry = self.table.get(victim);
        if entry.can_evict() {
            self.lirs.evicted(self.table.entries_mut(), victim);
            self.unbind(victim);
            self.release_if_unused(victim);
            tracing::trace!(victim = victim, "evicted page");
            return self.free_slots.pop();
        }

        if entry.can_pageout() && self.io_waits < self.config.max_io_waits {
            self.start_pageout(victim, false);
        }
        None
    }

    fn process_map(&mut self) {
        while let Some(id) = self.sublists[Sublist::Map as usize].first() {
            let entry = self.table.get(id);
            let (key, slot) = (entry.key, entry.slot);
            let Some(slot) = slot else {
                abort_system("mapped page has no cache slot", Some(&key));
            };
            let buffer = self.slots[slot as usize].clone();

            if entry.state.any(EMPTY) {
                buffer.write().fill(0);
                let state = entry.state.with(MAPPED).without(EMPTY);
                self.set_state(id, state);
                continue;
            }

            if self.io_waits >= self.config.max_io_waits {
                return;
            }
            let Some(data_file) = self.files.get(key.file_no) else {
                abort_system("page requested from unmapped data file", Some(&key));
            };
            let file = data_file.file.clone().into();

            self.io_waits += 1;
            self.add_bits(id, PAGEIN);
            self.actions.push(Action::Read(PageRead {
                id,
                key,
                file,
                buffer,
            }));
        }
    }

    /// Serve the next request of the first resident entry.
    fn process_callback(&mut self) {
        let Some(id) = self.sublists[Sublist::Callback as usize].first() else {
            return;
        };

        let entry = self.table.get_mut(id);
        let key = entry.key;
        if let Some(request) = entry.requests.pop_front() {
            if request.waiter.is_closed() {
                tracing::trace!(key = ?key, "page request cancelled");
            } else {
                let buffer = self.serve(id, request.flags);
                self.actions.push(Action::Serve {
                    waiter: request.waiter,
                    id,
                    key,
                    buffer,
                });
            }
        }

        if self.table.get(id).requests.is_empty() {
            self.clear_bits(id, REQUEST);
        }
        if !self.sublists[Sublist::Callback as usize].is_empty() {
            self.signals.send(Signal::Callback);
        }
    }

    /// Start writing out a dirty page.
    ///
    /// The page contents are copied into the write so handles granted
    /// while the write runs never race with it.
    pub(crate) fn start_pageout(&mut self, id: u32, lcp: bool) {
        let entry = self.table.get(id);
        debug_assert!(entry.can_pageout());
        let (key, lsn, dirty_count) = (entry.key, entry.lsn, entry.dirty_count);
        let Some(slot) = entry.slot else {
            abort_system("dirty page has no cache slot", Some(&key));
        };
        let Some(data_file) = self.files.get(key.file_no) else {
            abort_system("dirty page of unmapped data file", Some(&key));
        };
        let file = data_file.file.clone();
        let data = self.slots[slot as usize].read().to_vec();

        let mut bits = PAGEOUT;
        if lsn > 0 {
            bits |= LOGSYNC;
        }
        if lcp {
            bits |= LCP;
        }
        let state = entry.state.with(bits).without(DIRTY);
        self.table.get_mut(id).dirty_count = 0;
        self.set_state(id, state);
        self.io_waits += 1;

        tracing::trace!(key = ?key, lsn = lsn, lcp = lcp, "page write started");
        self.actions.push(Action::Write(PageWrite {
            id,
            key,
            lsn,
            file,
            data,
            dirty_count,
        }));
    }

    /// A page read completed.
    pub(crate) fn pagein_done(&mut self, id: u32) {
        self.io_waits -= 1;
        self.counters.page_reads += 1;
        let state = self.table.get(id).state.with(MAPPED).without(PAGEIN);
        self.set_state(id, state);
        self.signals.send(Signal::Map);
    }

    /// The log is durable up to the LSN of the page being written.
    pub(crate) fn pageout_log_synced(&mut self, id: u32, waited: bool) {
        if waited {
            self.counters.log_waits += 1;
        }
        self.clear_bits(id, LOGSYNC);
    }

    /// A page write completed.
    ///
    /// A page changed while it was written out stays dirty.
    pub(crate) fn pageout_done(&mut self, id: u32) {
        self.io_waits -= 1;
        self.counters.page_writes += 1;

        let state = self.table.get(id).state;
        if state.any(LCP)
            && let Some(lcp) = self.lcp.as_mut()
        {
            lcp.outstanding -= 1;
            lcp.pages_written += 1;
            self.counters.lcp_pages_written += 1;
        }
        self.clear_bits(id, PAGEOUT | LOGSYNC | LCP);

        self.wake_bind();
        self.signals.send(Signal::Map);
        if self.lcp.is_some() {
            self.signals.send(Signal::Lcp);
        }
    }

    /// Write out dirty pages from the cold end of the queue ahead of eviction.
    fn process_cleanup(&mut self, now: Instant) {
        let mut started = 0;
        for _ in 0..self.config.cleanup_batch.min(self.lirs.queue().len()) {
            if self.io_waits >= self.config.max_io_waits {
                break;
            }
            let Some(id) = self.lirs.next_cleanup(self.table.entries()) else {
                break;
            };
            if self.table.get(id).can_pageout() {
                self.start_pageout(id, false);
                started += 1;
            }
        }

        if started > 0 {
            tracing::debug!(pages = started, "cleanup writing pages");
        }
        self.signals
            .send_delayed(Signal::Cleanup, self.config.cleanup_loop_delay, now);
    }

    /// Walk every entry and write out the pages dirtied before the checkpoint.
    fn process_lcp(&mut self, now: Instant) {
        let Some(lcp_id) = self.lcp.as_ref().map(|lcp| lcp.lcp_id) else {
            return;
        };

        loop {
            let cursor = self.lcp.as_ref().map_or(0, |lcp| lcp.cursor);
            let Some(id) = self.table.next_id_from(cursor) else {
                break;
            };

            let entry = self.table.get(id);
            if entry.state.any(PAGEOUT) {
                if entry.state.any(DIRTY) || !entry.state.any(LCP) {
                    // Wait for the running write, the page is inspected again once it completes.
                    return;
                }
            } else if entry.state.all(MAPPED | DIRTY) && entry.last_lcp != Some(lcp_id) {
                if !entry.can_pageout() || self.io_waits >= self.config.max_io_waits {
                    self.signals
                        .send_delayed(Signal::Lcp, self.config.lcp_loop_delay, now);
                    return;
                }
                self.table.get_mut(id).last_lcp = Some(lcp_id);
                self.start_pageout(id, true);
                if let Some(lcp) = self.lcp.as_mut() {
                    lcp.outstanding += 1;
                }
            }

            if let Some(lcp) = self.lcp.as_mut() {
                lcp.cursor = id + 1;
            }
        }

        let is_complete = self.lcp.as_ref().is_some_and(|lcp| lcp.outstanding == 0);
        if !is_complete {
            return;
        }
        let Some(lcp) = self.lcp.take() else {
            return;
        };

        tracing::info!(
            lcp_id = lcp.lcp_id,
            pages_written = lcp.pages_written,
            elapsed = ?now.saturating_duration_since(lcp.started),
            "checkpoint pageouts complete",
        );
        self.actions.push(Action::LcpComplete(LcpComplete {
            lcp_id: lcp.lcp_id,
            waiter: lcp.waiter,
            files: self.files.mapped_files(),
        }));
    }

    fn process_stats(&mut self, now: Instant) {
        let stats = self.stats();
        tracing::debug!(
            num_entries = stats.num_entries,
            num_hot_pages = stats.num_hot_pages,
            num_free_pages = stats.num_free_pages,
            io_waits = stats.current_io_waits,
            page_hits = stats.page_hits,
            page_faults = stats.page_faults,
            page_reads = stats.page_reads,
            page_writes = stats.page_writes,
            log_waits = stats.log_waits,
            stalls = stats.stalls,
            "page cache stats",
        );
        self.signals
            .send_delayed(Signal::Stats, self.config.stats_loop_delay, now);
    }
}
