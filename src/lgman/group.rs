use std::collections::VecDeque;

use smallvec::SmallVec;
use tokio::sync::oneshot;

use super::buffer::{LogBuffer, PAGE_DATA_WORDS};
use super::file_set::{FileSet, UndoFileState};
use super::search::LogHead;
use super::space::{AccountingError, LogSpace};
use super::{GroupState, LogError, LogStats};
use crate::file::RWFile;
use crate::layout::record::{UndoEntry, encode_entry, entry_words};
use crate::layout::undo_page::encode_undo_page;
use crate::layout::{Lsn, PAGE_SIZE, words_to_bytes};
use crate::utils::abort_system;

/// The maximum number of pages written by a single flush request.
pub(crate) const MAX_WRITE_PAGES: u64 = 512;

/// A batch of contiguous log pages ready to be written to a single file.
pub(crate) struct WriteBatch {
    pub(crate) file: RWFile,
    pub(crate) file_no: u32,
    pub(crate) file_idx: usize,
    pub(crate) page_no: u32,
    pub(crate) num_pages: u64,
    pub(crate) last_lsn: Lsn,
    pub(crate) data: Vec<u8>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// A checkpoint start marker written to the log.
pub(crate) struct LcpMarker {
    pub(crate) lcp_id: u32,
    /// Zero for the marker of a global checkpoint.
    pub(crate) local_lcp_id: u32,
    pub(crate) lsn: Lsn,
    /// The logical page holding the marker.
    pub(crate) page: u64,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct GroupCounters {
    pub(crate) entries_added: u64,
    pub(crate) pages_written: u64,
    pub(crate) write_batches: u64,
    pub(crate) forced_page_closes: u64,
    pub(crate) padding_words: u64,
}

/// The state of the single logfile group.
pub(crate) struct LogfileGroup {
    pub(crate) group_id: u32,
    pub(crate) version: u32,
    pub(crate) state: GroupState,
    pub(crate) files: FileSet,
    /// File numbers being created or opened.
    pub(crate) pending_files: Vec<u32>,
    /// Files holding existing data were opened, the group must be recovered
    /// before going online.
    pub(crate) opened_files: bool,
    pub(crate) buffer: LogBuffer,
    pub(crate) space: LogSpace,
    /// The oldest logical page still holding live log data.
    pub(crate) tail_page: u64,
    pub(crate) next_lsn: Lsn,
    /// The LSN of the newest page handed to the file system.
    pub(crate) last_sync_req_lsn: Lsn,
    /// The largest LSN any caller has asked to be made durable.
    pub(crate) max_sync_req_lsn: Lsn,
    pub(crate) last_synced_lsn: Lsn,
    pub(crate) sync_waiters: Vec<(Lsn, oneshot::Sender<()>)>,
    pub(crate) buffer_waiters: Vec<oneshot::Sender<()>>,
    pub(crate) lcp_markers: VecDeque<LcpMarker>,
    /// The logical page the tail may be cut up to.
    pub(crate) cut_boundary: Option<u64>,
    pub(crate) head: Option<LogHead>,
    pub(crate) node_restart: bool,
    pub(crate) buffer_pages: usize,
    pub(crate) counters: GroupCounters,
}

impl LogfileGroup {
    pub(crate) fn new(group_id: u32, version: u32, buffer_pages: usize) -> Self {
        Self {
            group_id,
            version,
            state: GroupState::Starting,
            files: FileSet::new(),
            pending_files: Vec::new(),
            opened_files: false,
            buffer: LogBuffer::new(buffer_pages, 0, 0),
            space: LogSpace::new(0, 0),
            tail_page: 0,
            next_lsn: 1,
            last_sync_req_lsn: 0,
            max_sync_req_lsn: 0,
            last_synced_lsn: 0,
            sync_waiters: Vec::new(),
            buffer_waiters: Vec::new(),
            lcp_markers: VecDeque::new(),
            cut_boundary: None,
            head: None,
            node_restart: false,
            buffer_pages,
            counters: GroupCounters::default(),
        }
    }

    #[inline]
    pub(crate) fn total_words(&self) -> u64 {
        self.files.total_pages() * PAGE_DATA_WORDS as u64
    }

    /// The number of words used by log data between the tail and the producer.
    pub(crate) fn used_words(&self) -> u64 {
        let used_pages = self.buffer.producer_page() - self.tail_page;
        used_pages * PAGE_DATA_WORDS as u64 + self.buffer.producer_words() as u64
    }

    /// Reset the producer, tail and accounting after the ring changed.
    ///
    /// Must only be called while no reservations are outstanding.
    pub(crate) fn reset_positions(&mut self, producer_page: u64, tail_page: u64, last_lsn: Lsn) {
        debug_assert!(producer_page >= tail_page);
        self.buffer = LogBuffer::new(self.buffer_pages, producer_page, last_lsn);
        self.tail_page = tail_page;
        self.space = LogSpace::new(self.total_words(), self.used_words());
        self.next_lsn = last_lsn + 1;
        self.last_sync_req_lsn = last_lsn;
        self.max_sync_req_lsn = last_lsn;
        self.last_synced_lsn = last_lsn;
    }

    pub(crate) fn ensure_state(&self, allowed: &[GroupState]) -> Result<(), LogError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LogError::InvalidState(self.state))
        }
    }

    /// Append an entry using `buffer_reserved` words of buffer reservation.
    ///
    /// The log space for the entry must already be reserved.
    pub(crate) fn append_entry(
        &mut self,
        parts: &[UndoEntry],
        buffer_reserved: usize,
    ) -> Result<(Lsn, u64), LogError> {
        let words = entry_words(parts);
        self.space.check_reserved(words as u64)?;

        let lsn = self.next_lsn;
        self.next_lsn += 1;

        let mut encoded = SmallVec::<[u32; 64]>::from_elem(0, words);
        encode_entry(lsn, parts, &mut encoded);

        let placement = self.buffer.append(&encoded, lsn, buffer_reserved);
        self.space.consume(words as u64, placement.padding as u64);
        self.counters.entries_added += 1;
        self.counters.padding_words += placement.padding as u64;

        if self.used_words() > self.total_words() {
            abort_system("log producer overran the log tail", Some(&self.stats()));
        }

        Ok((lsn, placement.page))
    }

    /// The padding of an early close is charged to the free log space, the
    /// close waits for a tail cut or a released reservation if it does not fit.
    fn should_close_producer_page(&self) -> bool {
        let padding = PAGE_DATA_WORDS - self.buffer.producer_words();
        self.buffer.producer_words() > 0
            && self.space.free_words() >= padding as i64
            && (self.max_sync_req_lsn > self.buffer.last_closed_lsn()
                || !self.buffer_waiters.is_empty())
    }

    /// Collect the next batch of complete pages to write out.
    ///
    /// The producer page is closed early when a caller waits on an LSN
    /// it holds, or a client waits for buffer space.
    pub(crate) fn prepare_batch(&mut self, checksums: bool) -> Option<WriteBatch> {
        if self.should_close_producer_page()
            && let Some(padding) = self.buffer.close_producer_page()
        {
            self.space.charge(padding as u64);
            self.counters.forced_page_closes += 1;
            self.counters.padding_words += padding as u64;
        }

        let ready = self.buffer.pages_ready();
        if ready == 0 {
            return None;
        }

        let start = self.buffer.consumer_page();
        let position = self.files.locate(start);
        let num_pages = if position.page_no == 1 {
            1
        } else {
            ready
                .min(MAX_WRITE_PAGES)
                .min(self.files.pages_to_file_end(start))
        };

        let mut data = vec![0u8; num_pages as usize * PAGE_SIZE];
        let mut scratch = vec![0u8; PAGE_DATA_WORDS * 4];
        let mut first_lsn = 0;
        let mut last_lsn = 0;
        for (idx, page) in data.chunks_exact_mut(PAGE_SIZE).enumerate() {
            let (words, lsn) = self.buffer.page(start + idx as u64);
            words_to_bytes(words, &mut scratch);
            encode_undo_page(lsn, &scratch, checksums, page);
            if idx == 0 {
                first_lsn = lsn;
            }
            last_lsn = lsn;
        }

        let file = self.files.get_mut(position.file_idx);
        if position.page_no == 1 {
            file.first_lsn = first_lsn;
        }
        file.state = UndoFileState::Online;
        file.outstanding = true;

        self.last_sync_req_lsn = last_lsn;
        self.max_sync_req_lsn = self.max_sync_req_lsn.max(last_lsn);

        Some(WriteBatch {
            file: file.file.clone(),
            file_no: file.file_no,
            file_idx: position.file_idx,
            page_no: position.page_no,
            num_pages,
            last_lsn,
            data,
        })
    }

    /// Mark a written batch as durable and wake any waiters it satisfies.
    pub(crate) fn complete_batch(&mut self, batch: &WriteBatch) {
        self.buffer.complete(batch.num_pages);
        self.last_synced_lsn = self.last_synced_lsn.max(batch.last_lsn);
        self.files.get_mut(batch.file_idx).outstanding = false;
        self.counters.pages_written += batch.num_pages;
        self.counters.write_batches += 1;

        let last_synced_lsn = self.last_synced_lsn;
        let mut ready = SmallVec::<[oneshot::Sender<()>; 4]>::new();
        let mut idx = 0;
        while idx < self.sync_waiters.len() {
            if self.sync_waiters[idx].0 <= last_synced_lsn {
                ready.push(self.sync_waiters.swap_remove(idx).1);
            } else {
                idx += 1;
            }
        }
        ready.extend(self.buffer_waiters.drain(..));

        for waiter in ready {
            let _ = waiter.send(());
        }
    }

    /// Returns if there is any work for the flusher to do.
    pub(crate) fn has_pending_writes(&self) -> bool {
        self.buffer.pages_ready() > 0 || self.should_close_producer_page()
    }

    pub(crate) fn validate(&self) -> Result<(), AccountingError> {
        let used_pages = self.buffer.producer_page() - self.tail_page;
        if used_pages > self.files.total_pages() {
            return Err(AccountingError::Overrun {
                used: used_pages,
                total: self.files.total_pages(),
            });
        }

        self.space.validate(self.used_words())?;

        let buffer = &self.buffer;
        let accounted =
            buffer.free_words() + buffer.reserved_words() + buffer.unwritten_words();
        if accounted != buffer.capacity() {
            return Err(AccountingError::Buffer {
                free: buffer.free_words(),
                reserved: buffer.reserved_words(),
                unwritten: buffer.unwritten_words(),
                capacity: buffer.capacity(),
            });
        }

        Ok(())
    }

    pub(crate) fn stats(&self) -> LogStats {
        LogStats {
            state: self.state,
            num_files: self.files.len(),
            next_lsn: self.next_lsn,
            last_synced_lsn: self.last_synced_lsn,
            last_sync_req_lsn: self.last_sync_req_lsn,
            max_sync_req_lsn: self.max_sync_req_lsn,
            total_log_words: self.space.total_words(),
            free_log_words: self.space.free_words(),
            reserved_log_words: self.space.reserved_words(),
            free_buffer_words: self.buffer.free_words(),
            tail_page: self.tail_page,
            producer_page: self.buffer.producer_page(),
            consumer_page: self.buffer.consumer_page(),
            entries_added: self.counters.entries_added,
            pages_written: self.counters.pages_written,
            write_batches: self.counters.write_batches,
            forced_page_closes: self.counters.forced_page_closes,
            padding_words: self.counters.padding_words,
        }
    }
}
