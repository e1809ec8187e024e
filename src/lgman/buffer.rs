use crate::layout::Lsn;
use crate::layout::record::encode_noop;
use crate::layout::undo_page::UNDO_PAGE_DATA_WORDS;

/// The number of record words held by one buffer page.
pub(crate) const PAGE_DATA_WORDS: usize = UNDO_PAGE_DATA_WORDS;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// Where an entry was placed in the log.
pub(crate) struct Placement {
    /// The logical log page the entry was written to.
    pub page: u64,
    /// The number of padding words written ahead of the entry.
    pub padding: usize,
}

/// The in-memory log buffer.
///
/// The buffer is a ring of pages indexed by the logical log page number,
/// pages between the consumer and producer are complete and waiting to be
/// written out, the producer page is the one records are appended to.
///
/// Space is tracked in words:
///
/// `free_words + reserved_words + unwritten_words == capacity`
pub(crate) struct LogBuffer {
    pages: Vec<Box<[u32]>>,
    page_lsns: Vec<Lsn>,
    producer_page: u64,
    producer_words: usize,
    consumer_page: u64,
    free_words: usize,
    reserved_words: usize,
    /// The LSN of the newest record on a completed page.
    last_closed_lsn: Lsn,
}

impl LogBuffer {
    /// Create a new buffer with `num_pages` pages, starting at the logical page `start_page`.
    pub(crate) fn new(num_pages: usize, start_page: u64, last_lsn: Lsn) -> Self {
        let num_pages = num_pages.max(2);
        let pages = (0..num_pages)
            .map(|_| vec![0u32; PAGE_DATA_WORDS].into_boxed_slice())
            .collect();
        Self {
            pages,
            page_lsns: vec![0; num_pages],
            producer_page: start_page,
            producer_words: 0,
            consumer_page: start_page,
            free_words: num_pages * PAGE_DATA_WORDS,
            reserved_words: 0,
            last_closed_lsn: last_lsn,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.pages.len() * PAGE_DATA_WORDS
    }

    #[inline]
    pub(crate) fn free_words(&self) -> usize {
        self.free_words
    }

    #[inline]
    pub(crate) fn reserved_words(&self) -> usize {
        self.reserved_words
    }

    #[inline]
    pub(crate) fn producer_page(&self) -> u64 {
        self.producer_page
    }

    #[inline]
    pub(crate) fn producer_words(&self) -> usize {
        self.producer_words
    }

    #[inline]
    pub(crate) fn consumer_page(&self) -> u64 {
        self.consumer_page
    }

    #[inline]
    pub(crate) fn last_closed_lsn(&self) -> Lsn {
        self.last_closed_lsn
    }

    /// The number of complete pages waiting to be written.
    #[inline]
    pub(crate) fn pages_ready(&self) -> u64 {
        self.producer_page - self.consumer_page
    }

    /// Words held by pages not yet written to disk.
    pub(crate) fn unwritten_words(&self) -> usize {
        self.pages_ready() as usize * PAGE_DATA_WORDS + self.producer_words
    }

    /// Attempt to reserve `words` of buffer space.
    pub(crate) fn try_reserve(&mut self, words: usize) -> bool {
        if self.free_words < words {
            return false;
        }
        self.free_words -= words;
        self.reserved_words += words;
        true
    }

    /// Release a previously made reservation.
    pub(crate) fn release(&mut self, words: usize) {
        debug_assert!(self.reserved_words >= words);
        self.reserved_words -= words;
        self.free_words += words;
    }

    /// Append an encoded entry to the producer page, consuming `reserved` words
    /// of reservation.
    ///
    /// If the entry does not fit the remainder of the producer page, the
    /// remainder is padded with a NOOP record and the entry is placed at the
    /// start of the next page. Any unused reservation is returned to the free pool.
    pub(crate) fn append(&mut self, entry: &[u32], lsn: Lsn, reserved: usize) -> Placement {
        debug_assert!(entry.len() <= PAGE_DATA_WORDS);
        debug_assert!(reserved >= entry.len() + PAGE_DATA_WORDS - 1);
        debug_assert!(self.reserved_words >= reserved);

        let remaining = PAGE_DATA_WORDS - self.producer_words;
        let padding = if entry.len() > remaining {
            self.pad_producer_page();
            remaining
        } else {
            0
        };

        let slot = self.slot(self.producer_page);
        let start = self.producer_words;
        self.pages[slot][start..start + entry.len()].copy_from_slice(entry);
        self.page_lsns[slot] = lsn;
        self.producer_words += entry.len();
        let page = self.producer_page;

        if self.producer_words == PAGE_DATA_WORDS {
            self.advance_producer();
        }

        let used = padding + entry.len();
        self.reserved_words -= reserved;
        self.free_words += reserved - used;

        Placement { page, padding }
    }

    /// Complete the producer page early by padding its remainder.
    ///
    /// Returns the number of padding words or `None` if the page is empty or
    /// there is not enough free buffer space to pad it.
    pub(crate) fn close_producer_page(&mut self) -> Option<usize> {
        if self.producer_words == 0 {
            return None;
        }

        let remaining = PAGE_DATA_WORDS - self.producer_words;
        if self.free_words < remaining {
            return None;
        }

        self.free_words -= remaining;
        self.pad_producer_page();
        Some(remaining)
    }

    /// Returns the records and page LSN of a complete logical page.
    pub(crate) fn page(&self, page: u64) -> (&[u32], Lsn) {
        debug_assert!(page >= self.consumer_page && page < self.producer_page);
        let slot = self.slot(page);
        (&self.pages[slot], self.page_lsns[slot])
    }

    /// Mark `num_pages` pages from the consumer as written, returning their space.
    pub(crate) fn complete(&mut self, num_pages: u64) {
        debug_assert!(self.consumer_page + num_pages <= self.producer_page);
        self.consumer_page += num_pages;
        self.free_words += num_pages as usize * PAGE_DATA_WORDS;
    }

    fn pad_producer_page(&mut self) {
        let slot = self.slot(self.producer_page);
        if self.producer_words < PAGE_DATA_WORDS {
            encode_noop(&mut self.pages[slot][self.producer_words..]);
        }
        self.producer_words = PAGE_DATA_WORDS;
        self.advance_producer();
    }

    fn advance_producer(&mut self) {
        let slot = self.slot(self.producer_page);
        self.last_closed_lsn = self.page_lsns[slot];
        self.producer_page += 1;
        self.producer_words = 0;
    }

    #[inline]
    fn slot(&self, page: u64) -> usize {
        (page % self.pages.len() as u64) as usize
    }
}
