//! Restart discovery of the log head.
//!
//! Each UNDO file records the LSN of its first data page, sorting the files
//! by that LSN recovers the order the ring was written in. The newest file is
//! then binary searched for the last page written in the current lap of the
//! ring, followed by a short linear scan covering the final write batch, which
//! may have been written out of order.

use std::io;

use super::file_set::UndoFileState;
use super::group::MAX_WRITE_PAGES;
use super::{GroupState, Lgman, RecoveryError};
use crate::file::RWFile;
use crate::layout::undo_page::decode_undo_page;
use crate::layout::{Lsn, PAGE_SIZE};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The newest valid page of the log.
pub struct LogHead {
    /// The file holding the head page.
    pub file_no: u32,
    /// The page number of the head page.
    pub page_no: u32,
    /// The LSN of the newest record in the log.
    pub lsn: Lsn,
}

/// Read an UNDO page returning its LSN if the page is valid.
pub(crate) async fn read_page_lsn(file: &RWFile, page_no: u32) -> io::Result<Option<Lsn>> {
    let page = file.read_at(PAGE_SIZE, page_no as u64 * PAGE_SIZE as u64).await?;
    Ok(decode_undo_page(&page).ok().map(|header| header.lsn))
}

/// Order files by the LSN of their first page, files which hold no data go last.
pub(crate) fn sort_order(first_lsns: &[Lsn]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..first_lsns.len()).collect();
    order.sort_by_key(|&idx| (first_lsns[idx] == 0, first_lsns[idx]));
    order
}

/// Binary search a file for the last page written since its first page.
///
/// Returns the page number and LSN of the last page found.
pub(crate) async fn search_file(
    file: &RWFile,
    data_pages: u32,
    first_lsn: Lsn,
) -> io::Result<(u32, Lsn)> {
    let mut low = 1;
    let mut low_lsn = first_lsn;
    let mut high = data_pages;

    while low < high {
        let mid = low + (high - low).div_ceil(2);
        match read_page_lsn(file, mid).await? {
            Some(lsn) if lsn >= first_lsn => {
                low = mid;
                low_lsn = lsn;
            },
            _ => high = mid - 1,
        }
    }

    Ok((low, low_lsn))
}

/// Scan the pages after the search result for a newer page.
///
/// A flush may complete its pages out of order so a gap left by a torn
/// write does not mark the end of the log.
pub(crate) async fn search_end(
    file: &RWFile,
    data_pages: u32,
    first_lsn: Lsn,
    page_no: u32,
    lsn: Lsn,
) -> io::Result<(u32, Lsn)> {
    let mut head = (page_no, lsn);
    let last = data_pages.min(page_no.saturating_add(MAX_WRITE_PAGES as u32));
    for candidate in page_no + 1..=last {
        if let Some(candidate_lsn) = read_page_lsn(file, candidate).await?
            && candidate_lsn >= first_lsn
            && candidate_lsn > head.1
        {
            head = (candidate, candidate_lsn);
        }
    }
    Ok(head)
}

impl Lgman {
    #[tracing::instrument("lgman-start-recovery", skip_all)]
    /// Discover the head of the log from the declared UNDO files.
    ///
    /// The files are re-ordered into the ring order they were written in and
    /// the log positions are restored so execution and new appends continue
    /// from the head. Returns `None` when no file holds any log data.
    pub async fn start_recovery(&self) -> Result<Option<LogHead>, RecoveryError> {
        let files = {
            let mut guard = self.inner.group.lock();
            let group = guard.as_mut().ok_or(super::LogError::NoLogfileGroup)?;
            group.ensure_state(&[GroupState::Starting])?;
            group.state = GroupState::Searching;
            group
                .files
                .iter_mut()
                .map(|file| {
                    file.state = UndoFileState::Sorting;
                    (file.file_no, file.file.clone(), file.num_pages)
                })
                .collect::<Vec<_>>()
        };

        let result = self.search_head(&files).await;
        let mut guard = self.inner.group.lock();
        let group = guard.as_mut().ok_or(super::LogError::NoLogfileGroup)?;
        let (order, first_lsns, head) = match result {
            Ok(found) => found,
            Err(err) => {
                group.state = GroupState::Starting;
                return Err(err);
            },
        };

        group.files.reorder(&order);
        for (file, &idx) in group.files.iter_mut().zip(order.iter()) {
            file.first_lsn = first_lsns[idx];
            file.state = if file.first_lsn == 0 {
                UndoFileState::Empty
            } else {
                UndoFileState::Online
            };
        }

        let Some((sorted_idx, page_no, lsn)) = head else {
            tracing::info!("undo log is empty");
            group.reset_positions(0, 0, 0);
            group.head = None;
            group.state = GroupState::Recovered;
            return Ok(None);
        };

        let total = group.files.total_pages();
        let physical = group.files.physical_of(super::file_set::RingPosition {
            file_idx: sorted_idx,
            page_no,
        });
        group.reset_positions(physical + total + 1, total, lsn);

        let head = LogHead {
            file_no: group.files.get(sorted_idx).file_no,
            page_no,
            lsn,
        };
        group.head = Some(head);
        group.state = GroupState::Recovered;

        tracing::info!(
            file_no = head.file_no,
            page_no = head.page_no,
            lsn = head.lsn,
            "found undo log head",
        );

        Ok(Some(head))
    }

    async fn search_head(
        &self,
        files: &[(u32, RWFile, u32)],
    ) -> Result<(Vec<usize>, Vec<Lsn>, Option<(usize, u32, Lsn)>), RecoveryError> {
        let mut first_lsns = Vec::with_capacity(files.len());
        for (_, file, _) in files {
            first_lsns.push(read_page_lsn(file, 1).await?.unwrap_or(0));
        }

        let order = sort_order(&first_lsns);
        let Some(sorted_idx) = order.iter().rposition(|&idx| first_lsns[idx] != 0) else {
            return Ok((order, first_lsns, None));
        };

        let (file_no, file, num_pages) = &files[order[sorted_idx]];
        let first_lsn = first_lsns[order[sorted_idx]];
        let data_pages = num_pages - 1;

        self.set_file_state(*file_no, UndoFileState::Searching);
        let (page_no, lsn) = search_file(file, data_pages, first_lsn).await?;

        self.set_file_state(*file_no, UndoFileState::SearchingEnd);
        let (page_no, lsn) = search_end(file, data_pages, first_lsn, page_no, lsn).await?;

        self.set_file_state(*file_no, UndoFileState::SearchingFinalRead);
        let final_lsn = read_page_lsn(file, page_no).await?;
        if final_lsn != Some(lsn) {
            return Err(RecoveryError::Corrupted {
                file_no: *file_no,
                page_no,
                reason: "head page changed during the final read".to_string(),
            });
        }

        Ok((order, first_lsns, Some((sorted_idx, page_no, lsn))))
    }

    fn set_file_state(&self, file_no: u32, state: UndoFileState) {
        let mut guard = self.inner.group.lock();
        if let Some(group) = guard.as_mut()
            && let Some(file) = group.files.iter_mut().find(|file| file.file_no == file_no)
        {
            file.state = state;
        }
    }
}
