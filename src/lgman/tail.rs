//! Checkpoint markers and reclaiming log space from the tail.
//!
//! Every checkpoint writes a marker to the log when it starts. Once a
//! checkpoint completes, every entry older than the marker of the
//! checkpoint before it is no longer needed to restore a consistent
//! state and the pages holding them can be reused. Space is reclaimed a
//! page at a time, a file is marked empty once the tail has passed its
//! last page.

use super::buffer::PAGE_DATA_WORDS;
use super::file_set::UndoFileState;
use super::group::{LcpMarker, LogfileGroup};
use super::{GroupState, Lgman, LogError};
use crate::layout::Lsn;
use crate::layout::record::{UndoEntry, UndoRecordType, entry_words};

impl Lgman {
    #[tracing::instrument("lgman-lcp-start", skip(self))]
    /// Write the start marker of checkpoint `lcp_id`.
    ///
    /// The marker cannot be aborted and may use the reserved log space.
    pub async fn lcp_start(&self, lcp_id: u32) -> Result<Lsn, LogError> {
        self.write_marker(UndoRecordType::Lcp, lcp_id, 0).await
    }

    #[tracing::instrument("lgman-local-lcp-start", skip(self))]
    /// Write the start marker of local checkpoint `local_lcp_id` taken
    /// within checkpoint `lcp_id`.
    pub async fn local_lcp_start(&self, lcp_id: u32, local_lcp_id: u32) -> Result<Lsn, LogError> {
        self.write_marker(UndoRecordType::LocalLcp, lcp_id, local_lcp_id)
            .await
    }

    async fn write_marker(
        &self,
        record_type: UndoRecordType,
        lcp_id: u32,
        local_lcp_id: u32,
    ) -> Result<Lsn, LogError> {
        let local_payload = [lcp_id, local_lcp_id];
        let payload = if record_type == UndoRecordType::LocalLcp {
            &local_payload[..]
        } else {
            &local_payload[..1]
        };
        let parts = [UndoEntry::new(record_type, payload)];
        let words = entry_words(&parts);

        let client = self.client("lcp");
        client.alloc_log_space_non_abortable(words)?;
        let mut permit = match client.get_log_buffer(words).await {
            Ok(permit) => permit,
            Err(err) => {
                let _ = client.free_log_space(words);
                return Err(err);
            },
        };

        let reserved = std::mem::take(&mut permit.reserved);
        let mut guard = self.inner.group.lock();
        let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
        let (lsn, page) = match group.append_entry(&parts, reserved) {
            Ok(placement) => placement,
            Err(err) => {
                group.buffer.release(reserved);
                return Err(err);
            },
        };
        group.lcp_markers.push_back(LcpMarker {
            lcp_id,
            local_lcp_id,
            lsn,
            page,
        });
        Self::debug_validate(group);

        tracing::info!(
            lcp_id = lcp_id,
            local_lcp_id = local_lcp_id,
            lsn = lsn,
            page = page,
            "wrote checkpoint marker",
        );
        Ok(lsn)
    }

    #[tracing::instrument("lgman-lcp-complete", skip(self))]
    /// Mark checkpoint `lcp_id` as complete, cutting the log tail up to the
    /// marker of the previous checkpoint.
    ///
    /// Returns the number of pages reclaimed.
    pub fn lcp_complete(&self, lcp_id: u32) -> Result<u64, LogError> {
        {
            let mut guard = self.inner.group.lock();
            let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;

            let Some(boundary) = group
                .lcp_markers
                .iter()
                .rev()
                .find(|marker| marker.lcp_id < lcp_id)
                .copied()
            else {
                return Ok(0);
            };

            group.lcp_markers.retain(|marker| marker.page >= boundary.page);
            let page = group.cut_boundary.map_or(boundary.page, |page| page.max(boundary.page));
            group.cut_boundary = Some(page);
        }

        self.cut_log_tail()
    }

    /// Reclaim every page before the current cut boundary.
    ///
    /// Returns the number of pages reclaimed, cutting again without a newer
    /// boundary reclaims nothing.
    pub fn cut_log_tail(&self) -> Result<u64, LogError> {
        let mut guard = self.inner.group.lock();
        let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
        group.ensure_state(&[GroupState::Online, GroupState::Dropping])?;

        let Some(target) = group.cut_boundary else {
            return Ok(0);
        };

        let freed = cut_tail_to(group, target);
        Self::debug_validate(group);

        if freed > 0 {
            self.inner.flush_notify.notify_one();
            tracing::info!(
                freed_pages = freed,
                tail_page = group.tail_page,
                free_log_words = group.space.free_words(),
                "cut log tail",
            );
        }

        Ok(freed)
    }
}

/// Move the tail forward up to `target`, never past the producer page.
///
/// Files the tail moves past are marked empty unless the producer is
/// writing to them.
pub(crate) fn cut_tail_to(group: &mut LogfileGroup, target: u64) -> u64 {
    if group.files.is_empty() {
        return 0;
    }

    let target = target.min(group.buffer.producer_page());
    let producer_file = group.files.locate(group.buffer.producer_page()).file_idx;
    let mut freed = 0;
    while group.tail_page < target {
        let position = group.files.locate(group.tail_page);
        let to_file_end = group.files.pages_to_file_end(group.tail_page);
        let pages = to_file_end.min(target - group.tail_page);

        if pages == to_file_end && position.file_idx != producer_file {
            group.files.get_mut(position.file_idx).state = UndoFileState::Empty;
        }

        group.tail_page += pages;
        group.space.credit(pages * PAGE_DATA_WORDS as u64);
        freed += pages;
    }

    freed
}
