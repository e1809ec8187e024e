use std::mem;
use std::sync::Arc;

use super::group::WriteBatch;
use super::{Lgman, LogError};
use crate::layout::PAGE_SIZE;
use crate::utils::abort_system;

impl Lgman {
    #[tracing::instrument("lgman-flush", skip_all)]
    /// Write every complete buffer page to the ring.
    ///
    /// The producer page is closed early if a caller waits on an LSN it
    /// holds. Returns the number of pages written.
    pub async fn flush_log(&self) -> Result<u64, LogError> {
        let _flush_guard = self.inner.flush_lock.lock().await;
        let checksums = self.inner.config.page_checksums;

        let mut pages_written = 0;
        loop {
            let batch = {
                let mut guard = self.inner.group.lock();
                let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
                match group.prepare_batch(checksums) {
                    Some(batch) => batch,
                    None => break,
                }
            };

            let batch = write_batch(batch).await;
            pages_written += batch.num_pages;

            let mut guard = self.inner.group.lock();
            let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
            group.complete_batch(&batch);
            Self::debug_validate(group);
        }

        Ok(pages_written)
    }

    pub(super) fn spawn_flusher(&self) {
        let inner = Arc::downgrade(&self.inner);
        let notify = self.inner.flush_notify.clone();
        let interval = self.inner.config.flush_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {},
                    _ = tokio::time::sleep(interval) => {},
                }

                let Some(inner) = inner.upgrade() else { break };
                let lgman = Lgman { inner };
                let has_work = lgman
                    .inner
                    .group
                    .lock()
                    .as_ref()
                    .is_some_and(|group| group.has_pending_writes());
                if !has_work {
                    continue;
                }

                if let Err(err) = lgman.flush_log().await {
                    tracing::warn!(error = %err, "background flusher stopping");
                    break;
                }
            }
        });

        if let Some(previous) = self.inner.flusher.lock().replace(handle) {
            previous.abort();
        }
    }
}

/// Write the batch and make it durable.
///
/// A failed log write leaves the durability of every later entry unknown,
/// the system is aborted.
async fn write_batch(mut batch: WriteBatch) -> WriteBatch {
    let offset = batch.page_no as u64 * PAGE_SIZE as u64;
    let data = mem::take(&mut batch.data);

    if let Err(err) = batch.file.write_at(data, offset).await {
        abort_system("failed to write undo log pages", Some(&err));
    }
    if let Err(err) = batch.file.sync_data().await {
        abort_system("failed to sync undo log pages", Some(&err));
    }

    tracing::debug!(
        file_no = batch.file_no,
        page_no = batch.page_no,
        num_pages = batch.num_pages,
        last_lsn = batch.last_lsn,
        "wrote undo log pages",
    );

    batch
}
