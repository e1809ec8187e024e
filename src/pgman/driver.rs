use std::sync::{Arc, Weak};

use tokio::time::Instant;

use super::engine::{Action, LcpComplete, PageRead, PageWrite};
use super::files::page_offset;
use super::{PageHandle, Pgman, PgmanInner};
use crate::layout::PAGE_SIZE;
use crate::layout::data_page::stamp_data_page;
use crate::lgman::SyncLsn;
use crate::utils::abort_system;

impl Pgman {
    /// Spawn the task running the cache loops.
    pub(super) fn spawn_driver(&self) {
        let inner = Arc::downgrade(&self.inner);
        let notify = self.inner.notify.clone();
        let handle = tokio::spawn(run_driver(inner, notify));
        if let Some(previous) = self.inner.driver.lock().replace(handle) {
            previous.abort();
        }
    }
}

async fn run_driver(inner: Weak<PgmanInner>, notify: Arc<tokio::sync::Notify>) {
    loop {
        let deadline = {
            let Some(inner) = inner.upgrade() else { break };
            let (actions, deadline) = {
                let mut core = inner.core.lock();
                core.run(Instant::now());
                (core.take_actions(), core.next_deadline())
            };
            for action in actions {
                dispatch(&inner, action);
            }
            deadline
        };

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = notify.notified() => {},
                    _ = tokio::time::sleep_until(deadline) => {},
                }
            },
            None => notify.notified().await,
        }
    }
}

/// Execute an action outside the cache lock.
fn dispatch(inner: &Arc<PgmanInner>, action: Action) {
    match action {
        Action::Serve {
            waiter,
            id,
            key,
            buffer,
        } => {
            let handle = PageHandle {
                inner: inner.clone(),
                id,
                key,
                buffer,
            };
            // A waiter which gave up drops the handle, releasing the page again.
            let _ = waiter.send(handle);
        },
        Action::Read(read) => {
            tokio::spawn(read_page(inner.clone(), read));
        },
        Action::Write(write) => {
            tokio::spawn(write_page(inner.clone(), write));
        },
        Action::LcpComplete(complete) => {
            tokio::spawn(complete_lcp(complete));
        },
    }
}

async fn read_page(inner: Arc<PgmanInner>, read: PageRead) {
    let data = match read.file.read_at(PAGE_SIZE, page_offset(read.key.page_no)).await {
        Ok(data) => data,
        Err(err) => abort_system("failed to read data page", Some(&err)),
    };
    read.buffer.write().copy_from_slice(&data);

    tracing::trace!(key = ?read.key, "page read complete");
    inner.core.lock().pagein_done(read.id);
    inner.notify.notify_one();
}

/// Write out a page once the log covering its newest change is durable.
async fn write_page(inner: Arc<PgmanInner>, mut write: PageWrite) {
    inner
        .client
        .page_unmap(write.key, &mut write.data, write.dirty_count);
    stamp_data_page(&mut write.data, write.lsn);

    if write.lsn > 0 {
        let waited = match inner.log.sync_lsn(write.lsn) {
            Ok(SyncLsn::Durable) => false,
            Ok(SyncLsn::Queued(rx)) => {
                if rx.await.is_err() {
                    abort_system("log dropped before page lsn was durable", Some(&write.key));
                }
                true
            },
            Err(err) => abort_system("failed to sync log for page write", Some(&err)),
        };
        inner.core.lock().pageout_log_synced(write.id, waited);
    }

    let offset = page_offset(write.key.page_no);
    if let Err(err) = write.file.write_at(write.data, offset).await {
        abort_system("failed to write data page", Some(&err));
    }

    tracing::trace!(key = ?write.key, lsn = write.lsn, "page write complete");
    inner.core.lock().pageout_done(write.id);
    inner.notify.notify_one();
}

async fn complete_lcp(complete: LcpComplete) {
    for file in complete.files {
        if let Err(err) = file.sync_data().await {
            abort_system("failed to sync data file for checkpoint", Some(&err));
        }
    }
    tracing::info!(lcp_id = complete.lcp_id, "checkpoint complete");
    let _ = complete.waiter.send(());
}
