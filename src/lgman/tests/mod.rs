use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::*;
use crate::config::LgmanConfig;
use crate::ctx::Context;
use crate::layout::record::UndoRecordType;
use crate::memory_storage::MemoryStorage;

mod accounting;
mod append;

pub(super) const GROUP_ID: u32 = 7;
pub(super) const GROUP_VERSION: u32 = 1;

pub(super) fn test_config() -> LgmanConfig {
    LgmanConfig {
        buffer_pages: 8,
        flush_interval: Duration::from_secs(3600),
        ..LgmanConfig::default()
    }
}

/// Create a new online log manager with freshly created files.
pub(super) async fn online_lgman(
    storage: &MemoryStorage,
    config: LgmanConfig,
    files: &[(u32, u32)],
) -> Lgman {
    let ctx = Context::for_test_with_storage(storage.clone());
    ctx.set_config(config);
    let lgman = Lgman::new(ctx);
    lgman
        .create_logfile_group(GROUP_ID, GROUP_VERSION)
        .expect("create group");
    for &(file_no, num_pages) in files {
        lgman
            .create_undo_file(file_no, num_pages)
            .await
            .expect("create undo file");
    }
    lgman.go_online().expect("go online");
    lgman
}

/// Open the files of a crashed node and discover the log head.
pub(super) async fn restarted_lgman(
    storage: &MemoryStorage,
    config: LgmanConfig,
    files: &[(u32, u32)],
) -> (Lgman, Option<LogHead>) {
    let ctx = Context::for_test_with_storage(storage.clone());
    ctx.set_config(config);
    let lgman = Lgman::new(ctx);
    lgman
        .create_logfile_group(GROUP_ID, GROUP_VERSION)
        .expect("create group");
    for &(file_no, num_pages) in files {
        lgman
            .open_undo_file(file_no, num_pages)
            .await
            .expect("open undo file");
    }
    let head = lgman.start_recovery().await.expect("find log head");
    (lgman, head)
}

/// Append a single part entry, the log space cannot be aborted.
pub(super) async fn append(
    client: &LogfileClient,
    record_type: UndoRecordType,
    payload: &[u32],
) -> Result<Lsn, LogError> {
    let parts = [UndoEntry::new(record_type, payload)];
    append_parts(client, &parts).await
}

pub(super) async fn append_parts(
    client: &LogfileClient,
    parts: &[UndoEntry<'_>],
) -> Result<Lsn, LogError> {
    let words = entry_words(parts);
    client.alloc_log_space_non_abortable(words)?;
    let permit = client.get_log_buffer(words).await?;
    client.add_entry(permit, parts)
}

/// An entry payload filling exactly one log page.
pub(super) fn full_page_payload(tag: u32) -> Vec<u32> {
    vec![tag; PAGE_DATA_WORDS - 1]
}

#[derive(Default)]
/// Records every UNDO record it is asked to apply.
pub(super) struct RecordingApplier {
    pub(super) records: Mutex<Vec<UndoRecord>>,
    pub(super) workers: usize,
    pub(super) fail_at: Option<Lsn>,
}

impl RecordingApplier {
    pub(super) fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    pub(super) fn lsns(&self) -> Vec<Lsn> {
        self.records.lock().iter().map(|record| record.lsn).collect()
    }
}

impl UndoApplier for RecordingApplier {
    fn worker_for(&self, record: &UndoRecord) -> Option<usize> {
        if self.workers == 0 {
            return None;
        }
        record.payload.first().map(|&key| key as usize % self.workers)
    }

    async fn disk_restart_undo(&self, record: UndoRecord) -> Result<ApplyOutcome, ApplyError> {
        if self.fail_at == Some(record.lsn) {
            return Err(ApplyError {
                lsn: record.lsn,
                reason: "page unavailable".to_string(),
            });
        }
        tokio::task::yield_now().await;
        self.records.lock().push(record);
        Ok(ApplyOutcome::Applied)
    }
}

pub(super) fn applier(applier: RecordingApplier) -> Arc<RecordingApplier> {
    Arc::new(applier)
}
