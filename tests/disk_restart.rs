use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lnx_diskdata::layout::data_page::DATA_PAGE_HEADER_SIZE;
use lnx_diskdata::layout::record::entry_words;
use lnx_diskdata::lgman::{ApplyError, ApplyOutcome, StopReason, UndoApplier, UndoRecord};
use lnx_diskdata::{
    ContextBuilder,
    Lgman,
    LgmanConfig,
    LogfileClient,
    Lsn,
    MemoryStorage,
    PageKey,
    Pgman,
    PgmanConfig,
    RequestFlags,
    UndoEntry,
    UndoRecordType,
};
use parking_lot::Mutex;

const GROUP_ID: u32 = 1;
const GROUP_VERSION: u32 = 1;
const UNDO_FILES: &[(u32, u32)] = &[(1, 32), (2, 32)];
const DATA_FILE_NO: u32 = 10;
const TABLESPACE_ID: u32 = 4;
const DATA_PAGES: u32 = 17;
const SLOTS: u32 = 8;

fn read_slot(page: &[u8], slot: u32) -> u32 {
    let offset = DATA_PAGE_HEADER_SIZE + slot as usize * 4;
    u32::from_le_bytes(page[offset..offset + 4].try_into().unwrap())
}

fn write_slot(page: &mut [u8], slot: u32, value: u32) {
    let offset = DATA_PAGE_HEADER_SIZE + slot as usize * 4;
    page[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn checkpoint_value(page_no: u32, slot: u32) -> u32 {
    page_no * 100 + slot
}

async fn open_context(storage: &MemoryStorage) -> anyhow::Result<Arc<lnx_diskdata::Context>> {
    let ctx = ContextBuilder::in_memory(storage.clone())
        .open()
        .await
        .context("open context")?;
    // Only explicit sync requests flush the log.
    ctx.set_config(LgmanConfig {
        flush_interval: Duration::from_secs(3600),
        ..LgmanConfig::default()
    });
    ctx.set_config(PgmanConfig {
        max_pages: 4,
        max_hot_pages: Some(2),
        ..PgmanConfig::default()
    });
    Ok(Arc::new(ctx))
}

/// A node with freshly created log and data files.
async fn create_node(storage: &MemoryStorage) -> anyhow::Result<(Lgman, Pgman)> {
    let ctx = open_context(storage).await?;
    let lgman = Lgman::new(ctx.clone());
    lgman.create_logfile_group(GROUP_ID, GROUP_VERSION)?;
    for &(file_no, num_pages) in UNDO_FILES {
        lgman
            .create_undo_file(file_no, num_pages)
            .await
            .context("create undo file")?;
    }
    lgman.go_online()?;

    let pgman = Pgman::new(ctx, Arc::new(lgman.clone()));
    pgman
        .create_data_file(DATA_FILE_NO, TABLESPACE_ID, DATA_PAGES)
        .await
        .context("create data file")?;
    Ok((lgman, pgman))
}

/// Replace a slot value, logging the previous value first.
async fn update_slot(
    pgman: &Pgman,
    client: &LogfileClient,
    page_no: u32,
    slot: u32,
    value: u32,
) -> anyhow::Result<Lsn> {
    let key = PageKey::new(DATA_FILE_NO, page_no);
    let handle = pgman.fetch_page(key, RequestFlags::NONE).await?;
    let previous = read_slot(&handle.read()[..], slot);

    let payload = [page_no, slot, previous];
    let parts = [UndoEntry::new(UndoRecordType::TupUpdate, &payload)];
    let words = entry_words(&parts);
    client.alloc_log_space(words)?;
    let permit = client.get_log_buffer(words).await?;
    let lsn = client.add_entry(permit, &parts)?;

    write_slot(&mut handle.write()[..], slot, value);
    handle.update_lsn(lsn);
    Ok(lsn)
}

async fn wait_idle(pgman: &Pgman) {
    for _ in 0..10_000 {
        if pgman.stats().current_io_waits == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("page cache io did not complete");
}

/// Restores the previous slot value recorded in each UNDO record.
struct SlotRestorer {
    pgman: Pgman,
    applied: Mutex<Vec<Lsn>>,
}

impl UndoApplier for SlotRestorer {
    async fn disk_restart_undo(&self, record: UndoRecord) -> Result<ApplyOutcome, ApplyError> {
        let lsn = record.lsn;
        let [page_no, slot, previous] = record.payload[..] else {
            return Err(ApplyError {
                lsn,
                reason: format!("unexpected payload {:?}", record.payload),
            });
        };

        let key = PageKey::new(DATA_FILE_NO, page_no);
        let handle = self
            .pgman
            .fetch_page(key, RequestFlags::NONE)
            .await
            .map_err(|err| ApplyError {
                lsn,
                reason: err.to_string(),
            })?;
        write_slot(&mut handle.write()[..], slot, previous);
        handle.update_lsn(lsn);
        drop(handle);

        self.applied.lock().push(lsn);
        Ok(ApplyOutcome::Applied)
    }
}

#[rstest::rstest]
#[case::power_loss(true)]
#[case::process_exit(false)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_restores_checkpoint_state(#[case] power_loss: bool) -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let storage = MemoryStorage::new();
    let (lgman, pgman) = create_node(&storage).await?;
    let client = lgman.client("tup");

    for page_no in 1..DATA_PAGES {
        for slot in 0..SLOTS {
            update_slot(&pgman, &client, page_no, slot, checkpoint_value(page_no, slot)).await?;
        }
    }

    lgman.lcp_start(1).await.context("write checkpoint marker")?;
    pgman.lcp(1).await.context("run checkpoint")?;
    lgman.lcp_complete(1)?;
    let checkpoint_writes = pgman.stats().page_writes;

    let mut newest = 0;
    for round in 0..3 {
        for page_no in 1..DATA_PAGES {
            newest = update_slot(&pgman, &client, page_no, round % SLOTS, 9_000 + round).await?;
        }
    }
    wait_idle(&pgman).await;

    // The cache only holds 4 pages, changes after the checkpoint reached the disk.
    let stats = pgman.stats();
    assert!(stats.page_writes > checkpoint_writes, "stats={stats:?}");
    assert!(stats.log_waits > 0, "stats={stats:?}");
    pgman.validate().map_err(anyhow::Error::msg)?;

    let restart_storage = if power_loss {
        storage.crash_image()
    } else {
        storage.clone()
    };
    drop(client);
    drop(pgman);
    drop(lgman);

    let ctx = open_context(&restart_storage).await?;
    let lgman = Lgman::new(ctx.clone());
    lgman.create_logfile_group(GROUP_ID, GROUP_VERSION)?;
    for &(file_no, num_pages) in UNDO_FILES {
        lgman
            .open_undo_file(file_no, num_pages)
            .await
            .context("open undo file")?;
    }
    let head = lgman
        .start_recovery()
        .await
        .context("find log head")?
        .context("log must not be empty")?;
    assert!(head.lsn <= newest);

    let pgman = Pgman::new(ctx, Arc::new(lgman.clone()));
    pgman
        .open_data_file(DATA_FILE_NO, TABLESPACE_ID, DATA_PAGES)
        .await
        .context("open data file")?;

    let restorer = Arc::new(SlotRestorer {
        pgman: pgman.clone(),
        applied: Mutex::new(Vec::new()),
    });
    let report = lgman
        .execute_undo_log(1, restorer.clone())
        .await
        .context("execute undo log")?;
    assert!(matches!(report.stop, StopReason::LcpMarker { lcp_id: 1, .. }));
    assert_eq!(report.head_lsn, Some(head.lsn));

    let applied = restorer.applied.lock().clone();
    assert_eq!(applied.len() as u64, report.records_applied);
    assert!(applied.windows(2).all(|pair| pair[0] > pair[1]), "undo must run newest first");
    assert!(applied.first().is_some_and(|&lsn| lsn == head.lsn));

    for page_no in 1..DATA_PAGES {
        let handle = pgman
            .fetch_page(PageKey::new(DATA_FILE_NO, page_no), RequestFlags::NONE)
            .await?;
        let page = handle.read();
        for slot in 0..SLOTS {
            assert_eq!(
                read_slot(&page[..], slot),
                checkpoint_value(page_no, slot),
                "page {page_no} slot {slot} was not restored",
            );
        }
    }

    lgman.go_online()?;
    let client = lgman.client("tup");
    let lsn = update_slot(&pgman, &client, 1, 0, 42).await?;
    assert_eq!(lsn, head.lsn + 1);
    lgman.wait_for_lsn(lsn).await?;

    pgman.validate().map_err(anyhow::Error::msg)?;
    lgman.validate()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_without_changes_after_checkpoint() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let storage = MemoryStorage::new();
    let (lgman, pgman) = create_node(&storage).await?;
    let client = lgman.client("tup");

    for page_no in 1..5 {
        update_slot(&pgman, &client, page_no, 0, checkpoint_value(page_no, 0)).await?;
    }
    let marker = lgman.lcp_start(7).await?;
    pgman.lcp(7).await?;
    lgman.wait_for_lsn(marker).await?;

    let image = storage.crash_image();
    drop(client);
    drop(pgman);
    drop(lgman);

    let ctx = open_context(&image).await?;
    let lgman = Lgman::new(ctx.clone());
    lgman.create_logfile_group(GROUP_ID, GROUP_VERSION)?;
    for &(file_no, num_pages) in UNDO_FILES {
        lgman.open_undo_file(file_no, num_pages).await?;
    }
    let head = lgman.start_recovery().await?.context("log must not be empty")?;
    assert_eq!(head.lsn, marker);

    let pgman = Pgman::new(ctx, Arc::new(lgman.clone()));
    pgman.open_data_file(DATA_FILE_NO, TABLESPACE_ID, DATA_PAGES).await?;
    let restorer = Arc::new(SlotRestorer {
        pgman: pgman.clone(),
        applied: Mutex::new(Vec::new()),
    });
    let report = lgman.execute_undo_log(7, restorer.clone()).await?;

    assert_eq!(
        report.stop,
        StopReason::LcpMarker {
            lcp_id: 7,
            local_lcp_id: 0,
            lsn: marker,
        },
    );
    assert_eq!(report.records_applied, 0);
    assert!(restorer.applied.lock().is_empty());

    for page_no in 1..5 {
        let handle = pgman
            .fetch_page(PageKey::new(DATA_FILE_NO, page_no), RequestFlags::NONE)
            .await?;
        assert_eq!(read_slot(&handle.read()[..], 0), checkpoint_value(page_no, 0));
    }
    Ok(())
}
