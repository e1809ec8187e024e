use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::engine::{Action, PageAccess, PgmanCore};
use super::entry::*;
use super::*;
use crate::config::PgmanConfig;
use crate::ctx::Context;
use crate::memory_storage::MemoryStorage;


pub(super) const FILE_NO: u32 = 1;
pub(super) const TABLESPACE_ID: u32 = 3;

pub(super) fn test_config(max_pages: usize, max_hot_pages: usize) -> PgmanConfig {
    PgmanConfig {
        max_pages,
        max_hot_pages: Some(max_hot_pages),
        stats_loop_delay: Duration::from_secs(3600),
        cleanup_loop_delay: Duration::from_secs(3600),
        ..PgmanConfig::default()
    }
}

/// Drives a [PgmanCore] directly, completing every IO as soon as it is issued.
pub(super) struct Harness {
    pub(super) core: PgmanCore,
    pub(super) now: Instant,
    pub(super) writes: Vec<(PageKey, Lsn)>,
    pub(super) completed_lcps: Vec<u32>,
    /// Handles served to requests are held until [Harness::release_all].
    pub(super) hold_handles: bool,
    pub(super) held: Vec<u32>,
}

impl Harness {
    pub(super) async fn new(config: PgmanConfig, num_pages: u32) -> Self {
        let ctx = Context::for_test();
        let now = Instant::now();
        let mut core = PgmanCore::new(config, now);

        let zero_page = files::data_zero_page(FILE_NO, TABLESPACE_ID, num_pages, false);
        let data_file = files::create_data_file(&ctx, FILE_NO, &zero_page)
            .await
            .expect("create data file");
        assert!(core.files.alloc(FILE_NO));
        assert!(core.files.map(FILE_NO, data_file));

        Self {
            core,
            now,
            writes: Vec::new(),
            completed_lcps: Vec::new(),
            hold_handles: false,
            held: Vec::new(),
        }
    }

    /// Request a page and run the loops until the request is served.
    pub(super) fn access(&mut self, page_no: u32, flags: RequestFlags) -> Result<(), PageCacheError> {
        let key = PageKey::new(FILE_NO, page_no);
        match self.core.get_page(key, flags)? {
            PageAccess::Ready { id, .. } => self.served(id),
            PageAccess::Queued(rx) => {
                self.settle();
                drop(rx);
            },
        }
        self.settle();
        Ok(())
    }

    fn served(&mut self, id: u32) {
        if self.hold_handles {
            self.held.push(id);
        } else {
            self.core.release_handle(id);
        }
    }

    pub(super) fn release_all(&mut self) {
        for id in std::mem::take(&mut self.held) {
            self.core.release_handle(id);
        }
        self.settle();
    }

    /// Run the loops and complete their IO until no work is left.
    ///
    /// A stalled bind loop is retried a few times before giving up.
    pub(super) fn settle(&mut self) {
        let mut stalled_rounds = 0;
        for _ in 0..1_000 {
            self.core.run(self.now);
            let actions = self.core.take_actions();
            if actions.is_empty() {
                let stalled = !self.core.sublists[Sublist::Bind as usize].is_empty();
                if !stalled || stalled_rounds >= 5 {
                    return;
                }
                stalled_rounds += 1;
                self.now += Duration::from_millis(20);
                continue;
            }

            for action in actions {
                match action {
                    Action::Serve { id, .. } => self.served(id),
                    Action::Read(read) => self.core.pagein_done(read.id),
                    Action::Write(write) => {
                        self.writes.push((write.key, write.lsn));
                        self.core.pageout_log_synced(write.id, false);
                        self.core.pageout_done(write.id);
                    },
                    Action::LcpComplete(complete) => {
                        self.completed_lcps.push(complete.lcp_id);
                    },
                }
            }
        }
        panic!("page cache did not settle");
    }

    pub(super) fn state(&self, page_no: u32) -> Option<PageState> {
        self.core.page_state(PageKey::new(FILE_NO, page_no))
    }

    pub(super) fn check(&self) {
        if let Err(err) = self.core.check() {
            panic!("page cache invariant broken: {err}");
        }
    }
}

#[derive(Default)]
/// A log which is always durable, recording the LSNs it was asked to sync.
pub(super) struct DurableLog {
    pub(super) requested: Mutex<Vec<Lsn>>,
}

impl LogSync for DurableLog {
    fn sync_lsn(&self, lsn: Lsn) -> Result<SyncLsn, LogError> {
        self.requested.lock().push(lsn);
        Ok(SyncLsn::Durable)
    }
}

/// Create a page cache with a single freshly created data file.
pub(super) async fn cache_with_file(
    storage: &MemoryStorage,
    config: PgmanConfig,
    log: Arc<dyn LogSync>,
    num_pages: u32,
) -> Pgman {
    let ctx = Context::for_test_with_storage(storage.clone());
    ctx.set_config(config);
    let pgman = Pgman::new(ctx, log);
    pgman
        .create_data_file(FILE_NO, TABLESPACE_ID, num_pages)
        .await
        .expect("create data file");
    pgman
}

/// Wait until the cache has no IO in flight.
pub(super) async fn wait_idle(pgman: &Pgman) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while pgman.stats().current_io_waits > 0 {
        assert!(Instant::now() < deadline, "page cache io did not complete");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
