//! The page cache manager.
//!
//! Data pages are cached in a fixed pool of page buffers. Requests for a
//! page either find it resident and get a handle immediately, or queue
//! until a background driver has bound a buffer, read the page and handed
//! it over. Replacement follows the LIRS policy, and dirty pages are only
//! written once the UNDO log is durable up to the newest change on them.

mod driver;
mod engine;
mod entry;
mod files;
mod lirs;
mod list;
mod loops;
mod table;
#[cfg(all(test, not(feature = "test-miri")))]
mod tests;

use std::fmt::{Debug, Formatter};
use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use self::engine::{PageAccess, PageBuffer, PgmanCore};
pub use self::entry::{PageState, RequestFlags};
pub use self::files::OpenDataFileError;
#[cfg(feature = "bench-internal")]
pub use self::lirs::LirsSimulation;
use crate::config::PgmanConfig;
use crate::ctx;
use crate::directory::FileGroup;
use crate::layout::{Lsn, PageKey};
use crate::lgman::{Lgman, LogError, SyncLsn};

#[derive(Debug, thiserror::Error)]
/// An error returned by the page cache.
pub enum PageCacheError {
    #[error("page {0:?} does not exist")]
    /// The page is outside the file or not present in the cache.
    NoSuchPage(PageKey),
    #[error("page {0:?} is in use")]
    /// The page has IO or requests in progress.
    PageBusy(PageKey),
    #[error("out of page entries")]
    /// Every page entry is in use and none can be reclaimed.
    OutOfPageEntries,
    #[error("data file {0} is not mapped")]
    /// The file number is not attached to a data file.
    UnknownFile(u32),
    #[error("data file {0} already exists")]
    /// The file number is already in use.
    FileExists(u32),
    #[error("data file {0} has pages in use")]
    /// The file still has pages cached or requested.
    FileInUse(u32),
    #[error("checkpoint {0} is already running")]
    /// Only a single checkpoint can run at a time.
    LcpInProgress(u32),
    #[error("failed to open data file {file_no}: {source}")]
    /// An existing data file could not be opened.
    OpenFile {
        /// The file number.
        file_no: u32,
        #[source]
        /// The reason the file could not be opened.
        source: OpenDataFileError,
    },
    #[error("the page cache has shut down")]
    /// The cache was dropped while the operation was waiting.
    Shutdown,
    #[error(transparent)]
    /// An IO error occurred.
    IO(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A snapshot of the page cache counters.
pub struct PgmanStats {
    /// The number of page buffers.
    pub num_pages: usize,
    /// The number of page buffers not bound to any page.
    pub num_free_pages: usize,
    /// The number of entries in the hot set.
    pub num_hot_pages: usize,
    /// The number of page entries, resident or not.
    pub num_entries: usize,
    /// The number of entries on the LIRS stack.
    pub stack_len: usize,
    /// The number of resident cold entries.
    pub queue_len: usize,
    /// The number of reads and writes in flight.
    pub current_io_waits: usize,
    /// Requests served without waiting.
    pub page_hits: u64,
    /// Requests for pages which were not resident.
    pub page_faults: u64,
    /// Pages read from disk.
    pub page_reads: u64,
    /// Pages written to disk.
    pub page_writes: u64,
    /// Writes which had to wait for the log to become durable.
    pub log_waits: u64,
    /// The number of times binding a page found no evictable buffer.
    pub stalls: u64,
    /// Pages written on behalf of checkpoints.
    pub lcp_pages_written: u64,
}

/// Makes the UNDO log durable before data pages are written.
pub trait LogSync: Send + Sync + 'static {
    /// Request the log to be durable up to `lsn`.
    fn sync_lsn(&self, lsn: Lsn) -> Result<SyncLsn, LogError>;
}

impl LogSync for Lgman {
    fn sync_lsn(&self, lsn: Lsn) -> Result<SyncLsn, LogError> {
        Lgman::sync_lsn(self, lsn)
    }
}

/// Notified before a page is written out.
pub trait PageClient: Send + Sync + 'static {
    /// Called with the copy of the page about to be written.
    ///
    /// The first bytes of the page are reserved for the page header and
    /// are overwritten once this returns.
    fn page_unmap(&self, key: PageKey, page: &mut [u8], dirty_count: u32);
}

impl PageClient for () {
    fn page_unmap(&self, _key: PageKey, _page: &mut [u8], _dirty_count: u32) {}
}

/// The result of a page request.
pub enum GetPage {
    /// The page was resident.
    Ready(PageHandle),
    /// The page will be handed over once it is resident.
    Queued(oneshot::Receiver<PageHandle>),
}

impl Debug for GetPage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(handle) => f.debug_tuple("Ready").field(handle).finish(),
            Self::Queued(_) => f.write_str("Queued"),
        }
    }
}

/// A live reference to a resident page.
///
/// The page stays in the cache, and is not written out, while any handle
/// to it is alive.
pub struct PageHandle {
    inner: Arc<PgmanInner>,
    id: u32,
    key: PageKey,
    buffer: PageBuffer,
}

impl Debug for PageHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle").field("key", &self.key).finish()
    }
}

impl PageHandle {
    #[inline]
    /// The page the handle refers to.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Read access to the page contents.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buffer.read()
    }

    /// Write access to the page contents.
    ///
    /// Changes must be followed by [PageHandle::update_lsn] for the page to
    /// be written out.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.buffer.write()
    }

    /// Record the LSN of a change made to the page.
    pub fn update_lsn(&self, lsn: Lsn) {
        self.inner.core.lock().update_lsn_by_id(self.id, lsn);
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.inner.core.lock().release_handle(self.id);
        self.inner.notify.notify_one();
    }
}

#[derive(Clone)]
/// The page cache manager.
pub struct Pgman {
    inner: Arc<PgmanInner>,
}

pub(crate) struct PgmanInner {
    ctx: Arc<ctx::Context>,
    config: PgmanConfig,
    core: Mutex<PgmanCore>,
    log: Arc<dyn LogSync>,
    client: Arc<dyn PageClient>,
    notify: Arc<Notify>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PgmanInner {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}

impl Pgman {
    /// Create a new page cache using the [PgmanConfig] registered on the context.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(ctx: Arc<ctx::Context>, log: Arc<dyn LogSync>) -> Self {
        Self::with_client(ctx, log, Arc::new(()))
    }

    /// Create a new page cache which notifies `client` before pages are written.
    pub fn with_client(
        ctx: Arc<ctx::Context>,
        log: Arc<dyn LogSync>,
        client: Arc<dyn PageClient>,
    ) -> Self {
        let config: PgmanConfig = ctx.config_opt().unwrap_or_default();
        let core = PgmanCore::new(config.clone(), Instant::now());
        let pgman = Self {
            inner: Arc::new(PgmanInner {
                ctx,
                config,
                core: Mutex::new(core),
                log,
                client,
                notify: Arc::new(Notify::new()),
                driver: Mutex::new(None),
            }),
        };
        pgman.spawn_driver();
        pgman
    }

    /// Request a page.
    ///
    /// Resident pages are returned immediately, otherwise the request is
    /// queued and completes once the page has been read.
    pub fn get_page(&self, key: PageKey, flags: RequestFlags) -> Result<GetPage, PageCacheError> {
        let access = self.inner.core.lock().get_page(key, flags)?;
        let result = match access {
            PageAccess::Ready { id, buffer } => GetPage::Ready(PageHandle {
                inner: self.inner.clone(),
                id,
                key,
                buffer,
            }),
            PageAccess::Queued(rx) => {
                self.inner.notify.notify_one();
                GetPage::Queued(rx)
            },
        };
        Ok(result)
    }

    /// Request a page and wait until it is resident.
    pub async fn fetch_page(
        &self,
        key: PageKey,
        flags: RequestFlags,
    ) -> Result<PageHandle, PageCacheError> {
        match self.get_page(key, flags)? {
            GetPage::Ready(handle) => Ok(handle),
            GetPage::Queued(rx) => rx.await.map_err(|_| PageCacheError::Shutdown),
        }
    }

    /// Record the LSN of a change to a resident page and mark it dirty.
    pub fn update_lsn(&self, key: PageKey, lsn: Lsn) -> Result<(), PageCacheError> {
        self.inner.core.lock().update_lsn(key, lsn)
    }

    /// Remove a page from the cache, discarding any unwritten changes.
    pub fn drop_page(&self, key: PageKey) -> Result<(), PageCacheError> {
        self.inner.core.lock().drop_page(key)?;
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Start a checkpoint.
    ///
    /// The receiver completes once every page dirty at the start of the
    /// checkpoint has been written and the data files are synced.
    pub fn start_lcp(&self, lcp_id: u32) -> Result<oneshot::Receiver<()>, PageCacheError> {
        let rx = self.inner.core.lock().start_lcp(lcp_id, Instant::now())?;
        self.inner.notify.notify_one();
        Ok(rx)
    }

    #[tracing::instrument("pgman-lcp", skip(self))]
    /// Run a checkpoint to completion.
    pub async fn lcp(&self, lcp_id: u32) -> Result<(), PageCacheError> {
        let rx = self.start_lcp(lcp_id)?;
        rx.await.map_err(|_| PageCacheError::Shutdown)
    }

    /// Reserve a data file number.
    pub fn alloc_data_file(&self, file_no: u32) -> Result<(), PageCacheError> {
        if !self.inner.core.lock().files.alloc(file_no) {
            return Err(PageCacheError::FileExists(file_no));
        }
        Ok(())
    }

    #[tracing::instrument("pgman-map-file", skip(self))]
    /// Open the data file of a reserved file number and attach it to the cache.
    pub async fn map_file_no(
        &self,
        file_no: u32,
        tablespace_id: u32,
        num_pages: u32,
    ) -> Result<(), PageCacheError> {
        if !self.inner.core.lock().files.contains(file_no) {
            return Err(PageCacheError::UnknownFile(file_no));
        }
        let zero_page = files::data_zero_page(
            file_no,
            tablespace_id,
            num_pages,
            self.inner.config.encrypted_filesystem,
        );
        let data_file = files::open_data_file(&self.inner.ctx, file_no, &zero_page)
            .await
            .map_err(|source| PageCacheError::OpenFile { file_no, source })?;
        self.attach(file_no, data_file)
    }

    #[tracing::instrument("pgman-create-data-file", skip(self))]
    /// Create a new data file of `num_pages` pages and attach it to the cache.
    ///
    /// Page `0` holds the zero page, pages `1..num_pages` hold data.
    pub async fn create_data_file(
        &self,
        file_no: u32,
        tablespace_id: u32,
        num_pages: u32,
    ) -> Result<(), PageCacheError> {
        self.alloc_data_file(file_no)?;
        let zero_page = files::data_zero_page(
            file_no,
            tablespace_id,
            num_pages,
            self.inner.config.encrypted_filesystem,
        );
        match files::create_data_file(&self.inner.ctx, file_no, &zero_page).await {
            Ok(data_file) => self.attach(file_no, data_file),
            Err(err) => {
                self.inner.core.lock().files.release(file_no);
                Err(err.into())
            },
        }
    }

    /// Open an existing data file and attach it to the cache.
    pub async fn open_data_file(
        &self,
        file_no: u32,
        tablespace_id: u32,
        num_pages: u32,
    ) -> Result<(), PageCacheError> {
        self.alloc_data_file(file_no)?;
        let result = self.map_file_no(file_no, tablespace_id, num_pages).await;
        if result.is_err() {
            self.inner.core.lock().files.release(file_no);
        }
        result
    }

    fn attach(&self, file_no: u32, data_file: files::DataFile) -> Result<(), PageCacheError> {
        if !self.inner.core.lock().files.map(file_no, data_file) {
            return Err(PageCacheError::UnknownFile(file_no));
        }
        Ok(())
    }

    #[tracing::instrument("pgman-free-data-file", skip(self))]
    /// Detach a data file from the cache, optionally removing it from disk.
    ///
    /// None of its pages may be resident or requested.
    pub async fn free_data_file(&self, file_no: u32, remove: bool) -> Result<(), PageCacheError> {
        {
            let mut core = self.inner.core.lock();
            if !core.files.contains(file_no) {
                return Err(PageCacheError::UnknownFile(file_no));
            }
            if core.file_in_use(file_no) {
                return Err(PageCacheError::FileInUse(file_no));
            }
            core.forget_file(file_no);
            core.files.release(file_no);
        }

        if remove {
            self.inner
                .ctx
                .directory()
                .remove_file(FileGroup::Data, file_no)
                .await?;
        }
        tracing::info!(file_no = file_no, removed = remove, "freed data file");
        Ok(())
    }

    /// Returns a snapshot of the cache counters.
    pub fn stats(&self) -> PgmanStats {
        self.inner.core.lock().stats()
    }

    /// Returns the state of the page entry, if one exists.
    pub fn page_state(&self, key: PageKey) -> Option<PageState> {
        self.inner.core.lock().page_state(key)
    }

    /// Check the internal consistency of the cache.
    pub fn validate(&self) -> Result<(), String> {
        self.inner.core.lock().check()
    }
}
