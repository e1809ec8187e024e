//! The UNDO log manager.
//!
//! A single logfile group owns a ring of UNDO files. Clients reserve log
//! space, reserve room in the in-memory log buffer and append entries which
//! are assigned a monotonically increasing LSN. A background flusher writes
//! completed buffer pages to the ring, waking anyone waiting for their LSN
//! to become durable. On restart the head of the log is discovered and the
//! log is executed backwards to undo every change made after the restored
//! checkpoint.

mod buffer;
mod file_set;
mod group;
mod search;
mod space;
mod tail;
#[cfg(all(test, not(feature = "test-miri")))]
mod tests;
mod undo;
mod writer;

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

pub use self::file_set::{OpenUndoFileError, UndoFileState};
use self::file_set::UndoFile;
pub(crate) use self::buffer::PAGE_DATA_WORDS;
use self::group::LogfileGroup;
pub use self::search::LogHead;
pub use self::space::AccountingError;
pub use self::undo::{
    ApplyError,
    ApplyOutcome,
    RecoveryReport,
    StopReason,
    UndoApplier,
    UndoRecord,
};
use crate::config::LgmanConfig;
use crate::ctx;
use crate::layout::Lsn;
use crate::layout::record::{UndoEntry, entry_words};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The lifecycle state of the logfile group.
pub enum GroupState {
    /// Files are being declared, no log data has been read or written.
    Starting,
    /// The log head is being searched for.
    Searching,
    /// The log head is known and the log is ready to be executed.
    Recovered,
    /// The UNDO log is being executed.
    Executing,
    /// UNDO execution has completed.
    Executed,
    /// The group accepts new log entries.
    Online,
    /// The group is being dropped.
    Dropping,
}

#[derive(Debug, thiserror::Error)]
/// An error returned by the log manager.
pub enum LogError {
    #[error("out of undo log space")]
    /// There is not enough free log space for the allocation.
    OutOfLogSpace,
    #[error("entry of {0} words does not fit on a log page")]
    /// The entry is larger than a single log page.
    RecordTooLarge(usize),
    #[error("entry of {words} words exceeds the buffer reservation of {reserved} words")]
    /// The entry is larger than the buffer reservation it was added with.
    PermitTooSmall {
        /// The words required by the entry.
        words: usize,
        /// The words reserved by the permit.
        reserved: usize,
    },
    #[error("log space not allocated requested={requested} reserved={reserved}")]
    /// The log space for the entry was not allocated beforehand.
    SpaceNotAllocated {
        /// The words requested.
        requested: u64,
        /// The words currently reserved.
        reserved: u64,
    },
    #[error("no logfile group exists")]
    /// The logfile group has not been created.
    NoLogfileGroup,
    #[error("a logfile group already exists")]
    /// Only a single logfile group is supported.
    LogfileGroupExists,
    #[error("undo file {0} is already part of the group")]
    /// The file number is already in use by the group.
    FileExists(u32),
    #[error("undo file must have at least 2 pages, got {0}")]
    /// The file is too small to hold any log data.
    FileTooSmall(u32),
    #[error("operation not allowed while the group is {0:?}")]
    /// The group is not in a state which allows the operation.
    InvalidState(GroupState),
    #[error("lsn {0} has not been assigned")]
    /// The LSN is newer than any entry in the log.
    InvalidLsn(Lsn),
    #[error("failed to open undo file {file_no}: {source}")]
    /// An existing file could not be opened.
    OpenFile {
        /// The file number.
        file_no: u32,
        #[source]
        /// The reason the file could not be opened.
        source: OpenUndoFileError,
    },
    #[error("the logfile group was dropped while waiting")]
    /// The group was dropped while the operation was waiting.
    Dropped,
    #[error(transparent)]
    /// An IO error occurred.
    IO(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
/// An error preventing the log from being recovered.
pub enum RecoveryError {
    #[error("undo log corrupted in file {file_no} page {page_no}: {reason}")]
    /// A page could not be trusted after records had already been applied.
    Corrupted {
        /// The file holding the page.
        file_no: u32,
        /// The page number.
        page_no: u32,
        /// Why the page is invalid.
        reason: String,
    },
    #[error(transparent)]
    /// A record could not be applied.
    Apply(#[from] ApplyError),
    #[error("undo apply worker stopped unexpectedly")]
    /// An apply worker exited before execution completed.
    WorkerLost,
    #[error(transparent)]
    /// The log manager rejected the operation.
    Log(#[from] LogError),
    #[error(transparent)]
    /// An IO error occurred.
    IO(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A snapshot of the logfile group state.
pub struct LogStats {
    /// The group state.
    pub state: GroupState,
    /// The number of UNDO files in the ring.
    pub num_files: usize,
    /// The LSN assigned to the next entry.
    pub next_lsn: Lsn,
    /// The newest LSN known to be durable.
    pub last_synced_lsn: Lsn,
    /// The LSN of the newest page handed to the file system.
    pub last_sync_req_lsn: Lsn,
    /// The largest LSN any caller has asked to be durable.
    pub max_sync_req_lsn: Lsn,
    /// The total words of log space in the ring.
    pub total_log_words: u64,
    /// The free words of log space.
    pub free_log_words: i64,
    /// The words of log space reserved by clients.
    pub reserved_log_words: u64,
    /// The free words of the log buffer.
    pub free_buffer_words: usize,
    /// The logical page of the log tail.
    pub tail_page: u64,
    /// The logical page entries are appended to.
    pub producer_page: u64,
    /// The logical page of the oldest unwritten buffer page.
    pub consumer_page: u64,
    /// The number of entries added since the group was created.
    pub entries_added: u64,
    /// The number of pages written.
    pub pages_written: u64,
    /// The number of write batches issued.
    pub write_batches: u64,
    /// The number of pages written before they were full.
    pub forced_page_closes: u64,
    /// The number of words spent on padding.
    pub padding_words: u64,
}

#[derive(Debug)]
/// The result of a request to make an LSN durable.
pub enum SyncLsn {
    /// The LSN is already durable.
    Durable,
    /// The LSN will be durable once the receiver completes.
    Queued(oneshot::Receiver<()>),
}

#[derive(Clone)]
/// The UNDO log manager.
pub struct Lgman {
    inner: Arc<LgmanInner>,
}

struct LgmanInner {
    ctx: Arc<ctx::Context>,
    config: LgmanConfig,
    group: Mutex<Option<LogfileGroup>>,
    /// Only a single flush can be writing pages at a time.
    flush_lock: tokio::sync::Mutex<()>,
    flush_notify: Arc<Notify>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for LgmanInner {
    fn drop(&mut self) {
        if let Some(handle) = self.flusher.get_mut().take() {
            handle.abort();
        }
    }
}

impl Lgman {
    /// Create a new log manager using the [LgmanConfig] registered on the context.
    pub fn new(ctx: Arc<ctx::Context>) -> Self {
        let config: LgmanConfig = ctx.config_opt().unwrap_or_default();
        Self {
            inner: Arc::new(LgmanInner {
                ctx,
                config,
                group: Mutex::new(None),
                flush_lock: tokio::sync::Mutex::new(()),
                flush_notify: Arc::new(Notify::new()),
                flusher: Mutex::new(None),
            }),
        }
    }

    /// Create the logfile group.
    ///
    /// Only a single group is supported.
    pub fn create_logfile_group(&self, group_id: u32, version: u32) -> Result<(), LogError> {
        let mut guard = self.inner.group.lock();
        if guard.is_some() {
            return Err(LogError::LogfileGroupExists);
        }
        *guard = Some(LogfileGroup::new(group_id, version, self.inner.config.buffer_pages));
        tracing::info!(group_id = group_id, version = version, "created logfile group");
        Ok(())
    }

    #[tracing::instrument("lgman-create-undo-file", skip(self))]
    /// Create a new UNDO file of `num_pages` pages and add it to the ring.
    ///
    /// Files can only be added before the group goes online.
    pub async fn create_undo_file(&self, file_no: u32, num_pages: u32) -> Result<(), LogError> {
        let zero_page = self.prepare_file(file_no, num_pages, UndoFileState::Creating)?;
        let result = file_set::create_undo_file(&self.inner.ctx, file_no, &zero_page).await;
        self.finish_add_file(file_no, num_pages, result.map_err(LogError::from), false)
    }

    #[tracing::instrument("lgman-open-undo-file", skip(self))]
    /// Open an existing UNDO file and add it to the ring.
    ///
    /// The zero page must match the group and the declared size.
    pub async fn open_undo_file(&self, file_no: u32, num_pages: u32) -> Result<(), LogError> {
        let zero_page = self.prepare_file(file_no, num_pages, UndoFileState::Opening)?;
        let result = file_set::open_undo_file(&self.inner.ctx, file_no, &zero_page)
            .await
            .map_err(|source| LogError::OpenFile { file_no, source });
        self.finish_add_file(file_no, num_pages, result, true)
    }

    fn prepare_file(
        &self,
        file_no: u32,
        num_pages: u32,
        state: UndoFileState,
    ) -> Result<crate::layout::zero_page::ZeroPage, LogError> {
        let mut guard = self.inner.group.lock();
        let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
        group.ensure_state(&[GroupState::Starting])?;
        if num_pages < 2 {
            return Err(LogError::FileTooSmall(num_pages));
        }
        if group.files.contains(file_no) || group.pending_files.contains(&file_no) {
            return Err(LogError::FileExists(file_no));
        }
        group.pending_files.push(file_no);
        tracing::debug!(file_no = file_no, state = ?state, "adding undo file");

        Ok(file_set::undo_zero_page(
            file_no,
            group.group_id,
            group.version,
            num_pages,
            self.inner.config.encrypted_filesystem,
        ))
    }

    fn finish_add_file(
        &self,
        file_no: u32,
        num_pages: u32,
        result: Result<crate::file::RWFile, LogError>,
        opened: bool,
    ) -> Result<(), LogError> {
        let mut guard = self.inner.group.lock();
        let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
        group.pending_files.retain(|&pending| pending != file_no);
        let file = result?;

        group.files.push(UndoFile {
            file_no,
            num_pages,
            file,
            state: UndoFileState::Empty,
            first_lsn: 0,
            outstanding: false,
        });
        group.opened_files |= opened;
        group.reset_positions(0, 0, 0);
        Ok(())
    }

    /// Bring the group online so it accepts new entries.
    ///
    /// A group with opened files must have been recovered first.
    pub fn go_online(&self) -> Result<(), LogError> {
        {
            let mut guard = self.inner.group.lock();
            let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
            match group.state {
                GroupState::Starting if !group.opened_files => {},
                GroupState::Recovered | GroupState::Executed => {},
                state => return Err(LogError::InvalidState(state)),
            }
            if group.files.is_empty() {
                return Err(LogError::InvalidState(group.state));
            }
            group.state = GroupState::Online;

            tracing::info!(
                next_lsn = group.next_lsn,
                total_log_size = %humansize::format_size(group.total_words() * 4, humansize::DECIMAL),
                free_log_words = group.space.free_words(),
                "logfile group online",
            );
        }

        self.spawn_flusher();
        Ok(())
    }

    /// Signal the node restart has completed, lowering the free space
    /// abortable operations must leave behind.
    pub fn set_node_restart(&self, node_restart: bool) -> Result<(), LogError> {
        let mut guard = self.inner.group.lock();
        let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
        group.node_restart = node_restart;
        Ok(())
    }

    #[tracing::instrument("lgman-drop-group", skip(self))]
    /// Drop the logfile group, flushing any buffered pages and removing its files.
    pub async fn drop_logfile_group(&self) -> Result<(), LogError> {
        {
            let mut guard = self.inner.group.lock();
            let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
            if group.state == GroupState::Online {
                group.state = GroupState::Dropping;
            }
        }

        if let Some(handle) = self.inner.flusher.lock().take() {
            handle.abort();
        }

        let is_dropping = self
            .inner
            .group
            .lock()
            .as_ref()
            .is_some_and(|group| group.state == GroupState::Dropping);
        if is_dropping {
            self.flush_log().await?;
        }

        let files = {
            let mut guard = self.inner.group.lock();
            let Some(mut group) = guard.take() else {
                return Err(LogError::NoLogfileGroup);
            };
            for (_, waiter) in group.sync_waiters.drain(..) {
                drop(waiter);
            }
            group.buffer_waiters.clear();
            group.files.take_all()
        };

        let directory = self.inner.ctx.directory();
        for file in files {
            let file_no = file.file_no;
            drop(file);
            directory
                .remove_file(crate::directory::FileGroup::Undo, file_no)
                .await?;
        }

        tracing::info!("dropped logfile group");
        Ok(())
    }

    /// Returns a client facet used to append entries to the log.
    pub fn client(&self, name: &'static str) -> LogfileClient {
        LogfileClient {
            lgman: self.clone(),
            name,
        }
    }

    /// Request the LSN to be made durable.
    pub fn sync_lsn(&self, lsn: Lsn) -> Result<SyncLsn, LogError> {
        let mut guard = self.inner.group.lock();
        let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
        if lsn >= group.next_lsn {
            return Err(LogError::InvalidLsn(lsn));
        }
        if lsn <= group.last_synced_lsn {
            return Ok(SyncLsn::Durable);
        }

        let (tx, rx) = oneshot::channel();
        group.sync_waiters.push((lsn, tx));
        group.max_sync_req_lsn = group.max_sync_req_lsn.max(lsn);
        drop(guard);

        self.inner.flush_notify.notify_one();
        Ok(SyncLsn::Queued(rx))
    }

    /// Wait until the LSN is durable.
    pub async fn wait_for_lsn(&self, lsn: Lsn) -> Result<(), LogError> {
        match self.sync_lsn(lsn)? {
            SyncLsn::Durable => Ok(()),
            SyncLsn::Queued(rx) => rx.await.map_err(|_| LogError::Dropped),
        }
    }

    /// Returns the LSN of the newest entry in the log.
    pub fn get_latest_lsn(&self) -> Result<Lsn, LogError> {
        let guard = self.inner.group.lock();
        let group = guard.as_ref().ok_or(LogError::NoLogfileGroup)?;
        Ok(group.next_lsn - 1)
    }

    /// Returns the newest LSN known to be durable.
    pub fn last_synced_lsn(&self) -> Result<Lsn, LogError> {
        let guard = self.inner.group.lock();
        let group = guard.as_ref().ok_or(LogError::NoLogfileGroup)?;
        Ok(group.last_synced_lsn)
    }

    /// Returns a snapshot of the group state.
    pub fn stats(&self) -> Result<LogStats, LogError> {
        let guard = self.inner.group.lock();
        let group = guard.as_ref().ok_or(LogError::NoLogfileGroup)?;
        Ok(group.stats())
    }

    /// Returns the state of each UNDO file in ring order.
    pub fn file_states(&self) -> Result<Vec<(u32, UndoFileState)>, LogError> {
        let guard = self.inner.group.lock();
        let group = guard.as_ref().ok_or(LogError::NoLogfileGroup)?;
        Ok(group.files.iter().map(|file| (file.file_no, file.state)).collect())
    }

    /// Check the space accounting of the group balances.
    pub fn validate(&self) -> Result<(), AccountingError> {
        let guard = self.inner.group.lock();
        match guard.as_ref() {
            Some(group) => group.validate(),
            None => Ok(()),
        }
    }

    #[inline]
    fn debug_validate(group: &LogfileGroup) {
        if cfg!(debug_assertions)
            && let Err(err) = group.validate()
        {
            crate::utils::abort_system("log space accounting violated", Some(&err));
        }
    }
}

/// A client of the log manager.
///
/// Appending an entry follows three steps: allocate log space, reserve
/// room in the log buffer and finally add the entry.
#[derive(Clone)]
pub struct LogfileClient {
    lgman: Lgman,
    name: &'static str,
}

impl LogfileClient {
    /// Reserve log space for an entry which may be aborted.
    ///
    /// Refused once the free space would fall below the reserve kept for
    /// operations that cannot be aborted.
    pub fn alloc_log_space(&self, words: usize) -> Result<(), LogError> {
        self.alloc(words, true)
    }

    /// Reserve log space for an entry which cannot be aborted.
    pub fn alloc_log_space_non_abortable(&self, words: usize) -> Result<(), LogError> {
        self.alloc(words, false)
    }

    fn alloc(&self, words: usize, abortable: bool) -> Result<(), LogError> {
        let mut guard = self.lgman.inner.group.lock();
        let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
        group.ensure_state(&[GroupState::Online])?;
        let node_restart = group.node_restart;
        let result = group.space.alloc(words as u64, abortable, node_restart);
        if result.is_err() {
            tracing::debug!(
                client = self.name,
                words = words,
                free_log_words = group.space.free_words(),
                "out of log space",
            );
        }
        Lgman::debug_validate(group);
        result
    }

    /// Return log space reserved for an entry which will not be added.
    pub fn free_log_space(&self, words: usize) -> Result<(), LogError> {
        let mut guard = self.lgman.inner.group.lock();
        let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
        group.space.release(words as u64)?;
        Lgman::debug_validate(group);
        let has_sync_waiters = !group.sync_waiters.is_empty();
        drop(guard);

        if has_sync_waiters {
            self.lgman.inner.flush_notify.notify_one();
        }
        Ok(())
    }

    /// Reserve room for an entry of `words` in the log buffer.
    ///
    /// Waits for the flusher to free buffer pages when the buffer is full.
    pub async fn get_log_buffer(&self, words: usize) -> Result<BufferPermit, LogError> {
        if words > PAGE_DATA_WORDS {
            return Err(LogError::RecordTooLarge(words));
        }

        let reserved = words + PAGE_DATA_WORDS;
        loop {
            let rx = {
                let mut guard = self.lgman.inner.group.lock();
                let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
                group.ensure_state(&[GroupState::Online, GroupState::Dropping])?;
                if group.buffer.try_reserve(reserved) {
                    return Ok(BufferPermit {
                        lgman: self.lgman.clone(),
                        words,
                        reserved,
                    });
                }
                let (tx, rx) = oneshot::channel();
                group.buffer_waiters.push(tx);
                rx
            };

            tracing::debug!(client = self.name, words = words, "waiting for log buffer space");
            self.lgman.inner.flush_notify.notify_one();
            rx.await.map_err(|_| LogError::Dropped)?;
        }
    }

    /// Add an entry to the log, consuming the buffer permit and the log
    /// space allocated for it.
    ///
    /// Returns the LSN assigned to the entry.
    pub fn add_entry(&self, mut permit: BufferPermit, parts: &[UndoEntry]) -> Result<Lsn, LogError> {
        let words = entry_words(parts);
        if words > permit.words {
            return Err(LogError::PermitTooSmall {
                words,
                reserved: permit.words,
            });
        }

        let reserved = std::mem::take(&mut permit.reserved);
        let mut guard = self.lgman.inner.group.lock();
        let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
        match group.append_entry(parts, reserved) {
            Ok((lsn, _)) => {
                Lgman::debug_validate(group);
                let has_sync_waiters = !group.sync_waiters.is_empty();
                drop(guard);

                if has_sync_waiters {
                    self.lgman.inner.flush_notify.notify_one();
                }
                Ok(lsn)
            },
            Err(err) => {
                group.buffer.release(reserved);
                Err(err)
            },
        }
    }

    /// Request the LSN to be made durable.
    pub fn sync_lsn(&self, lsn: Lsn) -> Result<SyncLsn, LogError> {
        self.lgman.sync_lsn(lsn)
    }

    /// Returns the LSN of the newest entry in the log.
    pub fn get_latest_lsn(&self) -> Result<Lsn, LogError> {
        self.lgman.get_latest_lsn()
    }
}

/// A reservation of log buffer space.
///
/// The reservation is returned to the buffer if the permit is dropped
/// without being used.
pub struct BufferPermit {
    lgman: Lgman,
    words: usize,
    reserved: usize,
}

impl std::fmt::Debug for BufferPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferPermit(words={}, reserved={})", self.words, self.reserved)
    }
}

impl BufferPermit {
    #[inline]
    /// The number of entry words the permit covers.
    pub fn words(&self) -> usize {
        self.words
    }
}

impl Drop for BufferPermit {
    fn drop(&mut self) {
        if self.reserved == 0 {
            return;
        }

        let mut guard = self.lgman.inner.group.lock();
        if let Some(group) = guard.as_mut() {
            group.buffer.release(self.reserved);
            let waiters = std::mem::take(&mut group.buffer_waiters);
            drop(guard);
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}
