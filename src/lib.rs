//! Disk-data persistence core.
//!
//! Two cooperating managers sit between the record layer and the files of
//! a node. The [Lgman] owns the UNDO write-ahead log, assigning LSNs and
//! replaying the log backwards after a restart. The [Pgman] caches data
//! pages under a LIRS replacement policy and never writes a page before
//! the log covering it is durable.

mod config;
mod ctx;
mod directory;
mod file;
pub mod layout;
pub mod lgman;
mod memory_storage;
pub mod pgman;
mod signal;
mod utils;

#[cfg(feature = "bench-internal")]
pub mod bench {
    pub use crate::pgman::LirsSimulation;
}

pub use self::config::{LgmanConfig, PgmanConfig};
pub use self::ctx::{Context, ContextBuilder};
pub use self::directory::FileGroup;
pub use self::layout::data_page::data_page_lsn;
pub use self::layout::record::{UndoEntry, UndoRecordType};
pub use self::layout::{Lsn, PAGE_SIZE, PageKey};
pub use self::lgman::{Lgman, LogError, LogfileClient, SyncLsn};
pub use self::memory_storage::{MemoryStorage, PageDamage, WriteObserver};
pub use self::pgman::{
    GetPage,
    LogSync,
    PageCacheError,
    PageClient,
    PageHandle,
    Pgman,
    PgmanStats,
    RequestFlags,
};
