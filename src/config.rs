//! Configuration options for the log and page cache managers.
//!
//! Configs are registered on the [crate::Context] and fetched by each
//! manager when it is created, missing configs fall back to their defaults.

use std::time::Duration;

#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
#[serde(default)]
/// Configuration options for the UNDO log manager.
pub struct LgmanConfig {
    /// The number of pages held by the in-memory log buffer.
    pub buffer_pages: usize,
    /// Stamp a CRC32 checksum into every written UNDO page.
    ///
    /// When disabled the checksum field is left as zero and torn pages can only
    /// be detected by their LSN.
    pub page_checksums: bool,
    /// The file system the files live on provides encryption at rest.
    ///
    /// This value is recorded in the zero page of every file and must match
    /// when the file is opened again.
    pub encrypted_filesystem: bool,
    #[serde(with = "duration_millis")]
    /// How often the background flusher wakes up to write full pages
    /// if no sync request arrives.
    pub flush_interval: Duration,
    /// The maximum number of UNDO records queued to a single apply worker.
    pub max_pending_undo_records: usize,
    /// The number of parallel apply workers used when executing the UNDO log.
    pub undo_workers: usize,
}

impl Default for LgmanConfig {
    fn default() -> Self {
        Self {
            buffer_pages: 64,
            page_checksums: false,
            encrypted_filesystem: false,
            flush_interval: Duration::from_millis(10),
            max_pending_undo_records: 100,
            undo_workers: 1,
        }
    }
}

#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
#[serde(default)]
/// Configuration options for the page cache manager.
pub struct PgmanConfig {
    /// The number of page buffers held in memory.
    pub max_pages: usize,
    /// The number of pages classified as hot.
    ///
    /// Defaults to 90% of `max_pages` and is always kept below `max_pages`
    /// so there is at least one page which can be evicted.
    pub max_hot_pages: Option<usize>,
    /// The maximum number of outstanding page reads and writes.
    pub max_io_waits: usize,
    /// The maximum number of page entries, resident or not.
    pub max_page_entries: Option<usize>,
    /// The number of queue entries inspected per cleanup loop iteration.
    pub cleanup_batch: usize,
    /// The file system the data files live on provides encryption at rest.
    pub encrypted_filesystem: bool,
    #[serde(with = "duration_millis")]
    /// Delay between statistics reports.
    pub stats_loop_delay: Duration,
    #[serde(with = "duration_millis")]
    /// Delay between background cleanup passes.
    pub cleanup_loop_delay: Duration,
    #[serde(with = "duration_millis")]
    /// Delay between checkpoint pageout passes.
    pub lcp_loop_delay: Duration,
}

impl Default for PgmanConfig {
    fn default() -> Self {
        Self {
            max_pages: 64,
            max_hot_pages: None,
            max_io_waits: 64,
            max_page_entries: None,
            cleanup_batch: 16,
            encrypted_filesystem: false,
            stats_loop_delay: Duration::from_secs(1),
            cleanup_loop_delay: Duration::from_millis(200),
            lcp_loop_delay: Duration::from_millis(10),
        }
    }
}

impl PgmanConfig {
    /// The number of hot pages the LIRS engine allows.
    pub fn hot_page_quota(&self) -> usize {
        let max_pages = self.max_pages.max(1);
        let target = self.max_hot_pages.unwrap_or(max_pages * 9 / 10);
        target.clamp(1, max_pages.saturating_sub(1).max(1))
    }

    /// The maximum number of page entries.
    pub fn page_entry_limit(&self) -> usize {
        self.max_page_entries.unwrap_or(self.max_pages.max(1) * 4)
    }
}

mod duration_millis {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let millis = <u64 as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
