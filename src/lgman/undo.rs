//! Backward execution of the UNDO log on restart.
//!
//! Pages are read from the head of the log towards the tail and their
//! records decoded newest first. Data records are handed to the
//! [UndoApplier], either inline or through a set of worker tasks with
//! bounded queues, until the checkpoint marker of the restored checkpoint
//! is reached.

use std::future::Future;
use std::sync::Arc;

use smallvec::SmallVec;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::file_set::UndoFileState;
use super::group::LcpMarker;
use super::{GroupState, Lgman, LogError, RecoveryError};
use crate::file::RWFile;
use crate::layout::record::{RecordCursor, UndoRecordType};
use crate::layout::undo_page::decode_undo_page;
use crate::layout::{Lsn, PAGE_SIZE, bytes_to_words};

const PROGRESS_LOG_INTERVAL: u64 = 30_000;
const YIELD_INTERVAL: u64 = 1_024;

#[derive(Debug, Clone, Eq, PartialEq)]
/// A data record read from the UNDO log.
pub struct UndoRecord {
    /// The LSN of the entry the record belongs to.
    pub lsn: Lsn,
    /// The record type.
    pub record_type: UndoRecordType,
    /// The record payload.
    pub payload: SmallVec<[u32; 16]>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The result of applying a single UNDO record.
pub enum ApplyOutcome {
    /// The record changed a page.
    Applied,
    /// The change was not present on the page and nothing was done.
    Skipped,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to apply undo record lsn={lsn}: {reason}")]
/// The applier could not apply an UNDO record.
pub struct ApplyError {
    /// The LSN of the record.
    pub lsn: Lsn,
    /// The reason the record could not be applied.
    pub reason: String,
}

/// Applies UNDO records to the disk data on restart.
pub trait UndoApplier: Send + Sync + 'static {
    /// Select the worker that applies the record.
    ///
    /// Records routed to the same worker are applied in log order, records
    /// returning `None` are applied inline once every queued record has
    /// been applied.
    fn worker_for(&self, record: &UndoRecord) -> Option<usize> {
        let _ = record;
        None
    }

    /// Undo the change described by the record.
    fn disk_restart_undo(
        &self,
        record: UndoRecord,
    ) -> impl Future<Output = Result<ApplyOutcome, ApplyError>> + Send;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// Why UNDO execution stopped.
pub enum StopReason {
    /// A checkpoint marker at or before the restored checkpoint was reached.
    LcpMarker {
        /// The checkpoint ID of the marker.
        lcp_id: u32,
        /// The local checkpoint ID of the marker, zero for a global checkpoint.
        local_lcp_id: u32,
        /// The LSN of the marker.
        lsn: Lsn,
    },
    /// An end of log record was reached.
    EndRecord {
        /// The LSN of the record.
        lsn: Lsn,
    },
    /// The oldest page of the log was reached.
    StartOfLog,
    /// The log holds no data.
    EmptyLog,
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// A summary of an UNDO execution.
pub struct RecoveryReport {
    /// The LSN of the log head.
    pub head_lsn: Option<Lsn>,
    /// The number of log pages read.
    pub pages_read: u64,
    /// The number of invalid pages skipped before any record was applied.
    pub pages_skipped: u64,
    /// The number of records decoded.
    pub records_read: u64,
    /// The number of records which changed a page.
    pub records_applied: u64,
    /// The number of records which were not applied.
    pub records_skipped: u64,
    /// Why execution stopped.
    pub stop: StopReason,
}

enum UndoJob {
    Apply(UndoRecord),
    Barrier(oneshot::Sender<WorkerProgress>),
}

#[derive(Debug, Default, Clone)]
struct WorkerProgress {
    applied: u64,
    skipped: u64,
    failed: Option<ApplyError>,
}

async fn run_worker<A: UndoApplier>(applier: Arc<A>, mut jobs: mpsc::Receiver<UndoJob>) {
    let mut progress = WorkerProgress::default();
    while let Some(job) = jobs.recv().await {
        match job {
            UndoJob::Apply(record) => {
                if progress.failed.is_some() {
                    continue;
                }
                match applier.disk_restart_undo(record).await {
                    Ok(ApplyOutcome::Applied) => progress.applied += 1,
                    Ok(ApplyOutcome::Skipped) => progress.skipped += 1,
                    Err(err) => progress.failed = Some(err),
                }
            },
            UndoJob::Barrier(tx) => {
                let _ = tx.send(progress.clone());
            },
        }
    }
}

/// Routes records to the applier and tracks what has been applied.
struct UndoExecutor<A: UndoApplier> {
    applier: Arc<A>,
    workers: Vec<mpsc::Sender<UndoJob>>,
    handles: Vec<JoinHandle<()>>,
    inline: WorkerProgress,
    /// The combined worker progress as of the last drain.
    drained: WorkerProgress,
}

impl<A: UndoApplier> UndoExecutor<A> {
    fn new(applier: Arc<A>, num_workers: usize, max_pending: usize) -> Self {
        let mut workers = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = mpsc::channel(max_pending.max(1));
            handles.push(tokio::spawn(run_worker(applier.clone(), rx)));
            workers.push(tx);
        }

        Self {
            applier,
            workers,
            handles,
            inline: WorkerProgress::default(),
            drained: WorkerProgress::default(),
        }
    }

    async fn dispatch(&mut self, record: UndoRecord) -> Result<(), RecoveryError> {
        let worker = self.applier.worker_for(&record);
        match worker {
            Some(worker) if !self.workers.is_empty() => {
                let idx = worker % self.workers.len();
                self.workers[idx]
                    .send(UndoJob::Apply(record))
                    .await
                    .map_err(|_| RecoveryError::WorkerLost)
            },
            _ => {
                self.drain().await?;
                match self.applier.disk_restart_undo(record).await? {
                    ApplyOutcome::Applied => self.inline.applied += 1,
                    ApplyOutcome::Skipped => self.inline.skipped += 1,
                }
                Ok(())
            },
        }
    }

    /// Wait for every queued record to be applied.
    async fn drain(&mut self) -> Result<(), RecoveryError> {
        let mut total = WorkerProgress::default();
        for worker in &self.workers {
            let (tx, rx) = oneshot::channel();
            worker
                .send(UndoJob::Barrier(tx))
                .await
                .map_err(|_| RecoveryError::WorkerLost)?;
            let progress = rx.await.map_err(|_| RecoveryError::WorkerLost)?;
            if let Some(err) = progress.failed {
                return Err(RecoveryError::Apply(err));
            }
            total.applied += progress.applied;
            total.skipped += progress.skipped;
        }
        self.drained = total;
        Ok(())
    }

    /// Returns if any record has changed a page so far.
    async fn any_applied(&mut self) -> Result<bool, RecoveryError> {
        self.drain().await?;
        Ok(self.applied() > 0)
    }

    fn applied(&self) -> u64 {
        self.inline.applied + self.drained.applied
    }

    fn skipped(&self) -> u64 {
        self.inline.skipped + self.drained.skipped
    }

    async fn finish(mut self) -> Result<(u64, u64), RecoveryError> {
        self.drain().await?;
        let counts = (self.applied(), self.skipped());
        self.workers.clear();
        for handle in self.handles.drain(..) {
            handle.await.map_err(|_| RecoveryError::WorkerLost)?;
        }
        Ok(counts)
    }
}

struct ExecFile {
    file_no: u32,
    file: RWFile,
    data_pages: u32,
    first_lsn: Lsn,
}

/// Walks the ring backwards from the head page.
struct PageWalk {
    files: Vec<ExecFile>,
    offsets: Vec<u64>,
    total_pages: u64,
    head_idx: usize,
    head_page: u32,
    head_physical: u64,
    /// Every file holds data so pages past the head belong to the previous lap.
    wrap_allowed: bool,
    wrapped: bool,
    idx: usize,
    page_no: u32,
}

impl PageWalk {
    fn current(&self) -> &ExecFile {
        &self.files[self.idx]
    }

    fn lower_bound(&self) -> Lsn {
        if self.wrapped { 1 } else { self.current().first_lsn }
    }

    /// The logical log page of the current position.
    fn logical(&self) -> u64 {
        let physical = self.offsets[self.idx] + self.page_no as u64 - 1;
        if physical <= self.head_physical {
            physical + self.total_pages
        } else {
            physical
        }
    }

    fn step_back(&mut self) -> bool {
        if self.page_no > 1 {
            self.page_no -= 1;
        } else if self.idx > 0 {
            self.idx -= 1;
            self.page_no = self.files[self.idx].data_pages;
        } else if self.wrap_allowed && !self.wrapped {
            self.wrapped = true;
            self.idx = self.head_idx;
            self.page_no = self.files[self.idx].data_pages;
        } else {
            return false;
        }

        !(self.wrapped && self.idx == self.head_idx && self.page_no <= self.head_page)
    }

    async fn read_page(&self) -> std::io::Result<Vec<u8>> {
        let file = self.current();
        file.file
            .read_at(PAGE_SIZE, self.page_no as u64 * PAGE_SIZE as u64)
            .await
    }
}

impl Lgman {
    /// Apply the UNDO log backwards from the head until the checkpoint
    /// marker of `lcp_id` is reached.
    ///
    /// Markers of local checkpoints taken after the global checkpoint are
    /// passed.
    pub async fn execute_undo_log<A: UndoApplier>(
        &self,
        lcp_id: u32,
        applier: Arc<A>,
    ) -> Result<RecoveryReport, RecoveryError> {
        self.execute_undo_log_local(lcp_id, 0, applier).await
    }

    #[tracing::instrument("lgman-execute-undo", skip(self, applier))]
    /// Apply the UNDO log backwards from the head until a marker at or
    /// before local checkpoint `local_lcp_id` of checkpoint `lcp_id` is reached.
    ///
    /// Markers are ordered by their checkpoint ID and then their local
    /// checkpoint ID. On completion the tail of the log is moved to the page
    /// where execution stopped.
    pub async fn execute_undo_log_local<A: UndoApplier>(
        &self,
        lcp_id: u32,
        local_lcp_id: u32,
        applier: Arc<A>,
    ) -> Result<RecoveryReport, RecoveryError> {
        let (walk, head) = {
            let mut guard = self.inner.group.lock();
            let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
            group.ensure_state(&[GroupState::Recovered])?;

            let Some(head) = group.head else {
                group.state = GroupState::Executed;
                return Ok(RecoveryReport {
                    head_lsn: None,
                    pages_read: 0,
                    pages_skipped: 0,
                    records_read: 0,
                    records_applied: 0,
                    records_skipped: 0,
                    stop: StopReason::EmptyLog,
                });
            };

            group.state = GroupState::Executing;
            let mut files = Vec::with_capacity(group.files.len());
            let mut offsets = Vec::with_capacity(group.files.len());
            let mut offset = 0;
            for file in group.files.iter_mut() {
                if file.first_lsn != 0 {
                    file.state = UndoFileState::Executing;
                }
                offsets.push(offset);
                offset += file.data_pages();
                files.push(ExecFile {
                    file_no: file.file_no,
                    file: file.file.clone(),
                    data_pages: file.num_pages - 1,
                    first_lsn: file.first_lsn,
                });
            }

            let head_idx = files
                .iter()
                .position(|file| file.file_no == head.file_no)
                .ok_or(LogError::InvalidState(group.state))?;
            let head_physical = offsets[head_idx] + head.page_no as u64 - 1;
            let wrap_allowed = files.iter().all(|file| file.first_lsn != 0);
            let walk = PageWalk {
                files,
                offsets,
                total_pages: offset,
                head_idx,
                head_page: head.page_no,
                head_physical,
                wrap_allowed,
                wrapped: false,
                idx: head_idx,
                page_no: head.page_no,
            };
            (walk, head)
        };

        let config = &self.inner.config;
        let executor = UndoExecutor::new(
            applier,
            config.undo_workers,
            config.max_pending_undo_records,
        );

        tracing::info!(
            lcp_id = lcp_id,
            local_lcp_id = local_lcp_id,
            head_lsn = head.lsn,
            workers = config.undo_workers,
            "starting undo execution",
        );

        let outcome = run_execution(walk, head, (lcp_id, local_lcp_id), executor).await?;
        let (report, tail_logical, marker) = outcome;

        let mut guard = self.inner.group.lock();
        let group = guard.as_mut().ok_or(LogError::NoLogfileGroup)?;
        if let Some(tail) = tail_logical {
            let producer = group.buffer.producer_page();
            group.reset_positions(producer, tail, head.lsn);
        }
        if let Some(marker) = marker {
            group.lcp_markers.push_back(marker);
        }
        for file in group.files.iter_mut() {
            if file.state == UndoFileState::Executing {
                file.state = UndoFileState::Online;
            }
        }
        group.state = GroupState::Executed;

        tracing::info!(
            records_read = report.records_read,
            records_applied = report.records_applied,
            records_skipped = report.records_skipped,
            pages_read = report.pages_read,
            stop = ?report.stop,
            "undo execution complete",
        );

        Ok(report)
    }
}

async fn run_execution<A: UndoApplier>(
    mut walk: PageWalk,
    head: super::LogHead,
    target: (u32, u32),
    mut executor: UndoExecutor<A>,
) -> Result<(RecoveryReport, Option<u64>, Option<LcpMarker>), RecoveryError> {
    let mut upper_lsn = head.lsn;
    let mut pages_read = 0;
    let mut pages_skipped = 0;
    let mut records_read = 0;
    let mut oldest_valid = None;
    let mut marker = None;

    let stop = 'pages: loop {
        let page = walk.read_page().await?;
        pages_read += 1;

        let lower = walk.lower_bound();
        let header = match decode_undo_page(&page) {
            Ok(header) if header.lsn < lower || header.lsn > upper_lsn => Err(format!(
                "page lsn {} outside of expected range {lower}..={upper_lsn}",
                header.lsn,
            )),
            Ok(header) => Ok(header),
            Err(err) => Err(err.to_string()),
        };

        match header {
            Err(_) if walk.wrapped => break StopReason::StartOfLog,
            Err(reason) => {
                let file_no = walk.current().file_no;
                if executor.any_applied().await? {
                    return Err(RecoveryError::Corrupted {
                        file_no,
                        page_no: walk.page_no,
                        reason,
                    });
                }
                tracing::warn!(
                    file_no = file_no,
                    page_no = walk.page_no,
                    reason = %reason,
                    "skipping invalid undo page",
                );
                pages_skipped += 1;
            },
            Ok(header) => {
                let words = bytes_to_words(&page[header.data_range()]);
                let mut cursor = RecordCursor::new(&words, header.lsn);
                oldest_valid = Some(walk.logical());

                while let Some(decoded) = cursor.next_back() {
                    let record = match decoded {
                        Ok(record) => record,
                        Err(err) => {
                            let file_no = walk.current().file_no;
                            if executor.any_applied().await? || walk.wrapped {
                                return Err(RecoveryError::Corrupted {
                                    file_no,
                                    page_no: walk.page_no,
                                    reason: err.to_string(),
                                });
                            }
                            tracing::warn!(
                                file_no = file_no,
                                page_no = walk.page_no,
                                error = %err,
                                "skipping undo page with invalid record",
                            );
                            pages_skipped += 1;
                            break;
                        },
                    };

                    records_read += 1;
                    if records_read % PROGRESS_LOG_INTERVAL == 0 {
                        tracing::info!(
                            records_read = records_read,
                            lsn = record.lsn,
                            "undo execution progress",
                        );
                    }
                    if records_read % YIELD_INTERVAL == 0 {
                        tokio::task::yield_now().await;
                    }

                    let payload = cursor.payload(&record);
                    match record.record_type {
                        UndoRecordType::Noop => {},
                        UndoRecordType::End => {
                            break 'pages StopReason::EndRecord { lsn: record.lsn };
                        },
                        kind if kind.is_lcp_marker() => {
                            let Some(&lcp_id) = payload.first() else {
                                continue;
                            };
                            let local_lcp_id = match kind {
                                UndoRecordType::LocalLcpFirst | UndoRecordType::LocalLcp => {
                                    payload.get(1).copied().unwrap_or(0)
                                },
                                _ => 0,
                            };
                            if (lcp_id, local_lcp_id) <= target {
                                marker = Some(LcpMarker {
                                    lcp_id,
                                    local_lcp_id,
                                    lsn: record.lsn,
                                    page: walk.logical(),
                                });
                                break 'pages StopReason::LcpMarker {
                                    lcp_id,
                                    local_lcp_id,
                                    lsn: record.lsn,
                                };
                            }
                        },
                        record_type => {
                            executor
                                .dispatch(UndoRecord {
                                    lsn: record.lsn,
                                    record_type,
                                    payload: SmallVec::from_slice(payload),
                                })
                                .await?;
                        },
                    }
                }

                upper_lsn = cursor.expected_lsn();
            },
        }

        if !walk.step_back() {
            break StopReason::StartOfLog;
        }
    };

    let tail = match stop {
        StopReason::LcpMarker { .. } | StopReason::EndRecord { .. } => Some(walk.logical()),
        _ => oldest_valid,
    };

    let (records_applied, records_skipped) = executor.finish().await?;
    let report = RecoveryReport {
        head_lsn: Some(head.lsn),
        pages_read,
        pages_skipped,
        records_read,
        records_applied,
        records_skipped,
        stop,
    };
    Ok((report, tail, marker))
}
