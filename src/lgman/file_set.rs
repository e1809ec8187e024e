use std::io;

use crate::directory::FileGroup;
use crate::file::RWFile;
use crate::layout::zero_page::{FileType, ZeroPage};
use crate::layout::{Lsn, PAGE_SIZE};
use crate::{ctx, layout};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The lifecycle state of an UNDO file.
pub enum UndoFileState {
    /// The file is being created and its zero page written.
    Creating,
    /// The file is being opened and its zero page validated.
    Opening,
    /// The first page of the file is being read to order the files.
    Sorting,
    /// The file is being searched for the log head.
    Searching,
    /// The log head has been found and the remaining pages are being scanned.
    SearchingEnd,
    /// The head page is being re-read.
    SearchingFinalRead,
    /// The file is part of UNDO execution.
    Executing,
    /// The file holds live log data.
    Online,
    /// The file holds no live log data.
    Empty,
}

/// An UNDO file that is part of the logfile group ring.
pub(crate) struct UndoFile {
    pub(crate) file_no: u32,
    /// The total number of pages including the zero page.
    pub(crate) num_pages: u32,
    pub(crate) file: RWFile,
    pub(crate) state: UndoFileState,
    /// The LSN of the first data page written in this lap of the ring.
    pub(crate) first_lsn: Lsn,
    /// A write to the file has been issued and not completed.
    pub(crate) outstanding: bool,
}

impl UndoFile {
    #[inline]
    /// The number of pages that can hold log data.
    pub(crate) fn data_pages(&self) -> u64 {
        self.num_pages as u64 - 1
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// A physical location within the ring.
pub(crate) struct RingPosition {
    /// The index of the file within the ring order.
    pub(crate) file_idx: usize,
    /// The page within the file, always `>= 1`.
    pub(crate) page_no: u32,
}

/// The UNDO files of a logfile group in their ring order.
///
/// The log addresses its pages with a logical page number which increases
/// monotonically, the physical location of a logical page is found by taking
/// it modulo the number of data pages in the ring.
pub(crate) struct FileSet {
    files: Vec<UndoFile>,
    /// The first physical page index of each file.
    offsets: Vec<u64>,
    total_pages: u64,
}

impl FileSet {
    pub(crate) fn new() -> Self {
        Self {
            files: Vec::new(),
            offsets: Vec::new(),
            total_pages: 0,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.files.len()
    }

    #[inline]
    /// The total number of data pages in the ring.
    pub(crate) fn total_pages(&self) -> u64 {
        self.total_pages
    }

    pub(crate) fn contains(&self, file_no: u32) -> bool {
        self.files.iter().any(|file| file.file_no == file_no)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &UndoFile> {
        self.files.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut UndoFile> {
        self.files.iter_mut()
    }

    #[inline]
    pub(crate) fn get(&self, file_idx: usize) -> &UndoFile {
        &self.files[file_idx]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, file_idx: usize) -> &mut UndoFile {
        &mut self.files[file_idx]
    }

    /// Add a file to the end of the ring.
    pub(crate) fn push(&mut self, file: UndoFile) {
        self.files.push(file);
        self.rebuild_offsets();
    }

    /// Reorder the ring, `order` holds the current index of each file in its new position.
    pub(crate) fn reorder(&mut self, order: &[usize]) {
        debug_assert_eq!(order.len(), self.files.len());
        let mut slots: Vec<Option<UndoFile>> = self.files.drain(..).map(Some).collect();
        for &idx in order {
            if let Some(file) = slots[idx].take() {
                self.files.push(file);
            }
        }
        self.rebuild_offsets();
    }

    /// Remove every file from the set.
    pub(crate) fn take_all(&mut self) -> Vec<UndoFile> {
        self.offsets.clear();
        self.total_pages = 0;
        std::mem::take(&mut self.files)
    }

    #[inline]
    /// The physical page index of a logical page.
    pub(crate) fn physical(&self, logical: u64) -> u64 {
        logical % self.total_pages
    }

    /// Locate a logical page within the ring.
    pub(crate) fn locate(&self, logical: u64) -> RingPosition {
        let physical = self.physical(logical);
        let file_idx = self.offsets.partition_point(|&offset| offset <= physical) - 1;
        RingPosition {
            file_idx,
            page_no: (physical - self.offsets[file_idx]) as u32 + 1,
        }
    }

    /// The physical page index of a position in the ring.
    pub(crate) fn physical_of(&self, position: RingPosition) -> u64 {
        self.offsets[position.file_idx] + position.page_no as u64 - 1
    }

    /// The number of pages from the logical page to the end of its file, inclusive.
    pub(crate) fn pages_to_file_end(&self, logical: u64) -> u64 {
        let position = self.locate(logical);
        let file = &self.files[position.file_idx];
        file.data_pages() - (position.page_no as u64 - 1)
    }

    fn rebuild_offsets(&mut self) {
        self.offsets.clear();
        let mut offset = 0;
        for file in &self.files {
            self.offsets.push(offset);
            offset += file.data_pages();
        }
        self.total_pages = offset;
    }
}

/// The expected byte length of an UNDO file with `num_pages` pages.
pub(crate) fn file_len(num_pages: u32) -> u64 {
    num_pages as u64 * PAGE_SIZE as u64
}

#[tracing::instrument("undo-file-create", skip(ctx, zero_page))]
/// Create a new UNDO file, allocate its pages and write the zero page.
pub(crate) async fn create_undo_file(
    ctx: &ctx::Context,
    file_no: u32,
    zero_page: &ZeroPage,
) -> io::Result<RWFile> {
    let file = ctx.directory().create_file(FileGroup::Undo, file_no).await?;
    file.set_len(file_len(zero_page.page_count)).await?;
    file.write_at(zero_page.encode(), 0).await?;
    file.sync_data().await?;

    tracing::info!(
        file_no = file_no,
        num_pages = zero_page.page_count,
        size = %humansize::format_size(file_len(zero_page.page_count), humansize::DECIMAL),
        "created undo file",
    );

    Ok(file)
}

#[derive(Debug, thiserror::Error)]
/// An error preventing an existing UNDO file from being opened.
pub enum OpenUndoFileError {
    #[error("file size mismatch expected {expected} bytes got {actual} bytes")]
    /// The file on disk does not match the declared page count.
    SizeMismatch {
        /// The expected file length.
        expected: u64,
        /// The actual file length.
        actual: u64,
    },
    #[error("invalid zero page: {0}")]
    /// The zero page does not describe this file.
    ZeroPage(#[from] layout::zero_page::ZeroPageError),
    #[error(transparent)]
    /// An IO error occurred.
    IO(#[from] io::Error),
}

#[tracing::instrument("undo-file-open", skip(ctx, zero_page))]
/// Open an existing UNDO file and validate its zero page.
pub(crate) async fn open_undo_file(
    ctx: &ctx::Context,
    file_no: u32,
    zero_page: &ZeroPage,
) -> Result<RWFile, OpenUndoFileError> {
    let file = ctx.directory().open_file(FileGroup::Undo, file_no).await?;

    let expected = file_len(zero_page.page_count);
    let actual = file.get_len().await?;
    if actual != expected {
        return Err(OpenUndoFileError::SizeMismatch { expected, actual });
    }

    let page = file.read_at(PAGE_SIZE, 0).await?;
    zero_page.validate(&page)?;

    tracing::info!(file_no = file_no, num_pages = zero_page.page_count, "opened undo file");

    Ok(file)
}

/// Build the expected zero page of an UNDO file.
pub(crate) fn undo_zero_page(
    file_no: u32,
    group_id: u32,
    group_version: u32,
    num_pages: u32,
    encrypted_filesystem: bool,
) -> ZeroPage {
    ZeroPage {
        file_type: FileType::Undo,
        file_no,
        group_id,
        group_version,
        page_count: num_pages,
        encrypted_filesystem,
    }
}
