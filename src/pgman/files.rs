use std::collections::BTreeMap;
use std::io;

use crate::ctx;
use crate::directory::FileGroup;
use crate::file::RWFile;
use crate::layout;
use crate::layout::PAGE_SIZE;
use crate::layout::zero_page::{FileType, ZeroPage};

/// The group version stamped into the zero page of every data file.
const DATA_FILE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
/// An error preventing an existing data file from being opened.
pub enum OpenDataFileError {
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

#[derive(Clone)]
/// A data file pages are read from and written to.
pub(crate) struct DataFile {
    pub(crate) file: RWFile,
    pub(crate) num_pages: u32,
}

enum FileSlot {
    /// The file number is taken but no file is attached yet.
    Reserved,
    Mapped(DataFile),
}

#[derive(Default)]
/// Maps file numbers to open data files.
pub(crate) struct DataFileTable {
    files: BTreeMap<u32, FileSlot>,
}

impl DataFileTable {
    /// Reserve a file number, returns `false` if it is already in use.
    pub(crate) fn alloc(&mut self, file_no: u32) -> bool {
        if self.files.contains_key(&file_no) {
            return false;
        }
        self.files.insert(file_no, FileSlot::Reserved);
        true
    }

    /// Attach an open file to a reserved file number.
    ///
    /// Returns `false` if the number was not reserved.
    pub(crate) fn map(&mut self, file_no: u32, file: DataFile) -> bool {
        match self.files.get_mut(&file_no) {
            Some(slot @ FileSlot::Reserved) => {
                *slot = FileSlot::Mapped(file);
                true
            },
            _ => false,
        }
    }

    /// Release the file number, returns `false` if it was not in use.
    pub(crate) fn release(&mut self, file_no: u32) -> bool {
        self.files.remove(&file_no).is_some()
    }

    pub(crate) fn contains(&self, file_no: u32) -> bool {
        self.files.contains_key(&file_no)
    }

    /// Get a mapped file.
    pub(crate) fn get(&self, file_no: u32) -> Option<&DataFile> {
        match self.files.get(&file_no) {
            Some(FileSlot::Mapped(file)) => Some(file),
            _ => None,
        }
    }

    /// Returns handles to all mapped files.
    pub(crate) fn mapped_files(&self) -> Vec<RWFile> {
        self.files
            .values()
            .filter_map(|slot| match slot {
                FileSlot::Mapped(data_file) => Some(data_file.file.clone()),
                FileSlot::Reserved => None,
            })
            .collect()
    }
}

/// The byte length of a data file with `num_pages` pages.
pub(crate) fn data_file_len(num_pages: u32) -> u64 {
    num_pages as u64 * PAGE_SIZE as u64
}

/// The byte offset of a page within its data file.
pub(crate) fn page_offset(page_no: u32) -> u64 {
    page_no as u64 * PAGE_SIZE as u64
}

/// Build the expected zero page of a data file.
pub(crate) fn data_zero_page(
    file_no: u32,
    tablespace_id: u32,
    num_pages: u32,
    encrypted_filesystem: bool,
) -> ZeroPage {
    ZeroPage {
        file_type: FileType::Data,
        file_no,
        group_id: tablespace_id,
        group_version: DATA_FILE_VERSION,
        page_count: num_pages,
        encrypted_filesystem,
    }
}

#[tracing::instrument("data-file-create", skip(ctx, zero_page))]
/// Create a new data file, allocate its pages and write the zero page.
pub(crate) async fn create_data_file(
    ctx: &ctx::Context,
    file_no: u32,
    zero_page: &ZeroPage,
) -> io::Result<DataFile> {
    let file = ctx.directory().create_file(FileGroup::Data, file_no).await?;
    file.set_len(data_file_len(zero_page.page_count)).await?;
    file.write_at(zero_page.encode(), 0).await?;
    file.sync_data().await?;

    tracing::info!(
        file_no = file_no,
        num_pages = zero_page.page_count,
        size = %humansize::format_size(data_file_len(zero_page.page_count), humansize::DECIMAL),
        "created data file",
    );

    Ok(DataFile {
        file,
        num_pages: zero_page.page_count,
    })
}

#[tracing::instrument("data-file-open", skip(ctx, zero_page))]
/// Open an existing data file and validate its zero page.
pub(crate) async fn open_data_file(
    ctx: &ctx::Context,
    file_no: u32,
    zero_page: &ZeroPage,
) -> Result<DataFile, OpenDataFileError> {
    let file = ctx.directory().open_file(FileGroup::Data, file_no).await?;

    let expected = data_file_len(zero_page.page_count);
    let actual = file.get_len().await?;
    if actual != expected {
        return Err(OpenDataFileError::SizeMismatch { expected, actual });
    }

    let page = file.read_at(PAGE_SIZE, 0).await?;
    zero_page.validate(&page)?;

    tracing::info!(file_no = file_no, num_pages = zero_page.page_count, "opened data file");

    Ok(DataFile {
        file,
        num_pages: zero_page.page_count,
    })
}
