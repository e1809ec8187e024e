//! The zero page identifies a file.
//!
//! ```text
//! word 0..2    lsn              always zero
//! word 2       page_type        PageType::Zero
//! word 3..5    magic            b"LNXDISK\0"
//! word 5       byte_order       0x12345678
//! word 6       page_size
//! word 7       format_version
//! word 8       file_type        1 = data, 2 = undo
//! word 9       file_no
//! word 10      group_id         logfile group or tablespace ID
//! word 11      group_version
//! word 12      page_count
//! word 13      flags            bit 0 = encrypted file system
//! ```
//!
//! The remainder of the page is zero. A file is only accepted when the stored
//! page is byte-for-byte identical to the page the opener expects.

use super::{PAGE_SIZE, PageType, read_word, write_word};

/// The magic bytes at the start of every file.
pub const ZERO_PAGE_MAGIC: [u8; 8] = *b"LNXDISK\0";
/// Detects files written with a different byte order.
pub const BYTE_ORDER_MARK: u32 = 0x1234_5678;
/// The current file format version.
pub const FORMAT_VERSION: u32 = 2;

const FLAG_ENCRYPTED_FILESYSTEM: u32 = 1;

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The type of file described by a zero page.
pub enum FileType {
    /// A tablespace data file.
    Data = 1,
    /// An UNDO log file.
    Undo = 2,
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// The identifying information of a file.
pub struct ZeroPage {
    /// The type of the file.
    pub file_type: FileType,
    /// The file number.
    pub file_no: u32,
    /// The owning logfile group or tablespace.
    pub group_id: u32,
    /// The version of the owning group.
    pub group_version: u32,
    /// The total number of pages in the file, including the zero page.
    pub page_count: u32,
    /// If the files live on an encrypted file system.
    pub encrypted_filesystem: bool,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
/// The on-disk zero page does not describe the expected file.
pub enum ZeroPageError {
    #[error("zero page magic bytes missing")]
    /// The page does not start with the magic bytes.
    BadMagic,
    #[error("file was written with a different byte order")]
    /// The byte order mark does not match.
    ByteOrder,
    #[error("unsupported page size {0}")]
    /// The file uses a different page size.
    PageSize(u32),
    #[error("unsupported file format version {0}")]
    /// The file format version is not known.
    UnsupportedVersion(u32),
    #[error(
        "encrypted file system flag mismatch, file has encrypted_filesystem={actual}"
    )]
    /// The encrypted file system flag differs from the current configuration.
    EncryptedFilesystemMismatch {
        /// The flag stored in the file.
        actual: bool,
    },
    #[error("zero page mismatch: {field} expected {expected} found {actual}")]
    /// A field of the zero page differs from the expected value.
    FieldMismatch {
        /// The name of the mismatched field.
        field: &'static str,
        /// The expected value.
        expected: u32,
        /// The value in the file.
        actual: u32,
    },
    #[error("zero page contains unexpected trailing data")]
    /// The page is not identical to the expected page.
    TrailingData,
}

impl ZeroPage {
    /// Encode the zero page into a full page buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut page = vec![0; PAGE_SIZE];
        write_word(&mut page, 2, PageType::Zero as u32);
        page[12..20].copy_from_slice(&ZERO_PAGE_MAGIC);
        write_word(&mut page, 5, BYTE_ORDER_MARK);
        write_word(&mut page, 6, PAGE_SIZE as u32);
        write_word(&mut page, 7, FORMAT_VERSION);
        write_word(&mut page, 8, self.file_type as u32);
        write_word(&mut page, 9, self.file_no);
        write_word(&mut page, 10, self.group_id);
        write_word(&mut page, 11, self.group_version);
        write_word(&mut page, 12, self.page_count);
        let flags = if self.encrypted_filesystem {
            FLAG_ENCRYPTED_FILESYSTEM
        } else {
            0
        };
        write_word(&mut page, 13, flags);
        page
    }

    /// Validate the on-disk `page` is identical to this expected zero page.
    ///
    /// On a mismatch the first differing field is reported.
    pub fn validate(&self, page: &[u8]) -> Result<(), ZeroPageError> {
        let expected = self.encode();
        if page == expected.as_slice() {
            return Ok(());
        }

        if page.len() < PAGE_SIZE || page[12..20] != ZERO_PAGE_MAGIC {
            return Err(ZeroPageError::BadMagic);
        }
        if read_word(page, 5) != BYTE_ORDER_MARK {
            return Err(ZeroPageError::ByteOrder);
        }
        let page_size = read_word(page, 6);
        if page_size != PAGE_SIZE as u32 {
            return Err(ZeroPageError::PageSize(page_size));
        }
        let version = read_word(page, 7);
        if version != FORMAT_VERSION {
            return Err(ZeroPageError::UnsupportedVersion(version));
        }

        let flags = read_word(page, 13);
        let actual_encrypted = flags & FLAG_ENCRYPTED_FILESYSTEM != 0;
        if actual_encrypted != self.encrypted_filesystem {
            return Err(ZeroPageError::EncryptedFilesystemMismatch {
                actual: actual_encrypted,
            });
        }

        let fields = [
            ("page_type", 2),
            ("file_type", 8),
            ("file_no", 9),
            ("group_id", 10),
            ("group_version", 11),
            ("page_count", 12),
            ("flags", 13),
        ];
        for (field, word) in fields {
            let expected = read_word(&expected, word);
            let actual = read_word(page, word);
            if expected != actual {
                return Err(ZeroPageError::FieldMismatch {
                    field,
                    expected,
                    actual,
                });
            }
        }

        Err(ZeroPageError::TrailingData)
    }
}
