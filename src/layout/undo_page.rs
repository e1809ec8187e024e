//! The UNDO log page.
//!
//! ```text
//! word 0      lsn_hi       LSN of the newest record on the page
//! word 1      lsn_lo
//! word 2      page_type    always PageType::Undo
//! word 3      version      1 or 2
//! word 4      checksum     v2 only, zero when checksums are disabled
//! word 5      words_used   v2 only, number of record words on the page
//! word 6..8   padding      v2 only
//! ```
//!
//! Version 1 pages have a 6 word header where `words_used` lives at word 4,
//! they are accepted when read but never written.

use std::ops::Range;

use super::{Lsn, PAGE_SIZE, PAGE_WORDS, PageType, integrity, join_lsn, read_word};
use crate::layout::{split_lsn, write_word};

/// The legacy page layout without a checksum field.
pub const UNDO_PAGE_VERSION_V1: u32 = 1;
/// The current page layout.
pub const UNDO_PAGE_VERSION_V2: u32 = 2;
/// The header size of version 1 pages.
pub const V1_HEADER_WORDS: usize = 6;
/// The header size of version 2 pages.
pub const V2_HEADER_WORDS: usize = 8;
/// The number of record words a written page can hold.
pub const UNDO_PAGE_DATA_WORDS: usize = PAGE_WORDS - V2_HEADER_WORDS;

const CHECKSUM_FIELD: Range<usize> = 16..20;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
/// The page cannot be used as a valid UNDO page.
pub enum UndoPageError {
    #[error("page has never been written")]
    /// The page contains no LSN.
    Unwritten,
    #[error("unexpected page type: {0}")]
    /// The page header does not describe an UNDO page.
    WrongPageType(u32),
    #[error("unsupported UNDO page version: {0}")]
    /// The version tag is not known.
    UnsupportedVersion(u32),
    #[error("invalid number of used words: {0}")]
    /// The used word count is outside of the page bounds.
    InvalidLength(u32),
    #[error("page checksum mismatch")]
    /// The page checksum does not match the page contents.
    ChecksumMismatch,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The decoded header of an UNDO page.
pub struct UndoPageHeader {
    /// The LSN of the newest record on the page.
    pub lsn: Lsn,
    /// The page layout version.
    pub version: u32,
    /// The stored checksum, `0` if not computed.
    pub checksum: u32,
    /// The number of record words on the page.
    pub words_used: u32,
}

impl UndoPageHeader {
    /// The number of header words preceding the record data.
    pub fn header_words(&self) -> usize {
        if self.version == UNDO_PAGE_VERSION_V1 {
            V1_HEADER_WORDS
        } else {
            V2_HEADER_WORDS
        }
    }

    /// The byte range of the record data within the page.
    pub fn data_range(&self) -> Range<usize> {
        let start = self.header_words() * 4;
        start..start + self.words_used as usize * 4
    }
}

/// Encode a version 2 UNDO page into `page`.
///
/// `data` holds the encoded record bytes and must be a multiple of 4 bytes.
pub fn encode_undo_page(lsn: Lsn, data: &[u8], checksums: bool, page: &mut [u8]) {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    debug_assert_eq!(data.len() % 4, 0);
    debug_assert!(data.len() <= UNDO_PAGE_DATA_WORDS * 4);

    let (lsn_hi, lsn_lo) = split_lsn(lsn);
    write_word(page, 0, lsn_hi);
    write_word(page, 1, lsn_lo);
    write_word(page, 2, PageType::Undo as u32);
    write_word(page, 3, UNDO_PAGE_VERSION_V2);
    write_word(page, 4, 0);
    write_word(page, 5, (data.len() / 4) as u32);
    write_word(page, 6, 0);
    write_word(page, 7, 0);

    let data_start = V2_HEADER_WORDS * 4;
    page[data_start..data_start + data.len()].copy_from_slice(data);
    page[data_start + data.len()..].fill(0);

    if checksums {
        integrity::write_check_bytes(page, CHECKSUM_FIELD);
    }
}

/// Decode and validate the header of an UNDO page.
pub fn decode_undo_page(page: &[u8]) -> Result<UndoPageHeader, UndoPageError> {
    debug_assert_eq!(page.len(), PAGE_SIZE);

    let lsn = join_lsn(read_word(page, 0), read_word(page, 1));
    let page_type = read_word(page, 2);
    let version = read_word(page, 3);

    if lsn == 0 && page_type == 0 {
        return Err(UndoPageError::Unwritten);
    }

    if PageType::from_u32(page_type) != Some(PageType::Undo) {
        return Err(UndoPageError::WrongPageType(page_type));
    }

    let (checksum, words_used, max_words) = match version {
        UNDO_PAGE_VERSION_V1 => (0, read_word(page, 4), PAGE_WORDS - V1_HEADER_WORDS),
        UNDO_PAGE_VERSION_V2 => {
            (read_word(page, 4), read_word(page, 5), UNDO_PAGE_DATA_WORDS)
        },
        other => return Err(UndoPageError::UnsupportedVersion(other)),
    };

    if lsn == 0 {
        return Err(UndoPageError::Unwritten);
    }

    if words_used == 0 || words_used as usize > max_words {
        return Err(UndoPageError::InvalidLength(words_used));
    }

    if checksum != 0 && !integrity::verify(page, CHECKSUM_FIELD) {
        return Err(UndoPageError::ChecksumMismatch);
    }

    Ok(UndoPageHeader {
        lsn,
        version,
        checksum,
        words_used,
    })
}
