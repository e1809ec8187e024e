//! Bit exact on-disk formats.
//!
//! Every file is a sequence of 32KB pages addressed by page number, page `0`
//! of every file is the zero page identifying the file. All structures are
//! read and written as little endian 32-bit words with explicit pack/unpack
//! helpers, no struct is ever reinterpreted over a raw buffer.
//!
//! - Zero Page
//!     * Identifies the file type, owning group and layout version.
//!     * Compared byte for byte with the expected page whenever the file is opened.
//! - UNDO Page
//!     * 8 word header (LSN, page type, version, checksum, words used).
//!     * Packed variable length UNDO records growing from the start of the page.
//! - Data Page
//!     * 4 word header carrying the LSN of the last change written to disk.
//!     * The rest of the page belongs to the page owner.

pub mod data_page;
pub mod integrity;
pub mod record;
#[cfg(all(test, not(feature = "test-miri")))]
mod tests;
pub mod undo_page;
pub mod zero_page;

/// The size of every page in bytes.
pub const PAGE_SIZE: usize = 32 << 10;
/// The number of 32-bit words within a page.
pub const PAGE_WORDS: usize = PAGE_SIZE / 4;

/// A log sequence number.
///
/// LSNs are assigned from `1` upwards, `0` marks a page which has never been
/// written to.
pub type Lsn = u64;

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
/// Identifies a single page of a data file.
pub struct PageKey {
    /// The file number of the data file.
    pub file_no: u32,
    /// The page within the file.
    pub page_no: u32,
}

impl PageKey {
    /// Creates a new [PageKey].
    pub const fn new(file_no: u32, page_no: u32) -> Self {
        Self { file_no, page_no }
    }
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The page type written into every page header.
pub enum PageType {
    /// The identifying first page of a file.
    Zero = 1,
    /// A page of the UNDO log.
    Undo = 2,
    /// A page of a data file.
    Data = 3,
}

impl PageType {
    /// Get the [PageType] from its encoded value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Zero),
            2 => Some(Self::Undo),
            3 => Some(Self::Data),
            _ => None,
        }
    }
}

#[inline]
/// Read the little endian word at word index `word`.
pub fn read_word(buffer: &[u8], word: usize) -> u32 {
    let start = word * 4;
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buffer[start..start + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
/// Write the little endian word at word index `word`.
pub fn write_word(buffer: &mut [u8], word: usize, value: u32) {
    let start = word * 4;
    buffer[start..start + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
/// Split an LSN into its high and low words.
pub const fn split_lsn(lsn: Lsn) -> (u32, u32) {
    ((lsn >> 32) as u32, lsn as u32)
}

#[inline]
/// Join the high and low words of an LSN.
pub const fn join_lsn(hi: u32, lo: u32) -> Lsn {
    ((hi as u64) << 32) | lo as u64
}

/// Decode a slice of little endian bytes into words.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Encode a slice of words into the target byte buffer.
pub fn words_to_bytes(words: &[u32], target: &mut [u8]) {
    for (chunk, word) in target.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}
