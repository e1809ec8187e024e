//! The header of a data page.
//!
//! The first 16 bytes of every data page are owned by the page cache and
//! record the LSN of the last change written out with the page. The
//! remaining bytes belong to the page owner.

use super::{Lsn, PageType, join_lsn, read_word, split_lsn, write_word};

/// The number of bytes reserved at the start of every data page.
pub const DATA_PAGE_HEADER_SIZE: usize = 16;

/// Stamp the page header with the LSN of the newest change on the page.
pub fn stamp_data_page(page: &mut [u8], lsn: Lsn) {
    let (lsn_hi, lsn_lo) = split_lsn(lsn);
    write_word(page, 0, lsn_hi);
    write_word(page, 1, lsn_lo);
    write_word(page, 2, PageType::Data as u32);
    write_word(page, 3, 0);
}

/// Read the LSN of a data page.
///
/// Returns `None` if the page has never been written out.
pub fn data_page_lsn(page: &[u8]) -> Option<Lsn> {
    if PageType::from_u32(read_word(page, 2)) != Some(PageType::Data) {
        return None;
    }
    Some(join_lsn(read_word(page, 0), read_word(page, 1)))
}
