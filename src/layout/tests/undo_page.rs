use crate::layout::undo_page::*;
use crate::layout::{PAGE_SIZE, PageType, write_word};

fn sample_data(words: usize) -> Vec<u8> {
    (0..words as u32).flat_map(|w| w.to_le_bytes()).collect()
}

#[rstest::rstest]
#[case::single_word(1, false)]
#[case::half_page(4000, false)]
#[case::full_page(UNDO_PAGE_DATA_WORDS, false)]
#[case::checksummed(512, true)]
#[case::checksummed_full(UNDO_PAGE_DATA_WORDS, true)]
fn test_encode_decode_page(#[case] words: usize, #[case] checksums: bool) {
    let data = sample_data(words);
    let mut page = vec![0xFF; PAGE_SIZE];
    encode_undo_page(1 << 40 | 17, &data, checksums, &mut page);

    let header = decode_undo_page(&page).expect("page should decode");
    assert_eq!(header.lsn, 1 << 40 | 17);
    assert_eq!(header.version, UNDO_PAGE_VERSION_V2);
    assert_eq!(header.words_used as usize, words);
    assert_eq!(header.checksum != 0, checksums);
    assert_eq!(&page[header.data_range()], data.as_slice());
}

#[test]
fn test_encoded_header_layout() {
    let mut page = vec![0; PAGE_SIZE];
    encode_undo_page(5, &[1, 0, 0, 0], false, &mut page);
    assert_eq!(
        &page[..36],
        &[
            0, 0, 0, 0, // lsn hi
            5, 0, 0, 0, // lsn lo
            2, 0, 0, 0, // page type
            2, 0, 0, 0, // version
            0, 0, 0, 0, // checksum
            1, 0, 0, 0, // words used
            0, 0, 0, 0, 0, 0, 0, 0, // padding
            1, 0, 0, 0, // data
        ],
    );
}

#[test]
fn test_unwritten_page_rejected() {
    let page = vec![0; PAGE_SIZE];
    assert_eq!(decode_undo_page(&page), Err(UndoPageError::Unwritten));
}

#[test]
fn test_torn_page_detected_with_checksum() {
    let data = sample_data(UNDO_PAGE_DATA_WORDS);
    let mut page = vec![0; PAGE_SIZE];
    encode_undo_page(9, &data, true, &mut page);
    page[PAGE_SIZE / 2..].fill(0);
    assert_eq!(decode_undo_page(&page), Err(UndoPageError::ChecksumMismatch));
}

#[test]
fn test_torn_page_undetected_without_checksum() {
    let data = sample_data(UNDO_PAGE_DATA_WORDS);
    let mut page = vec![0; PAGE_SIZE];
    encode_undo_page(9, &data, false, &mut page);
    page[PAGE_SIZE / 2..].fill(0);
    assert!(decode_undo_page(&page).is_ok());
}

#[rstest::rstest]
#[case::wrong_type(|page: &mut [u8]| write_word(page, 2, PageType::Data as u32), UndoPageError::WrongPageType(3))]
#[case::bad_version(|page: &mut [u8]| write_word(page, 3, 9), UndoPageError::UnsupportedVersion(9))]
#[case::zero_len(|page: &mut [u8]| write_word(page, 5, 0), UndoPageError::InvalidLength(0))]
#[case::too_long(|page: &mut [u8]| write_word(page, 5, 9000), UndoPageError::InvalidLength(9000))]
fn test_invalid_headers(
    #[case] corrupt: fn(&mut [u8]),
    #[case] expected: UndoPageError,
) {
    let mut page = vec![0; PAGE_SIZE];
    encode_undo_page(3, &sample_data(16), false, &mut page);
    corrupt(&mut page);
    assert_eq!(decode_undo_page(&page), Err(expected));
}

#[test]
fn test_v1_page_accepted() {
    let mut page = vec![0; PAGE_SIZE];
    write_word(&mut page, 1, 44);
    write_word(&mut page, 2, PageType::Undo as u32);
    write_word(&mut page, 3, UNDO_PAGE_VERSION_V1);
    write_word(&mut page, 4, 2);
    write_word(&mut page, 6, 0xAAAA);
    write_word(&mut page, 7, 0xBBBB);

    let header = decode_undo_page(&page).expect("v1 page should decode");
    assert_eq!(header.lsn, 44);
    assert_eq!(header.header_words(), V1_HEADER_WORDS);
    assert_eq!(header.data_range(), 24..32);
}
