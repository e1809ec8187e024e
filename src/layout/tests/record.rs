use crate::layout::record::*;

fn encode(lsn: u64, parts: &[UndoEntry]) -> Vec<u32> {
    let mut out = vec![0; entry_words(parts)];
    encode_entry(lsn, parts, &mut out);
    out
}

#[test]
fn test_header_pack_unpack() {
    let header = pack_header(UndoRecordType::TupUpdate, true, 12);
    assert_eq!(header, (0x8004 << 16) | 12);
    assert_eq!(unpack_header(header), (UndoRecordType::TupUpdate as u16, true, 12));

    let header = pack_header(UndoRecordType::End, false, 1);
    assert_eq!(unpack_header(header), (0x7FFF, false, 1));
}

#[rstest::rstest]
#[case::single(&[3], 4)]
#[case::single_empty(&[0], 1)]
#[case::composite(&[3, 5], 4 + 8)]
#[case::composite_three(&[1, 1, 1], 2 + 4 + 4)]
fn test_entry_words(#[case] payload_lens: &[usize], #[case] expected: usize) {
    let payload = vec![0u32; 16];
    let parts = payload_lens
        .iter()
        .map(|len| UndoEntry::new(UndoRecordType::TupAlloc, &payload[..*len]))
        .collect::<Vec<_>>();
    assert_eq!(entry_words(&parts), expected);
}

#[test]
fn test_cursor_decodes_records_backwards() {
    let mut words = Vec::new();
    words.extend(encode(10, &[UndoEntry::new(UndoRecordType::TupAlloc, &[1, 2])]));
    words.extend(encode(
        11,
        &[
            UndoEntry::new(UndoRecordType::TupFirstUpdatePart, &[3]),
            UndoEntry::new(UndoRecordType::TupUpdatePart, &[4, 5]),
        ],
    ));
    words.extend(encode(12, &[UndoEntry::new(UndoRecordType::TupFree, &[])]));
    let mut noop = vec![0; 5];
    encode_noop(&mut noop);
    words.extend(noop);

    let mut cursor = RecordCursor::new(&words, 12);
    let mut decoded = Vec::new();
    while let Some(record) = cursor.next_back() {
        let record = record.expect("record should decode");
        decoded.push((record.lsn, record.record_type, cursor.payload(&record).to_vec()));
    }

    assert_eq!(
        decoded,
        vec![
            (12, UndoRecordType::Noop, vec![]),
            (12, UndoRecordType::TupFree, vec![]),
            (11, UndoRecordType::TupUpdatePart, vec![4, 5]),
            (11, UndoRecordType::TupFirstUpdatePart, vec![3]),
            (10, UndoRecordType::TupAlloc, vec![1, 2]),
        ],
    );
    assert_eq!(cursor.expected_lsn(), 9);
}

#[rstest::rstest]
#[case::zero_len(vec![0], RecordDecodeError::InvalidLength { position: 1, len: 0 })]
#[case::overflow(vec![7, 9 | (3 << 16)], RecordDecodeError::InvalidLength { position: 2, len: 9 })]
#[case::unknown_type(vec![(0x1234 << 16) | 1], RecordDecodeError::UnknownType(0x1234))]
#[case::explicit_too_short(vec![(4 << 16) | 2, (4 << 16) | 2], RecordDecodeError::InvalidLength { position: 2, len: 2 })]
#[case::newer_prev(vec![0, 50, (4 << 16) | 3], RecordDecodeError::LsnOrdering { lsn: 20, prev: 50 })]
fn test_cursor_rejects_corrupt_records(
    #[case] words: Vec<u32>,
    #[case] expected: RecordDecodeError,
) {
    let mut cursor = RecordCursor::new(&words, 20);
    let result = cursor.next_back().expect("cursor should produce a result");
    assert_eq!(result, Err(expected));
}

#[test]
fn test_record_type_classification() {
    assert!(UndoRecordType::Lcp.is_lcp_marker());
    assert!(UndoRecordType::LocalLcp.is_lcp_marker());
    assert!(!UndoRecordType::TupAlloc.is_lcp_marker());
    assert!(UndoRecordType::TupUpdatePart.is_data_record());
    assert!(!UndoRecordType::Noop.is_data_record());
    assert!(!UndoRecordType::End.is_data_record());
    for code in 1..=14 {
        assert!(UndoRecordType::from_u16(code).is_some());
    }
    assert!(UndoRecordType::from_u16(0).is_none());
}
