use super::*;

#[tokio::test]
async fn test_lsns_are_sequential() {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 16)]).await;
    let client = lgman.client("test");

    let mut lsns = Vec::new();
    for idx in 0..200u32 {
        let payload = vec![idx; (idx % 37) as usize];
        lsns.push(append(&client, UndoRecordType::TupUpdate, &payload).await.unwrap());
    }

    let expected: Vec<Lsn> = (1..=200).collect();
    assert_eq!(lsns, expected);
    assert_eq!(client.get_latest_lsn().unwrap(), 200);
    lgman.validate().expect("accounting must balance");
}

#[tokio::test]
async fn test_composite_entry_shares_lsn() {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 8)]).await;
    let client = lgman.client("test");

    let first = append(&client, UndoRecordType::TupAlloc, &[1, 2]).await.unwrap();
    let parts = [
        UndoEntry::new(UndoRecordType::TupFirstUpdatePart, &[3, 4]),
        UndoEntry::new(UndoRecordType::TupUpdatePart, &[5]),
        UndoEntry::new(UndoRecordType::TupUpdatePart, &[6]),
    ];
    let composite = append_parts(&client, &parts).await.unwrap();
    let last = append(&client, UndoRecordType::TupFree, &[7]).await.unwrap();

    assert_eq!((first, composite, last), (1, 2, 3));
    let stats = lgman.stats().unwrap();
    assert_eq!(stats.entries_added, 3);
}

#[tokio::test]
async fn test_add_entry_without_log_space() {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 8)]).await;
    let client = lgman.client("test");

    let buffer_words = lgman.stats().unwrap().free_buffer_words;
    let permit = client.get_log_buffer(4).await.unwrap();
    let parts = [UndoEntry::new(UndoRecordType::TupAlloc, &[1, 2, 3])];
    let err = client.add_entry(permit, &parts).unwrap_err();
    assert!(
        matches!(err, LogError::SpaceNotAllocated { requested: 4, reserved: 0 }),
        "unexpected error: {err}",
    );

    let stats = lgman.stats().unwrap();
    assert_eq!(stats.free_buffer_words, buffer_words);
    assert_eq!(stats.next_lsn, 1);
    lgman.validate().expect("accounting must balance");
}

#[tokio::test]
async fn test_permit_too_small() {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 8)]).await;
    let client = lgman.client("test");

    client.alloc_log_space(10).unwrap();
    let permit = client.get_log_buffer(2).await.unwrap();
    let parts = [UndoEntry::new(UndoRecordType::TupAlloc, &[1, 2, 3])];
    let err = client.add_entry(permit, &parts).unwrap_err();
    assert!(matches!(err, LogError::PermitTooSmall { words: 4, reserved: 2 }));

    client.free_log_space(10).unwrap();
    lgman.validate().expect("accounting must balance");
    assert_eq!(lgman.stats().unwrap().reserved_log_words, 0);
}

#[tokio::test]
async fn test_record_too_large() {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 8)]).await;
    let client = lgman.client("test");

    let err = client.get_log_buffer(PAGE_DATA_WORDS + 1).await.unwrap_err();
    assert!(matches!(err, LogError::RecordTooLarge(words) if words == PAGE_DATA_WORDS + 1));
    assert!(client.get_log_buffer(PAGE_DATA_WORDS).await.is_ok());
}

#[rstest::rstest]
#[case::abortable_refused(true, false)]
#[case::non_abortable_allowed(false, true)]
#[tokio::test]
async fn test_abortable_allocation_limit(#[case] abortable: bool, #[case] expect_ok: bool) {
    let storage = MemoryStorage::new();
    // Two data pages.
    let lgman = online_lgman(&storage, test_config(), &[(1, 3)]).await;
    let client = lgman.client("test");

    let total = lgman.stats().unwrap().total_log_words;
    assert_eq!(total, 2 * PAGE_DATA_WORDS as u64);

    // The reservation also covers the padding the entry may need.
    let words = (total / 3 + 1) as usize;
    let result = if abortable {
        client.alloc_log_space(words)
    } else {
        client.alloc_log_space_non_abortable(words)
    };
    assert_eq!(result.is_ok(), expect_ok, "unexpected result: {result:?}");
    if !expect_ok {
        assert!(matches!(result, Err(LogError::OutOfLogSpace)));
    }
    lgman.validate().expect("accounting must balance");
}

#[tokio::test]
async fn test_node_restart_lowers_limit() {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 3)]).await;
    let client = lgman.client("test");

    let total = lgman.stats().unwrap().total_log_words;
    let words = (total / 3 + 1) as usize;
    assert!(client.alloc_log_space(words).is_err());

    lgman.set_node_restart(true).unwrap();
    client.alloc_log_space(words).expect("limit is lower during node restart");
}

#[tokio::test]
async fn test_out_of_log_space() {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 3)]).await;
    let client = lgman.client("test");

    append(&client, UndoRecordType::TupUpdate, &full_page_payload(1))
        .await
        .unwrap();

    // A full page entry also reserves room for padding a partial page.
    let err = append(&client, UndoRecordType::TupUpdate, &full_page_payload(2))
        .await
        .unwrap_err();
    assert!(matches!(err, LogError::OutOfLogSpace));

    // Single word entries never pad, they fill the ring to the last word.
    let mut appended = 0;
    let err = loop {
        match append(&client, UndoRecordType::TupAlloc, &[]).await {
            Ok(_) => appended += 1,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, LogError::OutOfLogSpace));
    assert_eq!(appended, PAGE_DATA_WORDS);

    let stats = lgman.stats().unwrap();
    assert_eq!(stats.free_log_words, 0);
    assert_eq!(stats.producer_page - stats.tail_page, 2);
    lgman.validate().expect("accounting must balance");
}

#[tokio::test]
async fn test_group_lifecycle_errors() {
    let storage = MemoryStorage::new();
    let ctx = Context::for_test_with_storage(storage.clone());
    let lgman = Lgman::new(ctx);

    let err = lgman.client("test").alloc_log_space(1).unwrap_err();
    assert!(matches!(err, LogError::NoLogfileGroup));

    lgman.create_logfile_group(GROUP_ID, GROUP_VERSION).unwrap();
    let err = lgman.create_logfile_group(GROUP_ID, GROUP_VERSION).unwrap_err();
    assert!(matches!(err, LogError::LogfileGroupExists));

    let err = lgman.go_online().unwrap_err();
    assert!(matches!(err, LogError::InvalidState(GroupState::Starting)));

    let err = lgman.create_undo_file(1, 1).await.unwrap_err();
    assert!(matches!(err, LogError::FileTooSmall(1)));

    lgman.create_undo_file(1, 4).await.unwrap();
    let err = lgman.create_undo_file(1, 4).await.unwrap_err();
    assert!(matches!(err, LogError::FileExists(1)));

    let err = lgman.client("test").alloc_log_space(1).unwrap_err();
    assert!(matches!(err, LogError::InvalidState(GroupState::Starting)));

    lgman.go_online().unwrap();
    let err = lgman.create_undo_file(2, 4).await.unwrap_err();
    assert!(matches!(err, LogError::InvalidState(GroupState::Online)));
}

#[tokio::test]
async fn test_drop_logfile_group_removes_files() {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 4), (2, 4)]).await;
    let client = lgman.client("test");
    append(&client, UndoRecordType::TupAlloc, &[1]).await.unwrap();

    lgman.drop_logfile_group().await.expect("drop group");
    assert!(storage.list_files(crate::directory::FileGroup::Undo).is_empty());
    assert!(matches!(lgman.stats(), Err(LogError::NoLogfileGroup)));

    lgman.create_logfile_group(GROUP_ID + 1, GROUP_VERSION).unwrap();
}
