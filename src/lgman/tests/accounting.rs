use super::*;

#[rstest::rstest]
#[trace]
#[tokio::test]
async fn test_random_operations_keep_accounting(#[values(1, 7, 42, 1337)] seed: u64) {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 10), (2, 10), (3, 10)]).await;
    let client = lgman.client("test");
    let mut rng = fastrand::Rng::with_seed(seed);

    let mut lcp_id = 1;
    let mut last_lsn = 0;
    for _ in 0..400 {
        match rng.u8(0..6) {
            0 => {
                let words = rng.usize(1..4_000);
                if client.alloc_log_space(words).is_ok() {
                    client.free_log_space(words).unwrap();
                }
            },
            1 | 2 => {
                let payload = vec![rng.u32(..); rng.usize(0..3_000)];
                match append(&client, UndoRecordType::TupUpdate, &payload).await {
                    Ok(lsn) => {
                        assert!(lsn > last_lsn, "lsn {lsn} not after {last_lsn}");
                        last_lsn = lsn;
                    },
                    Err(LogError::OutOfLogSpace) => {
                        lgman.flush_log().await.unwrap();
                        for _ in 0..2 {
                            if let Ok(lsn) = lgman.lcp_start(lcp_id).await {
                                last_lsn = lsn;
                            }
                            lgman.lcp_complete(lcp_id).unwrap();
                            lcp_id += 1;
                        }
                    },
                    Err(other) => panic!("unexpected error: {other}"),
                }
            },
            3 => {
                lgman.flush_log().await.unwrap();
            },
            4 => {
                let permit = client.get_log_buffer(rng.usize(1..100)).await.unwrap();
                drop(permit);
            },
            _ => {
                last_lsn = lgman.lcp_start(lcp_id).await.unwrap();
                lgman.lcp_complete(lcp_id).unwrap();
                lcp_id += 1;
            },
        }

        lgman.validate().expect("accounting must balance");
    }

    let stats = lgman.stats().unwrap();
    assert_eq!(stats.reserved_log_words, 0);
    assert_eq!(stats.next_lsn, last_lsn + 1);
}

#[tokio::test]
async fn test_padding_is_charged_to_free_space() {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 8)]).await;
    let client = lgman.client("test");

    append(&client, UndoRecordType::TupUpdate, &vec![1; PAGE_DATA_WORDS - 2])
        .await
        .unwrap();
    let before = lgman.stats().unwrap();
    append(&client, UndoRecordType::TupUpdate, &[2; 9]).await.unwrap();
    let after = lgman.stats().unwrap();

    assert_eq!(after.padding_words - before.padding_words, 1);
    assert_eq!(before.free_log_words - after.free_log_words, 11);
    assert_eq!(after.producer_page, 1);
    lgman.validate().expect("accounting must balance");
}

#[tokio::test]
async fn test_fill_log_to_limit_then_sync() {
    let storage = MemoryStorage::new();
    // Three data pages.
    let lgman = online_lgman(&storage, test_config(), &[(1, 4)]).await;
    let client = lgman.client("test");

    let mut appended = Vec::new();
    loop {
        match append(&client, UndoRecordType::TupUpdate, &[7; 999]).await {
            Ok(lsn) => appended.push(lsn),
            Err(LogError::OutOfLogSpace) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(lgman.stats().unwrap().free_log_words >= 0);
        lgman.validate().expect("accounting must balance");
    }
    // Eight entries fit a page, the last page is left with room for seven.
    assert_eq!(appended.len(), 23);

    let before = lgman.stats().unwrap();
    assert_eq!(before.producer_page, 2);
    assert_eq!(before.free_log_words, (PAGE_DATA_WORDS - 7_000) as i64);

    lgman.wait_for_lsn(*appended.last().unwrap()).await.unwrap();
    let after = lgman.stats().unwrap();
    assert_eq!(after.free_log_words, 0);
    assert_eq!(after.producer_page, 3);
    assert_eq!(after.forced_page_closes, 1);
    lgman.validate().expect("accounting must balance");
}

#[tokio::test]
async fn test_sync_waits_for_space_to_pad_page() {
    let storage = MemoryStorage::new();
    let lgman = online_lgman(&storage, test_config(), &[(1, 4)]).await;
    let client = lgman.client("test");

    let lsn = append(&client, UndoRecordType::TupUpdate, &[1; 9]).await.unwrap();

    // Hold every remaining word of log space without adding the entry.
    let free = lgman.stats().unwrap().free_log_words as usize;
    let held = free - (PAGE_DATA_WORDS - 1);
    assert!(held > PAGE_DATA_WORDS);
    client.alloc_log_space_non_abortable(held).unwrap();
    assert_eq!(lgman.stats().unwrap().free_log_words, 0);

    let SyncLsn::Queued(mut rx) = lgman.sync_lsn(lsn).unwrap() else {
        panic!("lsn {lsn} must not be durable yet");
    };
    assert_eq!(lgman.flush_log().await.unwrap(), 0);
    assert!(rx.try_recv().is_err());

    let stats = lgman.stats().unwrap();
    assert_eq!(stats.forced_page_closes, 0);
    assert_eq!(stats.free_log_words, 0);
    lgman.validate().expect("accounting must balance");

    client.free_log_space(held).unwrap();
    lgman.flush_log().await.unwrap();
    rx.await.expect("sync completes once the padding fits");

    let stats = lgman.stats().unwrap();
    assert!(stats.last_synced_lsn >= lsn);
    assert_eq!(stats.forced_page_closes, 1);
    assert_eq!(stats.free_log_words, 2 * PAGE_DATA_WORDS as i64);
    lgman.validate().expect("accounting must balance");
}
