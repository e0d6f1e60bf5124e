use super::user_target;
use crate::dedupe::{DedupeLedger, DedupeOutcome};
use crate::store::Store;
use mailswarm_api::Namespace;

#[tokio::test]
async fn second_insert_is_a_duplicate() {
    let store = Store::open_in_memory().expect("store");
    let target = user_target();
    let outcomes = store
        .transaction(|tx| {
            Ok(vec![
                DedupeLedger::record(tx, &target, Namespace::Default, "h1", 10, 0)?,
                DedupeLedger::record(tx, &target, Namespace::Default, "h1", 10, 0)?,
                DedupeLedger::record(tx, &target, Namespace::ConfigContacts, "h1", 10, 0)?,
            ])
        })
        .await
        .expect("record");
    assert_eq!(
        outcomes,
        vec![
            DedupeOutcome::Accepted,
            DedupeOutcome::Duplicate,
            DedupeOutcome::Accepted
        ]
    );
}

#[tokio::test]
async fn active_hashes_skip_expired_and_invalid() {
    let store = Store::open_in_memory().expect("store");
    let target = user_target();
    let active = store
        .transaction(|tx| {
            DedupeLedger::record(tx, &target, Namespace::Default, "live", 3, 0)?;
            DedupeLedger::record(tx, &target, Namespace::Default, "expired", 2, 50)?;
            DedupeLedger::record(tx, &target, Namespace::Default, "stale", 1, 0)?;
            DedupeLedger::mark_invalid(tx, &target, Namespace::Default, "stale")?;
            DedupeLedger::active_hashes(tx, &target, 100, 10)
        })
        .await
        .expect("active");
    assert_eq!(active, vec!["live".to_string()]);
}

#[tokio::test]
async fn clear_target_is_scoped() {
    let store = Store::open_in_memory().expect("store");
    let a = user_target();
    let b = user_target();
    store
        .transaction(|tx| {
            DedupeLedger::record(tx, &a, Namespace::Default, "x", 1, 0)?;
            DedupeLedger::record(tx, &b, Namespace::Default, "x", 1, 0)?;
            Ok(())
        })
        .await
        .expect("record");
    store.clear_target(&a).await.expect("clear");
    let (left_a, left_b) = store
        .read(|conn| Ok((DedupeLedger::count(conn, &a)?, DedupeLedger::count(conn, &b)?)))
        .await
        .expect("count");
    assert_eq!(left_a, 0);
    assert_eq!(left_b, 1);
}

#[tokio::test]
async fn failed_transaction_leaves_no_records() {
    let store = Store::open_in_memory().expect("store");
    let target = user_target();
    let result: Result<(), _> = store
        .transaction(|tx| {
            DedupeLedger::record(tx, &target, Namespace::Default, "h", 1, 0)?;
            Err(crate::error::CoreError::Storage)
        })
        .await;
    assert!(result.is_err());
    let found = store
        .read(|conn| DedupeLedger::contains(conn, &target, Namespace::Default, "h"))
        .await
        .expect("contains");
    assert!(!found);
}

#[tokio::test]
async fn suspended_store_refuses_writes() {
    let store = Store::open_in_memory().expect("store");
    store.suspend();
    let target = user_target();
    let result = store
        .transaction(|tx| DedupeLedger::record(tx, &target, Namespace::Default, "h", 1, 0))
        .await;
    assert!(matches!(result, Err(crate::error::CoreError::Suspended(_))));
    store.resume();
    assert!(store
        .transaction(|tx| DedupeLedger::record(tx, &target, Namespace::Default, "h", 1, 0))
        .await
        .is_ok());
}
