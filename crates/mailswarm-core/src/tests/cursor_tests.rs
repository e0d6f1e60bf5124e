use super::{group_target, user_target};
use crate::cursor::{CursorSnapshot, CursorStore, CursorValidator};
use crate::error::CoreError;
use crate::store::Store;
use mailswarm_api::Namespace;

#[tokio::test]
async fn snapshot_skips_namespaces_without_cursor() {
    let store = Store::open_in_memory().expect("store");
    let target = group_target();
    let namespaces = Namespace::defaults_for(&target);
    let snapshot = store
        .transaction(|tx| {
            CursorStore::set(tx, &target, Namespace::GroupMessages, "g1")?;
            CursorStore::snapshot(tx, &target, &namespaces)
        })
        .await
        .expect("snapshot");
    assert!(!snapshot.contains_key(&Namespace::RevokedRetrievableGroupMessages));
    assert_eq!(
        snapshot.get(&Namespace::GroupMessages),
        Some(&Some("g1".to_string()))
    );
    assert_eq!(snapshot.get(&Namespace::ConfigGroupKeys), Some(&None));
}

#[tokio::test]
async fn verify_reports_first_changed_namespace() {
    let store = Store::open_in_memory().expect("store");
    let target = user_target();
    let mut expected = CursorSnapshot::new();
    expected.insert(Namespace::Default, Some("d1".to_string()));
    expected.insert(Namespace::ConfigContacts, None);
    store
        .transaction(|tx| CursorStore::set(tx, &target, Namespace::Default, "d1"))
        .await
        .expect("set");
    store
        .read(|conn| CursorValidator::verify(conn, &target, &expected))
        .await
        .expect("matches");

    store
        .reset_cursor(&target, Namespace::Default)
        .await
        .expect("reset");
    let result = store
        .read(|conn| CursorValidator::verify(conn, &target, &expected))
        .await;
    assert!(matches!(result, Err(CoreError::CursorMismatch(Namespace::Default))));
}

#[tokio::test]
async fn cursors_are_per_target() {
    let store = Store::open_in_memory().expect("store");
    let a = user_target();
    let b = user_target();
    store
        .transaction(|tx| {
            CursorStore::set(tx, &a, Namespace::Default, "a1")?;
            CursorStore::set(tx, &a, Namespace::Default, "a2")?;
            CursorStore::set(tx, &b, Namespace::Default, "b1")
        })
        .await
        .expect("set");
    store.clear_target(&b).await.expect("clear");
    let (ca, cb) = store
        .read(|conn| {
            Ok((
                CursorStore::get(conn, &a, Namespace::Default)?,
                CursorStore::get(conn, &b, Namespace::Default)?,
            ))
        })
        .await
        .expect("get");
    assert_eq!(ca.as_deref(), Some("a2"));
    assert_eq!(cb, None);
}
