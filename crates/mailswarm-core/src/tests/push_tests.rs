use super::{group_target, harness, user_target};
use crate::error::CoreError;
use crate::handlers::HandledKind;
use mailswarm_api::{Namespace, PushPayload, ReceivedVia};

#[tokio::test]
async fn push_is_handled_inline_without_jobs() {
    let h = harness().await;
    let target = user_target();
    let raw = h.put_standard(&target, Namespace::Default, "alice", "ping").await;
    let mut rx = h.core.subscribe();

    let result = h
        .core
        .ingest_push(&PushPayload::from_raw(target.clone(), &raw))
        .await
        .expect("push");
    assert_eq!(result.valid_count, 1);
    assert_eq!(h.job_count().await, 0);
    assert_eq!(h.cursor(&target, Namespace::Default).await, None);
    let entries = h.journal.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, HandledKind::Standard);
    assert!(entries[0].notified);
    let event = rx.recv().await.expect("event");
    assert_eq!(event.received_via, ReceivedVia::Push);
    assert!(event.node.is_none());
}

#[tokio::test]
async fn pushed_message_is_a_duplicate_for_the_next_poll() {
    let h = harness().await;
    let target = user_target();
    let raw = h.put_standard(&target, Namespace::Default, "alice", "ping").await;
    h.core
        .ingest_push(&PushPayload::from_raw(target.clone(), &raw))
        .await
        .expect("push");

    h.swarm.ignore_known_hashes();
    let polled = h.core.poll_once(&target).await.expect("poll");
    assert_eq!(polled.raw_count, 1);
    assert_eq!(polled.valid_count, 0);
    assert_eq!(polled.duplicate_count, 1);
    assert_eq!(h.journal.len(), 1);
    assert_eq!(h.job_count().await, 0);

    let again = h
        .core
        .ingest_push(&PushPayload::from_raw(target.clone(), &raw))
        .await
        .expect("push again");
    assert_eq!(again.duplicate_count, 1);
    assert_eq!(h.journal.len(), 1);
}

#[tokio::test]
async fn push_handler_failure_is_swallowed() {
    let h = harness().await;
    let target = group_target();
    let raw = h.put_config(&target, Namespace::ConfigGroupInfo, b"info").await;
    h.config_merger.fail_next(1);
    let result = h
        .core
        .ingest_push(&PushPayload::from_raw(target.clone(), &raw))
        .await
        .expect("push");
    assert_eq!(result.valid_count, 1);
    assert!(h.journal.is_empty());
    assert_eq!(h.job_count().await, 0);
}

#[tokio::test]
async fn push_for_unpolled_namespace_is_rejected() {
    let h = harness().await;
    let target = user_target();
    let raw = h.put_standard(&target, Namespace::GroupMessages, "crew", "x").await;
    let err = h
        .core
        .ingest_push(&PushPayload::from_raw(target, &raw))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn push_follows_the_watched_namespaces() {
    let h = harness().await;
    let target = user_target();
    h.core
        .manager()
        .get_or_create(&target, Some(vec![Namespace::LegacyClosedGroup]))
        .await
        .expect("poller");
    let raw = h
        .put_standard(&target, Namespace::LegacyClosedGroup, "legacy", "old")
        .await;
    let result = h
        .core
        .ingest_push(&PushPayload::from_raw(target.clone(), &raw))
        .await
        .expect("push");
    assert_eq!(result.valid_count, 1);

    let default = h.put_standard(&target, Namespace::Default, "alice", "x").await;
    assert!(h
        .core
        .ingest_push(&PushPayload::from_raw(target, &default))
        .await
        .is_err());
}
