use super::{group_target, harness, harness_with, test_config, test_policy, user_target};
use crate::handlers::{Journal, RecordingConfigMerger, RecordingMessageHandler};
use crate::jobs::{JobDetails, JobKind, JobQueue};
use crate::policy::Policy;
use crate::runner::{JobOutcome, JobRunner};
use crate::store::Store;
use crate::time::now_ms;
use mailswarm_api::{Namespace, ThreadId};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::test]
async fn failed_job_is_retried_with_backoff() {
    let policy = Policy {
        backoff_initial_ms: 200,
        backoff_max_ms: 200,
        ..test_policy()
    };
    let h = harness_with(test_config(), policy).await;
    let target = user_target();
    let msg = h.put_standard(&target, Namespace::Default, "alice", "hi").await;
    h.core.poll_once(&target).await.expect("poll");

    h.handler.fail_next(1);
    let first = h.core.run_jobs().await.expect("run");
    assert_eq!(first.retried, 1);
    let jobs = h.core.store().read(JobQueue::list).await.expect("jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].failure_count, 1);
    assert!(jobs[0].next_run_ms > now_ms());
    assert_eq!(h.core.run_jobs().await.expect("run").retried, 0);

    sleep(Duration::from_millis(400)).await;
    let second = h.core.run_jobs().await.expect("run");
    assert_eq!(second.completed, 1);
    assert_eq!(h.journal.hashes(), vec![msg.hash]);
    assert_eq!(h.job_count().await, 0);
}

#[tokio::test]
async fn exhausted_config_job_releases_dependents() {
    let policy = Policy {
        max_job_failures: 1,
        ..test_policy()
    };
    let h = harness_with(test_config(), policy).await;
    let target = group_target();
    h.put_config(&target, Namespace::ConfigGroupInfo, b"info").await;
    let msg = h.put_standard(&target, Namespace::GroupMessages, "crew", "hi").await;
    h.core.poll_once(&target).await.expect("poll");

    h.config_merger.fail_next(1);
    let summary = h.core.run_jobs().await.expect("run");
    assert_eq!(summary.dropped, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(h.journal.hashes(), vec![msg.hash]);
    assert_eq!(h.job_count().await, 0);
}

#[tokio::test]
async fn constrained_runner_persists_without_running() {
    let config = crate::config::CoreConfig {
        job_worker_interval_ms: 10,
        ..test_config()
    };
    let h = harness_with(config, test_policy()).await;
    h.core.runner().set_constrained(true);
    let target = user_target();
    h.put_standard(&target, Namespace::Default, "alice", "later").await;
    h.core.poll_once(&target).await.expect("poll");

    sleep(Duration::from_millis(60)).await;
    assert_eq!(h.job_count().await, 1);
    assert!(h.journal.is_empty());

    h.core.runner().set_constrained(false);
    for _ in 0..50 {
        if h.job_count().await == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.job_count().await, 0);
    assert_eq!(h.journal.len(), 1);
    h.core.shutdown().await;
}

#[tokio::test]
async fn config_job_merges_namespaces_in_processing_order() {
    let store = Store::open_in_memory().expect("store");
    let journal = Journal::new();
    let runner = JobRunner::new(
        store.clone(),
        test_policy(),
        Arc::new(RecordingConfigMerger::new(journal.clone())),
        Arc::new(RecordingMessageHandler::new(journal.clone())),
    );
    let h = harness().await;
    let target = user_target();
    let volatile = h.put_config(&target, Namespace::ConfigConvoInfoVolatile, b"v").await;
    let contacts = h.put_config(&target, Namespace::ConfigContacts, b"c").await;
    let result = h.core.poll_once(&target).await.expect("poll");
    let mut messages = result.messages.clone();
    messages.reverse();

    let details = JobDetails {
        target: target.clone(),
        messages,
    };
    let id = store
        .transaction(|tx| {
            JobQueue::enqueue(
                tx,
                JobKind::ConfigMessageReceive,
                &ThreadId::for_target(&target),
                &details,
            )
        })
        .await
        .expect("enqueue");
    let job = store
        .read(|conn| JobQueue::load(conn, id))
        .await
        .expect("load")
        .expect("job");
    assert_eq!(runner.run_job(job).await.expect("run"), JobOutcome::Completed);
    assert_eq!(journal.hashes(), vec![contacts.hash, volatile.hash]);
}

#[tokio::test]
async fn clear_target_drops_jobs_and_dependencies() {
    let h = harness().await;
    let target = group_target();
    h.put_config(&target, Namespace::ConfigGroupInfo, b"info").await;
    h.put_standard(&target, Namespace::GroupMessages, "crew", "hi").await;
    h.core.poll_once(&target).await.expect("poll");
    assert_eq!(h.job_count().await, 2);

    h.core.store().clear_target(&target).await.expect("clear");
    assert_eq!(h.job_count().await, 0);
    assert_eq!(h.dedupe_count(&target).await, 0);
    let orphans: i64 = h
        .core
        .store()
        .read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM job_dependencies", [], |row| row.get(0))?)
        })
        .await
        .expect("deps");
    assert_eq!(orphans, 0);
}
