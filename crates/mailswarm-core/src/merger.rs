use crate::cursor::{CursorSnapshot, CursorStore, CursorValidator};
use crate::decoder::{MessageDecoder, OriginContext, ReceiveError};
use crate::dedupe::{DedupeLedger, DedupeOutcome};
use crate::error::CoreError;
use crate::handlers::{ConfigMerger, MessageHandler};
use crate::jobs::{JobDetails, JobId, JobKind, JobQueue};
use crate::network::NamespaceBatch;
use log::{debug, warn};
use mailswarm_api::{
    Namespace, PollResult, PollTarget, ProcessedMessage, ReceivedVia, ServiceNode, ThreadId,
};
use rusqlite::Connection;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct IngestBatch {
    pub target: PollTarget,
    pub node: Option<ServiceNode>,
    pub via: ReceivedVia,
    pub batches: Vec<NamespaceBatch>,
    pub expected: CursorSnapshot,
    pub force_sync: bool,
}

impl IngestBatch {
    pub fn raw_count(&self) -> usize {
        self.batches.iter().map(|b| b.messages.len()).sum()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub result: PollResult,
    pub config_jobs: Vec<JobId>,
    pub standard_jobs: Vec<JobId>,
}

impl MergeOutcome {
    pub fn enqueued(&self) -> usize {
        self.config_jobs.len() + self.standard_jobs.len()
    }
}

// `process` must run inside the caller's transaction; any `Err` rolls the batch back.
pub struct ResponseMerger {
    decoder: Arc<dyn MessageDecoder>,
    config_merger: Arc<dyn ConfigMerger>,
    handler: Arc<dyn MessageHandler>,
}

struct Accepted {
    message: ProcessedMessage,
    synchronous: bool,
}

impl ResponseMerger {
    pub fn new(
        decoder: Arc<dyn MessageDecoder>,
        config_merger: Arc<dyn ConfigMerger>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            decoder,
            config_merger,
            handler,
        }
    }

    pub fn process(&self, conn: &Connection, input: &IngestBatch) -> Result<MergeOutcome, CoreError> {
        let target = &input.target;
        let mut batches: Vec<&NamespaceBatch> = input.batches.iter().collect();
        batches.sort_by_key(|b| (b.namespace.processing_order(), b.namespace.tag()));

        CursorValidator::verify(conn, target, &input.expected)?;

        let mut result = PollResult {
            raw_count: input.raw_count(),
            ..PollResult::default()
        };
        let mut accepted: Vec<Accepted> = Vec::new();
        let mut expected_after = input.expected.clone();
        let live_poll = input.via == ReceivedVia::Poll;

        for batch in batches.iter() {
            let ns = batch.namespace;
            // No stored cursor: duplicates move it forward too.
            let resyncing = !matches!(input.expected.get(&ns), Some(Some(_)));
            let mut advance = false;
            let mut failures: Vec<ReceiveError> = Vec::new();
            for raw in batch.messages.iter() {
                let origin = OriginContext {
                    target: target.clone(),
                    namespace: ns,
                    server_hash: raw.hash.clone(),
                    server_timestamp_ms: raw.timestamp_ms,
                    expiration_ms: raw.expiration_ms,
                    node: input.node.clone(),
                    received_via: input.via,
                };
                match self.decoder.parse(&raw.data, &origin) {
                    Ok(message) => {
                        match DedupeLedger::record(
                            conn,
                            target,
                            ns,
                            &raw.hash,
                            raw.timestamp_ms,
                            raw.expiration_ms,
                        )? {
                            DedupeOutcome::Accepted => {
                                result.valid_count += 1;
                                advance = true;
                                accepted.push(Accepted {
                                    message,
                                    synchronous: input.force_sync || ns.should_handle_synchronously(),
                                });
                            }
                            DedupeOutcome::Duplicate => {
                                result.duplicate_count += 1;
                                advance |= resyncing;
                            }
                        }
                    }
                    Err(err) if err.should_update_last_hash() => {
                        match DedupeLedger::record(
                            conn,
                            target,
                            ns,
                            &raw.hash,
                            raw.timestamp_ms,
                            raw.expiration_ms,
                        )? {
                            DedupeOutcome::Accepted => {
                                result.invalid_count += 1;
                                advance = true;
                                failures.push(err);
                            }
                            DedupeOutcome::Duplicate => {
                                result.duplicate_count += 1;
                                advance |= resyncing;
                            }
                        }
                    }
                    Err(err) => {
                        result.invalid_count += 1;
                        failures.push(err);
                    }
                }
            }
            if let Some(first) = failures.first() {
                debug!(
                    "{} {}: {} of {} messages failed to process (first: {})",
                    target,
                    ns,
                    failures.len(),
                    batch.messages.len(),
                    first
                );
            }
            if advance && live_poll && ns.should_fetch_since_last_hash() {
                if let Some(hash) = batch.observed_last_hash() {
                    CursorStore::set(conn, target, ns, hash)?;
                    expected_after.insert(ns, Some(hash.to_string()));
                    result.had_valid_hash_update = true;
                }
            }
        }

        if live_poll && !result.had_valid_hash_update && result.raw_count > 0 {
            self.recover_stale_cursors(conn, target, &batches, &mut expected_after)?;
        }

        let (inline, deferred): (Vec<Accepted>, Vec<Accepted>) =
            accepted.into_iter().partition(|a| a.synchronous);
        let inline: Vec<ProcessedMessage> = inline.into_iter().map(|a| a.message).collect();
        let deferred: Vec<ProcessedMessage> = deferred.into_iter().map(|a| a.message).collect();

        self.handle_inline(conn, target, &inline)?;
        let (config_jobs, standard_jobs) = enqueue_jobs(conn, target, &deferred)?;

        CursorValidator::verify(conn, target, &expected_after)?;

        // Surface everything in the same namespace order it was processed in.
        let mut messages = inline;
        messages.extend(deferred);
        messages.sort_by_key(|m| (m.namespace.processing_order(), m.namespace.tag()));
        result.messages = messages;

        debug!(
            "{} merged raw={} valid={} invalid={} duplicate={} jobs={}",
            target,
            result.raw_count,
            result.valid_count,
            result.invalid_count,
            result.duplicate_count,
            config_jobs.len() + standard_jobs.len()
        );
        Ok(MergeOutcome {
            result,
            config_jobs,
            standard_jobs,
        })
    }

    fn recover_stale_cursors(
        &self,
        conn: &Connection,
        target: &PollTarget,
        batches: &[&NamespaceBatch],
        expected_after: &mut CursorSnapshot,
    ) -> Result<(), CoreError> {
        for batch in batches.iter().filter(|b| !b.messages.is_empty()) {
            let ns = batch.namespace;
            let Some(Some(stale)) = expected_after.get(&ns).cloned() else {
                continue;
            };
            let returned: Vec<String> = batch.messages.iter().map(|m| m.hash.clone()).collect();
            let next = CursorValidator::recover_stale(conn, target, ns, &stale, &returned)?;
            debug!(
                "{} {}: stale cursor {} replaced by {:?}",
                target, ns, stale, next
            );
            expected_after.insert(ns, next);
        }
        Ok(())
    }

    fn handle_inline(
        &self,
        conn: &Connection,
        target: &PollTarget,
        messages: &[ProcessedMessage],
    ) -> Result<(), CoreError> {
        let mut config_groups: Vec<(Namespace, Vec<ProcessedMessage>)> = Vec::new();
        for message in messages.iter().filter(|m| m.is_config()) {
            match config_groups.iter_mut().find(|(ns, _)| *ns == message.namespace) {
                Some((_, group)) => group.push(message.clone()),
                None => config_groups.push((message.namespace, vec![message.clone()])),
            }
        }
        for (ns, group) in config_groups.iter() {
            let merged = with_savepoint(conn, || {
                self.config_merger
                    .handle_config_messages(conn, target, *ns, group)
            })?;
            if let Err(err) = merged {
                warn!("{} {}: inline config merge failed: {}", target, ns, err);
            }
        }
        for message in messages.iter().filter(|m| !m.is_config()) {
            let handled = with_savepoint(conn, || self.handler.handle_message(conn, message, true))?;
            if let Err(err) = handled {
                warn!(
                    "{} {}: inline handling of {} failed: {}",
                    target, message.namespace, message.hash, err
                );
            }
        }
        Ok(())
    }
}

fn with_savepoint<T, F>(conn: &Connection, f: F) -> Result<Result<T, CoreError>, CoreError>
where
    F: FnOnce() -> Result<T, CoreError>,
{
    conn.execute_batch("SAVEPOINT inline_handler")?;
    match f() {
        Ok(value) => {
            conn.execute_batch("RELEASE inline_handler")?;
            Ok(Ok(value))
        }
        Err(err) => {
            conn.execute_batch("ROLLBACK TO inline_handler; RELEASE inline_handler")?;
            Ok(Err(err))
        }
    }
}

fn group_by_thread(messages: &[&ProcessedMessage]) -> Vec<(ThreadId, Vec<ProcessedMessage>)> {
    let mut groups: Vec<(ThreadId, Vec<ProcessedMessage>)> = Vec::new();
    for message in messages {
        let thread = message.thread_id();
        match groups.iter_mut().find(|(t, _)| *t == thread) {
            Some((_, group)) => group.push((*message).clone()),
            None => groups.push((thread, vec![(*message).clone()])),
        }
    }
    groups
}

fn enqueue_jobs(
    conn: &Connection,
    target: &PollTarget,
    messages: &[ProcessedMessage],
) -> Result<(Vec<JobId>, Vec<JobId>), CoreError> {
    let (config, standard): (Vec<&ProcessedMessage>, Vec<&ProcessedMessage>) =
        messages.iter().partition(|m| m.is_config());
    let mut config_jobs = Vec::new();
    for (thread, group) in group_by_thread(&config) {
        let details = JobDetails {
            target: target.clone(),
            messages: group,
        };
        config_jobs.push(JobQueue::enqueue(
            conn,
            JobKind::ConfigMessageReceive,
            &thread,
            &details,
        )?);
    }
    let mut standard_jobs = Vec::new();
    for (thread, group) in group_by_thread(&standard) {
        let details = JobDetails {
            target: target.clone(),
            messages: group,
        };
        let id = JobQueue::enqueue(conn, JobKind::MessageReceive, &thread, &details)?;
        for config_job in config_jobs.iter() {
            JobQueue::add_dependency(conn, id, *config_job)?;
        }
        standard_jobs.push(id);
    }
    Ok((config_jobs, standard_jobs))
}
