use crate::error::CoreError;
use crate::handlers::{ConfigMerger, MessageHandler};
use crate::jobs::{Job, JobKind, JobQueue};
use crate::policy::Policy;
use crate::store::Store;
use crate::time::{millis, now_ms};
use log::{debug, warn};
use mailswarm_api::{Namespace, ProcessedMessage};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub trait JobExecutor: Send + Sync {
    fn execute(&self, conn: &Connection, job: &Job) -> Result<(), CoreError>;
}

pub struct ConfigReceiveExecutor {
    merger: Arc<dyn ConfigMerger>,
}

impl ConfigReceiveExecutor {
    pub fn new(merger: Arc<dyn ConfigMerger>) -> Self {
        Self { merger }
    }
}

impl JobExecutor for ConfigReceiveExecutor {
    fn execute(&self, conn: &Connection, job: &Job) -> Result<(), CoreError> {
        let mut by_namespace: BTreeMap<(u8, i32), (Namespace, Vec<ProcessedMessage>)> =
            BTreeMap::new();
        for message in job.details.messages.iter() {
            let ns = message.namespace;
            by_namespace
                .entry((ns.processing_order(), ns.tag()))
                .or_insert_with(|| (ns, Vec::new()))
                .1
                .push(message.clone());
        }
        for (ns, messages) in by_namespace.values() {
            self.merger
                .handle_config_messages(conn, &job.details.target, *ns, messages)?;
        }
        Ok(())
    }
}

pub struct MessageReceiveExecutor {
    handler: Arc<dyn MessageHandler>,
}

impl MessageReceiveExecutor {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self { handler }
    }
}

impl JobExecutor for MessageReceiveExecutor {
    fn execute(&self, conn: &Connection, job: &Job) -> Result<(), CoreError> {
        for message in job.details.messages.iter() {
            self.handler.handle_message(conn, message, true)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub retried: usize,
    pub dropped: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried,
    Dropped,
}

#[derive(Clone)]
pub struct JobRunner {
    store: Store,
    policy: Policy,
    config_executor: Arc<dyn JobExecutor>,
    message_executor: Arc<dyn JobExecutor>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    constrained: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
}

impl JobRunner {
    pub fn new(
        store: Store,
        policy: Policy,
        config_merger: Arc<dyn ConfigMerger>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            store,
            policy,
            config_executor: Arc::new(ConfigReceiveExecutor::new(config_merger)),
            message_executor: Arc::new(MessageReceiveExecutor::new(handler)),
            notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            constrained: Arc::new(AtomicBool::new(false)),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While constrained, new jobs are persisted but the worker is not woken.
    pub fn set_constrained(&self, constrained: bool) {
        self.constrained.store(constrained, Ordering::SeqCst);
        if !constrained {
            self.notify.notify_one();
        }
    }

    pub fn can_start_jobs(&self) -> bool {
        !self.constrained.load(Ordering::SeqCst)
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn start(&self, interval_ms: u64) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let runner = self.clone();
        let interval = millis(interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = runner.cancel.cancelled() => break,
                    _ = runner.notify.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                if runner.cancel.is_cancelled() {
                    break;
                }
                if !runner.can_start_jobs() || runner.store.is_suspended() {
                    continue;
                }
                if let Err(err) = runner.run_ready().await {
                    warn!("job runner pass failed: {}", err);
                }
            }
            debug!("job runner stopped");
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn run_ready(&self) -> Result<RunSummary, CoreError> {
        let mut summary = RunSummary::default();
        let batch = self.policy.job_batch.max(1);
        loop {
            let jobs = self
                .store
                .read(|conn| JobQueue::ready(conn, now_ms(), batch))
                .await?;
            if jobs.is_empty() {
                break;
            }
            for job in jobs {
                match self.run_job(job).await? {
                    JobOutcome::Completed => summary.completed += 1,
                    JobOutcome::Retried => summary.retried += 1,
                    JobOutcome::Dropped => summary.dropped += 1,
                }
            }
        }
        if summary != RunSummary::default() {
            debug!(
                "jobs completed={} retried={} dropped={}",
                summary.completed, summary.retried, summary.dropped
            );
        }
        Ok(summary)
    }

    pub async fn run_job(&self, job: Job) -> Result<JobOutcome, CoreError> {
        let executor = match job.kind {
            JobKind::ConfigMessageReceive => self.config_executor.clone(),
            JobKind::MessageReceive => self.message_executor.clone(),
        };
        let id = job.id;
        let result = self
            .store
            .transaction(|tx| {
                executor.execute(tx, &job)?;
                JobQueue::complete(tx, job.id)
            })
            .await;
        match result {
            Ok(()) => Ok(JobOutcome::Completed),
            Err(err @ CoreError::Suspended(_)) => Err(err),
            Err(err) => {
                let retried = self
                    .store
                    .transaction(|tx| JobQueue::bump_failure(tx, id, &self.policy))
                    .await?;
                if retried {
                    debug!("job {} ({:?}) failed, retrying: {}", id, job.kind, err);
                    Ok(JobOutcome::Retried)
                } else {
                    warn!(
                        "job {} ({:?}) failed permanently, releasing dependents: {}",
                        id, job.kind, err
                    );
                    Ok(JobOutcome::Dropped)
                }
            }
        }
    }
}
