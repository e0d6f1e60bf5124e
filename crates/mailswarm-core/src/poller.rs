use crate::config::DrainBehaviour;
use crate::cursor::{CursorSnapshot, CursorStore};
use crate::dedupe::DedupeLedger;
use crate::delay::{ActivityTracker, PollDelay};
use crate::error::CoreError;
use crate::event::EventBus;
use crate::merger::{IngestBatch, ResponseMerger};
use crate::network::{AuthMethod, NamespaceRequest, RetrieveRequest, SwarmClient};
use crate::runner::JobRunner;
use crate::store::Store;
use crate::swarm::{SwarmDrainer, SwarmResolver};
use crate::time::now_ms;
use log::{debug, info, warn};
use mailswarm_api::{Namespace, PollResult, PollTarget, PollerPhase, PollerStatus, ReceivedVia};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollErrorResponse {
    StopPolling,
    ContinuePolling,
    ContinuePollingWithInfo(String),
}

pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, target: &PollTarget, error: &CoreError, failure_count: u32) -> PollErrorResponse;
}

pub struct DefaultErrorHandler {
    max_failures: u32,
}

impl DefaultErrorHandler {
    pub fn new(max_failures: u32) -> Self {
        Self { max_failures }
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn on_error(&self, _target: &PollTarget, error: &CoreError, failure_count: u32) -> PollErrorResponse {
        if self.max_failures > 0 && failure_count >= self.max_failures {
            return PollErrorResponse::StopPolling;
        }
        if error.is_retryable() {
            PollErrorResponse::ContinuePolling
        } else {
            PollErrorResponse::ContinuePollingWithInfo(error.to_string())
        }
    }
}

#[derive(Clone)]
pub struct PollerDeps {
    pub store: Store,
    pub client: Arc<dyn SwarmClient>,
    pub resolver: SwarmResolver,
    pub merger: Arc<ResponseMerger>,
    pub events: EventBus,
    pub runner: JobRunner,
    pub activity: ActivityTracker,
    pub known_hash_limit: usize,
}

#[derive(Clone)]
pub struct PollerOptions {
    pub namespaces: Vec<Namespace>,
    pub drain: DrainBehaviour,
    pub delay: Arc<dyn PollDelay>,
    pub error_handler: Arc<dyn ErrorHandler>,
}

struct PollerState {
    phase: PollerPhase,
    run_id: u64,
    cancel: Option<CancellationToken>,
    failure_count: u32,
    last_poll_start_ms: Option<u64>,
    last_raw_count: usize,
    last_valid_count: usize,
}

struct PollerInner {
    target: PollTarget,
    instance: Uuid,
    options: PollerOptions,
    deps: PollerDeps,
    // One poll at a time per target; also owns the node drain state.
    lane: Mutex<SwarmDrainer>,
    state: StdMutex<PollerState>,
    generation: watch::Receiver<Uuid>,
}

#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    pub fn new(
        target: PollTarget,
        instance: Uuid,
        options: PollerOptions,
        deps: PollerDeps,
        generation: watch::Receiver<Uuid>,
    ) -> Self {
        let drainer = SwarmDrainer::new(options.drain.clone());
        Self {
            inner: Arc::new(PollerInner {
                target,
                instance,
                options,
                deps,
                lane: Mutex::new(drainer),
                state: StdMutex::new(PollerState {
                    phase: PollerPhase::Idle,
                    run_id: 0,
                    cancel: None,
                    failure_count: 0,
                    last_poll_start_ms: None,
                    last_raw_count: 0,
                    last_valid_count: 0,
                }),
                generation,
            }),
        }
    }

    pub fn target(&self) -> &PollTarget {
        &self.inner.target
    }

    pub fn instance(&self) -> Uuid {
        self.inner.instance
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.inner.options.namespaces
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.phase(),
            PollerPhase::Running | PollerPhase::Polling | PollerPhase::Waiting
        )
    }

    pub fn phase(&self) -> PollerPhase {
        self.with_state(|s| s.phase)
    }

    pub fn failure_count(&self) -> u32 {
        self.with_state(|s| s.failure_count)
    }

    pub fn status(&self) -> PollerStatus {
        self.with_state(|s| PollerStatus {
            target: self.inner.target.clone(),
            instance: self.inner.instance.to_string(),
            phase: s.phase,
            failure_count: s.failure_count,
            last_poll_start_ms: s.last_poll_start_ms,
            last_raw_count: s.last_raw_count,
            last_valid_count: s.last_valid_count,
        })
    }

    /// Spawns the poll loop. Returns `false` when a loop is already running.
    pub fn start_if_needed(&self) -> bool {
        let (token, run_id) = {
            let Ok(mut state) = self.inner.state.lock() else {
                return false;
            };
            if matches!(
                state.phase,
                PollerPhase::Running | PollerPhase::Polling | PollerPhase::Waiting
            ) {
                return false;
            }
            let token = CancellationToken::new();
            state.run_id += 1;
            state.cancel = Some(token.clone());
            state.phase = PollerPhase::Running;
            (token, state.run_id)
        };
        info!("{} poller {} started", self.inner.target, self.inner.instance);
        let poller = self.clone();
        tokio::spawn(async move {
            let generation = poller.inner.generation.clone();
            tokio::select! {
                biased;
                _ = wait_for_replacement(generation, poller.inner.instance) => {
                    info!("{} poller {} replaced", poller.inner.target, poller.inner.instance);
                }
                _ = poller.run_loop(&token, run_id) => {}
            }
            token.cancel();
            poller.finish(run_id);
        });
        true
    }

    /// Cancels the loop. No poll starts after this returns; an in-flight one
    /// is dropped at its next suspension point.
    pub fn stop(&self) {
        let token = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            if state.phase != PollerPhase::Idle {
                state.phase = PollerPhase::Stopped;
            }
            state.cancel.take()
        };
        if let Some(token) = token {
            token.cancel();
            debug!("{} poller {} stopped", self.inner.target, self.inner.instance);
        }
    }

    pub async fn poll_now(&self) -> Result<PollResult, CoreError> {
        self.poll_once(&CancellationToken::new()).await
    }

    async fn run_loop(&self, token: &CancellationToken, run_id: u64) {
        let target = &self.inner.target;
        let deps = &self.inner.deps;
        let options = &self.inner.options;
        loop {
            if token.is_cancelled() {
                break;
            }
            if deps.store.is_suspended() || deps.client.is_suspended() {
                warn!("{} poller stopping: storage or network suspended", target);
                break;
            }
            let started = now_ms();
            let failures = self.update(|s| {
                if s.run_id == run_id && s.phase != PollerPhase::Stopped {
                    s.phase = PollerPhase::Polling;
                }
                s.last_poll_start_ms = Some(started);
                s.failure_count
            });
            debug!(
                "{} polling, next poll in about {:?}",
                target,
                options.delay.next_delay(target, failures)
            );
            let failures = match self.poll_once(token).await {
                Ok(result) => {
                    self.update(|s| {
                        s.failure_count = 0;
                        s.last_raw_count = result.raw_count;
                        s.last_valid_count = result.valid_count;
                    });
                    if result.raw_count > 0 {
                        info!(
                            "{} received raw={} valid={} invalid={} duplicate={}{}",
                            target,
                            result.raw_count,
                            result.valid_count,
                            result.invalid_count,
                            result.duplicate_count,
                            if result.discarded { " (discarded)" } else { "" }
                        );
                    }
                    0
                }
                Err(CoreError::Cancelled) => break,
                Err(CoreError::Suspended(what)) => {
                    warn!("{} poller stopping: {} suspended", target, what);
                    break;
                }
                Err(err) => {
                    let failures = self.update(|s| {
                        s.failure_count = s.failure_count.saturating_add(1);
                        s.failure_count
                    });
                    match options.error_handler.on_error(target, &err, failures) {
                        PollErrorResponse::StopPolling => {
                            warn!("{} poller stopping after {} failures: {}", target, failures, err);
                            break;
                        }
                        PollErrorResponse::ContinuePolling => {
                            debug!("{} poll failed ({}): {}", target, failures, err);
                        }
                        PollErrorResponse::ContinuePollingWithInfo(info) => {
                            info!("{} poll failed ({}): {}", target, failures, info);
                        }
                    }
                    failures
                }
            };
            let delay = options.delay.next_delay(target, failures);
            self.update(|s| {
                if s.run_id == run_id && s.phase != PollerPhase::Stopped {
                    s.phase = PollerPhase::Waiting;
                }
            });
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn poll_once(&self, token: &CancellationToken) -> Result<PollResult, CoreError> {
        let target = &self.inner.target;
        let deps = &self.inner.deps;
        let namespaces = &self.inner.options.namespaces;
        // Each await races the token; once it fires nothing is sent or committed.
        let mut drainer = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CoreError::Cancelled),
            guard = self.inner.lane.lock() => guard,
        };

        let limit = deps.known_hash_limit;
        let snapshot = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CoreError::Cancelled),
            snapshot = deps.store.read(|conn| {
                let known = DedupeLedger::active_hashes(conn, target, now_ms(), limit)?;
                let cursors: CursorSnapshot = CursorStore::snapshot(conn, target, namespaces)?;
                Ok((known, cursors))
            }) => snapshot,
        };
        let (known_hashes, expected) = snapshot?;

        let swarm = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CoreError::Cancelled),
            swarm = deps.resolver.resolve(target) => swarm?,
        };
        if token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let node = drainer.select(&swarm)?;
        let request = RetrieveRequest {
            target: target.clone(),
            namespaces: namespaces
                .iter()
                .map(|ns| NamespaceRequest {
                    namespace: *ns,
                    last_hash: expected.get(ns).cloned().flatten(),
                })
                .collect(),
            auth: AuthMethod::for_target(target, namespaces),
            known_hashes,
        };

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CoreError::Cancelled),
            response = deps.client.retrieve(&node, request) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, CoreError::Transport(_)) {
                    deps.resolver.mark_node_failed(target, &node).await;
                    drainer.forget(&node);
                }
                return Err(err);
            }
        };
        if token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let raw_count = response.raw_count();
        if raw_count == 0 {
            return Ok(PollResult::empty());
        }

        let batch = IngestBatch {
            target: target.clone(),
            node: Some(node),
            via: ReceivedVia::Poll,
            batches: response.batches,
            expected,
            force_sync: false,
        };
        let merger = deps.merger.clone();
        if token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let committed = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CoreError::Cancelled),
            committed = deps.store.transaction(|tx| merger.process(tx, &batch)) => committed,
        };
        let outcome = match committed {
            Ok(outcome) => outcome,
            Err(CoreError::CursorMismatch(ns)) => {
                info!(
                    "{} cursor for {} changed during poll, discarding {} messages",
                    target, ns, raw_count
                );
                return Ok(PollResult::discarded(raw_count));
            }
            Err(err) => return Err(err),
        };
        drop(drainer);

        deps.events.publish_all(&outcome.result.messages);
        if let Some(newest) = outcome.result.messages.iter().map(|m| m.timestamp_ms).max() {
            deps.activity.record(target, newest);
        }
        if outcome.enqueued() > 0 && deps.runner.can_start_jobs() {
            deps.runner.wake();
        }
        Ok(outcome.result)
    }

    fn finish(&self, run_id: u64) {
        if let Ok(mut state) = self.inner.state.lock() {
            if state.run_id == run_id {
                state.phase = PollerPhase::Stopped;
                state.cancel = None;
            }
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&PollerState) -> T) -> T {
        match self.inner.state.lock() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn update<T>(&self, f: impl FnOnce(&mut PollerState) -> T) -> T {
        match self.inner.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

async fn wait_for_replacement(mut generation: watch::Receiver<Uuid>, instance: Uuid) {
    loop {
        let current = *generation.borrow_and_update();
        if current != instance {
            return;
        }
        if generation.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
