pub mod config;
pub mod cursor;
pub mod decoder;
pub mod dedupe;
pub mod delay;
pub mod error;
pub mod event;
pub mod handlers;
pub mod jobs;
pub mod manager;
pub mod merger;
pub mod migrations;
pub mod network;
pub mod policy;
pub mod poller;
pub mod push;
pub mod runner;
pub mod store;
pub mod swarm;
pub mod time;

mod introspection;

pub use introspection::CoreStats;

use config::CoreConfig;
use decoder::MessageDecoder;
use delay::{ActivityDelay, ActivityTracker};
use error::CoreError;
use event::{EventBus, EventReceiver};
use handlers::{ConfigMerger, MessageHandler};
use manager::PollerManager;
use mailswarm_api::{Namespace, PollResult, PollTarget, PollerStatus, PushPayload};
use merger::ResponseMerger;
use network::SwarmClient;
use policy::Policy;
use poller::{DefaultErrorHandler, Poller, PollerDeps};
use push::PushIngestor;
use runner::{JobRunner, RunSummary};
use std::sync::Arc;
use store::Store;
use swarm::SwarmResolver;

/// Entry point wiring the store, pollers, push ingestion and job runner.
#[derive(Clone)]
pub struct Core {
    config: CoreConfig,
    policy: Policy,
    store: Store,
    events: EventBus,
    runner: JobRunner,
    manager: PollerManager,
    push: PushIngestor,
    activity: ActivityTracker,
}

impl Core {
    pub async fn init(
        config: CoreConfig,
        policy: Policy,
        client: Arc<dyn SwarmClient>,
        decoder: Arc<dyn MessageDecoder>,
        config_merger: Arc<dyn ConfigMerger>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, CoreError> {
        let store = Store::open(&config.storage_path)?;
        let events = EventBus::new(config.event_buffer);
        let runner = JobRunner::new(
            store.clone(),
            policy.clone(),
            config_merger.clone(),
            handler.clone(),
        );
        let merger = Arc::new(ResponseMerger::new(decoder, config_merger, handler));
        let activity = ActivityTracker::new();
        let deps = PollerDeps {
            store: store.clone(),
            client: client.clone(),
            resolver: SwarmResolver::new(client, config.swarm_cache_ttl_ms),
            merger: merger.clone(),
            events: events.clone(),
            runner: runner.clone(),
            activity: activity.clone(),
            known_hash_limit: config.known_hash_limit,
        };
        let manager = PollerManager::new(
            deps,
            config.clone(),
            Arc::new(ActivityDelay::new(&policy, Arc::new(activity.clone()))),
            Arc::new(DefaultErrorHandler::new(policy.max_failures_before_stop)),
        );
        let push = PushIngestor::new(store.clone(), merger, events.clone(), manager.clone());
        let core = Self {
            config,
            policy,
            store,
            events,
            runner,
            manager,
            push,
            activity,
        };
        if core.config.job_worker_interval_ms > 0 {
            core.runner.start(core.config.job_worker_interval_ms);
        }
        Ok(core)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn manager(&self) -> &PollerManager {
        &self.manager
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub async fn watch(
        &self,
        target: &PollTarget,
        namespaces: Option<Vec<Namespace>>,
    ) -> Result<Poller, CoreError> {
        self.manager.start_if_needed(target, namespaces).await
    }

    pub async fn unwatch(&self, target: &PollTarget) -> bool {
        self.manager.stop_and_remove(target).await
    }

    pub async fn poll_once(&self, target: &PollTarget) -> Result<PollResult, CoreError> {
        let poller = self.manager.get_or_create(target, None).await?;
        poller.poll_now().await
    }

    pub async fn ingest_push(&self, payload: &PushPayload) -> Result<PollResult, CoreError> {
        self.push.ingest(payload).await
    }

    pub async fn run_jobs(&self) -> Result<RunSummary, CoreError> {
        self.runner.run_ready().await
    }

    pub async fn pollers(&self) -> Vec<PollerStatus> {
        self.manager.snapshot().await
    }

    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
        self.runner.stop();
    }
}

#[cfg(test)]
mod tests;
