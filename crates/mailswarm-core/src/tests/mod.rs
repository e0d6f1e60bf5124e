pub mod cursor_tests;
pub mod dedupe_tests;
pub mod jobs_tests;
pub mod push_tests;

use crate::config::CoreConfig;
use crate::decoder::{AeadDecoder, WireMessage};
use crate::handlers::{Journal, RecordingConfigMerger, RecordingMessageHandler};
use crate::network::{InMemorySwarm, SwarmClient};
use crate::policy::Policy;
use crate::Core;
use mailswarm_api::{Namespace, PollTarget, RawMessage};
use std::sync::Arc;
use uuid::Uuid;

pub const TEST_KEY: [u8; 32] = [7u8; 32];

pub struct Harness {
    pub core: Core,
    pub swarm: InMemorySwarm,
    pub decoder: Arc<AeadDecoder>,
    pub journal: Journal,
    pub config_merger: RecordingConfigMerger,
    pub handler: RecordingMessageHandler,
}

pub fn user_target() -> PollTarget {
    PollTarget::swarm(format!("05{}", random_hex()))
}

pub fn group_target() -> PollTarget {
    PollTarget::swarm(format!("03{}", random_hex()))
}

fn random_hex() -> String {
    blake3::hash(Uuid::new_v4().as_bytes()).to_hex().to_string()
}

pub fn test_config() -> CoreConfig {
    CoreConfig {
        storage_path: ":memory:".to_string(),
        event_buffer: 64,
        swarm_cache_ttl_ms: 60_000,
        job_worker_interval_ms: 0,
        ..CoreConfig::default()
    }
}

pub fn test_policy() -> Policy {
    Policy {
        min_poll_interval_ms: 10,
        max_poll_interval_ms: 20,
        activity_window_ms: 1_000,
        failure_backoff_ms: 5,
        backoff_initial_ms: 1,
        backoff_max_ms: 5,
        ..Policy::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config(), test_policy()).await
}

pub async fn harness_with(config: CoreConfig, policy: Policy) -> Harness {
    let swarm = InMemorySwarm::with_nodes(3);
    harness_with_client(Arc::new(swarm.clone()), swarm, config, policy).await
}

pub async fn harness_with_client(
    client: Arc<dyn SwarmClient>,
    swarm: InMemorySwarm,
    config: CoreConfig,
    policy: Policy,
) -> Harness {
    let decoder = Arc::new(AeadDecoder::new(TEST_KEY).with_self_id("me"));
    let journal = Journal::new();
    let config_merger = RecordingConfigMerger::new(journal.clone());
    let handler = RecordingMessageHandler::new(journal.clone());
    let core = Core::init(
        config,
        policy,
        client,
        decoder.clone(),
        Arc::new(config_merger.clone()),
        Arc::new(handler.clone()),
    )
    .await
    .expect("core");
    Harness {
        core,
        swarm,
        decoder,
        journal,
        config_merger,
        handler,
    }
}

impl Harness {
    pub async fn put_standard(
        &self,
        target: &PollTarget,
        namespace: Namespace,
        thread: &str,
        body: &str,
    ) -> RawMessage {
        let data = self
            .decoder
            .seal(
                namespace,
                &WireMessage::Standard {
                    thread_id: thread.to_string(),
                    sender: "peer".to_string(),
                    kind: "text".to_string(),
                    body: body.as_bytes().to_vec(),
                },
            )
            .expect("seal");
        self.swarm.store(target, namespace, data, 60_000).await
    }

    pub async fn put_config(&self, target: &PollTarget, namespace: Namespace, data: &[u8]) -> RawMessage {
        let sealed = self
            .decoder
            .seal(namespace, &WireMessage::Config { data: data.to_vec() })
            .expect("seal");
        self.swarm.store(target, namespace, sealed, 60_000).await
    }

    pub async fn put_control(&self, target: &PollTarget, namespace: Namespace) -> RawMessage {
        let sealed = self
            .decoder
            .seal(namespace, &WireMessage::Control { id: Uuid::new_v4().to_string() })
            .expect("seal");
        self.swarm.store(target, namespace, sealed, 60_000).await
    }

    pub async fn put_garbage(&self, target: &PollTarget, namespace: Namespace) -> RawMessage {
        self.swarm
            .store(target, namespace, b"not an envelope at all, just bytes".to_vec(), 60_000)
            .await
    }

    pub async fn dedupe_count(&self, target: &PollTarget) -> usize {
        let target = target.clone();
        self.core
            .store()
            .read(move |conn| crate::dedupe::DedupeLedger::count(conn, &target))
            .await
            .expect("count")
    }

    pub async fn job_count(&self) -> usize {
        self.core
            .store()
            .read(crate::jobs::JobQueue::count)
            .await
            .expect("jobs")
    }

    pub async fn cursor(&self, target: &PollTarget, namespace: Namespace) -> Option<String> {
        let target = target.clone();
        self.core
            .store()
            .read(move |conn| crate::cursor::CursorStore::get(conn, &target, namespace))
            .await
            .expect("cursor")
    }
}
