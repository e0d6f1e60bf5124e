use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub enum DrainBehaviour {
    AlwaysRandom,
    Drain,
    LimitedReuse { count: u32 },
}

impl Default for DrainBehaviour {
    fn default() -> Self {
        DrainBehaviour::LimitedReuse { count: 3 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Path of the SQLite database, or `:memory:`.
    pub storage_path: String,
    pub event_buffer: usize,
    pub swarm_cache_ttl_ms: u64,
    pub user_drain: DrainBehaviour,
    pub group_drain: DrainBehaviour,
    pub job_worker_interval_ms: u64,
    pub known_hash_limit: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_path: ".mailswarm/store.sqlite".to_string(),
            event_buffer: 256,
            swarm_cache_ttl_ms: 10 * 60 * 1000,
            user_drain: DrainBehaviour::default(),
            group_drain: DrainBehaviour::AlwaysRandom,
            job_worker_interval_ms: 1000,
            known_hash_limit: 256,
        }
    }
}
