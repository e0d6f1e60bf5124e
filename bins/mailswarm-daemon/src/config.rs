use mailswarm_api::{validate_target, Namespace, PollTarget, ServiceNode};
use mailswarm_core::config::DrainBehaviour;
use mailswarm_core::policy::Policy;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailswarmConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub swarm: SwarmConfig,
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Relative to `data_dir` unless absolute.
    #[serde(default = "default_store_file")]
    pub file: String,
    #[serde(default = "default_cache_ttl")]
    pub swarm_cache_ttl_ms: u64,
    #[serde(default = "default_known_hashes")]
    pub known_hash_limit: usize,
    #[serde(default = "default_job_interval")]
    pub job_worker_interval_ms: u64,
    #[serde(default)]
    pub user_drain: DrainBehaviour,
    #[serde(default = "default_group_drain")]
    pub group_drain: DrainBehaviour,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file: default_store_file(),
            swarm_cache_ttl_ms: default_cache_ttl(),
            known_hash_limit: default_known_hashes(),
            job_worker_interval_ms: default_job_interval(),
            user_drain: DrainBehaviour::default(),
            group_drain: default_group_drain(),
        }
    }
}

/// One `[[targets]]` entry: exactly one of `swarm` or `server`.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default)]
    pub swarm: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    /// Namespace tags; the target's defaults when absent.
    #[serde(default)]
    pub namespaces: Option<Vec<i32>>,
    /// Legacy closed group living in a `05` swarm.
    #[serde(default)]
    pub legacy: bool,
}

impl TargetConfig {
    pub fn poll_target(&self) -> Result<PollTarget, ConfigError> {
        let target = match (&self.swarm, &self.server) {
            (Some(swarm), None) => PollTarget::swarm(swarm.trim()),
            (None, Some(server)) => PollTarget::server(server.trim()),
            _ => return Err(ConfigError::Invalid("target needs exactly one of swarm or server")),
        };
        if self.legacy && self.server.is_some() {
            return Err(ConfigError::Invalid("legacy target must be a swarm"));
        }
        validate_target(&target).map_err(|_| ConfigError::Invalid("target"))?;
        Ok(target)
    }

    pub fn namespaces(&self) -> Result<Option<Vec<Namespace>>, ConfigError> {
        let Some(tags) = self.namespaces.as_ref() else {
            if self.legacy {
                return Ok(Some(Namespace::legacy_group()));
            }
            return Ok(None);
        };
        if tags.is_empty() {
            return Err(ConfigError::Invalid("target namespaces empty"));
        }
        tags.iter()
            .map(|tag| Namespace::from_tag(*tag).map_err(|_| ConfigError::Invalid("namespace tag")))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwarmConfig {
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeConfig>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub ed25519_hex: String,
}

impl NodeConfig {
    pub fn service_node(&self) -> ServiceNode {
        ServiceNode::new(self.address.clone(), self.port, self.ed25519_hex.clone())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    pub key_hex: String,
    #[serde(default)]
    pub self_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_store_file() -> String {
    "store.sqlite".to_string()
}

fn default_cache_ttl() -> u64 {
    10 * 60 * 1000
}

fn default_known_hashes() -> usize {
    256
}

fn default_job_interval() -> u64 {
    1000
}

fn default_group_drain() -> DrainBehaviour {
    DrainBehaviour::AlwaysRandom
}

fn default_bind_addr() -> String {
    "127.0.0.1:0".to_string()
}

fn default_nodes() -> Vec<NodeConfig> {
    (1..=3)
        .map(|i| NodeConfig {
            address: format!("127.0.0.{}", i),
            port: 22021,
            ed25519_hex: String::new(),
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io")]
    Io,
    #[error("parse {0}")]
    Parse(String),
    #[error("invalid {0}")]
    Invalid(&'static str),
}

impl MailswarmConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.control
            .bind_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Invalid("control bind_addr"))?;
        let key = hex::decode(self.decoder.key_hex.trim())
            .map_err(|_| ConfigError::Invalid("decoder key_hex"))?;
        if key.len() != 32 {
            return Err(ConfigError::Invalid("decoder key length"));
        }
        if self.swarm.nodes.is_empty() {
            return Err(ConfigError::Invalid("swarm nodes empty"));
        }
        if self.policy.min_poll_interval_ms > self.policy.max_poll_interval_ms {
            return Err(ConfigError::Invalid("poll interval bounds"));
        }
        for target in self.targets.iter() {
            target.poll_target()?;
            target.namespaces()?;
        }
        Ok(())
    }

    pub fn storage_path(&self) -> PathBuf {
        let file = Path::new(&self.store.file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.data_dir.join(file)
        }
    }
}

pub fn load_config(path: &Path) -> Result<MailswarmConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
}
