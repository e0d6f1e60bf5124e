use crate::namespace::Namespace;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub const GROUP_PREFIX: &str = "03";
pub const STANDARD_PREFIX: &str = "05";

/// Hex encoded public key of the identity that owns a swarm.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwarmId {
    pub value: String,
}

impl SwarmId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into().to_lowercase(),
        }
    }

    pub fn prefix(&self) -> &str {
        self.value.get(..2).unwrap_or("")
    }

    pub fn is_group(&self) -> bool {
        self.prefix() == GROUP_PREFIX
    }
}

impl Display for SwarmId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PollTarget {
    Swarm(SwarmId),
    Server(String),
}

impl PollTarget {
    pub fn swarm(value: impl Into<String>) -> Self {
        PollTarget::Swarm(SwarmId::new(value))
    }

    pub fn server(url: impl Into<String>) -> Self {
        PollTarget::Server(url.into().trim_end_matches('/').to_string())
    }

    /// Stable key used for every persisted row that belongs to this target.
    pub fn key(&self) -> String {
        match self {
            PollTarget::Swarm(id) => format!("swarm:{}", id.value),
            PollTarget::Server(url) => format!("server:{}", url),
        }
    }
}

impl Display for PollTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PollTarget::Swarm(id) => {
                let short = id.value.get(..8).unwrap_or(&id.value);
                write!(f, "swarm {}..", short)
            }
            PollTarget::Server(url) => write!(f, "server {}", url),
        }
    }
}

/// One storage node that belongs to a swarm.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceNode {
    pub address: String,
    pub port: u16,
    pub ed25519_hex: String,
}

impl ServiceNode {
    pub fn new(address: impl Into<String>, port: u16, ed25519_hex: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            ed25519_hex: ed25519_hex.into(),
        }
    }

    /// Pseudo node standing in for a single server target.
    pub fn for_server(url: &str) -> Self {
        Self {
            address: url.to_string(),
            port: 0,
            ed25519_hex: String::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        if self.port == 0 {
            self.address.clone()
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Conversation a standard message belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadId {
    pub value: String,
}

impl ThreadId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Thread that owns the config state of a target.
    pub fn for_target(target: &PollTarget) -> Self {
        Self {
            value: target.key(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceivedVia {
    Poll,
    Push,
}

/// Envelope exactly as a node returned it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawMessage {
    pub hash: String,
    pub namespace: Namespace,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
    pub expiration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum MessageContent {
    Config {
        data: Vec<u8>,
    },
    Standard {
        thread_id: ThreadId,
        sender: Option<String>,
        kind: String,
        body: Vec<u8>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessedMessage {
    pub hash: String,
    pub target: PollTarget,
    pub namespace: Namespace,
    pub node: Option<ServiceNode>,
    pub received_via: ReceivedVia,
    pub timestamp_ms: u64,
    pub expiration_ms: u64,
    pub content: MessageContent,
}

impl ProcessedMessage {
    pub fn is_config(&self) -> bool {
        matches!(self.content, MessageContent::Config { .. })
    }

    /// Config messages are attributed to the config thread of their target.
    pub fn thread_id(&self) -> ThreadId {
        match &self.content {
            MessageContent::Config { .. } => ThreadId::for_target(&self.target),
            MessageContent::Standard { thread_id, .. } => thread_id.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollResult {
    pub messages: Vec<ProcessedMessage>,
    pub raw_count: usize,
    pub valid_count: usize,
    pub invalid_count: usize,
    pub duplicate_count: usize,
    pub had_valid_hash_update: bool,
    pub discarded: bool,
}

impl PollResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Result of a poll whose messages were thrown away because a cursor
    /// changed underneath it.
    pub fn discarded(raw_count: usize) -> Self {
        Self {
            raw_count,
            discarded: true,
            ..Self::default()
        }
    }
}

/// Message delivered out of band by a push notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushPayload {
    pub target: PollTarget,
    pub namespace: Namespace,
    pub hash: String,
    pub data_b64: String,
    pub timestamp_ms: u64,
    pub expiration_ms: u64,
}

impl PushPayload {
    pub fn to_raw(&self) -> Result<RawMessage, crate::validation::ValidationError> {
        let data = STANDARD
            .decode(&self.data_b64)
            .map_err(|_| crate::validation::ValidationError::Encoding("data_b64"))?;
        Ok(RawMessage {
            hash: self.hash.clone(),
            namespace: self.namespace,
            data,
            timestamp_ms: self.timestamp_ms,
            expiration_ms: self.expiration_ms,
        })
    }

    pub fn from_raw(target: PollTarget, raw: &RawMessage) -> Self {
        Self {
            target,
            namespace: raw.namespace,
            hash: raw.hash.clone(),
            data_b64: STANDARD.encode(&raw.data),
            timestamp_ms: raw.timestamp_ms,
            expiration_ms: raw.expiration_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollerPhase {
    Idle,
    Running,
    Polling,
    Waiting,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollerStatus {
    pub target: PollTarget,
    pub instance: String,
    pub phase: PollerPhase,
    pub failure_count: u32,
    pub last_poll_start_ms: Option<u64>,
    pub last_raw_count: usize,
    pub last_valid_count: usize,
}
