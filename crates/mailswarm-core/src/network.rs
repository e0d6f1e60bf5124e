use crate::error::CoreError;
use crate::time::now_ms;
use async_trait::async_trait;
use mailswarm_api::{Namespace, PollTarget, RawMessage, ServiceNode, SwarmId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Standard { swarm: SwarmId },
    GroupMember { swarm: SwarmId },
    LegacyGroup { swarm: SwarmId },
    Server { url: String },
}

impl AuthMethod {
    pub fn for_target(target: &PollTarget, namespaces: &[Namespace]) -> Self {
        match target {
            PollTarget::Server(url) => AuthMethod::Server { url: url.clone() },
            PollTarget::Swarm(id) if namespaces.contains(&Namespace::LegacyClosedGroup) => {
                AuthMethod::LegacyGroup { swarm: id.clone() }
            }
            PollTarget::Swarm(id) if id.is_group() => AuthMethod::GroupMember { swarm: id.clone() },
            PollTarget::Swarm(id) => AuthMethod::Standard { swarm: id.clone() },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceRequest {
    pub namespace: Namespace,
    pub last_hash: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrieveRequest {
    pub target: PollTarget,
    pub namespaces: Vec<NamespaceRequest>,
    pub auth: AuthMethod,
    pub known_hashes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceBatch {
    pub namespace: Namespace,
    pub messages: Vec<RawMessage>,
    pub last_hash: Option<String>,
}

impl NamespaceBatch {
    pub fn new(namespace: Namespace, messages: Vec<RawMessage>) -> Self {
        let last_hash = messages.last().map(|m| m.hash.clone());
        Self {
            namespace,
            messages,
            last_hash,
        }
    }

    pub fn observed_last_hash(&self) -> Option<&str> {
        self.last_hash
            .as_deref()
            .or_else(|| self.messages.last().map(|m| m.hash.as_str()))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetrieveResponse {
    pub batches: Vec<NamespaceBatch>,
}

impl RetrieveResponse {
    pub fn raw_count(&self) -> usize {
        self.batches.iter().map(|b| b.messages.len()).sum()
    }
}

/// Transport to the storage nodes. Request signing and wire decoding live
/// behind this trait.
#[async_trait]
pub trait SwarmClient: Send + Sync {
    async fn swarm(&self, swarm: &SwarmId) -> Result<HashSet<ServiceNode>, CoreError>;
    async fn retrieve(
        &self,
        node: &ServiceNode,
        request: RetrieveRequest,
    ) -> Result<RetrieveResponse, CoreError>;
    fn is_suspended(&self) -> bool {
        false
    }
}

#[derive(Clone)]
struct StoredMessage {
    raw: RawMessage,
    expired: bool,
}

#[derive(Clone, Default)]
pub struct InMemorySwarm {
    nodes: Arc<Mutex<Vec<ServiceNode>>>,
    entries: Arc<Mutex<HashMap<(String, Namespace), Vec<StoredMessage>>>>,
    requests: Arc<Mutex<Vec<(ServiceNode, RetrieveRequest)>>>,
    fail_next: Arc<AtomicUsize>,
    suspended: Arc<AtomicBool>,
    ignore_known: Arc<AtomicBool>,
}

impl InMemorySwarm {
    pub fn new(nodes: Vec<ServiceNode>) -> Self {
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
            ..Self::default()
        }
    }

    pub fn with_nodes(count: usize) -> Self {
        let nodes = (0..count)
            .map(|i| ServiceNode::new(format!("10.0.0.{}", i + 1), 22021, format!("{:064x}", i + 1)))
            .collect();
        Self::new(nodes)
    }

    pub fn message_hash(target: &PollTarget, namespace: Namespace, timestamp_ms: u64, data: &[u8]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(target.key().as_bytes());
        hasher.update(&namespace.tag().to_le_bytes());
        hasher.update(&timestamp_ms.to_le_bytes());
        hasher.update(data);
        hasher.finalize().to_hex().to_string()
    }

    pub async fn store(
        &self,
        target: &PollTarget,
        namespace: Namespace,
        data: Vec<u8>,
        ttl_ms: u64,
    ) -> RawMessage {
        let mut guard = self.entries.lock().await;
        let slot = guard.entry((target.key(), namespace)).or_default();
        let last_ts = slot.last().map(|m| m.raw.timestamp_ms).unwrap_or(0);
        let timestamp_ms = now_ms().max(last_ts + 1);
        let raw = RawMessage {
            hash: Self::message_hash(target, namespace, timestamp_ms, &data),
            namespace,
            data,
            timestamp_ms,
            expiration_ms: timestamp_ms.saturating_add(ttl_ms),
        };
        slot.push(StoredMessage {
            raw: raw.clone(),
            expired: false,
        });
        raw
    }

    pub async fn expire(&self, target: &PollTarget, namespace: Namespace, hash: &str) {
        let mut guard = self.entries.lock().await;
        if let Some(slot) = guard.get_mut(&(target.key(), namespace)) {
            for entry in slot.iter_mut().filter(|e| e.raw.hash == hash) {
                entry.expired = true;
            }
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn ignore_known_hashes(&self) {
        self.ignore_known.store(true, Ordering::SeqCst);
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    pub async fn requests(&self) -> Vec<(ServiceNode, RetrieveRequest)> {
        self.requests.lock().await.clone()
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SwarmClient for InMemorySwarm {
    async fn swarm(&self, _swarm: &SwarmId) -> Result<HashSet<ServiceNode>, CoreError> {
        Ok(self.nodes.lock().await.iter().cloned().collect())
    }

    async fn retrieve(
        &self,
        node: &ServiceNode,
        request: RetrieveRequest,
    ) -> Result<RetrieveResponse, CoreError> {
        self.requests
            .lock()
            .await
            .push((node.clone(), request.clone()));
        if self.take_failure() {
            return Err(CoreError::Transport(format!("{} unreachable", node.endpoint())));
        }
        let known: HashSet<&str> = if self.ignore_known.load(Ordering::SeqCst) {
            HashSet::new()
        } else {
            request.known_hashes.iter().map(|h| h.as_str()).collect()
        };
        let guard = self.entries.lock().await;
        let mut batches = Vec::new();
        for ns_req in request.namespaces.iter() {
            let live: Vec<&RawMessage> = guard
                .get(&(request.target.key(), ns_req.namespace))
                .map(|slot| slot.iter().filter(|e| !e.expired).map(|e| &e.raw).collect())
                .unwrap_or_default();
            // An unknown cursor makes the node return its whole mailbox.
            let start = match ns_req.last_hash.as_deref() {
                Some(hash) => live
                    .iter()
                    .position(|m| m.hash == hash)
                    .map(|idx| idx + 1)
                    .unwrap_or(0),
                None => 0,
            };
            let messages: Vec<RawMessage> = live[start..]
                .iter()
                .filter(|m| !known.contains(m.hash.as_str()))
                .map(|m| (*m).clone())
                .collect();
            batches.push(NamespaceBatch::new(ns_req.namespace, messages));
        }
        Ok(RetrieveResponse { batches })
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}
