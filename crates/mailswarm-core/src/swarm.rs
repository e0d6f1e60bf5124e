use crate::config::DrainBehaviour;
use crate::error::CoreError;
use crate::network::SwarmClient;
use crate::time::now_ms;
use log::debug;
use mailswarm_api::{PollTarget, ServiceNode};
use rand::seq::{IteratorRandom, SliceRandom};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

struct CachedSwarm {
    nodes: HashSet<ServiceNode>,
    fetched_at_ms: u64,
}

#[derive(Clone)]
pub struct SwarmResolver {
    client: Arc<dyn SwarmClient>,
    ttl_ms: u64,
    cache: Arc<Mutex<HashMap<PollTarget, CachedSwarm>>>,
}

impl SwarmResolver {
    pub fn new(client: Arc<dyn SwarmClient>, ttl_ms: u64) -> Self {
        Self {
            client,
            ttl_ms,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn resolve(&self, target: &PollTarget) -> Result<HashSet<ServiceNode>, CoreError> {
        let swarm_id = match target {
            PollTarget::Server(url) => return Ok(HashSet::from([ServiceNode::for_server(url)])),
            PollTarget::Swarm(id) => id,
        };
        let now = now_ms();
        {
            let guard = self.cache.lock().await;
            if let Some(cached) = guard.get(target) {
                if !cached.nodes.is_empty() && now.saturating_sub(cached.fetched_at_ms) < self.ttl_ms {
                    return Ok(cached.nodes.clone());
                }
            }
        }
        let nodes = self.client.swarm(swarm_id).await?;
        if nodes.is_empty() {
            return Err(CoreError::NoSwarmAvailable);
        }
        debug!("resolved {} nodes for {}", nodes.len(), target);
        self.cache.lock().await.insert(
            target.clone(),
            CachedSwarm {
                nodes: nodes.clone(),
                fetched_at_ms: now,
            },
        );
        Ok(nodes)
    }

    pub async fn mark_node_failed(&self, target: &PollTarget, node: &ServiceNode) {
        let mut guard = self.cache.lock().await;
        if let Some(cached) = guard.get_mut(target) {
            cached.nodes.remove(node);
        }
    }
}

pub struct SwarmDrainer {
    behaviour: DrainBehaviour,
    seen: BTreeSet<ServiceNode>,
    remaining: Vec<ServiceNode>,
    current: Option<(ServiceNode, u32)>,
}

impl SwarmDrainer {
    pub fn new(behaviour: DrainBehaviour) -> Self {
        Self {
            behaviour,
            seen: BTreeSet::new(),
            remaining: Vec::new(),
            current: None,
        }
    }

    pub fn select(&mut self, swarm: &HashSet<ServiceNode>) -> Result<ServiceNode, CoreError> {
        if swarm.is_empty() {
            return Err(CoreError::NoSwarmAvailable);
        }
        let reuse_limit = match self.behaviour {
            DrainBehaviour::AlwaysRandom => {
                return swarm
                    .iter()
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .ok_or(CoreError::NoSwarmAvailable);
            }
            DrainBehaviour::Drain => 1,
            DrainBehaviour::LimitedReuse { count } => count.max(1),
        };
        let snapshot: BTreeSet<ServiceNode> = swarm.iter().cloned().collect();
        if snapshot.is_subset(&self.seen) {
            if snapshot.len() < self.seen.len() {
                self.shrink_to(snapshot);
            }
        } else {
            self.reset_with(snapshot);
        }
        if let Some((node, uses)) = self.current.as_mut() {
            if *uses < reuse_limit {
                *uses += 1;
                return Ok(node.clone());
            }
        }
        if self.remaining.is_empty() {
            self.refill();
        }
        let node = self.remaining.pop().ok_or(CoreError::NoSwarmAvailable)?;
        self.current = Some((node.clone(), 1));
        Ok(node)
    }

    /// Stops reusing `node` and skips it until the next reshuffle.
    pub fn forget(&mut self, node: &ServiceNode) {
        self.remaining.retain(|n| n != node);
        if self.current.as_ref().map(|(n, _)| n == node).unwrap_or(false) {
            self.current = None;
        }
    }

    fn reset_with(&mut self, snapshot: BTreeSet<ServiceNode>) {
        self.seen = snapshot;
        self.remaining.clear();
        self.current = None;
    }

    fn shrink_to(&mut self, snapshot: BTreeSet<ServiceNode>) {
        self.remaining.retain(|n| snapshot.contains(n));
        if let Some((node, _)) = self.current.as_ref() {
            if !snapshot.contains(node) {
                self.current = None;
            }
        }
        self.seen = snapshot;
    }

    fn refill(&mut self) {
        self.remaining = self.seen.iter().cloned().collect();
        self.remaining.shuffle(&mut rand::thread_rng());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swarm(n: usize) -> HashSet<ServiceNode> {
        (0..n)
            .map(|i| ServiceNode::new(format!("node-{}", i), 1000 + i as u16, ""))
            .collect()
    }

    #[test]
    fn drain_visits_every_node_before_repeating() {
        let nodes = swarm(5);
        let mut drainer = SwarmDrainer::new(DrainBehaviour::Drain);
        let mut picked = HashSet::new();
        for _ in 0..5 {
            picked.insert(drainer.select(&nodes).expect("node"));
        }
        assert_eq!(picked, nodes);
    }

    #[test]
    fn limited_reuse_sticks_to_a_node() {
        let nodes = swarm(4);
        let mut drainer = SwarmDrainer::new(DrainBehaviour::LimitedReuse { count: 3 });
        let first = drainer.select(&nodes).expect("node");
        assert_eq!(drainer.select(&nodes).expect("node"), first);
        assert_eq!(drainer.select(&nodes).expect("node"), first);
        assert_ne!(drainer.select(&nodes).expect("node"), first);
    }

    #[test]
    fn forgotten_node_is_skipped() {
        let nodes = swarm(2);
        let mut drainer = SwarmDrainer::new(DrainBehaviour::LimitedReuse { count: 10 });
        let first = drainer.select(&nodes).expect("node");
        drainer.forget(&first);
        let second = drainer.select(&nodes).expect("node");
        assert_ne!(first, second);
    }

    #[test]
    fn removed_node_keeps_the_drain_cycle() {
        let mut nodes = swarm(4);
        let mut drainer = SwarmDrainer::new(DrainBehaviour::Drain);
        let mut visited = HashSet::new();
        visited.insert(drainer.select(&nodes).expect("node"));
        visited.insert(drainer.select(&nodes).expect("node"));

        let unvisited: Vec<ServiceNode> = nodes.difference(&visited).cloned().collect();
        let gone = unvisited[0].clone();
        let left = unvisited[1].clone();
        nodes.remove(&gone);

        assert_eq!(drainer.select(&nodes).expect("node"), left);
        let next = drainer.select(&nodes).expect("node");
        assert!(nodes.contains(&next));
        assert_ne!(next, gone);
    }

    #[test]
    fn added_node_starts_a_new_cycle() {
        let mut nodes = swarm(2);
        let mut drainer = SwarmDrainer::new(DrainBehaviour::Drain);
        drainer.select(&nodes).expect("node");
        nodes.insert(ServiceNode::new("node-new", 2000, ""));
        let mut picked = HashSet::new();
        for _ in 0..3 {
            picked.insert(drainer.select(&nodes).expect("node"));
        }
        assert_eq!(picked, nodes);
    }

    #[test]
    fn empty_swarm_is_an_error() {
        let mut drainer = SwarmDrainer::new(DrainBehaviour::AlwaysRandom);
        assert!(matches!(
            drainer.select(&HashSet::new()),
            Err(CoreError::NoSwarmAvailable)
        ));
    }
}
