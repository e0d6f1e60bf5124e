use crate::config::{CoreConfig, DrainBehaviour};
use crate::delay::PollDelay;
use crate::error::CoreError;
use crate::poller::{ErrorHandler, Poller, PollerDeps, PollerOptions};
use log::info;
use mailswarm_api::{validate_target, Namespace, PollTarget, PollerStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

struct Registry {
    pollers: HashMap<PollTarget, Poller>,
    generations: HashMap<PollTarget, watch::Sender<Uuid>>,
}

#[derive(Clone)]
pub struct PollerManager {
    deps: PollerDeps,
    config: CoreConfig,
    delay: Arc<dyn PollDelay>,
    error_handler: Arc<dyn ErrorHandler>,
    registry: Arc<Mutex<Registry>>,
}

impl PollerManager {
    pub fn new(
        deps: PollerDeps,
        config: CoreConfig,
        delay: Arc<dyn PollDelay>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            deps,
            config,
            delay,
            error_handler,
            registry: Arc::new(Mutex::new(Registry {
                pollers: HashMap::new(),
                generations: HashMap::new(),
            })),
        }
    }

    pub async fn get(&self, target: &PollTarget) -> Option<Poller> {
        self.registry.lock().await.pollers.get(target).cloned()
    }

    pub async fn get_or_create(
        &self,
        target: &PollTarget,
        namespaces: Option<Vec<Namespace>>,
    ) -> Result<Poller, CoreError> {
        validate_target(target)?;
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.pollers.get(target) {
            return Ok(existing.clone());
        }
        let poller = self.build(&mut registry, target, namespaces)?;
        registry.pollers.insert(target.clone(), poller.clone());
        Ok(poller)
    }

    /// Swaps in a fresh poller for `target`. The old instance sees the new
    /// generation and cancels itself.
    pub async fn replace(
        &self,
        target: &PollTarget,
        namespaces: Option<Vec<Namespace>>,
    ) -> Result<Poller, CoreError> {
        validate_target(target)?;
        let mut registry = self.registry.lock().await;
        let was_running = registry
            .pollers
            .get(target)
            .map(|p| p.is_running())
            .unwrap_or(false);
        let poller = self.build(&mut registry, target, namespaces)?;
        if let Some(old) = registry.pollers.insert(target.clone(), poller.clone()) {
            old.stop();
        }
        if was_running {
            poller.start_if_needed();
        }
        info!("{} poller replaced by {}", target, poller.instance());
        Ok(poller)
    }

    pub async fn start_if_needed(
        &self,
        target: &PollTarget,
        namespaces: Option<Vec<Namespace>>,
    ) -> Result<Poller, CoreError> {
        let poller = self.get_or_create(target, namespaces).await?;
        poller.start_if_needed();
        Ok(poller)
    }

    pub async fn stop_and_remove(&self, target: &PollTarget) -> bool {
        let mut registry = self.registry.lock().await;
        registry.generations.remove(target);
        match registry.pollers.remove(target) {
            Some(poller) => {
                poller.stop();
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let registry = self.registry.lock().await;
        for poller in registry.pollers.values() {
            poller.stop();
        }
    }

    pub async fn snapshot(&self) -> Vec<PollerStatus> {
        let registry = self.registry.lock().await;
        let mut out: Vec<PollerStatus> = registry.pollers.values().map(|p| p.status()).collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.pollers.len()
    }

    fn build(
        &self,
        registry: &mut Registry,
        target: &PollTarget,
        namespaces: Option<Vec<Namespace>>,
    ) -> Result<Poller, CoreError> {
        let mut namespaces = namespaces.unwrap_or_else(|| Namespace::defaults_for(target));
        namespaces.sort_by_key(|ns| (ns.processing_order(), ns.tag()));
        namespaces.dedup();
        if namespaces.is_empty() {
            return Err(CoreError::Validation("namespaces empty".to_string()));
        }
        let instance = Uuid::new_v4();
        let generation = match registry.generations.get(target) {
            Some(sender) => {
                sender.send_replace(instance);
                sender.subscribe()
            }
            None => {
                let (sender, receiver) = watch::channel(instance);
                registry.generations.insert(target.clone(), sender);
                receiver
            }
        };
        let options = PollerOptions {
            namespaces,
            drain: self.drain_for(target),
            delay: self.delay.clone(),
            error_handler: self.error_handler.clone(),
        };
        Ok(Poller::new(
            target.clone(),
            instance,
            options,
            self.deps.clone(),
            generation,
        ))
    }

    fn drain_for(&self, target: &PollTarget) -> DrainBehaviour {
        match target {
            PollTarget::Server(_) => DrainBehaviour::AlwaysRandom,
            PollTarget::Swarm(id) if id.is_group() => self.config.group_drain.clone(),
            PollTarget::Swarm(_) => self.config.user_drain.clone(),
        }
    }
}
