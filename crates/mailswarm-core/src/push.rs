use crate::cursor::CursorSnapshot;
use crate::error::CoreError;
use crate::event::EventBus;
use crate::manager::PollerManager;
use crate::merger::{IngestBatch, ResponseMerger};
use crate::network::NamespaceBatch;
use crate::store::Store;
use log::debug;
use mailswarm_api::{validate_push_payload, Namespace, PollResult, PushPayload, ReceivedVia};
use std::sync::Arc;

/// Feeds messages delivered by push notification through the merger,
/// handling them inline. Push never moves a cursor or persists a job; the
/// dedupe records it writes make the next poll skip the same messages.
#[derive(Clone)]
pub struct PushIngestor {
    store: Store,
    merger: Arc<ResponseMerger>,
    events: EventBus,
    manager: PollerManager,
}

impl PushIngestor {
    pub fn new(
        store: Store,
        merger: Arc<ResponseMerger>,
        events: EventBus,
        manager: PollerManager,
    ) -> Self {
        Self {
            store,
            merger,
            events,
            manager,
        }
    }

    pub async fn ingest(&self, payload: &PushPayload) -> Result<PollResult, CoreError> {
        let polled = match self.manager.get(&payload.target).await {
            Some(poller) => poller.namespaces().to_vec(),
            None => Namespace::defaults_for(&payload.target),
        };
        let raw = validate_push_payload(payload, &polled)?;
        let batch = IngestBatch {
            target: payload.target.clone(),
            node: None,
            via: ReceivedVia::Push,
            batches: vec![NamespaceBatch::new(raw.namespace, vec![raw])],
            expected: CursorSnapshot::new(),
            force_sync: true,
        };
        let merger = self.merger.clone();
        let outcome = self
            .store
            .transaction(|tx| merger.process(tx, &batch))
            .await?;
        debug!(
            "{} push {} valid={} duplicate={}",
            payload.target, payload.hash, outcome.result.valid_count, outcome.result.duplicate_count
        );
        self.events.publish_all(&outcome.result.messages);
        Ok(outcome.result)
    }
}
