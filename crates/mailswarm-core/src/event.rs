use mailswarm_api::ProcessedMessage;
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<ProcessedMessage>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProcessedMessage>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish_all(&self, messages: &[ProcessedMessage]) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        for message in messages {
            let _ = self.tx.send(message.clone());
        }
    }
}
