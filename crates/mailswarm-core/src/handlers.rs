use crate::error::CoreError;
use mailswarm_api::{Namespace, PollTarget, ProcessedMessage};
use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub trait ConfigMerger: Send + Sync {
    fn handle_config_messages(
        &self,
        conn: &Connection,
        target: &PollTarget,
        namespace: Namespace,
        messages: &[ProcessedMessage],
    ) -> Result<bool, CoreError>;
}

pub trait MessageHandler: Send + Sync {
    fn handle_message(
        &self,
        conn: &Connection,
        message: &ProcessedMessage,
        notify: bool,
    ) -> Result<(), CoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandledKind {
    Config,
    Standard,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandledEntry {
    pub kind: HandledKind,
    pub namespace: Namespace,
    pub hash: String,
    pub notified: bool,
}

#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<HandledEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<HandledEntry> {
        self.entries
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn hashes(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.hash).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, entry: HandledEntry) -> Result<(), CoreError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| CoreError::Job("journal poisoned".to_string()))?;
        guard.push(entry);
        Ok(())
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Clone, Default)]
pub struct RecordingConfigMerger {
    journal: Journal,
    fail_next: Arc<AtomicUsize>,
}

impl RecordingConfigMerger {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            fail_next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

impl ConfigMerger for RecordingConfigMerger {
    fn handle_config_messages(
        &self,
        _conn: &Connection,
        _target: &PollTarget,
        namespace: Namespace,
        messages: &[ProcessedMessage],
    ) -> Result<bool, CoreError> {
        if take_failure(&self.fail_next) {
            return Err(CoreError::Job(format!("config merge failed for {}", namespace)));
        }
        for message in messages {
            self.journal.push(HandledEntry {
                kind: HandledKind::Config,
                namespace,
                hash: message.hash.clone(),
                notified: false,
            })?;
        }
        Ok(!messages.is_empty())
    }
}

#[derive(Clone, Default)]
pub struct RecordingMessageHandler {
    journal: Journal,
    fail_next: Arc<AtomicUsize>,
}

impl RecordingMessageHandler {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            fail_next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

impl MessageHandler for RecordingMessageHandler {
    fn handle_message(
        &self,
        _conn: &Connection,
        message: &ProcessedMessage,
        notify: bool,
    ) -> Result<(), CoreError> {
        if take_failure(&self.fail_next) {
            return Err(CoreError::Job(format!("handler rejected {}", message.hash)));
        }
        self.journal.push(HandledEntry {
            kind: HandledKind::Standard,
            namespace: message.namespace,
            hash: message.hash.clone(),
            notified: notify,
        })
    }
}
