use crate::cursor::CursorStore;
use crate::dedupe::DedupeLedger;
use crate::error::CoreError;
use crate::jobs::JobQueue;
use crate::migrations;
use mailswarm_api::{Namespace, PollTarget};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    suspended: Arc<AtomicBool>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self, CoreError> {
        let mut conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|_| CoreError::Storage)?;
                }
            }
            let conn = Connection::open(path)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn
        };
        conn.busy_timeout(Duration::from_secs(5))?;
        migrations::apply(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            suspended: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn open_in_memory() -> Result<Self, CoreError> {
        Self::open(":memory:")
    }

    /// Runs `f` inside one immediate transaction. `Ok` commits, `Err` rolls back.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, CoreError>,
    {
        if self.is_suspended() {
            return Err(CoreError::Suspended("storage"));
        }
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub async fn read<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&Connection) -> Result<T, CoreError>,
    {
        let guard = self.conn.lock().await;
        f(&guard)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub async fn reset_cursor(
        &self,
        target: &PollTarget,
        namespace: Namespace,
    ) -> Result<(), CoreError> {
        self.transaction(|tx| CursorStore::clear(tx, target, namespace))
            .await
    }

    pub async fn clear_target(&self, target: &PollTarget) -> Result<(), CoreError> {
        self.transaction(|tx| {
            DedupeLedger::clear(tx, target)?;
            CursorStore::clear_all(tx, target)?;
            JobQueue::clear_target(tx, target)?;
            Ok(())
        })
        .await
    }
}
