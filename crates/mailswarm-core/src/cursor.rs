use crate::dedupe::DedupeLedger;
use crate::error::CoreError;
use crate::time::now_ms;
use mailswarm_api::{Namespace, PollTarget};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

pub type CursorSnapshot = BTreeMap<Namespace, Option<String>>;

pub struct CursorStore;

impl CursorStore {
    pub fn get(
        conn: &Connection,
        target: &PollTarget,
        namespace: Namespace,
    ) -> Result<Option<String>, CoreError> {
        let hash = conn
            .query_row(
                "SELECT hash FROM last_hashes WHERE target = ?1 AND namespace = ?2",
                params![target.key(), namespace.tag()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(hash)
    }

    pub fn set(
        conn: &Connection,
        target: &PollTarget,
        namespace: Namespace,
        hash: &str,
    ) -> Result<(), CoreError> {
        conn.execute(
            "INSERT INTO last_hashes (target, namespace, hash, updated_at_ms) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(target, namespace) DO UPDATE SET hash = excluded.hash, updated_at_ms = excluded.updated_at_ms",
            params![target.key(), namespace.tag(), hash, now_ms() as i64],
        )?;
        Ok(())
    }

    pub fn clear(
        conn: &Connection,
        target: &PollTarget,
        namespace: Namespace,
    ) -> Result<(), CoreError> {
        conn.execute(
            "DELETE FROM last_hashes WHERE target = ?1 AND namespace = ?2",
            params![target.key(), namespace.tag()],
        )?;
        Ok(())
    }

    pub fn clear_all(conn: &Connection, target: &PollTarget) -> Result<(), CoreError> {
        conn.execute(
            "DELETE FROM last_hashes WHERE target = ?1",
            params![target.key()],
        )?;
        Ok(())
    }

    pub fn snapshot(
        conn: &Connection,
        target: &PollTarget,
        namespaces: &[Namespace],
    ) -> Result<CursorSnapshot, CoreError> {
        let mut out = CursorSnapshot::new();
        for ns in namespaces.iter().filter(|ns| ns.should_fetch_since_last_hash()) {
            out.insert(*ns, Self::get(conn, target, *ns)?);
        }
        Ok(out)
    }
}

pub struct CursorValidator;

impl CursorValidator {
    /// Fails with [`CoreError::CursorMismatch`] on the first namespace whose
    /// persisted cursor differs from `expected`.
    pub fn verify(
        conn: &Connection,
        target: &PollTarget,
        expected: &CursorSnapshot,
    ) -> Result<(), CoreError> {
        for (ns, hash) in expected.iter() {
            let current = CursorStore::get(conn, target, *ns)?;
            if current.as_ref() != hash.as_ref() {
                return Err(CoreError::CursorMismatch(*ns));
            }
        }
        Ok(())
    }

    pub fn recover_stale(
        conn: &Connection,
        target: &PollTarget,
        namespace: Namespace,
        stale: &str,
        still_valid: &[String],
    ) -> Result<Option<String>, CoreError> {
        DedupeLedger::mark_invalid(conn, target, namespace, stale)?;
        DedupeLedger::mark_valid(conn, target, namespace, still_valid)?;
        let next = DedupeLedger::latest_valid(conn, target, namespace, now_ms())?;
        match next.as_deref() {
            Some(hash) => CursorStore::set(conn, target, namespace, hash)?,
            None => CursorStore::clear(conn, target, namespace)?,
        }
        Ok(next)
    }
}
