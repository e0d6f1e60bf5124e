use crate::error::CoreError;
use crate::time::now_ms;
use mailswarm_api::{Namespace, PollTarget};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedupeOutcome {
    Accepted,
    Duplicate,
}

pub struct DedupeLedger;

impl DedupeLedger {
    pub fn record(
        conn: &Connection,
        target: &PollTarget,
        namespace: Namespace,
        hash: &str,
        timestamp_ms: u64,
        expiration_ms: u64,
    ) -> Result<DedupeOutcome, CoreError> {
        let inserted = conn.execute(
            "INSERT INTO received_messages
                (target, namespace, hash, timestamp_ms, expiration_ms, invalid, received_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                target.key(),
                namespace.tag(),
                hash,
                timestamp_ms as i64,
                expiration_ms as i64,
                now_ms() as i64
            ],
        );
        match inserted {
            Ok(_) => Ok(DedupeOutcome::Accepted),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Ok(DedupeOutcome::Duplicate)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn contains(
        conn: &Connection,
        target: &PollTarget,
        namespace: Namespace,
        hash: &str,
    ) -> Result<bool, CoreError> {
        let found = conn
            .query_row(
                "SELECT 1 FROM received_messages WHERE target = ?1 AND namespace = ?2 AND hash = ?3",
                params![target.key(), namespace.tag(), hash],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn active_hashes(
        conn: &Connection,
        target: &PollTarget,
        now: u64,
        limit: usize,
    ) -> Result<Vec<String>, CoreError> {
        let mut stmt = conn.prepare(
            "SELECT hash FROM received_messages
             WHERE target = ?1 AND invalid = 0 AND (expiration_ms = 0 OR expiration_ms > ?2)
             ORDER BY timestamp_ms DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![target.key(), now as i64, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count(conn: &Connection, target: &PollTarget) -> Result<usize, CoreError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM received_messages WHERE target = ?1",
            params![target.key()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn mark_invalid(
        conn: &Connection,
        target: &PollTarget,
        namespace: Namespace,
        hash: &str,
    ) -> Result<bool, CoreError> {
        let changed = conn.execute(
            "UPDATE received_messages SET invalid = 1
             WHERE target = ?1 AND namespace = ?2 AND hash = ?3",
            params![target.key(), namespace.tag(), hash],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_valid(
        conn: &Connection,
        target: &PollTarget,
        namespace: Namespace,
        hashes: &[String],
    ) -> Result<(), CoreError> {
        let mut stmt = conn.prepare(
            "UPDATE received_messages SET invalid = 0
             WHERE target = ?1 AND namespace = ?2 AND hash = ?3",
        )?;
        let key = target.key();
        for hash in hashes {
            stmt.execute(params![key, namespace.tag(), hash])?;
        }
        Ok(())
    }

    pub fn latest_valid(
        conn: &Connection,
        target: &PollTarget,
        namespace: Namespace,
        now: u64,
    ) -> Result<Option<String>, CoreError> {
        let hash = conn
            .query_row(
                "SELECT hash FROM received_messages
                 WHERE target = ?1 AND namespace = ?2 AND invalid = 0
                   AND (expiration_ms = 0 OR expiration_ms > ?3)
                 ORDER BY timestamp_ms DESC, rowid DESC
                 LIMIT 1",
                params![target.key(), namespace.tag(), now as i64],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(hash)
    }

    pub fn clear(conn: &Connection, target: &PollTarget) -> Result<usize, CoreError> {
        Ok(conn.execute(
            "DELETE FROM received_messages WHERE target = ?1",
            params![target.key()],
        )?)
    }
}
