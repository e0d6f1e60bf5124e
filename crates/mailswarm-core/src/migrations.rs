use crate::error::CoreError;
use log::info;
use rusqlite::{params, Connection, OptionalExtension};

pub const CURRENT_VERSION: i64 = 2;

struct Migration {
    to_version: i64,
    sql: &'static str,
    description: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        to_version: 1,
        sql: r#"
            CREATE TABLE IF NOT EXISTS received_messages (
                target TEXT NOT NULL,
                namespace INTEGER NOT NULL,
                hash TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                expiration_ms INTEGER NOT NULL,
                invalid INTEGER NOT NULL DEFAULT 0,
                received_at_ms INTEGER NOT NULL,
                PRIMARY KEY (target, namespace, hash)
            );
            CREATE INDEX IF NOT EXISTS received_messages_expiry
                ON received_messages(target, expiration_ms);
            CREATE TABLE IF NOT EXISTS last_hashes (
                target TEXT NOT NULL,
                namespace INTEGER NOT NULL,
                hash TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (target, namespace)
            );
        "#,
        description: "dedupe ledger and last hash cursors",
    },
    Migration {
        to_version: 2,
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                target TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                details BLOB NOT NULL,
                failure_count INTEGER NOT NULL DEFAULT 0,
                next_run_ms INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS jobs_next_run ON jobs(next_run_ms);
            CREATE TABLE IF NOT EXISTS job_dependencies (
                job_id INTEGER NOT NULL,
                depends_on INTEGER NOT NULL,
                PRIMARY KEY (job_id, depends_on)
            );
            CREATE INDEX IF NOT EXISTS job_dependencies_target
                ON job_dependencies(depends_on);
        "#,
        description: "persisted dispatch queue",
    },
];

pub fn schema_version(conn: &Connection) -> Result<i64, CoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (id INTEGER PRIMARY KEY CHECK (id = 0), version INTEGER NOT NULL);",
    )?;
    let version = conn
        .query_row("SELECT version FROM schema_version WHERE id = 0", [], |row| {
            row.get::<_, i64>(0)
        })
        .optional()?;
    Ok(version.unwrap_or(0))
}

pub fn apply(conn: &mut Connection) -> Result<i64, CoreError> {
    let mut version = schema_version(conn)?;
    if version > CURRENT_VERSION {
        return Err(CoreError::Validation(format!(
            "schema version {} is newer than supported {}",
            version, CURRENT_VERSION
        )));
    }
    let start = version;
    for migration in MIGRATIONS.iter().filter(|m| m.to_version > start) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_version (id, version) VALUES (0, ?1)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            params![migration.to_version],
        )?;
        tx.commit()?;
        info!(
            "store migrated to v{}: {}",
            migration.to_version, migration.description
        );
        version = migration.to_version;
    }
    Ok(version)
}
