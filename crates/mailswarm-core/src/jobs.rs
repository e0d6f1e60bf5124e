use crate::error::CoreError;
use crate::policy::Policy;
use crate::time::now_ms;
use mailswarm_api::{PollTarget, ProcessedMessage, ThreadId};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

pub type JobId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    ConfigMessageReceive,
    MessageReceive,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ConfigMessageReceive => "config_message_receive",
            JobKind::MessageReceive => "message_receive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "config_message_receive" => Some(JobKind::ConfigMessageReceive),
            "message_receive" => Some(JobKind::MessageReceive),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDetails {
    pub target: PollTarget,
    pub messages: Vec<ProcessedMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub thread_id: ThreadId,
    pub details: JobDetails,
    pub failure_count: u32,
    pub next_run_ms: u64,
    pub created_at_ms: u64,
}

const JOB_COLUMNS: &str =
    "id, kind, thread_id, details, failure_count, next_run_ms, created_at_ms";

type JobRow = (JobId, String, String, Vec<u8>, i64, i64, i64);

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_job(raw: JobRow) -> Result<Job, CoreError> {
    let (id, kind, thread_id, details, failure_count, next_run_ms, created_at_ms) = raw;
    let kind = JobKind::parse(&kind).ok_or_else(|| CoreError::Job(format!("unknown kind {}", kind)))?;
    Ok(Job {
        id,
        kind,
        thread_id: ThreadId::new(thread_id),
        details: serde_json::from_slice(&details)?,
        failure_count: failure_count as u32,
        next_run_ms: next_run_ms as u64,
        created_at_ms: created_at_ms as u64,
    })
}

pub struct JobQueue;

impl JobQueue {
    pub fn enqueue(
        conn: &Connection,
        kind: JobKind,
        thread_id: &ThreadId,
        details: &JobDetails,
    ) -> Result<JobId, CoreError> {
        let payload = serde_json::to_vec(details)?;
        let now = now_ms() as i64;
        conn.execute(
            "INSERT INTO jobs (kind, target, thread_id, details, failure_count, next_run_ms, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![kind.as_str(), details.target.key(), thread_id.value, payload, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_dependency(conn: &Connection, job: JobId, depends_on: JobId) -> Result<(), CoreError> {
        conn.execute(
            "INSERT OR IGNORE INTO job_dependencies (job_id, depends_on) VALUES (?1, ?2)",
            params![job, depends_on],
        )?;
        Ok(())
    }

    pub fn load(conn: &Connection, id: JobId) -> Result<Option<Job>, CoreError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let raw = conn.query_row(&sql, params![id], job_from_row).optional()?;
        raw.map(decode_job).transpose()
    }

    pub fn ready(conn: &Connection, now: u64, limit: usize) -> Result<Vec<Job>, CoreError> {
        let sql = format!(
            "SELECT {} FROM jobs j
             WHERE j.next_run_ms <= ?1
               AND NOT EXISTS (SELECT 1 FROM job_dependencies d WHERE d.job_id = j.id)
             ORDER BY j.id
             LIMIT ?2",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now as i64, limit as i64], job_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_job(row?)?);
        }
        Ok(out)
    }

    pub fn complete(conn: &Connection, id: JobId) -> Result<(), CoreError> {
        conn.execute("DELETE FROM job_dependencies WHERE depends_on = ?1", params![id])?;
        conn.execute("DELETE FROM job_dependencies WHERE job_id = ?1", params![id])?;
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Schedules a retry with jittered exponential back-off. Returns `false`
    /// when the job ran out of attempts and was dropped.
    pub fn bump_failure(conn: &Connection, id: JobId, policy: &Policy) -> Result<bool, CoreError> {
        let tries: Option<i64> = conn
            .query_row(
                "SELECT failure_count FROM jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(tries) = tries else {
            return Err(CoreError::NotFound);
        };
        let tries = (tries as u32).saturating_add(1);
        if tries >= policy.max_job_failures.max(1) {
            Self::complete(conn, id)?;
            return Ok(false);
        }
        let factor = 1u64 << (tries.saturating_sub(1).min(16));
        let base = policy.backoff_initial_ms.saturating_mul(factor);
        let capped = base.min(policy.backoff_max_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2 + 1);
        let next_run = now_ms().saturating_add(capped + jitter);
        conn.execute(
            "UPDATE jobs SET failure_count = ?2, next_run_ms = ?3 WHERE id = ?1",
            params![id, tries as i64, next_run as i64],
        )?;
        Ok(true)
    }

    pub fn count(conn: &Connection) -> Result<usize, CoreError> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn dependencies(conn: &Connection, id: JobId) -> Result<Vec<JobId>, CoreError> {
        let mut stmt = conn.prepare(
            "SELECT depends_on FROM job_dependencies WHERE job_id = ?1 ORDER BY depends_on",
        )?;
        let rows = stmt.query_map(params![id], |row| row.get::<_, JobId>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Job>, CoreError> {
        let sql = format!("SELECT {} FROM jobs ORDER BY id", JOB_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], job_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_job(row?)?);
        }
        Ok(out)
    }

    pub fn clear_target(conn: &Connection, target: &PollTarget) -> Result<usize, CoreError> {
        let key = target.key();
        conn.execute(
            "DELETE FROM job_dependencies
             WHERE job_id IN (SELECT id FROM jobs WHERE target = ?1)
                OR depends_on IN (SELECT id FROM jobs WHERE target = ?1)",
            params![key],
        )?;
        Ok(conn.execute("DELETE FROM jobs WHERE target = ?1", params![key])?)
    }
}
