use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::Result, types::OutcomeKind};

/// Initialise the run-log schema in `conn`.
///
/// Creates the `runs` table (idempotent) with indexes for the per-job history
/// query and the retention sweep.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            run_id       TEXT    NOT NULL PRIMARY KEY,
            job_id       TEXT    NOT NULL,
            attempt      INTEGER NOT NULL,
            outcome      TEXT    NOT NULL,   -- success | transient_failure | timeout | configuration_error
            started_at   TEXT    NOT NULL,   -- RFC 3339
            finished_at  TEXT    NOT NULL,   -- RFC 3339
            duration_ms  INTEGER NOT NULL,
            error        TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_runs_job_finished ON runs (job_id, finished_at);
        CREATE INDEX IF NOT EXISTS idx_runs_finished ON runs (finished_at);
        ",
    )?;
    Ok(())
}

/// One completed fetch, as stored in the run log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub job_id: String,
    pub attempt: u32,
    pub outcome: OutcomeKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Append-only history of completed runs.
///
/// Written by the engine after each outcome and read by the HTTP layer, so
/// the connection sits behind a mutex.
pub struct RunLog {
    conn: Mutex<Connection>,
}

impl RunLog {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory log, used by tests and when persistence is disabled.
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn record(&self, run: &RunRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO runs
             (run_id, job_id, attempt, outcome, started_at, finished_at, duration_ms, error)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            rusqlite::params![
                run.run_id.to_string(),
                run.job_id,
                run.attempt,
                run.outcome.to_string(),
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
                i64::try_from(run.duration_ms).unwrap_or(i64::MAX),
                run.error,
            ],
        )?;
        debug!(job_id = %run.job_id, run_id = %run.run_id, outcome = %run.outcome, "run recorded");
        Ok(())
    }

    /// Most recent runs of `job_id`, newest first.
    pub fn recent(&self, job_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT run_id, job_id, attempt, outcome, started_at, finished_at, duration_ms, error
             FROM runs WHERE job_id = ?1
             ORDER BY finished_at DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let runs = stmt
            .query_map(rusqlite::params![job_id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,         // run_id
                    row.get::<_, String>(1)?,         // job_id
                    row.get::<_, u32>(2)?,            // attempt
                    row.get::<_, String>(3)?,         // outcome
                    row.get::<_, String>(4)?,         // started_at
                    row.get::<_, String>(5)?,         // finished_at
                    row.get::<_, i64>(6)?,            // duration_ms
                    row.get::<_, Option<String>>(7)?, // error
                ))
            })?
            .filter_map(|r| {
                let (run_id, job_id, attempt, outcome, started_at, finished_at, duration_ms, error) =
                    r.ok()?;
                let parsed = (|| {
                    Some(RunRecord {
                        run_id: run_id.parse().ok()?,
                        outcome: outcome.parse().ok()?,
                        started_at: parse_ts(&started_at)?,
                        finished_at: parse_ts(&finished_at)?,
                        duration_ms: u64::try_from(duration_ms).unwrap_or(0),
                        job_id: job_id.clone(),
                        attempt,
                        error,
                    })
                })();
                if parsed.is_none() {
                    warn!(%job_id, %run_id, "skipping malformed run row");
                }
                parsed
            })
            .collect();
        Ok(runs)
    }

    /// Delete runs that finished before `cutoff`. Returns the number removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM runs WHERE finished_at < ?1",
            [cutoff.to_rfc3339()],
        )?;
        Ok(n)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
