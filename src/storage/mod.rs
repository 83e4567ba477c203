// SPDX-License-Identifier: MIT
//! Durable ledger of job lifecycle state, backed by SQLite in WAL mode.
//!
//! The ledger is the single source of truth for every job. In-memory work
//! queues owned by the engine are derived caches, rebuilt from the ledger at
//! startup — never the other way around.

use crate::clock::{format_timestamp, Clock};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// Position of a job in the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Found,
    Uploaded,
    InCloud,
    Downloaded,
    Cleaned,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Found => "found",
            JobState::Uploaded => "uploaded",
            JobState::InCloud => "in_cloud",
            JobState::Downloaded => "downloaded",
            JobState::Cleaned => "cleaned",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "found" => JobState::Found,
            "uploaded" => JobState::Uploaded,
            "in_cloud" => JobState::InCloud,
            "downloaded" => JobState::Downloaded,
            "cleaned" => JobState::Cleaned,
            "done" => JobState::Done,
            "failed" => JobState::Failed,
            other => return Err(anyhow!("unknown job state in ledger: {other}")),
        })
    }
}

/// One row of the `jobs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub state: String,
    pub created_at: String,
    pub done_at: Option<String>,
    pub category_path: String,
    pub nzb_name: String,
    pub full_path: String,
    pub dl_id: Option<String>,
    pub dl_folder_id: Option<String>,
    pub dl_retry_count: i64,
    pub cld_dl_timeout_time: Option<String>,
    pub cld_dl_move_retry_c: i64,
    pub state_retry_count: i64,
    pub message: Option<String>,
}

impl Job {
    pub fn state(&self) -> JobState {
        // The ledger only ever contains states this process wrote.
        JobState::from_str(&self.state).expect("ledger contained an unrecognized job state")
    }

    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        self.cld_dl_timeout_time
            .as_deref()
            .and_then(|s| crate::clock::parse_timestamp(s).ok())
    }
}

/// Per-state row counts, for the aggregate dashboard reads.
#[derive(Debug, Clone, Default)]
pub struct StateCounts {
    pub found: i64,
    pub uploaded: i64,
    pub in_cloud: i64,
    pub downloaded: i64,
    pub cleaned: i64,
    pub done: i64,
    pub failed: i64,
}

/// Sums of the three retry counters across every job, for the aggregate
/// dashboard reads.
#[derive(Debug, Clone, Default)]
pub struct RetrySums {
    pub dl_retry_count: i64,
    pub cld_dl_move_retry_c: i64,
    pub state_retry_count: i64,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Ingest ─────────────────────────────────────────────────────────────

    /// Insert a newly observed descriptor. Returns `None` without writing if
    /// `full_path` is already tracked (Stage A uniqueness check).
    pub async fn insert_if_new(
        &self,
        full_path: &str,
        category_path: &str,
        nzb_name: &str,
        clock: &dyn Clock,
    ) -> Result<Option<Job>> {
        let existing = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE full_path = ?")
            .bind(full_path)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Ok(None);
        }

        let created_at = format_timestamp(clock.now());
        let result = sqlx::query(
            "INSERT INTO jobs (state, created_at, category_path, nzb_name, full_path)
             VALUES ('found', ?, ?, ?, ?)",
        )
        .bind(&created_at)
        .bind(category_path)
        .bind(nzb_name)
        .bind(full_path)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get(id).await.map(Some)
    }

    pub async fn get(&self, id: i64) -> Result<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!("job {id} not found in ledger: {e}"))
    }

    /// Every non-terminal row, for restart recovery.
    pub async fn current_work(&self) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE state NOT IN ('done', 'failed') ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// All non-terminal rows in a given state, used by the engine to derive
    /// each in-memory queue at startup.
    pub async fn current_work_in_state(&self, state: JobState) -> Result<Vec<Job>> {
        Ok(
            sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE state = ? ORDER BY id ASC")
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Paged slice of terminal (`done`/`failed`) rows, most recent first.
    pub async fn terminal_slice(&self, limit: i64, offset: i64) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE state IN ('done', 'failed')
             ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?)
    }

    // ─── Targeted mutations ─────────────────────────────────────────────────

    pub async fn mark_uploaded(
        &self,
        id: i64,
        dl_id: &str,
        timeout: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET state = 'uploaded', dl_id = ?, cld_dl_timeout_time = ?, \
             dl_retry_count = 0 WHERE id = ?",
        )
        .bind(dl_id)
        .bind(format_timestamp(timeout))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_in_cloud(&self, id: i64, dl_folder_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = 'in_cloud', dl_folder_id = ? WHERE id = ?")
            .bind(dl_folder_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_downloaded(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = 'downloaded' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_cleaned(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = 'cleaned' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_done(&self, id: i64, done_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = 'done', done_at = ? WHERE id = ?")
            .bind(format_timestamp(done_at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = 'failed' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Degrade a job back to `found`, clearing its per-attempt remote fields
    /// and optionally bumping the two cross-stage counters. A single
    /// unambiguous `UPDATE ... SET` — every column gets its own assignment,
    /// never a comparison mistaken for one.
    pub async fn reset_to_found(
        &self,
        id: i64,
        increment_move_retry: bool,
        increment_state_retry: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET \
                state = 'found', \
                dl_id = NULL, \
                dl_folder_id = NULL, \
                dl_retry_count = 0, \
                cld_dl_timeout_time = NULL, \
                message = NULL, \
                cld_dl_move_retry_c = cld_dl_move_retry_c + ?, \
                state_retry_count = state_retry_count + ? \
             WHERE id = ?",
        )
        .bind(increment_move_retry as i64)
        .bind(increment_state_retry as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Increment `dl_retry_count` and return the new value.
    pub async fn increment_dl_retry(&self, id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "UPDATE jobs SET dl_retry_count = dl_retry_count + 1 WHERE id = ? \
             RETURNING dl_retry_count",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Increment `state_retry_count` and return the new value. Used by the
    /// file integrator before deciding whether to degrade or fail a job.
    pub async fn increment_state_retry(&self, id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "UPDATE jobs SET state_retry_count = state_retry_count + 1 WHERE id = ? \
             RETURNING state_retry_count",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn set_message_and_timeout(
        &self,
        id: i64,
        message: &str,
        timeout: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE jobs SET message = ?, cld_dl_timeout_time = ? WHERE id = ?")
            .bind(message)
            .bind(format_timestamp(timeout))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Aggregate reads (ambient dashboard contract) ──────────────────────

    pub async fn state_counts(&self) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = StateCounts::default();
        for (state, n) in rows {
            match state.as_str() {
                "found" => counts.found = n,
                "uploaded" => counts.uploaded = n,
                "in_cloud" => counts.in_cloud = n,
                "downloaded" => counts.downloaded = n,
                "cleaned" => counts.cleaned = n,
                "done" => counts.done = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    pub async fn retry_sums(&self) -> Result<RetrySums> {
        let row: (Option<i64>, Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT SUM(dl_retry_count), SUM(cld_dl_move_retry_c), SUM(state_retry_count) \
             FROM jobs",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(RetrySums {
            dl_retry_count: row.0.unwrap_or(0),
            cld_dl_move_retry_c: row.1.unwrap_or(0),
            state_retry_count: row.2.unwrap_or(0),
        })
    }

    pub async fn last_added_at(&self) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT created_at FROM jobs ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn last_done_at(&self) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT done_at FROM jobs WHERE done_at IS NOT NULL ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(v,)| Some(v)))
    }

    /// Size in bytes of the SQLite file backing this ledger, for the
    /// aggregate dashboard read.
    pub fn db_size_bytes(db_path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(db_path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    async fn open_test_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("data.db");
        let storage = Storage::new(&db_path).await.unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn insert_if_new_is_idempotent_on_full_path() {
        let (storage, _dir) = open_test_storage().await;
        let clock = SystemClock;

        let first = storage
            .insert_if_new("/blackhole/Series/A.nzb", "/Series", "A.nzb", &clock)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = storage
            .insert_if_new("/blackhole/Series/A.nzb", "/Series", "A.nzb", &clock)
            .await
            .unwrap();
        assert!(second.is_none());

        let work = storage.current_work().await.unwrap();
        assert_eq!(work.len(), 1);
    }

    #[tokio::test]
    async fn lifecycle_transitions_reach_done() {
        let (storage, _dir) = open_test_storage().await;
        let clock = SystemClock;

        let job = storage
            .insert_if_new("/blackhole/Series/A.nzb", "/Series", "A.nzb", &clock)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state(), JobState::Found);

        let now = clock.now();
        storage.mark_uploaded(job.id, "T1", now).await.unwrap();
        storage.mark_in_cloud(job.id, "F1").await.unwrap();
        storage.mark_downloaded(job.id).await.unwrap();
        storage.mark_cleaned(job.id).await.unwrap();
        storage.mark_done(job.id, now).await.unwrap();

        let updated = storage.get(job.id).await.unwrap();
        assert_eq!(updated.state(), JobState::Done);
        assert!(updated.done_at.is_some());
        assert_eq!(updated.dl_id.as_deref(), Some("T1"));
        assert_eq!(updated.dl_folder_id.as_deref(), Some("F1"));
    }

    #[tokio::test]
    async fn reset_to_found_clears_attempt_fields_and_bumps_counters() {
        let (storage, _dir) = open_test_storage().await;
        let clock = SystemClock;

        let job = storage
            .insert_if_new("/blackhole/Series/A.nzb", "/Series", "A.nzb", &clock)
            .await
            .unwrap()
            .unwrap();
        storage.mark_uploaded(job.id, "T1", clock.now()).await.unwrap();
        storage
            .set_message_and_timeout(job.id, "Moving to cloud", clock.now())
            .await
            .unwrap();

        storage.reset_to_found(job.id, true, false).await.unwrap();

        let reset = storage.get(job.id).await.unwrap();
        assert_eq!(reset.state(), JobState::Found);
        assert!(reset.dl_id.is_none());
        assert!(reset.message.is_none());
        assert!(reset.cld_dl_timeout_time.is_none());
        assert_eq!(reset.dl_retry_count, 0);
        assert_eq!(reset.cld_dl_move_retry_c, 1);
        assert_eq!(reset.state_retry_count, 0);
        // Preserved fields.
        assert_eq!(reset.full_path, "/blackhole/Series/A.nzb");
        assert_eq!(reset.category_path, "/Series");
        assert_eq!(reset.nzb_name, "A.nzb");
    }

    #[tokio::test]
    async fn increment_dl_retry_returns_new_value() {
        let (storage, _dir) = open_test_storage().await;
        let clock = SystemClock;

        let job = storage
            .insert_if_new("/blackhole/Series/A.nzb", "/Series", "A.nzb", &clock)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(storage.increment_dl_retry(job.id).await.unwrap(), 1);
        assert_eq!(storage.increment_dl_retry(job.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn state_counts_reflects_terminal_split() {
        let (storage, _dir) = open_test_storage().await;
        let clock = SystemClock;

        let a = storage
            .insert_if_new("/blackhole/A.nzb", "/", "A.nzb", &clock)
            .await
            .unwrap()
            .unwrap();
        let b = storage
            .insert_if_new("/blackhole/B.nzb", "/", "B.nzb", &clock)
            .await
            .unwrap()
            .unwrap();
        storage.mark_failed(b.id).await.unwrap();

        let counts = storage.state_counts().await.unwrap();
        assert_eq!(counts.found, 1);
        assert_eq!(counts.failed, 1);

        let terminal = storage.terminal_slice(10, 0).await.unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].id, b.id);
        let _ = a;
    }
}
