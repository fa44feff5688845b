//! ABOUTME: Durable job and execution persistence over SQLite
//! ABOUTME: Owns the atomic lock CAS, due-job queries, and statistics

use crate::status::{ExecutionStatus, IntervalType, JobStatus};
use crate::types::{
    AggregateStats, CleanupReport, CrawlJob, JobExecution, JobFilter, JobStatsReport, Metadata,
    RunDisposition, UpdateJobRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tr_core::{Error, Id, Result};
use tracing::{debug, warn};

/// Message recorded on execution rows finalized by the abandonment sweep
pub const ABANDONED_EXECUTION_ERROR: &str = "execution abandoned; lock expired before completion";

/// How many recent executions feed the per-job rolling average
const STATS_WINDOW: i64 = 20;

/// Trait for job storage operations
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job row; duplicate source_id is a conflict
    async fn insert_job(&self, job: &CrawlJob) -> Result<()>;

    /// Fetch a job by ID
    async fn get_job(&self, id: &str) -> Result<Option<CrawlJob>>;

    /// Fetch a job by its logical source key
    async fn get_job_by_source(&self, source_id: &str) -> Result<Option<CrawlJob>>;

    /// List jobs matching the filter
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<CrawlJob>>;

    /// Apply a spec update and return the updated job
    async fn update_job_spec(
        &self,
        id: &str,
        req: &UpdateJobRequest,
        now: DateTime<Utc>,
    ) -> Result<CrawlJob>;

    /// Persist control-plane fields (status, pause/cancel marks, next_run_at,
    /// retry count, error). Never touches the lock columns.
    async fn save_control_state(&self, job: &CrawlJob) -> Result<()>;

    /// Record a cancellation request on a running job. Only stamps
    /// cancelled_at; the worker holding the lock finalizes the status.
    async fn mark_cancel_requested(&self, job_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Delete a job and (by cascade) its executions
    async fn delete_job(&self, id: &str) -> Result<()>;

    /// Non-terminal jobs holding a next_run_at, for bucket map rebuild
    async fn list_schedulable_jobs(&self) -> Result<Vec<CrawlJob>>;

    /// Due jobs: enabled, unpaused, claimable status, next_run_at <= now,
    /// unlocked; ordered by next_run_at ascending, bounded by limit
    async fn list_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<CrawlJob>>;

    /// Atomic lock claim. Succeeds iff the row is unlocked or its lock is
    /// older than the TTL; on success the row becomes running under `token`.
    async fn try_acquire_lock(
        &self,
        job_id: &str,
        token: &str,
        now: DateTime<Utc>,
        lock_ttl: Duration,
    ) -> Result<bool>;

    /// Clear the lock iff `token` still holds it
    async fn release_lock(&self, job_id: &str, token: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Clear every lock acquired before `older_than`, returning the count.
    /// Rows left running by a dead worker return to scheduled so the next
    /// poll can claim them.
    async fn clear_stale_locks(&self, older_than: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<u64>;

    /// Apply a run outcome and release the lock in one statement, iff `token`
    /// still holds the lock. Returns false on token mismatch.
    async fn update_after_run(
        &self,
        job_id: &str,
        token: &str,
        now: DateTime<Utc>,
        disposition: &RunDisposition,
    ) -> Result<bool>;

    /// Insert a new execution row, allocating the next execution_number
    async fn create_execution(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
        retry_attempt: u32,
        executed_on: Option<String>,
    ) -> Result<JobExecution>;

    /// Persist the mutable fields of an execution row
    async fn update_execution(&self, execution: &JobExecution) -> Result<()>;

    /// Fetch one execution by ID
    async fn get_execution(&self, id: &str) -> Result<Option<JobExecution>>;

    /// Executions for a job, newest first
    async fn list_executions(
        &self,
        job_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobExecution>>;

    /// Per-job statistics
    async fn job_stats(&self, job_id: &str) -> Result<JobStatsReport>;

    /// Store-wide statistics for the metrics aggregator
    async fn aggregate_stats(&self, now: DateTime<Utc>) -> Result<AggregateStats>;

    /// Retention sweep: finalize abandoned running executions and delete old
    /// history beyond the age/keep-per-job policy
    async fn cleanup_executions(
        &self,
        now: DateTime<Utc>,
        retention_days: u32,
        keep_per_job: u32,
        abandoned_after: Duration,
    ) -> Result<CleanupReport>;
}

/// SQLite implementation of the job store
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Create a new store over an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a store over a database handle
    pub fn from_db(db: &tr_db::Db) -> Self {
        Self::new(db.pool().clone())
    }

    /// Convert database row to CrawlJob
    fn row_to_job(&self, row: sqlx::sqlite::SqliteRow) -> Result<CrawlJob> {
        let status_str: String = row.get("status");
        let interval_type_str: String = row.get("interval_type");

        let metadata_str: String = row.get("metadata");
        let metadata: Metadata = serde_json::from_str(&metadata_str).unwrap_or_default();

        Ok(CrawlJob {
            id: row.get("id"),
            source_id: row.get("source_id"),
            source_name: row.get("source_name"),
            url: row.get("url"),
            interval_minutes: row.get("interval_minutes"),
            interval_type: IntervalType::parse(&interval_type_str)?,
            next_run_at: parse_opt_timestamp(row.get("next_run_at"), "next_run_at")?,
            schedule_enabled: row.get::<i64, _>("schedule_enabled") != 0,
            status: JobStatus::parse(&status_str)?,
            is_paused: row.get::<i64, _>("is_paused") != 0,
            paused_at: parse_opt_timestamp(row.get("paused_at"), "paused_at")?,
            cancelled_at: parse_opt_timestamp(row.get("cancelled_at"), "cancelled_at")?,
            max_retries: row.get::<i64, _>("max_retries") as u32,
            retry_backoff_seconds: row.get("retry_backoff_seconds"),
            current_retry_count: row.get::<i64, _>("current_retry_count") as u32,
            lock_token: row.get("lock_token"),
            lock_acquired_at: parse_opt_timestamp(row.get("lock_acquired_at"), "lock_acquired_at")?,
            created_at: parse_timestamp(row.get("created_at"), "created_at")?,
            updated_at: parse_timestamp(row.get("updated_at"), "updated_at")?,
            started_at: parse_opt_timestamp(row.get("started_at"), "started_at")?,
            completed_at: parse_opt_timestamp(row.get("completed_at"), "completed_at")?,
            error_message: row.get("error_message"),
            metadata,
        })
    }

    /// Convert database row to JobExecution
    fn row_to_execution(&self, row: sqlx::sqlite::SqliteRow) -> Result<JobExecution> {
        let status_str: String = row.get("status");

        let metadata_str: String = row.get("metadata");
        let metadata: Metadata = serde_json::from_str(&metadata_str).unwrap_or_default();

        Ok(JobExecution {
            id: row.get("id"),
            job_id: row.get("job_id"),
            execution_number: row.get("execution_number"),
            status: ExecutionStatus::parse(&status_str)?,
            started_at: parse_timestamp(row.get("started_at"), "started_at")?,
            completed_at: parse_opt_timestamp(row.get("completed_at"), "completed_at")?,
            duration_ms: row.get("duration_ms"),
            items_crawled: row.get("items_crawled"),
            items_indexed: row.get("items_indexed"),
            error_message: row.get("error_message"),
            stack_trace: row.get("stack_trace"),
            retry_attempt: row.get::<i64, _>("retry_attempt") as u32,
            executed_on: row.get("executed_on"),
            metadata,
        })
    }
}

fn parse_timestamp(value: String, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("Invalid {} timestamp: {}", field, e)))
}

fn parse_opt_timestamp(value: Option<String>, field: &str) -> Result<Option<DateTime<Utc>>> {
    value.map(|s| parse_timestamp(s, field)).transpose()
}

fn to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn to_db_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(to_db)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_job(&self, job: &CrawlJob) -> Result<()> {
        debug!(job_id = %job.id, source_id = %job.source_id, "Inserting job");

        let metadata_json = serde_json::to_string(&job.metadata).map_err(|e| {
            Error::Validation(format!("Failed to serialize metadata: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO crawl_jobs (
                id, source_id, source_name, url,
                interval_minutes, interval_type, next_run_at, schedule_enabled,
                status, is_paused, paused_at, cancelled_at,
                max_retries, retry_backoff_seconds, current_retry_count,
                lock_token, lock_acquired_at,
                created_at, updated_at, started_at, completed_at,
                error_message, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.source_id)
        .bind(&job.source_name)
        .bind(&job.url)
        .bind(job.interval_minutes)
        .bind(job.interval_type.as_str())
        .bind(to_db_opt(job.next_run_at))
        .bind(job.schedule_enabled as i32)
        .bind(job.status.as_str())
        .bind(job.is_paused as i32)
        .bind(to_db_opt(job.paused_at))
        .bind(to_db_opt(job.cancelled_at))
        .bind(job.max_retries as i64)
        .bind(job.retry_backoff_seconds)
        .bind(job.current_retry_count as i64)
        .bind(&job.lock_token)
        .bind(to_db_opt(job.lock_acquired_at))
        .bind(to_db(job.created_at))
        .bind(to_db(job.updated_at))
        .bind(to_db_opt(job.started_at))
        .bind(to_db_opt(job.completed_at))
        .bind(&job.error_message)
        .bind(&metadata_json)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .map_or(false, |d| d.is_unique_violation())
            {
                Error::Conflict(format!(
                    "A job for source {} already exists",
                    job.source_id
                ))
            } else {
                Error::Database(format!("Failed to insert job: {}", e))
            }
        })?;

        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<CrawlJob>> {
        let row = sqlx::query("SELECT * FROM crawl_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get job: {}", e)))?;

        row.map(|r| self.row_to_job(r)).transpose()
    }

    async fn get_job_by_source(&self, source_id: &str) -> Result<Option<CrawlJob>> {
        let row = sqlx::query("SELECT * FROM crawl_jobs WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get job by source: {}", e)))?;

        row.map(|r| self.row_to_job(r)).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<CrawlJob>> {
        let mut query = "SELECT * FROM crawl_jobs WHERE 1=1".to_string();
        let mut params: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            params.push(status.as_str().to_string());
        }
        if let Some(enabled) = filter.schedule_enabled {
            query.push_str(" AND schedule_enabled = ?");
            params.push(if enabled { "1" } else { "0" }.to_string());
        }
        if let Some(ref source_id) = filter.source_id {
            query.push_str(" AND source_id = ?");
            params.push(source_id.clone());
        }

        query.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {}", limit));
            if let Some(offset) = filter.offset {
                query.push_str(&format!(" OFFSET {}", offset));
            }
        }

        let mut db_query = sqlx::query(&query);
        for param in &params {
            db_query = db_query.bind(param);
        }

        let rows = db_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list jobs: {}", e)))?;

        rows.into_iter().map(|r| self.row_to_job(r)).collect()
    }

    async fn update_job_spec(
        &self,
        id: &str,
        req: &UpdateJobRequest,
        now: DateTime<Utc>,
    ) -> Result<CrawlJob> {
        let mut job = self
            .get_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Job not found: {}", id)))?;

        if let Some(ref source_name) = req.source_name {
            job.source_name = source_name.clone();
        }
        if let Some(ref url) = req.url {
            job.url = url.clone();
        }
        if let Some(minutes) = req.interval_minutes {
            job.interval_minutes = Some(minutes);
        }
        if let Some(interval_type) = req.interval_type {
            job.interval_type = interval_type;
        }
        if let Some(enabled) = req.schedule_enabled {
            job.schedule_enabled = enabled;
        }
        if let Some(max_retries) = req.max_retries {
            job.max_retries = max_retries;
        }
        if let Some(backoff) = req.retry_backoff_seconds {
            job.retry_backoff_seconds = backoff;
        }
        if let Some(ref metadata) = req.metadata {
            job.metadata = metadata.clone();
        }
        job.updated_at = now;

        let metadata_json = serde_json::to_string(&job.metadata).map_err(|e| {
            Error::Validation(format!("Failed to serialize metadata: {}", e))
        })?;

        sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET source_name = ?, url = ?, interval_minutes = ?, interval_type = ?,
                schedule_enabled = ?, max_retries = ?, retry_backoff_seconds = ?,
                metadata = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.source_name)
        .bind(&job.url)
        .bind(job.interval_minutes)
        .bind(job.interval_type.as_str())
        .bind(job.schedule_enabled as i32)
        .bind(job.max_retries as i64)
        .bind(job.retry_backoff_seconds)
        .bind(&metadata_json)
        .bind(to_db(now))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update job: {}", e)))?;

        Ok(job)
    }

    async fn save_control_state(&self, job: &CrawlJob) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = ?, is_paused = ?, paused_at = ?, cancelled_at = ?,
                next_run_at = ?, current_retry_count = ?, error_message = ?,
                schedule_enabled = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.is_paused as i32)
        .bind(to_db_opt(job.paused_at))
        .bind(to_db_opt(job.cancelled_at))
        .bind(to_db_opt(job.next_run_at))
        .bind(job.current_retry_count as i64)
        .bind(&job.error_message)
        .bind(job.schedule_enabled as i32)
        .bind(to_db(job.updated_at))
        .bind(&job.id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to save control state: {}", e)))?;

        Ok(())
    }

    async fn mark_cancel_requested(&self, job_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE crawl_jobs SET cancelled_at = ?, updated_at = ? WHERE id = ?")
            .bind(to_db(now))
            .bind(to_db(now))
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to mark cancel requested: {}", e)))?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM crawl_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete job: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Job not found: {}", id)));
        }

        debug!(job_id = %id, "Deleted job");
        Ok(())
    }

    async fn list_schedulable_jobs(&self) -> Result<Vec<CrawlJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM crawl_jobs
            WHERE status NOT IN ('completed', 'failed', 'cancelled')
              AND next_run_at IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list schedulable jobs: {}", e)))?;

        rows.into_iter().map(|r| self.row_to_job(r)).collect()
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<CrawlJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM crawl_jobs
            WHERE schedule_enabled = 1
              AND is_paused = 0
              AND status IN ('pending', 'scheduled')
              AND next_run_at IS NOT NULL
              AND next_run_at <= ?
              AND lock_token IS NULL
            ORDER BY next_run_at ASC
            LIMIT ?
            "#,
        )
        .bind(to_db(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list due jobs: {}", e)))?;

        rows.into_iter().map(|r| self.row_to_job(r)).collect()
    }

    async fn try_acquire_lock(
        &self,
        job_id: &str,
        token: &str,
        now: DateTime<Utc>,
        lock_ttl: Duration,
    ) -> Result<bool> {
        let stale_before = now - lock_ttl;

        // Single conditional update; any check-then-set split here would
        // reintroduce the double-execution race.
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET lock_token = ?, lock_acquired_at = ?, status = 'running',
                started_at = ?, updated_at = ?
            WHERE id = ?
              AND (lock_token IS NULL OR lock_acquired_at < ?)
            "#,
        )
        .bind(token)
        .bind(to_db(now))
        .bind(to_db(now))
        .bind(to_db(now))
        .bind(job_id)
        .bind(to_db(stale_before))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to acquire lock: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, job_id: &str, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET lock_token = NULL, lock_acquired_at = NULL, updated_at = ?
            WHERE id = ? AND lock_token = ?
            "#,
        )
        .bind(to_db(now))
        .bind(job_id)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to release lock: {}", e)))?;

        let released = result.rows_affected() > 0;
        if !released {
            warn!(job_id = %job_id, "Lock token no longer current, not releasing");
        }
        Ok(released)
    }

    async fn clear_stale_locks(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        // A row left running by a dead worker goes back to scheduled so the
        // next poll can claim it; its next_run_at is already in the past.
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET lock_token = NULL, lock_acquired_at = NULL,
                status = CASE WHEN status = 'running' THEN 'scheduled' ELSE status END,
                updated_at = ?
            WHERE lock_token IS NOT NULL AND lock_acquired_at < ?
            "#,
        )
        .bind(to_db(now))
        .bind(to_db(older_than))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to clear stale locks: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn update_after_run(
        &self,
        job_id: &str,
        token: &str,
        now: DateTime<Utc>,
        disposition: &RunDisposition,
    ) -> Result<bool> {
        let result = match disposition {
            RunDisposition::Success { next_run_at } => {
                let status = if next_run_at.is_some() {
                    JobStatus::Scheduled
                } else {
                    JobStatus::Completed
                };
                sqlx::query(
                    r#"
                    UPDATE crawl_jobs
                    SET status = ?, next_run_at = ?, current_retry_count = 0,
                        completed_at = ?, error_message = NULL,
                        lock_token = NULL, lock_acquired_at = NULL, updated_at = ?
                    WHERE id = ? AND lock_token = ?
                    "#,
                )
                .bind(status.as_str())
                .bind(to_db_opt(*next_run_at))
                .bind(to_db(now))
                .bind(to_db(now))
                .bind(job_id)
                .bind(token)
                .execute(&self.pool)
                .await
            }
            RunDisposition::RetryScheduled {
                retry_count,
                next_run_at,
                error,
            } => {
                sqlx::query(
                    r#"
                    UPDATE crawl_jobs
                    SET status = 'scheduled', next_run_at = ?, current_retry_count = ?,
                        completed_at = ?, error_message = ?,
                        lock_token = NULL, lock_acquired_at = NULL, updated_at = ?
                    WHERE id = ? AND lock_token = ?
                    "#,
                )
                .bind(to_db(*next_run_at))
                .bind(*retry_count as i64)
                .bind(to_db(now))
                .bind(error)
                .bind(to_db(now))
                .bind(job_id)
                .bind(token)
                .execute(&self.pool)
                .await
            }
            RunDisposition::FailedTerminal { retry_count, error } => {
                sqlx::query(
                    r#"
                    UPDATE crawl_jobs
                    SET status = 'failed', next_run_at = NULL, current_retry_count = ?,
                        completed_at = ?, error_message = ?,
                        lock_token = NULL, lock_acquired_at = NULL, updated_at = ?
                    WHERE id = ? AND lock_token = ?
                    "#,
                )
                .bind(*retry_count as i64)
                .bind(to_db(now))
                .bind(error)
                .bind(to_db(now))
                .bind(job_id)
                .bind(token)
                .execute(&self.pool)
                .await
            }
            RunDisposition::Cancelled => {
                sqlx::query(
                    r#"
                    UPDATE crawl_jobs
                    SET status = 'cancelled', next_run_at = NULL, cancelled_at = ?,
                        completed_at = ?,
                        lock_token = NULL, lock_acquired_at = NULL, updated_at = ?
                    WHERE id = ? AND lock_token = ?
                    "#,
                )
                .bind(to_db(now))
                .bind(to_db(now))
                .bind(to_db(now))
                .bind(job_id)
                .bind(token)
                .execute(&self.pool)
                .await
            }
        };

        let result =
            result.map_err(|e| Error::Database(format!("Failed to finalize run: {}", e)))?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_execution(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
        retry_attempt: u32,
        executed_on: Option<String>,
    ) -> Result<JobExecution> {
        let id = Id::new().to_string();

        // The caller holds the job lock, so the per-job max is stable here.
        sqlx::query(
            r#"
            INSERT INTO job_executions (
                id, job_id, execution_number, status, started_at,
                items_crawled, items_indexed, retry_attempt, executed_on, metadata
            ) VALUES (
                ?, ?,
                (SELECT COALESCE(MAX(execution_number), 0) + 1
                 FROM job_executions WHERE job_id = ?),
                'running', ?, 0, 0, ?, ?, '{}'
            )
            "#,
        )
        .bind(&id)
        .bind(job_id)
        .bind(job_id)
        .bind(to_db(now))
        .bind(retry_attempt as i64)
        .bind(&executed_on)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create execution: {}", e)))?;

        self.get_execution(&id).await?.ok_or_else(|| {
            Error::Database(format!("Execution {} vanished after insert", id))
        })
    }

    async fn update_execution(&self, execution: &JobExecution) -> Result<()> {
        let metadata_json = serde_json::to_string(&execution.metadata).map_err(|e| {
            Error::Validation(format!("Failed to serialize metadata: {}", e))
        })?;

        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = ?, completed_at = ?, duration_ms = ?,
                items_crawled = ?, items_indexed = ?,
                error_message = ?, stack_trace = ?, metadata = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(to_db_opt(execution.completed_at))
        .bind(execution.duration_ms)
        .bind(execution.items_crawled)
        .bind(execution.items_indexed)
        .bind(&execution.error_message)
        .bind(&execution.stack_trace)
        .bind(&metadata_json)
        .bind(&execution.id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update execution: {}", e)))?;

        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<JobExecution>> {
        let row = sqlx::query("SELECT * FROM job_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get execution: {}", e)))?;

        row.map(|r| self.row_to_execution(r)).transpose()
    }

    async fn list_executions(
        &self,
        job_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM job_executions
            WHERE job_id = ?
            ORDER BY execution_number DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(job_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list executions: {}", e)))?;

        rows.into_iter().map(|r| self.row_to_execution(r)).collect()
    }

    async fn job_stats(&self, job_id: &str) -> Result<JobStatsReport> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Job not found: {}", job_id)))?;

        let counts = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS successes,
                   COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failures,
                   COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0) AS cancelled,
                   MAX(started_at) AS last_run
            FROM job_executions WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get job stats: {}", e)))?;

        let total = counts.get::<i64, _>("total") as u64;
        let successes = counts.get::<i64, _>("successes") as u64;
        let failures = counts.get::<i64, _>("failures") as u64;
        let cancelled = counts.get::<i64, _>("cancelled") as u64;
        let last_run_at = parse_opt_timestamp(counts.get("last_run"), "last_run")?;

        let last_success_row = sqlx::query(
            "SELECT MAX(completed_at) AS last_success FROM job_executions \
             WHERE job_id = ? AND status = 'completed'",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get job stats: {}", e)))?;
        let last_success_at =
            parse_opt_timestamp(last_success_row.get("last_success"), "last_success")?;

        let avg_row = sqlx::query(
            r#"
            SELECT AVG(duration_ms) AS avg_ms FROM (
                SELECT duration_ms FROM job_executions
                WHERE job_id = ? AND duration_ms IS NOT NULL
                ORDER BY execution_number DESC
                LIMIT ?
            )
            "#,
        )
        .bind(job_id)
        .bind(STATS_WINDOW)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get job stats: {}", e)))?;
        let avg_duration_ms: Option<f64> = avg_row.get("avg_ms");

        let finished = successes + failures;
        let success_rate = if finished == 0 {
            0.0
        } else {
            successes as f64 / finished as f64
        };

        Ok(JobStatsReport {
            job_id: job_id.to_string(),
            total_executions: total,
            successful_executions: successes,
            failed_executions: failures,
            cancelled_executions: cancelled,
            success_rate,
            avg_duration_ms,
            last_run_at,
            last_success_at,
            next_run_at: job.next_run_at,
        })
    }

    async fn aggregate_stats(&self, now: DateTime<Utc>) -> Result<AggregateStats> {
        let status_rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM crawl_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get aggregate stats: {}", e)))?;

        let mut jobs_by_status = BTreeMap::new();
        let mut total_jobs = 0u64;
        for row in status_rows {
            let status: String = row.get("status");
            let count = row.get::<i64, _>("count") as u64;
            total_jobs += count;
            jobs_by_status.insert(status, count);
        }
        let running_jobs = jobs_by_status.get("running").copied().unwrap_or(0);

        let today = to_db(now);
        let today_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS executions,
                   COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failures
            FROM job_executions WHERE DATE(started_at) = DATE(?)
            "#,
        )
        .bind(&today)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get aggregate stats: {}", e)))?;

        let executions_today = today_row.get::<i64, _>("executions") as u64;
        let failures_today = today_row.get::<i64, _>("failures") as u64;

        let avg_row = sqlx::query(
            r#"
            SELECT AVG(duration_ms) AS avg_ms FROM (
                SELECT duration_ms FROM job_executions
                WHERE duration_ms IS NOT NULL
                ORDER BY started_at DESC
                LIMIT 100
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get aggregate stats: {}", e)))?;
        let avg_duration_ms: Option<f64> = avg_row.get("avg_ms");

        Ok(AggregateStats {
            jobs_by_status,
            total_jobs,
            running_jobs,
            executions_today,
            failures_today,
            avg_duration_ms,
        })
    }

    async fn cleanup_executions(
        &self,
        now: DateTime<Utc>,
        retention_days: u32,
        keep_per_job: u32,
        abandoned_after: Duration,
    ) -> Result<CleanupReport> {
        // Finalize executions orphaned by a stale-lock takeover: still
        // running, started long ago, and their job is no longer locked.
        let abandoned_cutoff = now - abandoned_after;
        let abandoned = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = 'failed', completed_at = ?, error_message = ?
            WHERE status = 'running'
              AND started_at < ?
              AND job_id IN (SELECT id FROM crawl_jobs WHERE lock_token IS NULL)
            "#,
        )
        .bind(to_db(now))
        .bind(ABANDONED_EXECUTION_ERROR)
        .bind(to_db(abandoned_cutoff))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to finalize abandoned executions: {}", e)))?;

        // Age out old history, always keeping the most recent rows per job
        let age_cutoff = now - Duration::days(retention_days as i64);
        let deleted = sqlx::query(
            r#"
            DELETE FROM job_executions
            WHERE started_at < ?
              AND status != 'running'
              AND id NOT IN (
                  SELECT id FROM (
                      SELECT id, ROW_NUMBER() OVER (
                          PARTITION BY job_id ORDER BY execution_number DESC
                      ) AS rn
                      FROM job_executions
                  ) WHERE rn <= ?
              )
            "#,
        )
        .bind(to_db(age_cutoff))
        .bind(keep_per_job as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to cleanup executions: {}", e)))?;

        let report = CleanupReport {
            deleted: deleted.rows_affected(),
            abandoned_finalized: abandoned.rows_affected(),
        };
        if report.deleted > 0 || report.abandoned_finalized > 0 {
            debug!(
                deleted = report.deleted,
                abandoned = report.abandoned_finalized,
                "Execution retention sweep"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CreateJobRequest;
    use chrono::TimeZone;

    async fn test_store() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("store_test.db");
        let db = tr_db::Db::new(path.to_str().unwrap())
            .await
            .expect("Failed to create test database");
        (dir, SqliteJobStore::new(db.pool().clone()))
    }

    fn test_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn scheduled_job(source: &str, next_run_at: DateTime<Utc>, now: DateTime<Utc>) -> CrawlJob {
        let mut job = CreateJobRequest::new(
            source.to_string(),
            format!("{} feed", source),
            format!("https://example.com/{}", source),
        )
        .with_interval_minutes(30)
        .into_job(now);
        job.status = JobStatus::Scheduled;
        job.next_run_at = Some(next_run_at);
        job
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let mut job = scheduled_job("src-1", now, now);
        job.metadata
            .insert("category".to_string(), serde_json::json!("news"));
        store.insert_job(&job).await.expect("insert should succeed");

        let found = store
            .get_job(&job.id)
            .await
            .expect("get should succeed")
            .expect("job should exist");

        assert_eq!(found.source_id, "src-1");
        assert_eq!(found.status, JobStatus::Scheduled);
        assert_eq!(found.next_run_at, Some(now));
        assert_eq!(found.interval_minutes, Some(30));
        assert_eq!(found.metadata["category"], serde_json::json!("news"));
        assert!(found.lock_token.is_none());

        let by_source = store
            .get_job_by_source("src-1")
            .await
            .unwrap()
            .expect("lookup by source should find the job");
        assert_eq!(by_source.id, job.id);
    }

    #[tokio::test]
    async fn test_duplicate_source_is_conflict() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        store
            .insert_job(&scheduled_job("src-1", now, now))
            .await
            .unwrap();
        let err = store
            .insert_job(&scheduled_job("src-1", now, now))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_due_filters() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        // Due exactly now (boundary: counts as due)
        store
            .insert_job(&scheduled_job("due-now", now, now))
            .await
            .unwrap();
        // Due earlier
        store
            .insert_job(&scheduled_job(
                "due-earlier",
                now - Duration::minutes(10),
                now,
            ))
            .await
            .unwrap();
        // Future
        store
            .insert_job(&scheduled_job("future", now + Duration::minutes(10), now))
            .await
            .unwrap();
        // Paused
        let mut paused = scheduled_job("paused", now - Duration::minutes(5), now);
        paused.status = JobStatus::Paused;
        paused.is_paused = true;
        store.insert_job(&paused).await.unwrap();
        // Cancelled
        let mut cancelled = scheduled_job("cancelled", now - Duration::minutes(5), now);
        cancelled.status = JobStatus::Cancelled;
        store.insert_job(&cancelled).await.unwrap();
        // Locked
        let mut locked = scheduled_job("locked", now - Duration::minutes(5), now);
        locked.lock_token = Some("tok".to_string());
        locked.lock_acquired_at = Some(now);
        store.insert_job(&locked).await.unwrap();
        // Disabled
        let mut disabled = scheduled_job("disabled", now - Duration::minutes(5), now);
        disabled.schedule_enabled = false;
        store.insert_job(&disabled).await.unwrap();

        let due = store.list_due(now, 10).await.unwrap();
        let sources: Vec<_> = due.iter().map(|j| j.source_id.as_str()).collect();
        assert_eq!(sources, vec!["due-earlier", "due-now"]);

        // Limit caps the batch
        let due = store.list_due(now, 1).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].source_id, "due-earlier");
    }

    #[tokio::test]
    async fn test_lock_cas_contention() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();

        let ttl = Duration::minutes(5);
        let first = store
            .try_acquire_lock(&job.id, "token-a", now, ttl)
            .await
            .unwrap();
        assert!(first);

        // Second claimant loses
        let second = store
            .try_acquire_lock(&job.id, "token-b", now, ttl)
            .await
            .unwrap();
        assert!(!second);

        let locked = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(locked.lock_token.as_deref(), Some("token-a"));
        assert_eq!(locked.status, JobStatus::Running);
        assert!(locked.started_at.is_some());
        assert!(locked.lock_acquired_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_lock_takeover() {
        let (_dir, store) = test_store().await;
        let now = test_now();
        let ttl = Duration::minutes(5);

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();

        assert!(store
            .try_acquire_lock(&job.id, "token-a", now, ttl)
            .await
            .unwrap());

        // Within the TTL the lock holds
        let later = now + Duration::minutes(4);
        assert!(!store
            .try_acquire_lock(&job.id, "token-b", later, ttl)
            .await
            .unwrap());

        // Past the TTL a new claimant may take over
        let much_later = now + Duration::minutes(6);
        assert!(store
            .try_acquire_lock(&job.id, "token-b", much_later, ttl)
            .await
            .unwrap());

        let stolen = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stolen.lock_token.as_deref(), Some("token-b"));
    }

    #[tokio::test]
    async fn test_release_lock_requires_matching_token() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();
        store
            .try_acquire_lock(&job.id, "token-a", now, Duration::minutes(5))
            .await
            .unwrap();

        assert!(!store.release_lock(&job.id, "token-b", now).await.unwrap());
        let still_locked = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(still_locked.lock_token.as_deref(), Some("token-a"));

        assert!(store.release_lock(&job.id, "token-a", now).await.unwrap());
        let released = store.get_job(&job.id).await.unwrap().unwrap();
        assert!(released.lock_token.is_none());
        assert!(released.lock_acquired_at.is_none());
    }

    #[tokio::test]
    async fn test_clear_stale_locks() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();
        store
            .try_acquire_lock(&job.id, "token-a", now, Duration::minutes(5))
            .await
            .unwrap();

        // Fresh lock survives
        let cleared = store
            .clear_stale_locks(now - Duration::minutes(5), now)
            .await
            .unwrap();
        assert_eq!(cleared, 0);

        // Stale lock is reclaimed and the row returns to scheduled
        let later = now + Duration::minutes(6);
        let cleared = store
            .clear_stale_locks(later - Duration::minutes(5), later)
            .await
            .unwrap();
        assert_eq!(cleared, 1);

        let recovered = store.get_job(&job.id).await.unwrap().unwrap();
        assert!(recovered.lock_token.is_none());
        assert_eq!(recovered.status, JobStatus::Scheduled);

        // Immediately sweeping again is a no-op
        let cleared = store
            .clear_stale_locks(later + Duration::seconds(1), later)
            .await
            .unwrap();
        assert_eq!(cleared, 0);
    }

    #[tokio::test]
    async fn test_update_after_run_success_recurring() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let mut job = scheduled_job("src-1", now, now);
        job.current_retry_count = 2;
        job.error_message = Some("old failure".to_string());
        store.insert_job(&job).await.unwrap();
        store
            .try_acquire_lock(&job.id, "token-a", now, Duration::minutes(5))
            .await
            .unwrap();

        let next = now + Duration::minutes(30);
        let owned = store
            .update_after_run(
                &job.id,
                "token-a",
                now + Duration::seconds(3),
                &RunDisposition::Success {
                    next_run_at: Some(next),
                },
            )
            .await
            .unwrap();
        assert!(owned);

        let updated = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Scheduled);
        assert_eq!(updated.next_run_at, Some(next));
        assert_eq!(updated.current_retry_count, 0);
        assert!(updated.error_message.is_none());
        assert!(updated.lock_token.is_none());
        assert!(updated.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_after_run_one_shot_completes() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let mut job = scheduled_job("src-1", now, now);
        job.interval_minutes = None;
        store.insert_job(&job).await.unwrap();
        store
            .try_acquire_lock(&job.id, "token-a", now, Duration::minutes(5))
            .await
            .unwrap();

        store
            .update_after_run(
                &job.id,
                "token-a",
                now,
                &RunDisposition::Success { next_run_at: None },
            )
            .await
            .unwrap();

        let updated = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Completed);
        assert!(updated.next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_update_after_run_retry_and_terminal() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();
        store
            .try_acquire_lock(&job.id, "token-a", now, Duration::minutes(5))
            .await
            .unwrap();

        let retry_at = now + Duration::seconds(60);
        store
            .update_after_run(
                &job.id,
                "token-a",
                now,
                &RunDisposition::RetryScheduled {
                    retry_count: 1,
                    next_run_at: retry_at,
                    error: "fetch failed".to_string(),
                },
            )
            .await
            .unwrap();

        let retried = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Scheduled);
        assert_eq!(retried.current_retry_count, 1);
        assert_eq!(retried.next_run_at, Some(retry_at));
        assert_eq!(retried.error_message.as_deref(), Some("fetch failed"));

        // Exhausted retries
        store
            .try_acquire_lock(&job.id, "token-b", now, Duration::minutes(5))
            .await
            .unwrap();
        store
            .update_after_run(
                &job.id,
                "token-b",
                now,
                &RunDisposition::FailedTerminal {
                    retry_count: 4,
                    error: "still failing".to_string(),
                },
            )
            .await
            .unwrap();

        let failed = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.next_run_at.is_none());
        assert_eq!(failed.current_retry_count, 4);
    }

    #[tokio::test]
    async fn test_update_after_run_token_mismatch() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();
        store
            .try_acquire_lock(&job.id, "token-a", now, Duration::minutes(5))
            .await
            .unwrap();

        let owned = store
            .update_after_run(
                &job.id,
                "stolen-token",
                now,
                &RunDisposition::Success { next_run_at: None },
            )
            .await
            .unwrap();
        assert!(!owned);

        // The row is untouched
        let job_row = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job_row.status, JobStatus::Running);
        assert_eq!(job_row.lock_token.as_deref(), Some("token-a"));
    }

    #[tokio::test]
    async fn test_update_after_run_cancelled() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let mut job = scheduled_job("src-1", now, now);
        job.current_retry_count = 2;
        store.insert_job(&job).await.unwrap();
        store
            .try_acquire_lock(&job.id, "token-a", now, Duration::minutes(5))
            .await
            .unwrap();

        store
            .update_after_run(&job.id, "token-a", now, &RunDisposition::Cancelled)
            .await
            .unwrap();

        let cancelled = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert!(cancelled.next_run_at.is_none());
        // Cancellation never touches the retry counter
        assert_eq!(cancelled.current_retry_count, 2);
    }

    #[tokio::test]
    async fn test_execution_numbers_increase() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();

        let first = store
            .create_execution(&job.id, now, 0, Some("host:1".to_string()))
            .await
            .unwrap();
        let second = store
            .create_execution(&job.id, now + Duration::minutes(30), 0, None)
            .await
            .unwrap();

        assert_eq!(first.execution_number, 1);
        assert_eq!(second.execution_number, 2);
        assert_eq!(first.status, ExecutionStatus::Running);
        assert_eq!(first.executed_on.as_deref(), Some("host:1"));
        assert_eq!(first.retry_attempt, 0);
    }

    #[tokio::test]
    async fn test_execution_update_and_listing() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();

        let mut execution = store.create_execution(&job.id, now, 0, None).await.unwrap();
        execution.complete_success(now + Duration::milliseconds(2500), 25, 23);
        store.update_execution(&execution).await.unwrap();

        let fetched = store
            .get_execution(&execution.id)
            .await
            .unwrap()
            .expect("execution should exist");
        assert_eq!(fetched.status, ExecutionStatus::Completed);
        assert_eq!(fetched.duration_ms, Some(2500));
        assert_eq!(fetched.items_crawled, 25);
        assert_eq!(fetched.items_indexed, 23);
        assert!(fetched.completed_at.unwrap() >= fetched.started_at);

        // Newest first, with offset paging
        store
            .create_execution(&job.id, now + Duration::minutes(30), 0, None)
            .await
            .unwrap();
        let page = store.list_executions(&job.id, 1, 0).await.unwrap();
        assert_eq!(page[0].execution_number, 2);
        let page = store.list_executions(&job.id, 1, 1).await.unwrap();
        assert_eq!(page[0].execution_number, 1);
    }

    #[tokio::test]
    async fn test_job_stats() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();

        let mut success = store.create_execution(&job.id, now, 0, None).await.unwrap();
        success.complete_success(now + Duration::seconds(2), 10, 9);
        store.update_execution(&success).await.unwrap();

        let mut failure = store
            .create_execution(&job.id, now + Duration::minutes(30), 0, None)
            .await
            .unwrap();
        failure.complete_failure(
            now + Duration::minutes(30) + Duration::seconds(4),
            "boom".to_string(),
            None,
        );
        store.update_execution(&failure).await.unwrap();

        let stats = store.job_stats(&job.id).await.unwrap();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.cancelled_executions, 0);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.avg_duration_ms, Some(3000.0));
        assert!(stats.last_run_at.is_some());
        assert!(stats.last_success_at.is_some());
        assert_eq!(stats.next_run_at, Some(now));

        assert!(matches!(
            store.job_stats("missing").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_aggregate_stats() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        store
            .insert_job(&scheduled_job("src-1", now, now))
            .await
            .unwrap();
        let mut failed = scheduled_job("src-2", now, now);
        failed.status = JobStatus::Failed;
        store.insert_job(&failed).await.unwrap();

        let stats = store.aggregate_stats(now).await.unwrap();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.jobs_by_status.get("scheduled"), Some(&1));
        assert_eq!(stats.jobs_by_status.get("failed"), Some(&1));
        assert_eq!(stats.running_jobs, 0);
        assert_eq!(stats.executions_today, 0);
    }

    #[tokio::test]
    async fn test_cleanup_finalizes_abandoned_and_ages_out() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();

        // An execution abandoned by a crashed worker (job no longer locked)
        let abandoned = store
            .create_execution(&job.id, now - Duration::minutes(20), 0, None)
            .await
            .unwrap();

        // Ancient finished history beyond retention
        let mut ancient = store
            .create_execution(&job.id, now - Duration::days(60), 0, None)
            .await
            .unwrap();
        ancient.complete_success(now - Duration::days(60) + Duration::seconds(1), 1, 1);
        store.update_execution(&ancient).await.unwrap();

        let report = store
            .cleanup_executions(now, 30, 1, Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(report.abandoned_finalized, 1);
        let finalized = store.get_execution(&abandoned.id).await.unwrap().unwrap();
        assert_eq!(finalized.status, ExecutionStatus::Failed);
        assert_eq!(
            finalized.error_message.as_deref(),
            Some(ABANDONED_EXECUTION_ERROR)
        );

        assert_eq!(report.deleted, 1);
        assert!(store.get_execution(&ancient.id).await.unwrap().is_none());

        // Sweep is idempotent
        let again = store
            .cleanup_executions(now, 30, 1, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(again, CleanupReport::default());
    }

    #[tokio::test]
    async fn test_save_control_state_leaves_lock_alone() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();
        store
            .try_acquire_lock(&job.id, "token-a", now, Duration::minutes(5))
            .await
            .unwrap();

        let mut current = store.get_job(&job.id).await.unwrap().unwrap();
        current.cancelled_at = Some(now);
        current.updated_at = now;
        store.save_control_state(&current).await.unwrap();

        let after = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(after.cancelled_at, Some(now));
        assert_eq!(after.lock_token.as_deref(), Some("token-a"));
    }

    #[tokio::test]
    async fn test_update_job_spec_and_delete() {
        let (_dir, store) = test_store().await;
        let now = test_now();

        let job = scheduled_job("src-1", now, now);
        store.insert_job(&job).await.unwrap();

        let req = UpdateJobRequest {
            interval_minutes: Some(60),
            max_retries: Some(5),
            ..Default::default()
        };
        let updated = store
            .update_job_spec(&job.id, &req, now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(updated.interval_minutes, Some(60));
        assert_eq!(updated.max_retries, 5);
        assert_eq!(updated.updated_at, now + Duration::seconds(1));

        store.delete_job(&job.id).await.unwrap();
        assert!(store.get_job(&job.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_job(&job.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
