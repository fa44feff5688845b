//! ABOUTME: Core data types for crawl jobs and their execution history
//! ABOUTME: Entities, request structs, filters, and statistics payloads

use crate::status::{ExecutionStatus, IntervalType, JobStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tr_core::{Error, Id, Result};

/// Opaque key-value metadata carried on jobs and executions
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A recurring (or one-shot) crawl job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    /// Unique job identifier
    pub id: String,

    /// Logical key: the source this job crawls (unique across jobs)
    pub source_id: String,

    /// Human-readable source name, passed to the crawler
    pub source_name: String,

    /// Source URL
    pub url: String,

    /// Interval magnitude in minutes; None means run-once-immediate
    pub interval_minutes: Option<i64>,

    /// Unit the interval was entered in (magnitude is always minutes)
    pub interval_type: IntervalType,

    /// When the job next becomes due (UTC)
    pub next_run_at: Option<DateTime<Utc>>,

    /// Whether the scheduler may pick this job up
    pub schedule_enabled: bool,

    /// Lifecycle status
    pub status: JobStatus,

    /// Mirror of the paused state, kept for indexed due-queries
    pub is_paused: bool,

    pub paused_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Maximum retry attempts after a failure
    pub max_retries: u32,

    /// Base for the exponential backoff, in seconds
    pub retry_backoff_seconds: i64,

    /// Consecutive failures so far (reset on success)
    pub current_retry_count: u32,

    /// Opaque lock token; present iff lock_acquired_at is present
    pub lock_token: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Last failure message, cleared on success
    pub error_message: Option<String>,

    /// Opaque metadata blob
    pub metadata: Metadata,
}

impl CrawlJob {
    /// Whether this job reschedules after a successful run
    pub fn is_recurring(&self) -> bool {
        self.interval_minutes.is_some()
    }

    /// Effective interval as a duration, when recurring
    pub fn interval(&self) -> Option<Duration> {
        self.interval_minutes.map(Duration::minutes)
    }
}

/// Request to create a new crawl job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub source_id: String,
    pub source_name: String,
    pub url: String,
    pub interval_minutes: Option<i64>,
    pub interval_type: IntervalType,
    pub schedule_enabled: bool,
    pub max_retries: u32,
    pub retry_backoff_seconds: i64,
    pub metadata: Metadata,
}

impl CreateJobRequest {
    /// Create a request with defaults (3 retries, 60 s backoff base)
    pub fn new(source_id: String, source_name: String, url: String) -> Self {
        Self {
            source_id,
            source_name,
            url,
            interval_minutes: None,
            interval_type: IntervalType::Minutes,
            schedule_enabled: true,
            max_retries: 3,
            retry_backoff_seconds: 60,
            metadata: Metadata::new(),
        }
    }

    /// Builder method to set the interval
    pub fn with_interval_minutes(mut self, minutes: i64) -> Self {
        self.interval_minutes = Some(minutes);
        self
    }

    /// Builder method to set the interval unit
    pub fn with_interval_type(mut self, interval_type: IntervalType) -> Self {
        self.interval_type = interval_type;
        self
    }

    /// Builder method to enable or disable scheduling
    pub fn with_schedule_enabled(mut self, enabled: bool) -> Self {
        self.schedule_enabled = enabled;
        self
    }

    /// Builder method to set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder method to set the backoff base
    pub fn with_retry_backoff_seconds(mut self, seconds: i64) -> Self {
        self.retry_backoff_seconds = seconds;
        self
    }

    /// Builder method to attach metadata
    pub fn with_metadata(mut self, key: String, value: serde_json::Value) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Validate the request
    pub fn validate(&self) -> Result<()> {
        if self.source_id.is_empty() {
            return Err(Error::Validation("source_id cannot be empty".to_string()));
        }
        if self.source_name.is_empty() {
            return Err(Error::Validation(
                "source_name cannot be empty".to_string(),
            ));
        }
        if self.url.is_empty() {
            return Err(Error::Validation("url cannot be empty".to_string()));
        }
        if let Some(minutes) = self.interval_minutes {
            if minutes <= 0 {
                return Err(Error::Validation(format!(
                    "interval must be positive, got {}",
                    minutes
                )));
            }
        }
        if self.retry_backoff_seconds < 1 {
            return Err(Error::Validation(
                "retry_backoff_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Materialize a job row from this request
    pub fn into_job(self, now: DateTime<Utc>) -> CrawlJob {
        CrawlJob {
            id: Id::new().to_string(),
            source_id: self.source_id,
            source_name: self.source_name,
            url: self.url,
            interval_minutes: self.interval_minutes,
            interval_type: self.interval_type,
            next_run_at: None,
            schedule_enabled: self.schedule_enabled,
            status: JobStatus::Pending,
            is_paused: false,
            paused_at: None,
            cancelled_at: None,
            max_retries: self.max_retries,
            retry_backoff_seconds: self.retry_backoff_seconds,
            current_retry_count: 0,
            lock_token: None,
            lock_acquired_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            metadata: self.metadata,
        }
    }
}

/// Request to update an existing job's spec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateJobRequest {
    pub source_name: Option<String>,
    pub url: Option<String>,
    pub interval_minutes: Option<i64>,
    pub interval_type: Option<IntervalType>,
    pub schedule_enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_backoff_seconds: Option<i64>,
    pub metadata: Option<Metadata>,
}

impl UpdateJobRequest {
    pub fn validate(&self) -> Result<()> {
        if let Some(minutes) = self.interval_minutes {
            if minutes <= 0 {
                return Err(Error::Validation(format!(
                    "interval must be positive, got {}",
                    minutes
                )));
            }
        }
        if let Some(seconds) = self.retry_backoff_seconds {
            if seconds < 1 {
                return Err(Error::Validation(
                    "retry_backoff_seconds must be at least 1".to_string(),
                ));
            }
        }
        if matches!(&self.source_name, Some(name) if name.is_empty()) {
            return Err(Error::Validation(
                "source_name cannot be empty".to_string(),
            ));
        }
        if matches!(&self.url, Some(url) if url.is_empty()) {
            return Err(Error::Validation("url cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Listing filter for jobs
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub schedule_enabled: Option<bool>,
    pub source_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// One attempt to run a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,

    /// 1-based, strictly increasing per job
    pub execution_number: i64,

    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Wall-clock duration, derived at completion
    pub duration_ms: Option<i64>,

    pub items_crawled: i64,
    pub items_indexed: i64,

    pub error_message: Option<String>,
    pub stack_trace: Option<String>,

    /// 0 for the first try of a generation
    pub retry_attempt: u32,

    /// hostname:pid of the executing instance
    pub executed_on: Option<String>,

    pub metadata: Metadata,
}

impl JobExecution {
    /// Mark this execution completed and derive its duration
    pub fn complete_success(&mut self, now: DateTime<Utc>, items_crawled: i64, items_indexed: i64) {
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.items_crawled = items_crawled;
        self.items_indexed = items_indexed;
    }

    /// Mark this execution failed
    pub fn complete_failure(
        &mut self,
        now: DateTime<Utc>,
        error: String,
        stack_trace: Option<String>,
    ) {
        self.status = ExecutionStatus::Failed;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.error_message = Some(error);
        self.stack_trace = stack_trace;
    }

    /// Mark this execution cancelled
    pub fn complete_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Cancelled;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}

/// How a finished run updates the job row.
///
/// Applied by the store in a single token-guarded statement so the status
/// change, retry bookkeeping, reschedule, and lock release are atomic.
#[derive(Debug, Clone, PartialEq)]
pub enum RunDisposition {
    /// Run succeeded; recurring jobs carry their next slot, one-shots None
    Success { next_run_at: Option<DateTime<Utc>> },
    /// Run failed with retries remaining
    RetryScheduled {
        retry_count: u32,
        next_run_at: DateTime<Utc>,
        error: String,
    },
    /// Run failed and the retry budget is exhausted
    FailedTerminal { retry_count: u32, error: String },
    /// Run was cancelled; retry counter untouched, no reschedule
    Cancelled,
}

/// Per-job execution statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatsReport {
    pub job_id: String,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    /// Fraction of finished executions that succeeded, in [0, 1]
    pub success_rate: f64,
    /// Average duration over the most recent window of executions
    pub avg_duration_ms: Option<f64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Store-wide statistics consumed by the metrics aggregator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub jobs_by_status: BTreeMap<String, u64>,
    pub total_jobs: u64,
    pub running_jobs: u64,
    pub executions_today: u64,
    pub failures_today: u64,
    pub avg_duration_ms: Option<f64>,
}

/// Result of an execution-history retention sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Rows deleted by the age/keep-per-job policy
    pub deleted: u64,
    /// Abandoned `running` rows finalized as failed
    pub abandoned_finalized: u64,
}
