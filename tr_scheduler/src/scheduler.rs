//! ABOUTME: Scheduler loop: polls due jobs, claims locks, dispatches workers
//! ABOUTME: Also exposes the control surface used by the HTTP layer

use crate::buckets::{BucketMap, DistributionReport, RebalanceCandidate, RebalanceReport};
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::status::JobStatus;
use crate::store::JobStore;
use crate::types::{
    CrawlJob, CreateJobRequest, JobExecution, JobFilter, JobStatsReport, UpdateJobRequest,
};
use crate::worker::{run_job, WorkerContext};
use crate::{CrawlerRunner, TokenGenerator};
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tr_core::{Clock, Error, Result};
use tr_events::{CrawlEvent, EventPublisher};
use tracing::{debug, info, warn};

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the poll tick looks for due jobs
    pub check_interval: Duration,
    /// Maximum due jobs claimed per poll
    pub batch_size: u32,
    /// Lock TTL; locks older than this are stale. Keep it at least twice the
    /// realistic P99 job duration or a slow job will be double-executed.
    pub lock_duration: ChronoDuration,
    /// How often the stale-lock sweep runs
    pub stale_lock_check_interval: Duration,
    /// How often aggregate metrics are refreshed
    pub metrics_interval: Duration,
    /// How often execution history retention runs
    pub retention_interval: Duration,
    /// Days of execution history to keep
    pub retention_days: u32,
    /// Most-recent executions always kept per job
    pub retention_keep_per_job: u32,
    /// How long `stop` waits for in-flight workers
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            batch_size: 50,
            lock_duration: ChronoDuration::minutes(5),
            stale_lock_check_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(30),
            retention_interval: Duration::from_secs(3600),
            retention_days: 30,
            retention_keep_per_job: 100,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// A worker currently executing, with its cancellation handle
pub(crate) struct ActiveJob {
    pub cancel: CancellationToken,
    pub handle: Option<JoinHandle<()>>,
}

pub(crate) type ActiveJobs = Arc<Mutex<HashMap<String, ActiveJob>>>;

struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    runner: Arc<dyn CrawlerRunner>,
    clock: Arc<dyn Clock>,
    publisher: Arc<EventPublisher>,
    token_gen: Arc<dyn TokenGenerator>,
    buckets: Arc<BucketMap>,
    metrics: Arc<MetricsRegistry>,
    active_jobs: ActiveJobs,
}

/// The crawl scheduler: owns the job catalog, decides when jobs run, and
/// coordinates execution with sibling instances through row locks.
///
/// All collaborators are injected; there are no globals. Multiple instances
/// may share one store — the lock CAS keeps them from colliding.
pub struct CrawlScheduler {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CrawlScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        runner: Arc<dyn CrawlerRunner>,
        clock: Arc<dyn Clock>,
        publisher: Arc<EventPublisher>,
        token_gen: Arc<dyn TokenGenerator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                runner,
                clock,
                publisher,
                token_gen,
                buckets: Arc::new(BucketMap::new()),
                metrics: Arc::new(MetricsRegistry::new()),
                active_jobs: Arc::new(Mutex::new(HashMap::new())),
            }),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild the bucket map from the store and launch the periodic tasks
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;

        let jobs = inner.store.list_schedulable_jobs().await?;
        for job in &jobs {
            if let Some(next_run_at) = job.next_run_at {
                inner.buckets.record_existing(&job.id, next_run_at);
            }
        }
        info!(jobs = jobs.len(), "Bucket map rebuilt from store");

        let mut tasks = self.tasks.lock().await;

        let poll_inner = inner.clone();
        let poll_shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_inner.config.check_interval);
            loop {
                tokio::select! {
                    _ = poll_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = poll_inner.poll_tick(&poll_shutdown).await {
                            warn!(error = %e, "Poll tick failed; will retry next tick");
                        }
                    }
                }
            }
        }));

        let stale_inner = inner.clone();
        let stale_shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(stale_inner.config.stale_lock_check_interval);
            loop {
                tokio::select! {
                    _ = stale_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = stale_inner.stale_lock_tick().await {
                            warn!(error = %e, "Stale-lock sweep failed; will retry next tick");
                        }
                    }
                }
            }
        }));

        let metrics_inner = inner.clone();
        let metrics_shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(metrics_inner.config.metrics_interval);
            loop {
                tokio::select! {
                    _ = metrics_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = metrics_inner.metrics_tick().await {
                            warn!(error = %e, "Metrics refresh failed; will retry next tick");
                        }
                    }
                }
            }
        }));

        let retention_inner = inner.clone();
        let retention_shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention_inner.config.retention_interval);
            loop {
                tokio::select! {
                    _ = retention_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = retention_inner.retention_tick().await {
                            warn!(error = %e, "Retention sweep failed; will retry next tick");
                        }
                    }
                }
            }
        }));

        info!("Scheduler started");
        Ok(())
    }

    /// Cancel the periodic tasks and wait for in-flight workers
    pub async fn stop(&self, grace: Duration) {
        info!("Stopping scheduler");
        self.shutdown.cancel();

        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut active = self.inner.active_jobs.lock().await;
            active
                .values_mut()
                .filter_map(|job| job.handle.take())
                .collect()
        };

        if !handles.is_empty() {
            info!(workers = handles.len(), "Waiting for workers to finalize");
            let drain = futures_util::future::join_all(handles);
            if tokio::time::timeout(grace, drain).await.is_err() {
                // Workers past the grace keep their locks; if the process
                // exits before they finish, stale-lock recovery reschedules
                // the jobs.
                warn!("Shutdown grace elapsed with workers still running");
            }
        }

        info!("Scheduler stopped");
    }

    /// Trigger one poll pass immediately (tests and manual kicks)
    pub async fn poll_now(&self) -> Result<()> {
        self.inner.poll_tick(&self.shutdown).await
    }

    /// Trigger one stale-lock sweep immediately
    pub async fn sweep_stale_locks_now(&self) -> Result<u64> {
        self.inner.stale_lock_tick().await
    }

    // --- control surface -------------------------------------------------

    /// Create a job. Recurring enabled jobs are placed into the least-loaded
    /// slot; one-shots become due immediately.
    pub async fn create_job(&self, req: CreateJobRequest) -> Result<CrawlJob> {
        req.validate()?;

        let inner = &self.inner;
        if inner.store.get_job_by_source(&req.source_id).await?.is_some() {
            return Err(Error::Conflict(format!(
                "A job for source {} already exists",
                req.source_id
            )));
        }

        let now = inner.clock.now();
        let mut job = req.into_job(now);

        if job.schedule_enabled {
            match job.interval() {
                Some(interval) => {
                    job.status = JobStatus::Scheduled;
                    job.next_run_at =
                        Some(inner.buckets.place_new(&job.id, Some(interval), now));
                }
                None => {
                    // Run-once-immediate: due as of now, no placement needed
                    job.next_run_at = Some(now);
                }
            }
        }

        if let Err(e) = inner.store.insert_job(&job).await {
            inner.buckets.remove(&job.id);
            return Err(e);
        }

        info!(
            job_id = %job.id,
            source_id = %job.source_id,
            next_run_at = ?job.next_run_at,
            "Created job"
        );
        inner
            .publisher
            .publish(CrawlEvent::JobStatus {
                job_id: job.id.clone(),
                status: job.status.as_str().to_string(),
                details: Some("created".to_string()),
            })
            .await;

        Ok(job)
    }

    /// Fetch a job or fail with NotFound
    pub async fn get_job(&self, id: &str) -> Result<CrawlJob> {
        self.inner
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Job not found: {}", id)))
    }

    /// List jobs matching the filter
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<CrawlJob>> {
        self.inner.store.list_jobs(filter).await
    }

    /// Update a job's spec; an interval change re-places the job
    pub async fn update_job(&self, id: &str, req: &UpdateJobRequest) -> Result<CrawlJob> {
        req.validate()?;

        let inner = &self.inner;
        let before = self.get_job(id).await?;
        let now = inner.clock.now();
        let mut job = inner.store.update_job_spec(id, req, now).await?;

        let interval_changed = before.interval_minutes != job.interval_minutes;
        if interval_changed && job.status.is_schedulable() && job.schedule_enabled {
            if let Some(interval) = job.interval() {
                job.next_run_at = Some(inner.buckets.place_new(&job.id, Some(interval), now));
                job.updated_at = now;
                inner.store.save_control_state(&job).await?;
            }
        }

        Ok(job)
    }

    /// Delete a job; running jobs must be cancelled first
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        let job = self.get_job(id).await?;
        if job.status == JobStatus::Running {
            return Err(Error::Conflict(format!(
                "Job {} is running; cancel it before deleting",
                id
            )));
        }

        self.inner.store.delete_job(id).await?;
        self.inner.buckets.remove(id);
        Ok(())
    }

    /// Suspend a scheduled job
    pub async fn pause_job(&self, id: &str) -> Result<CrawlJob> {
        let inner = &self.inner;
        let mut job = self.get_job(id).await?;
        job.status.ensure_transition(JobStatus::Paused)?;

        let now = inner.clock.now();
        job.status = JobStatus::Paused;
        job.is_paused = true;
        job.paused_at = Some(now);
        job.updated_at = now;
        inner.store.save_control_state(&job).await?;
        inner.buckets.remove(&job.id);

        info!(job_id = %job.id, "Paused job");
        inner
            .publisher
            .publish(CrawlEvent::JobStatus {
                job_id: job.id.clone(),
                status: job.status.as_str().to_string(),
                details: None,
            })
            .await;
        Ok(job)
    }

    /// Resume a paused job with a freshly computed next_run_at
    pub async fn resume_job(&self, id: &str) -> Result<CrawlJob> {
        let inner = &self.inner;
        let mut job = self.get_job(id).await?;
        job.status.ensure_transition(JobStatus::Scheduled)?;

        let now = inner.clock.now();
        job.status = JobStatus::Scheduled;
        job.is_paused = false;
        job.paused_at = None;
        job.next_run_at = Some(inner.buckets.place_new(&job.id, job.interval(), now));
        job.updated_at = now;
        inner.store.save_control_state(&job).await?;

        info!(job_id = %job.id, next_run_at = ?job.next_run_at, "Resumed job");
        inner
            .publisher
            .publish(CrawlEvent::JobStatus {
                job_id: job.id.clone(),
                status: job.status.as_str().to_string(),
                details: None,
            })
            .await;
        Ok(job)
    }

    /// Cancel a job. A running job is signalled and finalized by its worker;
    /// anything else transitions directly.
    pub async fn cancel_job(&self, id: &str) -> Result<CrawlJob> {
        let inner = &self.inner;
        let mut job = self.get_job(id).await?;
        let now = inner.clock.now();

        if job.status == JobStatus::Running {
            inner.store.mark_cancel_requested(&job.id, now).await?;
            job.cancelled_at = Some(now);
            job.updated_at = now;

            let active = inner.active_jobs.lock().await;
            if let Some(active_job) = active.get(&job.id) {
                active_job.cancel.cancel();
                info!(job_id = %job.id, "Cancellation signalled to worker");
            } else {
                // Running under another scheduler instance; its stale-lock
                // recovery or completion path will observe cancelled_at
                warn!(job_id = %job.id, "Job is running on another instance");
            }
            return Ok(job);
        }

        job.status.ensure_transition(JobStatus::Cancelled)?;
        job.status = JobStatus::Cancelled;
        job.cancelled_at = Some(now);
        job.is_paused = false;
        job.next_run_at = None;
        job.updated_at = now;
        inner.store.save_control_state(&job).await?;
        inner.buckets.remove(&job.id);

        info!(job_id = %job.id, "Cancelled job");
        inner
            .publisher
            .publish(CrawlEvent::JobStatus {
                job_id: job.id.clone(),
                status: job.status.as_str().to_string(),
                details: None,
            })
            .await;
        Ok(job)
    }

    /// Re-enter a failed or cancelled job with a zeroed retry counter
    pub async fn retry_failed_job(&self, id: &str) -> Result<CrawlJob> {
        let inner = &self.inner;
        let mut job = self.get_job(id).await?;

        match job.status {
            JobStatus::Failed => {
                job.status.ensure_transition(JobStatus::Scheduled)?;
                job.status = JobStatus::Scheduled;
            }
            JobStatus::Cancelled => {
                job.status.ensure_transition(JobStatus::Pending)?;
                job.status = JobStatus::Pending;
            }
            other => {
                return Err(Error::Validation(format!(
                    "Only failed or cancelled jobs can be retried (job is {})",
                    other
                )));
            }
        }

        let now = inner.clock.now();
        job.current_retry_count = 0;
        job.error_message = None;
        job.cancelled_at = None;
        job.next_run_at = Some(now);
        job.updated_at = now;
        inner.store.save_control_state(&job).await?;
        inner.buckets.record_existing(&job.id, now);

        info!(job_id = %job.id, "Job queued for manual retry");
        inner
            .publisher
            .publish(CrawlEvent::JobStatus {
                job_id: job.id.clone(),
                status: job.status.as_str().to_string(),
                details: Some("manual retry".to_string()),
            })
            .await;
        Ok(job)
    }

    /// Executions for a job, newest first
    pub async fn list_executions(
        &self,
        job_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobExecution>> {
        self.inner.store.list_executions(job_id, limit, offset).await
    }

    /// Fetch one execution or fail with NotFound
    pub async fn get_execution(&self, id: &str) -> Result<JobExecution> {
        self.inner
            .store
            .get_execution(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Execution not found: {}", id)))
    }

    /// Per-job statistics
    pub async fn job_stats(&self, job_id: &str) -> Result<JobStatsReport> {
        self.inner.store.job_stats(job_id).await
    }

    /// Current scheduler metrics snapshot
    pub async fn scheduler_metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot().await
    }

    /// Hourly load distribution over the window
    pub fn distribution(&self, window_hours: u32) -> DistributionReport {
        self.inner
            .buckets
            .distribution(window_hours, self.inner.clock.now())
    }

    /// Even out slot load; protected/cooled-down/running jobs stay put
    pub async fn rebalance(&self, window_hours: u32) -> Result<RebalanceReport> {
        let inner = &self.inner;
        let jobs = inner.store.list_schedulable_jobs().await?;
        let candidates: Vec<RebalanceCandidate> = jobs
            .iter()
            .map(|job| RebalanceCandidate {
                job_id: job.id.clone(),
                status: job.status,
                next_run_at: job.next_run_at,
            })
            .collect();

        let now = inner.clock.now();
        let report = inner.buckets.rebalance(&candidates, window_hours, now);

        // Persist the new slots for the jobs that actually moved
        for moved in &report.moved {
            if let Some(mut job) = inner.store.get_job(&moved.job_id).await? {
                job.next_run_at = Some(moved.to);
                job.updated_at = now;
                inner.store.save_control_state(&job).await?;
            }
        }

        info!(
            moved = report.moved.len(),
            skipped = report.skipped.len(),
            score = report.score,
            "Rebalance pass complete"
        );
        Ok(report)
    }

    /// IDs of jobs currently executing in this process
    pub async fn active_job_ids(&self) -> Vec<String> {
        self.inner.active_jobs.lock().await.keys().cloned().collect()
    }
}

impl Inner {
    /// One poll pass: claim due jobs and dispatch workers
    async fn poll_tick(&self, parent: &CancellationToken) -> Result<()> {
        let now = self.clock.now();
        let due = self.store.list_due(now, self.config.batch_size).await?;
        self.metrics.record_check(now).await;

        if due.is_empty() {
            return Ok(());
        }
        debug!(due = due.len(), "Poll found due jobs");

        for job in due {
            if parent.is_cancelled() {
                break;
            }
            if self.active_jobs.lock().await.contains_key(&job.id) {
                continue;
            }

            let token = self.token_gen.generate();
            let acquired = self
                .store
                .try_acquire_lock(&job.id, &token, now, self.config.lock_duration)
                .await?;
            if !acquired {
                // Another instance won the race; not our job this tick
                debug!(job_id = %job.id, "Lock contention, skipping");
                continue;
            }

            // Per-job token, deliberately not a child of the shutdown
            // signal: stopping the scheduler must not cancel the job itself.
            // Only cancel_job fires this token.
            let cancel = CancellationToken::new();
            let ctx = WorkerContext {
                store: self.store.clone(),
                runner: self.runner.clone(),
                clock: self.clock.clone(),
                publisher: self.publisher.clone(),
                buckets: self.buckets.clone(),
                active_jobs: self.active_jobs.clone(),
            };

            // Register before the worker starts so cancellation can find it
            self.active_jobs.lock().await.insert(
                job.id.clone(),
                ActiveJob {
                    cancel: cancel.clone(),
                    handle: None,
                },
            );

            let handle = tokio::spawn(run_job(ctx, job.id.clone(), token, cancel));
            if let Some(active_job) = self.active_jobs.lock().await.get_mut(&job.id) {
                active_job.handle = Some(handle);
            }
        }

        Ok(())
    }

    /// One stale-lock sweep
    async fn stale_lock_tick(&self) -> Result<u64> {
        let now = self.clock.now();
        let cleared = self
            .store
            .clear_stale_locks(now - self.config.lock_duration, now)
            .await?;
        self.metrics.record_stale_locks_cleared(cleared);
        if cleared > 0 {
            warn!(cleared, "Cleared stale job locks");
        }
        Ok(cleared)
    }

    /// One metrics refresh
    async fn metrics_tick(&self) -> Result<()> {
        let now = self.clock.now();
        let stats = self.store.aggregate_stats(now).await?;
        self.metrics.refresh(stats, now).await;
        Ok(())
    }

    /// One retention sweep
    async fn retention_tick(&self) -> Result<()> {
        let now = self.clock.now();
        let report = self
            .store
            .cleanup_executions(
                now,
                self.config.retention_days,
                self.config.retention_keep_per_job,
                self.config.lock_duration,
            )
            .await?;
        if report.deleted > 0 || report.abandoned_finalized > 0 {
            info!(
                deleted = report.deleted,
                abandoned = report.abandoned_finalized,
                "Execution retention sweep complete"
            );
        }
        Ok(())
    }
}
