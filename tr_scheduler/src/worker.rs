//! ABOUTME: Execution worker: drives one locked job through a crawl run
//! ABOUTME: Tracks progress, finalizes the execution, and reschedules the job

use crate::buckets::BucketMap;
use crate::scheduler::ActiveJobs;
use crate::status::retry_backoff;
use crate::store::JobStore;
use crate::types::RunDisposition;
use crate::{instance_identity, CrawlerRunner, ProgressFn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tr_core::{Clock, Error, Result};
use tr_events::{CrawlEvent, EventPublisher};
use tracing::{debug, error, info, warn};

/// Emit a progress event after this many new items...
const PROGRESS_ITEMS_DELTA: u64 = 10;
/// ...or after this much time since the last emission, whichever comes first
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Decides when cumulative crawl progress is worth emitting.
///
/// Construction counts as the first emission, so a run that produces its
/// first few items immediately does not spam the sink.
pub struct ProgressTracker {
    min_items_delta: u64,
    min_interval: Duration,
    last_items: u64,
    last_emit: Instant,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_thresholds(PROGRESS_ITEMS_DELTA, PROGRESS_MIN_INTERVAL)
    }

    pub fn with_thresholds(min_items_delta: u64, min_interval: Duration) -> Self {
        Self {
            min_items_delta,
            min_interval,
            last_items: 0,
            last_emit: Instant::now(),
        }
    }

    /// Whether to emit for this progress sample; updates the baseline when true
    pub fn should_emit(&mut self, items_crawled: u64) -> bool {
        let items_advanced =
            items_crawled.saturating_sub(self.last_items) >= self.min_items_delta;
        let time_elapsed = self.last_emit.elapsed() >= self.min_interval;

        if items_advanced || time_elapsed {
            self.last_items = items_crawled;
            self.last_emit = Instant::now();
            true
        } else {
            false
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Collaborators a worker needs for one run
pub(crate) struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub runner: Arc<dyn CrawlerRunner>,
    pub clock: Arc<dyn Clock>,
    pub publisher: Arc<EventPublisher>,
    pub buckets: Arc<BucketMap>,
    pub active_jobs: ActiveJobs,
}

/// Run one job to completion under the given lock token, then deregister.
///
/// Errors inside the run never escape: a failed store call leaves the lock in
/// place for the stale-lock sweep to recover, and the worker simply exits.
pub(crate) async fn run_job(
    ctx: WorkerContext,
    job_id: String,
    token: String,
    cancel: CancellationToken,
) {
    if let Err(e) = execute(&ctx, &job_id, &token, &cancel).await {
        // The lock stays put; stale-lock recovery returns the job to the pool
        warn!(job_id = %job_id, error = %e, "Worker aborted before finalizing");
    }
    ctx.active_jobs.lock().await.remove(&job_id);
}

async fn execute(
    ctx: &WorkerContext,
    job_id: &str,
    token: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let job = ctx
        .store
        .get_job(job_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Job disappeared before run: {}", job_id)))?;

    let started = ctx.clock.now();
    let mut execution = ctx
        .store
        .create_execution(
            job_id,
            started,
            job.current_retry_count,
            Some(instance_identity()),
        )
        .await?;

    debug!(
        job_id = %job_id,
        execution = execution.execution_number,
        source = %job.source_name,
        "Starting crawl"
    );
    ctx.publisher
        .publish(CrawlEvent::JobStatus {
            job_id: job_id.to_string(),
            status: "running".to_string(),
            details: Some(format!("execution #{}", execution.execution_number)),
        })
        .await;

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(u64, u64)>();
    let progress: ProgressFn = Arc::new(move |items_crawled, items_indexed| {
        let _ = progress_tx.send((items_crawled, items_indexed));
    });

    let run_fut = ctx.runner.run(cancel.clone(), &job.source_name, progress);
    tokio::pin!(run_fut);

    let mut tracker = ProgressTracker::new();
    let run_result = loop {
        tokio::select! {
            result = &mut run_fut => break result,
            Some((items_crawled, items_indexed)) = progress_rx.recv() => {
                execution.items_crawled = items_crawled as i64;
                execution.items_indexed = items_indexed as i64;
                if tracker.should_emit(items_crawled) {
                    if let Err(e) = ctx.store.update_execution(&execution).await {
                        warn!(job_id = %job_id, error = %e, "Failed to persist progress");
                    }
                    ctx.publisher
                        .publish(CrawlEvent::JobProgress {
                            job_id: job_id.to_string(),
                            execution_id: execution.id.clone(),
                            items_crawled,
                            items_indexed,
                        })
                        .await;
                }
            }
        }
    };

    let finished = ctx.clock.now();
    let disposition = if cancel.is_cancelled()
        || matches!(run_result, Err(ref e) if e.is_cancelled())
    {
        execution.complete_cancelled(finished);
        RunDisposition::Cancelled
    } else {
        match run_result {
            Ok(outcome) => {
                execution.complete_success(
                    finished,
                    outcome.items_crawled as i64,
                    outcome.items_indexed as i64,
                );
                let next_run_at = job.interval().map(|interval| {
                    ctx.buckets
                        .next_run_preserving_rhythm(job_id, interval, finished)
                });
                RunDisposition::Success { next_run_at }
            }
            Err(e) => {
                let message = e.to_string();
                execution.complete_failure(finished, message.clone(), Some(format!("{:?}", e)));
                let retry_count = job.current_retry_count + 1;
                if retry_count <= job.max_retries {
                    let backoff = retry_backoff(job.retry_backoff_seconds, retry_count);
                    RunDisposition::RetryScheduled {
                        retry_count,
                        next_run_at: finished + backoff,
                        error: message,
                    }
                } else {
                    RunDisposition::FailedTerminal {
                        retry_count,
                        error: message,
                    }
                }
            }
        }
    };

    // The execution row is ours even if the lock was stolen meanwhile
    ctx.store.update_execution(&execution).await?;

    let owned = ctx
        .store
        .update_after_run(job_id, token, finished, &disposition)
        .await?;

    if owned {
        // Keep the in-process placement aligned with what was persisted
        match &disposition {
            RunDisposition::Success {
                next_run_at: Some(_),
            } => {} // the rhythm advance above already moved the slot
            RunDisposition::Success { next_run_at: None } => ctx.buckets.remove(job_id),
            RunDisposition::RetryScheduled { next_run_at, .. } => {
                ctx.buckets.record_existing(job_id, *next_run_at)
            }
            RunDisposition::FailedTerminal { .. } | RunDisposition::Cancelled => {
                ctx.buckets.remove(job_id)
            }
        }

        info!(
            job_id = %job_id,
            execution = execution.execution_number,
            status = %execution.status,
            duration_ms = execution.duration_ms.unwrap_or(0),
            "Crawl finished"
        );
    } else {
        // Stale-lock recovery handed the job to a new owner while we ran.
        // The execution record above is preserved; scheduling state is not
        // ours to touch anymore.
        error!(
            job_id = %job_id,
            execution = execution.execution_number,
            "Lock token no longer current; leaving job state to its new owner"
        );
        ctx.buckets.remove(job_id);
    }

    ctx.publisher
        .publish(CrawlEvent::JobCompleted {
            job_id: job_id.to_string(),
            execution_id: execution.id.clone(),
            status: execution.status.as_str().to_string(),
            duration_ms: execution.duration_ms.unwrap_or(0).max(0) as u64,
            items_indexed: execution.items_indexed.max(0) as u64,
            error: execution.error_message.clone(),
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_emits_on_item_delta() {
        let mut tracker = ProgressTracker::with_thresholds(10, Duration::from_secs(3600));

        assert!(!tracker.should_emit(5));
        assert!(!tracker.should_emit(9));
        assert!(tracker.should_emit(10));
        // Baseline moved to 10
        assert!(!tracker.should_emit(15));
        assert!(tracker.should_emit(20));
    }

    #[test]
    fn test_tracker_emits_on_elapsed_time() {
        let mut tracker = ProgressTracker::with_thresholds(1000, Duration::from_millis(5));

        assert!(!tracker.should_emit(1));
        std::thread::sleep(Duration::from_millis(10));
        assert!(tracker.should_emit(2));
        // Timer reset by the emission
        assert!(!tracker.should_emit(3));
    }

    #[test]
    fn test_tracker_item_counter_never_goes_backwards() {
        let mut tracker = ProgressTracker::with_thresholds(10, Duration::from_secs(3600));

        assert!(tracker.should_emit(50));
        // A runner re-reporting lower counts must not underflow
        assert!(!tracker.should_emit(45));
        assert!(tracker.should_emit(60));
    }
}
