//! ABOUTME: Scheduler metrics aggregation and snapshot publication
//! ABOUTME: Refreshed periodically from store-wide statistics

use crate::types::AggregateStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Point-in-time view of scheduler health
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    /// Job counts keyed by status string
    pub jobs_by_status: BTreeMap<String, u64>,
    pub total_jobs: u64,
    pub running_jobs: u64,
    pub executions_today: u64,
    pub failures_today: u64,
    /// Average duration over the most recent executions
    pub avg_duration_ms: Option<f64>,
    /// When the poll loop last looked for due jobs
    pub last_check_at: Option<DateTime<Utc>>,
    /// Locks reclaimed by the most recent stale-lock sweep
    pub stale_locks_cleared_last: u64,
    /// Locks reclaimed since this instance started
    pub stale_locks_cleared_total: u64,
}

/// Holds the current snapshot plus counters updated outside the refresh cycle
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    snapshot: RwLock<MetricsSnapshot>,
    stale_locks_last: AtomicU64,
    stale_locks_total: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed poll pass
    pub async fn record_check(&self, at: DateTime<Utc>) {
        let mut snapshot = self.snapshot.write().await;
        snapshot.last_check_at = Some(at);
    }

    /// Record the result of one stale-lock sweep
    pub fn record_stale_locks_cleared(&self, count: u64) {
        self.stale_locks_last.store(count, Ordering::Relaxed);
        self.stale_locks_total.fetch_add(count, Ordering::Relaxed);
    }

    /// Fold fresh store-wide statistics into the snapshot
    pub async fn refresh(&self, stats: AggregateStats, at: DateTime<Utc>) {
        let mut snapshot = self.snapshot.write().await;
        let last_check_at = snapshot.last_check_at.max(Some(at));
        *snapshot = MetricsSnapshot {
            jobs_by_status: stats.jobs_by_status,
            total_jobs: stats.total_jobs,
            running_jobs: stats.running_jobs,
            executions_today: stats.executions_today,
            failures_today: stats.failures_today,
            avg_duration_ms: stats.avg_duration_ms,
            last_check_at,
            stale_locks_cleared_last: self.stale_locks_last.load(Ordering::Relaxed),
            stale_locks_cleared_total: self.stale_locks_total.load(Ordering::Relaxed),
        };
    }

    /// Current snapshot, with the live counter values merged in
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.snapshot.read().await.clone();
        snapshot.stale_locks_cleared_last = self.stale_locks_last.load(Ordering::Relaxed);
        snapshot.stale_locks_cleared_total = self.stale_locks_total.load(Ordering::Relaxed);
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refresh_and_snapshot() {
        let registry = MetricsRegistry::new();
        let now = Utc::now();

        let mut by_status = BTreeMap::new();
        by_status.insert("scheduled".to_string(), 3);
        by_status.insert("running".to_string(), 1);

        registry
            .refresh(
                AggregateStats {
                    jobs_by_status: by_status,
                    total_jobs: 4,
                    running_jobs: 1,
                    executions_today: 12,
                    failures_today: 2,
                    avg_duration_ms: Some(1500.0),
                },
                now,
            )
            .await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.total_jobs, 4);
        assert_eq!(snapshot.running_jobs, 1);
        assert_eq!(snapshot.executions_today, 12);
        assert_eq!(snapshot.jobs_by_status["scheduled"], 3);
        assert_eq!(snapshot.last_check_at, Some(now));
    }

    #[tokio::test]
    async fn test_stale_lock_counters_accumulate() {
        let registry = MetricsRegistry::new();

        registry.record_stale_locks_cleared(2);
        registry.record_stale_locks_cleared(3);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.stale_locks_cleared_last, 3);
        assert_eq!(snapshot.stale_locks_cleared_total, 5);
    }

    #[tokio::test]
    async fn test_last_check_survives_refresh() {
        let registry = MetricsRegistry::new();
        let check_at = Utc::now();

        registry.record_check(check_at).await;
        registry
            .refresh(AggregateStats::default(), check_at - chrono::Duration::seconds(10))
            .await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.last_check_at, Some(check_at));
    }
}
