//! ABOUTME: Interval-based crawl job scheduler with load-balanced placement
//! ABOUTME: Coordinates execution across instances via database-backed locks

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tr_core::Result;

pub mod buckets;
pub mod metrics;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod types;
pub mod worker;

pub use buckets::{BucketMap, DistributionReport, RebalanceReport, SLOT_SECONDS};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scheduler::{CrawlScheduler, SchedulerConfig};
pub use status::{retry_backoff, ExecutionStatus, IntervalType, JobStatus};
pub use store::{JobStore, SqliteJobStore};
pub use types::{
    AggregateStats, CleanupReport, CrawlJob, CreateJobRequest, JobExecution, JobFilter,
    JobStatsReport, RunDisposition, UpdateJobRequest,
};
pub use worker::ProgressTracker;

/// Counts reported by a finished crawl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlOutcome {
    pub items_crawled: u64,
    pub items_indexed: u64,
}

/// Callback invoked by the runner with cumulative (items_crawled, items_indexed)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Trait for the external crawler that jobs invoke
///
/// Implementations must observe the cancellation token: a cancelled run
/// should return `Error::Cancelled` promptly rather than finishing the crawl.
#[async_trait]
pub trait CrawlerRunner: Send + Sync {
    /// Crawl the named source, reporting progress along the way
    async fn run(
        &self,
        cancel: CancellationToken,
        source_name: &str,
        progress: ProgressFn,
    ) -> Result<CrawlOutcome>;
}

/// Source of opaque lock tokens
pub trait TokenGenerator: Send + Sync {
    /// Produce a fresh unique token
    fn generate(&self) -> String;
}

/// UUIDv4 token generator (122 bits of entropy)
#[derive(Debug, Clone, Default)]
pub struct UuidTokenGenerator;

impl TokenGenerator for UuidTokenGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Identity of this scheduler instance, recorded on executions
pub fn instance_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_tokens_are_unique() {
        let gen = UuidTokenGenerator;
        let a = gen.generate();
        let b = gen.generate();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_instance_identity_includes_pid() {
        let id = instance_identity();
        assert!(id.contains(':'));
        assert!(id.ends_with(&std::process::id().to_string()));
    }
}
