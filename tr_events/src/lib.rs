//! ABOUTME: Event publishing for job status, progress, and completion
//! ABOUTME: Best-effort emission to pluggable sinks; failures never propagate

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub mod sinks;

pub use sinks::{MemorySink, TracingSink};

/// Result type for event operations
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors that can occur while publishing events
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Events emitted by the scheduler on behalf of jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrawlEvent {
    /// A job changed status (scheduled, running, paused, ...)
    JobStatus {
        job_id: String,
        status: String,
        details: Option<String>,
    },
    /// Incremental crawl progress from a running execution
    JobProgress {
        job_id: String,
        execution_id: String,
        items_crawled: u64,
        items_indexed: u64,
    },
    /// A run finished, successfully or not
    JobCompleted {
        job_id: String,
        execution_id: String,
        status: String,
        duration_ms: u64,
        items_indexed: u64,
        error: Option<String>,
    },
}

impl CrawlEvent {
    /// The job this event concerns
    pub fn job_id(&self) -> &str {
        match self {
            Self::JobStatus { job_id, .. }
            | Self::JobProgress { job_id, .. }
            | Self::JobCompleted { job_id, .. } => job_id,
        }
    }

    /// Event kind for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobStatus { .. } => "job_status",
            Self::JobProgress { .. } => "job_progress",
            Self::JobCompleted { .. } => "job_completed",
        }
    }
}

/// Destination for crawl events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event
    async fn publish(&self, event: &CrawlEvent) -> Result<()>;

    /// Sink name for logging/debugging
    fn name(&self) -> &str;
}

/// Best-effort event publisher.
///
/// Sink failures are logged and swallowed: a broken event pipeline must never
/// fail a job. The global enabled flag exists so tests can silence emission.
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    enabled: AtomicBool,
}

impl EventPublisher {
    /// Create a publisher over the given sink
    pub fn new(sink: Arc<dyn EventSink>, enabled: bool) -> Self {
        Self {
            sink,
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Toggle event emission globally
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether emission is currently enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Publish an event, logging (never returning) any sink failure
    pub async fn publish(&self, event: CrawlEvent) {
        if !self.is_enabled() {
            debug!(kind = event.kind(), job_id = event.job_id(), "Event emission disabled, dropping");
            return;
        }

        if let Err(e) = self.sink.publish(&event).await {
            warn!(
                sink = self.sink.name(),
                kind = event.kind(),
                job_id = event.job_id(),
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publisher_delivers_to_sink() {
        let sink = Arc::new(MemorySink::new());
        let publisher = EventPublisher::new(sink.clone(), true);

        publisher
            .publish(CrawlEvent::JobStatus {
                job_id: "job-1".to_string(),
                status: "scheduled".to_string(),
                details: None,
            })
            .await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_id(), "job-1");
    }

    #[tokio::test]
    async fn test_disabled_publisher_drops_events() {
        let sink = Arc::new(MemorySink::new());
        let publisher = EventPublisher::new(sink.clone(), false);

        publisher
            .publish(CrawlEvent::JobProgress {
                job_id: "job-1".to_string(),
                execution_id: "exec-1".to_string(),
                items_crawled: 10,
                items_indexed: 9,
            })
            .await;

        assert!(sink.events().is_empty());

        publisher.set_enabled(true);
        publisher
            .publish(CrawlEvent::JobProgress {
                job_id: "job-1".to_string(),
                execution_id: "exec-1".to_string(),
                items_crawled: 20,
                items_indexed: 18,
            })
            .await;
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_propagate() {
        struct FailingSink;

        #[async_trait]
        impl EventSink for FailingSink {
            async fn publish(&self, _event: &CrawlEvent) -> Result<()> {
                Err(EventError::SinkUnavailable("connection refused".to_string()))
            }

            fn name(&self) -> &str {
                "failing"
            }
        }

        let publisher = EventPublisher::new(Arc::new(FailingSink), true);

        // Must not panic or error
        publisher
            .publish(CrawlEvent::JobCompleted {
                job_id: "job-1".to_string(),
                execution_id: "exec-1".to_string(),
                status: "completed".to_string(),
                duration_ms: 2500,
                items_indexed: 23,
                error: None,
            })
            .await;
    }

    #[test]
    fn test_event_serialization() {
        let event = CrawlEvent::JobCompleted {
            job_id: "job-1".to_string(),
            execution_id: "exec-1".to_string(),
            status: "completed".to_string(),
            duration_ms: 1234,
            items_indexed: 7,
            error: None,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"job_completed\""));

        let back: CrawlEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
