//! ABOUTME: Built-in event sink adapters
//! ABOUTME: TracingSink for structured log output, MemorySink for tests

use crate::{CrawlEvent, EventSink, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

/// Sink that emits events as structured log lines.
///
/// The platform's durable sink (the publisher pipeline's stream) lives in a
/// separate service; this adapter keeps events observable when running the
/// scheduler standalone.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&self, event: &CrawlEvent) -> Result<()> {
        match event {
            CrawlEvent::JobStatus {
                job_id,
                status,
                details,
            } => {
                info!(job_id = %job_id, status = %status, details = ?details, "job status");
            }
            CrawlEvent::JobProgress {
                job_id,
                execution_id,
                items_crawled,
                items_indexed,
            } => {
                info!(
                    job_id = %job_id,
                    execution_id = %execution_id,
                    items_crawled,
                    items_indexed,
                    "job progress"
                );
            }
            CrawlEvent::JobCompleted {
                job_id,
                execution_id,
                status,
                duration_ms,
                items_indexed,
                error,
            } => {
                info!(
                    job_id = %job_id,
                    execution_id = %execution_id,
                    status = %status,
                    duration_ms,
                    items_indexed,
                    error = ?error,
                    "job completed"
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Sink that records events in memory for test assertions
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CrawlEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of all events published so far
    pub fn events(&self) -> Vec<CrawlEvent> {
        self.events.lock().expect("sink poisoned").clone()
    }

    /// Events of one kind, in publication order
    pub fn events_of_kind(&self, kind: &str) -> Vec<CrawlEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .collect()
    }

    /// Drop all recorded events
    pub fn clear(&self) {
        self.events.lock().expect("sink poisoned").clear();
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: &CrawlEvent) -> Result<()> {
        self.events.lock().expect("sink poisoned").push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();

        for n in 0..3u64 {
            sink.publish(&CrawlEvent::JobProgress {
                job_id: "job-1".to_string(),
                execution_id: "exec-1".to_string(),
                items_crawled: n * 10,
                items_indexed: n * 9,
            })
            .await
            .unwrap();
        }

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(sink.events_of_kind("job_progress").len(), 3);
        assert_eq!(sink.events_of_kind("job_completed").len(), 0);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_all_kinds() {
        let sink = TracingSink::new();
        sink.publish(&CrawlEvent::JobStatus {
            job_id: "job-1".to_string(),
            status: "running".to_string(),
            details: Some("picked up by poll".to_string()),
        })
        .await
        .unwrap();
    }
}
