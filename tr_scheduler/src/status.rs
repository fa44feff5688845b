//! ABOUTME: Job and execution status enumerations and the transition rules
//! ABOUTME: Also owns interval arithmetic and the retry backoff curve

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tr_core::{Error, Result};

/// Backoff never exceeds one hour
pub const MAX_BACKOFF_SECONDS: i64 = 3600;

/// Lifecycle status of a crawl job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created but not yet placed, or reset by a manual retry
    Pending,
    /// Placed with a next_run_at in the future
    Scheduled,
    /// A worker currently holds the lock
    Running,
    /// Suspended by the operator; excluded from polling
    Paused,
    /// One-shot job finished successfully
    Completed,
    /// Retries exhausted
    Failed,
    /// Cancelled by the operator
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Validation(format!("Unknown job status: {}", other))),
        }
    }

    /// Statuses the poll loop considers claimable
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }

    /// Statuses that end a job's scheduling life until an explicit
    /// retry/resume re-enters it
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// `cancelled -> pending` is only reachable through a manual retry, which
    /// also zeroes the retry counter; the scheduler loop never takes it.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Scheduled)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Scheduled, Running)
                | (Scheduled, Paused)
                | (Scheduled, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Scheduled)
                | (Paused, Cancelled)
                | (Completed, Scheduled)
                | (Failed, Scheduled)
                | (Cancelled, Pending)
        )
    }

    /// Validate a transition, classifying bad edges as validation errors
    pub fn ensure_transition(&self, to: JobStatus) -> Result<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "Invalid status transition: {} -> {}",
                self.as_str(),
                to.as_str()
            )))
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Validation(format!(
                "Unknown execution status: {}",
                other
            ))),
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Granularity a job's interval was entered in.
///
/// The stored magnitude is always minutes; the type records the unit the
/// operator used so the dashboard can render it back faithfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntervalType {
    #[default]
    Minutes,
    Hours,
    Days,
}

impl IntervalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "minutes" => Ok(Self::Minutes),
            "hours" => Ok(Self::Hours),
            "days" => Ok(Self::Days),
            other => Err(Error::Validation(format!(
                "Unknown interval type: {}",
                other
            ))),
        }
    }
}

/// Exponential backoff for the nth retry (1-indexed), capped at one hour
pub fn retry_backoff(base_seconds: i64, attempt: u32) -> Duration {
    let base = base_seconds.max(1);
    let exponent = attempt.saturating_sub(1).min(30);
    let seconds = base
        .saturating_mul(1i64 << exponent)
        .min(MAX_BACKOFF_SECONDS);
    Duration::seconds(seconds)
}
