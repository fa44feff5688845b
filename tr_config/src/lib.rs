//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles all trawler settings from environment variables and files

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use tr_core::{Error, Result};
use validator::Validate;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
    pub events: EventsConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub path: String,
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,
    pub sqlite_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "trawler.db".to_string(),
            pool_size: 10,
            sqlite_wal: true,
        }
    }
}

/// Scheduler tuning knobs
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SchedulerConfig {
    /// Seconds between due-job polls
    #[validate(range(min = 1, max = 3600))]
    pub check_interval_seconds: u64,
    /// Maximum number of due jobs claimed per poll
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: u32,
    /// Seconds after which an unreleased lock is considered stale.
    /// Must be at least twice the realistic P99 job duration.
    #[validate(range(min = 30, max = 86400))]
    pub lock_duration_seconds: i64,
    /// Seconds between stale-lock sweeps
    #[validate(range(min = 5, max = 3600))]
    pub stale_lock_check_interval_seconds: u64,
    /// Seconds between metrics refreshes
    #[validate(range(min = 5, max = 3600))]
    pub metrics_interval_seconds: u64,
    /// Seconds between execution-history retention sweeps
    #[validate(range(min = 60, max = 86400))]
    pub retention_interval_seconds: u64,
    /// Days of execution history to keep
    #[validate(range(min = 1, max = 365))]
    pub retention_days: u32,
    /// Most-recent executions always kept per job, regardless of age
    #[validate(range(min = 1, max = 10000))]
    pub retention_keep_per_job: u32,
    /// Seconds to wait for in-flight workers on shutdown
    #[validate(range(min = 1, max = 600))]
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 10,
            batch_size: 50,
            lock_duration_seconds: 300, // 5 minutes
            stale_lock_check_interval_seconds: 60,
            metrics_interval_seconds: 30,
            retention_interval_seconds: 3600,
            retention_days: 30,
            retention_keep_per_job: 100,
            shutdown_grace_seconds: 30,
        }
    }
}

/// Event publishing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Global switch for event emission (disabled in most tests)
    pub enabled: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from defaults, an optional trawler.toml, and
    /// TRAWLER_-prefixed environment variables (highest priority)
    pub fn load() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        // Set defaults first
        builder = builder
            .set_default("database.path", "trawler.db")?
            .set_default("database.pool_size", 10)?
            .set_default("database.sqlite_wal", true)?
            .set_default("scheduler.check_interval_seconds", 10)?
            .set_default("scheduler.batch_size", 50)?
            .set_default("scheduler.lock_duration_seconds", 300)?
            .set_default("scheduler.stale_lock_check_interval_seconds", 60)?
            .set_default("scheduler.metrics_interval_seconds", 30)?
            .set_default("scheduler.retention_interval_seconds", 3600)?
            .set_default("scheduler.retention_days", 30)?
            .set_default("scheduler.retention_keep_per_job", 100)?
            .set_default("scheduler.shutdown_grace_seconds", 30)?
            .set_default("events.enabled", true)?;

        // Optional config file alongside the binary
        if std::path::Path::new("trawler.toml").exists() {
            builder = builder.add_source(File::with_name("trawler").required(false));
        }

        // Load from environment variables with TRAWLER_ prefix (highest priority)
        builder = builder.add_source(
            Environment::with_prefix("TRAWLER")
                .try_parsing(true)
                .separator("__"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }
}
