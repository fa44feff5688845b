//! ABOUTME: Entry point for the trawler crawl scheduling service
//! ABOUTME: Loads config, opens the database, and runs the scheduler

use clap::{Parser, Subcommand};
use std::{process, sync::Arc, time::Duration};
use tr_config::Config;
use tr_core::{telemetry, SystemClock};
use tr_db::Db;
use tr_events::{EventPublisher, TracingSink};
use tr_scheduler::{CrawlScheduler, SchedulerConfig, SqliteJobStore, UuidTokenGenerator};

mod runner;

use runner::NoopCrawlerRunner;

#[derive(Parser)]
#[command(name = "trawler")]
#[command(about = "Trawler crawl scheduling service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler (default)
    Start,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env = std::env::var("TRAWLER_ENV").unwrap_or_else(|_| "development".to_string());
    telemetry::init_tracing(&env, "trawler");

    // Load configuration - exit with non-zero if invalid
    let config = match Config::load() {
        Ok(config) => {
            tracing::debug!(?config, "Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    // Initialize database with schema
    let db = match Db::new_with_pool_size(&config.database.path, config.database.pool_size).await
    {
        Ok(db) => {
            tracing::info!("Database initialized successfully");
            db
        }
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = db.health_check().await {
        tracing::error!("Database health check failed: {}", e);
        process::exit(1);
    }

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            tracing::info!("trawler starting");
            if let Err(e) = run_scheduler(config, db).await {
                tracing::error!("Scheduler failed to start: {}", e);
                process::exit(1);
            }
        }
    }
}

fn scheduler_config(config: &tr_config::SchedulerConfig) -> SchedulerConfig {
    SchedulerConfig {
        check_interval: Duration::from_secs(config.check_interval_seconds),
        batch_size: config.batch_size,
        lock_duration: chrono::Duration::seconds(config.lock_duration_seconds),
        stale_lock_check_interval: Duration::from_secs(config.stale_lock_check_interval_seconds),
        metrics_interval: Duration::from_secs(config.metrics_interval_seconds),
        retention_interval: Duration::from_secs(config.retention_interval_seconds),
        retention_days: config.retention_days,
        retention_keep_per_job: config.retention_keep_per_job,
        shutdown_grace: Duration::from_secs(config.shutdown_grace_seconds),
    }
}

async fn run_scheduler(config: Config, db: Db) -> tr_core::Result<()> {
    let store = Arc::new(SqliteJobStore::new(db.pool().clone()));
    let publisher = Arc::new(EventPublisher::new(
        Arc::new(TracingSink::new()),
        config.events.enabled,
    ));

    let scheduler = CrawlScheduler::new(
        scheduler_config(&config.scheduler),
        store,
        Arc::new(NoopCrawlerRunner),
        Arc::new(SystemClock),
        publisher,
        Arc::new(UuidTokenGenerator),
    );

    scheduler.start().await?;
    tracing::info!("Scheduler running; press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    let grace = Duration::from_secs(config.scheduler.shutdown_grace_seconds);
    scheduler.stop(grace).await;
    tracing::info!("trawler stopped");
    Ok(())
}
