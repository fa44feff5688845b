//! ABOUTME: Database layer with SQLite pool, schema setup, and health checks
//! ABOUTME: Owns the crawl_jobs and job_executions tables

use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, Sqlite, SqlitePool,
};
use tr_core::{Error, Result};
use tracing::{debug, info};

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Create a new database connection, applying the schema
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::new_with_pool_size(db_path, 10).await
    }

    /// Create a new database connection with an explicit pool size
    pub async fn new_with_pool_size(db_path: &str, pool_size: u32) -> Result<Self> {
        info!(path = %db_path, pool_size, "Initializing database");

        let database_url = format!("sqlite://{}", db_path);
        if !Sqlite::database_exists(&database_url)
            .await
            .unwrap_or(false)
        {
            debug!("Creating database: {}", database_url);
            Sqlite::create_database(&database_url)
                .await
                .map_err(|e| Error::Database(format!("Failed to create database: {}", e)))?;
        }

        // WAL mode plus a generous busy timeout: the lock CAS relies on
        // SQLite serializing concurrent conditional updates.
        let connect_options = SqliteConnectOptions::new()
            .filename(db_path)
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true)
            .pragma("foreign_keys", "ON")
            .pragma("synchronous", "NORMAL")
            .pragma("busy_timeout", "30000");

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .min_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| Error::Database(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.migrate().await?;

        info!("Database initialized and migrated successfully");
        Ok(db)
    }

    /// Apply the schema. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        debug!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crawl_jobs (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL UNIQUE,
                source_name TEXT NOT NULL,
                url TEXT NOT NULL,
                interval_minutes INTEGER,
                interval_type TEXT NOT NULL DEFAULT 'minutes',
                next_run_at TEXT,
                schedule_enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'pending',
                is_paused INTEGER NOT NULL DEFAULT 0,
                paused_at TEXT,
                cancelled_at TEXT,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_backoff_seconds INTEGER NOT NULL DEFAULT 60,
                current_retry_count INTEGER NOT NULL DEFAULT 0,
                lock_token TEXT,
                lock_acquired_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create crawl_jobs table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_executions (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                execution_number INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER,
                items_crawled INTEGER NOT NULL DEFAULT 0,
                items_indexed INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                stack_trace TEXT,
                retry_attempt INTEGER NOT NULL DEFAULT 0,
                executed_on TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                FOREIGN KEY (job_id) REFERENCES crawl_jobs (id) ON DELETE CASCADE,
                UNIQUE (job_id, execution_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create job_executions table: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_next_run_at ON crawl_jobs (next_run_at) \
             WHERE next_run_at IS NOT NULL AND is_paused = 0",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create index: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_lock_token ON crawl_jobs (lock_token) \
             WHERE lock_token IS NOT NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create index: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON crawl_jobs (status)")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to create index: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_job_id ON job_executions (job_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create index: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_started_at \
             ON job_executions (started_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create index: {}", e)))?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a Db instance from an existing pool (for testing/reuse)
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Get row counts for the scheduler tables
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let mut table_counts = std::collections::HashMap::new();

        for table in ["crawl_jobs", "job_executions"] {
            let query = format!("SELECT COUNT(*) as count FROM {}", table);
            let row = sqlx::query(&query)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("Failed to get count for {}: {}", table, e)))?;

            let count: i64 = row.get("count");
            table_counts.insert(table.to_string(), count);
        }

        Ok(DatabaseStats { table_counts })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseStats {
    pub table_counts: std::collections::HashMap<String, i64>,
}
