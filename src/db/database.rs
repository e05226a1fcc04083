/// SQLite connection management and schema bootstrap
///
/// One database holds every tenant's rows; isolation comes from each table's
/// `user_id` column and every tenant-facing query filtering on it.
///
/// Timestamps are stored as INTEGER unix milliseconds so range comparisons
/// (`scheduled_for <= ?`, `next_send_at <= ?`) are plain integer compares.

use crate::error::{AppError, AppResult};
use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Shared connection pool plus schema bootstrap
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to the configured database, creating file and schema when missing
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| anyhow::anyhow!("Invalid database URL '{}': {}", url, e))?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = url.contains(":memory:");
        if !in_memory {
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e)
                    })?;
                }
            }
        }

        tracing::info!("🗄️ Opening database: {}", url);

        // An in-memory database lives and dies with its connection, so keep exactly one
        // and never recycle it.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options)
                .await?
        };

        let database = Self { pool };
        database.init_schema().await?;

        tracing::info!("✅ Database ready");
        Ok(database)
    }

    /// Fresh private in-memory database (tests, ephemeral runs)
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes. Safe to call repeatedly.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflow_templates (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                trigger_types JSON NOT NULL,
                trigger_config JSON NOT NULL,
                enrollment_mode TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_tasks (
                id TEXT PRIMARY KEY,
                template_id TEXT NOT NULL REFERENCES workflow_templates(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                display_order INTEGER NOT NULL,
                is_hitl INTEGER NOT NULL DEFAULT 0,
                delay_minutes INTEGER NOT NULL DEFAULT 0,
                action JSON NOT NULL,
                run_if JSON NOT NULL DEFAULT '[]',
                UNIQUE (template_id, display_order)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                template_id TEXT NOT NULL REFERENCES workflow_templates(id),
                user_id TEXT NOT NULL,
                lead_id TEXT,
                deal_id TEXT,
                status TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                variables JSON NOT NULL,
                started_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_executions (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES workflow_instances(id),
                task_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                display_order INTEGER NOT NULL,
                status TEXT NOT NULL,
                scheduled_for INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                notes TEXT,
                result JSON,
                error TEXT,
                decided_by TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS drip_sequences (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                channel TEXT NOT NULL,
                total_sent INTEGER NOT NULL DEFAULT 0,
                total_delivered INTEGER NOT NULL DEFAULT 0,
                total_replied INTEGER NOT NULL DEFAULT 0,
                total_failed INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS drip_steps (
                sequence_id TEXT NOT NULL REFERENCES drip_sequences(id) ON DELETE CASCADE,
                step_order INTEGER NOT NULL,
                delay_days INTEGER NOT NULL DEFAULT 0,
                delay_hours INTEGER NOT NULL DEFAULT 0,
                subject TEXT,
                body TEXT NOT NULL,
                skip_if_engaged INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (sequence_id, step_order)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS drip_enrollments (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL REFERENCES drip_sequences(id),
                contact_id TEXT NOT NULL,
                contact_name TEXT,
                email TEXT,
                phone TEXT,
                status TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                next_send_at INTEGER,
                enrolled_at INTEGER NOT NULL,
                last_engaged_at INTEGER,
                updated_at INTEGER NOT NULL
            )
            "#,
            // At most one open approval gate per (instance, task)
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_executions_awaiting_gate
            ON task_executions(instance_id, task_id) WHERE status = 'AWAITING_HITL'
            "#,
            "CREATE INDEX IF NOT EXISTS idx_templates_user ON workflow_templates(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_instances_user_started ON workflow_instances(user_id, started_at)",
            "CREATE INDEX IF NOT EXISTS idx_instances_template ON workflow_instances(template_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_executions_instance ON task_executions(instance_id)",
            "CREATE INDEX IF NOT EXISTS idx_executions_due ON task_executions(status, scheduled_for)",
            "CREATE INDEX IF NOT EXISTS idx_enrollments_due ON drip_enrollments(status, next_send_at)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

/// Convert a timestamp to its stored representation
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Convert a stored timestamp back; out-of-range values collapse to the epoch
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Upper bound for any authored delay (task delays, drip step delays)
pub const MAX_DELAY_DAYS: i64 = 365;

/// `at + delay`, as a validation error instead of a panic when out of range
pub fn checked_after(at: DateTime<Utc>, delay: TimeDelta) -> AppResult<DateTime<Utc>> {
    at.checked_add_signed(delay)
        .ok_or_else(|| AppError::validation("Scheduled time is out of range"))
}
