/// Configuration management for the crmflow engine
///
/// Handles server configuration, database connection, engine tuning, approval-gate
/// guards, background tick schedule and outbound integration endpoints.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Trigger dispatch and event log sizing
    pub engine: EngineConfig,
    /// Approval gate guards (rate limit, idempotency cache)
    pub hitl: HitlConfig,
    /// Background tick schedule
    pub scheduler: SchedulerConfig,
    /// Messaging and AI collaborators
    pub integrations: IntegrationsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL (e.g., "sqlite://data/crmflow.db" or "sqlite::memory:")
    pub url: String,
}

/// Trigger dispatcher and event log sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of background workers consuming fired triggers
    pub dispatch_workers: usize,
    /// Bound of the fired-trigger queue; events beyond it are dropped
    pub dispatch_queue_capacity: usize,
    /// Number of engine events retained in memory
    pub event_log_capacity: usize,
}

/// Approval gate guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlConfig {
    /// Calls allowed per user inside one window
    pub rate_limit: usize,
    /// Sliding window length in seconds
    pub rate_window_secs: u64,
    /// How long a cached idempotent response is replayed
    pub idempotency_ttl_secs: u64,
    /// Maximum cached idempotent responses
    pub idempotency_capacity: usize,
}

/// Background tick configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Six-field cron expression for the drip/delayed-task tick
    pub tick_schedule: String,
}

/// Outbound collaborator configuration. Missing URLs select the dry-run providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationsConfig {
    pub messaging_url: Option<String>,
    pub messaging_token: Option<String>,
    pub ai_url: Option<String>,
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    /// Per-request timeout for WEBHOOK tasks
    pub webhook_timeout_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("CRMFLOW_HOST", "0.0.0.0"),
                port: env_parse("CRMFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                url: env_or("CRMFLOW_DATABASE_URL", "sqlite://data/crmflow.db"),
            },
            engine: EngineConfig {
                dispatch_workers: env_parse("CRMFLOW_DISPATCH_WORKERS", 4),
                dispatch_queue_capacity: env_parse("CRMFLOW_DISPATCH_QUEUE", 1024),
                event_log_capacity: env_parse("CRMFLOW_EVENT_LOG_CAPACITY", 1000),
            },
            hitl: HitlConfig {
                rate_limit: env_parse("CRMFLOW_HITL_RATE_LIMIT", 20),
                rate_window_secs: env_parse("CRMFLOW_HITL_RATE_WINDOW_SECS", 60),
                idempotency_ttl_secs: env_parse("CRMFLOW_IDEMPOTENCY_TTL_SECS", 86_400),
                idempotency_capacity: env_parse("CRMFLOW_IDEMPOTENCY_CAPACITY", 10_000),
            },
            scheduler: SchedulerConfig {
                tick_schedule: env_or("CRMFLOW_TICK_SCHEDULE", "0 * * * * *"),
            },
            integrations: IntegrationsConfig {
                messaging_url: env_opt("CRMFLOW_MESSAGING_URL"),
                messaging_token: env_opt("CRMFLOW_MESSAGING_TOKEN"),
                ai_url: env_opt("CRMFLOW_AI_URL"),
                ai_api_key: env_opt("CRMFLOW_AI_API_KEY"),
                ai_model: env_or("CRMFLOW_AI_MODEL", "gpt-4o-mini"),
                webhook_timeout_secs: env_parse("CRMFLOW_WEBHOOK_TIMEOUT_SECS", 10),
            },
        }
    }
}
