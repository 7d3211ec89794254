//! Worker configuration

use std::str::FromStr;

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Six-field cron expression (seconds first)
    pub billing_cycle_cron: String,
    pub billing_batch_size: i64,
    /// Retries of one subscription within a cycle
    pub billing_max_retries: usize,
    pub notification_queue_cron: String,
    pub notification_batch_size: i64,
    pub queue_cleanup_cron: String,
    pub queue_retention_days: i32,
}

impl WorkerConfig {
    pub fn from_env() -> WorkerResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| WorkerError::Config("DATABASE_URL not set".to_string()))?;

        let config = Self {
            database_url,
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
            billing_cycle_cron: env_or("BILLING_CYCLE_CRON", "0 */15 * * * *"),
            billing_batch_size: env_parse("BILLING_BATCH_SIZE", 100),
            billing_max_retries: env_parse("BILLING_MAX_RETRIES", 3),
            notification_queue_cron: env_or("NOTIFICATION_QUEUE_CRON", "*/30 * * * * *"),
            notification_batch_size: env_parse("NOTIFICATION_BATCH_SIZE", 25),
            queue_cleanup_cron: env_or("QUEUE_CLEANUP_CRON", "0 0 3 * * *"),
            queue_retention_days: env_parse("QUEUE_RETENTION_DAYS", 30),
        };

        if config.billing_batch_size <= 0 || config.notification_batch_size <= 0 {
            return Err(WorkerError::Config("batch sizes must be positive".to_string()));
        }
        if config.queue_retention_days <= 0 {
            return Err(WorkerError::Config(
                "QUEUE_RETENTION_DAYS must be positive".to_string(),
            ));
        }

        Ok(config)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
