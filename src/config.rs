//! Application configuration loaded from environment variables.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Recognized configuration options and their effects (spec §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    pub log_dir: String,
    pub max_log_file_size_bytes: u64,
    pub max_log_files: usize,
    pub rotation_hours: u64,

    pub async_poll_interval: Duration,
    pub progress_poll_interval: Duration,
    pub max_concurrent_polls: usize,
    pub sync_interval: Duration,
    pub max_sync_errors: u32,
    pub stale_threshold: Duration,
    pub max_job_age: Duration,
    pub startup_grace_period: Duration,
    pub health_monitor_interval: Duration,

    /// Gates the source agent's documented "200 with `not found` body" quirk
    /// workaround (spec §9 open question). Each occurrence is still logged.
    pub legacy_not_found_body: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env_parse("PORT", 8080)?,

            log_dir: env::var("LOG_DIR").unwrap_or_else(|_| "/var/log/vmhub".to_string()),
            max_log_file_size_bytes: env_parse("MAX_LOG_FILE_SIZE", 100 * 1024 * 1024)?,
            max_log_files: env_parse("MAX_LOG_FILES", 10)?,
            rotation_hours: env_parse("ROTATION_HOURS", 24)?,

            async_poll_interval: Duration::from_secs(env_parse("ASYNC_POLL_INTERVAL_SECS", 2)?),
            progress_poll_interval: Duration::from_secs(env_parse(
                "PROGRESS_POLL_INTERVAL_SECS",
                5,
            )?),
            max_concurrent_polls: env_parse("MAX_CONCURRENT_POLLS", 10)?,
            sync_interval: Duration::from_secs(env_parse("SYNC_INTERVAL_SECS", 120)?),
            max_sync_errors: env_parse("MAX_SYNC_ERRORS", 5)?,
            stale_threshold: Duration::from_secs(env_parse("STALE_THRESHOLD_SECS", 30)?),
            max_job_age: Duration::from_secs(env_parse("MAX_JOB_AGE_SECS", 30 * 60)?),
            startup_grace_period: Duration::from_secs(env_parse(
                "STARTUP_GRACE_PERIOD_SECS",
                30,
            )?),
            health_monitor_interval: Duration::from_secs(env_parse(
                "HEALTH_MONITOR_INTERVAL_SECS",
                120,
            )?),

            legacy_not_found_body: env_parse("LEGACY_NOT_FOUND_BODY", true)?,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be valid: {e}")),
        Err(_) => Ok(default),
    }
}
