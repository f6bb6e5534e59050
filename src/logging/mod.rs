//! Structured Logger (C9) — correlated, job-scoped logging to file + DB +
//! stdout (spec §4.9).

mod rotation;

pub use rotation::LogRotator;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{error as trace_error, info as trace_info};
use uuid::Uuid;

use crate::models::{ErrorDetail, LogEntry, LogLevel};

pub struct StructuredLogger {
    db: PgPool,
    log_dir: PathBuf,
    current_file: Mutex<Option<(String, std::fs::File)>>,
    max_file_size_bytes: u64,
}

impl StructuredLogger {
    pub fn new(db: PgPool, log_dir: impl Into<PathBuf>, max_file_size_bytes: u64) -> Self {
        Self {
            db,
            log_dir: log_dir.into(),
            current_file: Mutex::new(None),
            max_file_size_bytes,
        }
    }

    pub async fn emit(&self, entry: LogEntry) {
        self.write_file(&entry);
        self.write_stdout(&entry);

        // Sink (b) failures must not break the operation path (spec §4.9).
        if let Err(e) = entry.insert_job_log(&self.db).await {
            trace_error!(error = %e, "failed to persist job log entry");
        }
    }

    fn write_file(&self, entry: &LogEntry) {
        let day = entry.timestamp.format("%Y-%m-%d").to_string();
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                trace_error!(error = %e, "failed to serialize log entry");
                return;
            }
        };

        let mut guard = self.current_file.lock().unwrap();
        let needs_new_file = match &*guard {
            Some((current_day, file)) => {
                current_day != &day || file.metadata().map(|m| m.len()).unwrap_or(0) >= self.max_file_size_bytes
            }
            None => true,
        };

        if needs_new_file {
            if let Err(e) = std::fs::create_dir_all(&self.log_dir) {
                trace_error!(error = %e, "failed to create log directory");
                return;
            }
            let path = self.log_dir.join(format!("vmhub-{day}.log"));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => *guard = Some((day.clone(), file)),
                Err(e) => {
                    trace_error!(error = %e, path = %path.display(), "failed to open log file");
                    return;
                }
            }
        }

        if let Some((_, file)) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                trace_error!(error = %e, "failed to write log line");
            }
        }
    }

    fn write_stdout(&self, entry: &LogEntry) {
        match entry.level {
            LogLevel::Error => trace_error!(component = %entry.component, operation = %entry.operation, "{}", entry.message),
            _ => trace_info!(component = %entry.component, operation = %entry.operation, "{}", entry.message),
        }
    }
}

/// Handle returned by `start_operation`, pairing a start time with the
/// context needed to emit the completion entry (spec §4.9).
pub struct OperationHandle {
    component: String,
    operation: String,
    correlation_id: Option<String>,
    job_id: Option<Uuid>,
    context: Option<Value>,
    started_at: std::time::Instant,
}

pub fn start_operation(
    component: impl Into<String>,
    operation: impl Into<String>,
    correlation_id: Option<String>,
    job_id: Option<Uuid>,
    context: Option<Value>,
) -> OperationHandle {
    OperationHandle {
        component: component.into(),
        operation: operation.into(),
        correlation_id,
        job_id,
        context,
        started_at: std::time::Instant::now(),
    }
}

impl OperationHandle {
    pub fn complete(self, error: Option<ErrorDetail>) -> LogEntry {
        let duration_ms = self.started_at.elapsed().as_millis() as i64;
        let level = if error.is_some() { LogLevel::Error } else { LogLevel::Info };
        let message = if error.is_some() {
            format!("{} failed", self.operation)
        } else {
            format!("{} completed", self.operation)
        };

        LogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            component: self.component,
            operation: self.operation,
            message,
            correlation_id: self.correlation_id,
            job_id: self.job_id,
            context: self.context,
            error,
            duration_ms: Some(duration_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_handle_completion_without_error_is_info() {
        let handle = start_operation("progress_poller", "poll_job", None, None, None);
        let entry = handle.complete(None);
        assert_eq!(entry.level, LogLevel::Info);
        assert!(entry.duration_ms.is_some());
    }

    #[test]
    fn operation_handle_completion_with_error_is_error_level() {
        let handle = start_operation("progress_poller", "poll_job", None, None, None);
        let entry = handle.complete(Some(ErrorDetail {
            kind: "external_unavailable".to_string(),
            message: "timeout".to_string(),
            details: None,
        }));
        assert_eq!(entry.level, LogLevel::Error);
    }
}
