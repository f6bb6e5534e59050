//! Log-file retention: keep up to `max_files`, oldest-first removal by
//! modification time (spec §4.9, §9 — "replace the hand-rolled bubble sort
//! with the language's standard ordered iteration").

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::kernel::service_host::Service;

pub struct LogRotator {
    log_dir: PathBuf,
    max_files: usize,
    tick_interval: Duration,
}

impl LogRotator {
    pub fn new(log_dir: impl Into<PathBuf>, max_files: usize, tick_interval: Duration) -> Self {
        Self {
            log_dir: log_dir.into(),
            max_files,
            tick_interval,
        }
    }

    /// Removes the oldest log files beyond `max_files`, ordered by mtime.
    pub fn enforce_retention(&self) -> std::io::Result<()> {
        let mut entries = list_log_files(&self.log_dir)?;
        entries.sort_by_key(|(_, mtime)| *mtime);

        if entries.len() <= self.max_files {
            return Ok(());
        }

        let excess = entries.len() - self.max_files;
        for (path, _) in entries.into_iter().take(excess) {
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "rotated out old log file"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old log file"),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Service for LogRotator {
    fn name(&self) -> &'static str {
        "log-rotator"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> AnyResult<()> {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.enforce_retention() {
                        warn!(error = %e, "log rotation tick failed");
                    }
                }
            }
        }
        Ok(())
    }
}

fn list_log_files(dir: &Path) -> std::io::Result<Vec<(PathBuf, SystemTime)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        files.push((path, mtime));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{{}}").unwrap();
        path
    }

    #[test]
    fn retention_keeps_only_max_files_newest_first() {
        let dir = std::env::temp_dir().join(format!("vmhub-rotation-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        for i in 0..5 {
            touch(&dir, &format!("vmhub-2026-01-0{i}.log"));
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let rotator = LogRotator::new(&dir, 3, Duration::from_secs(3600));
        rotator.enforce_retention().unwrap();

        let remaining = list_log_files(&dir).unwrap();
        assert_eq!(remaining.len(), 3);

        std::fs::remove_dir_all(&dir).ok();
    }
}
