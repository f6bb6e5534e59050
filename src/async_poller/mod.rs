//! Async Job Poller (C2) — single-owner background loop driving
//! `AsyncJobTracking` rows to completion (spec §4.2).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::IaasClient;
use crate::jobs::JobTracker;
use crate::kernel::service_host::Service;
use crate::models::{AsyncJobTracking, ExternalStatus};

pub struct AsyncPollerConfig {
    pub poll_tick: Duration,
    pub poll_interval: Duration,
    pub max_concurrent_polls: usize,
}

impl Default for AsyncPollerConfig {
    fn default() -> Self {
        Self {
            poll_tick: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            max_concurrent_polls: 10,
        }
    }
}

pub struct AsyncPoller {
    db: PgPool,
    tracker: Arc<JobTracker>,
    iaas: Arc<dyn IaasClient>,
    config: AsyncPollerConfig,
}

impl AsyncPoller {
    pub fn new(
        db: PgPool,
        tracker: Arc<JobTracker>,
        iaas: Arc<dyn IaasClient>,
        config: AsyncPollerConfig,
    ) -> Self {
        Self {
            db,
            tracker,
            iaas,
            config,
        }
    }

    /// One tick: fetch jobs due for polling and process them concurrently,
    /// bounded by `max_concurrent_polls` (spec §4.2/§5).
    pub async fn tick(&self) {
        let due = match self
            .tracker
            .get_jobs_due_for_polling(self.config.max_concurrent_polls as i64 * 4)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to fetch jobs due for polling");
                return;
            }
        };

        if due.is_empty() {
            return;
        }

        debug!(count = due.len(), "polling due async jobs");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_polls));
        let mut handles = Vec::with_capacity(due.len());

        for job in due {
            let semaphore = semaphore.clone();
            let db = self.db.clone();
            let tracker = self.tracker.clone();
            let iaas = self.iaas.clone();
            let poll_interval = self.config.poll_interval;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                process_one(&db, &tracker, iaas.as_ref(), job, poll_interval).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Process a single async job: query the IaaS, map its status, and apply
/// the result in one transaction (spec §4.2 ordering guarantee: "no
/// partial DB writes").
async fn process_one(
    db: &PgPool,
    tracker: &JobTracker,
    iaas: &dyn IaasClient,
    job: AsyncJobTracking,
    poll_interval: Duration,
) {
    let Some(external_id) = job.external_job_id.clone() else {
        warn!(job_id = %job.id, "polling job with no external_job_id; skipping");
        return;
    };

    let query_result = iaas.query_async_job_result(&external_id).await;

    let mut tx = match db.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!(job_id = %job.id, error = %e, "failed to open transaction for poll result");
            return;
        }
    };

    match query_result {
        Ok(result) => {
            let external_status = ExternalStatus::from_code(result.job_status);
            match external_status {
                ExternalStatus::Pending | ExternalStatus::InProgress => {
                    let next_poll = Utc::now() + chrono::Duration::from_std(poll_interval).unwrap();
                    let _ = sqlx::query(
                        "UPDATE async_job_tracking SET external_status = $1, next_poll_at = $2 WHERE id = $3",
                    )
                    .bind(external_status)
                    .bind(next_poll)
                    .bind(job.id)
                    .execute(&mut *tx)
                    .await;
                }
                ExternalStatus::Unknown => {
                    // An unrecognized status code gets the same retry-budget
                    // treatment as a transport error (spec §4.2): it is not
                    // evidence of progress, so it must not poll forever.
                    let new_retry_count = job.retry_count + 1;
                    if new_retry_count > job.max_retries {
                        let _ = sqlx::query(
                            r#"
                            UPDATE async_job_tracking
                            SET status = 'failed', external_status = $1, retry_count = $2,
                                error_message = 'unknown external status, max polling retries exceeded'
                            WHERE id = $3
                            "#,
                        )
                        .bind(external_status)
                        .bind(new_retry_count)
                        .bind(job.id)
                        .execute(&mut *tx)
                        .await;
                    } else {
                        let next_poll = Utc::now() + chrono::Duration::from_std(poll_interval).unwrap();
                        let _ = sqlx::query(
                            r#"
                            UPDATE async_job_tracking
                            SET external_status = $1, retry_count = $2, next_poll_at = $3
                            WHERE id = $4
                            "#,
                        )
                        .bind(external_status)
                        .bind(new_retry_count)
                        .bind(next_poll)
                        .bind(job.id)
                        .execute(&mut *tx)
                        .await;
                        warn!(job_id = %job.id, retry_count = new_retry_count, "unknown external status, rescheduled");
                    }
                }
                ExternalStatus::Success => {
                    let _ = sqlx::query(
                        r#"
                        UPDATE async_job_tracking
                        SET status = 'completed', external_status = 'success', response_payload = $1
                        WHERE id = $2
                        "#,
                    )
                    .bind(&result.job_result)
                    .bind(job.id)
                    .execute(&mut *tx)
                    .await;
                }
                ExternalStatus::Failure => {
                    let error_text = result
                        .job_result
                        .get("errortext")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| {
                            format!("job failed with code {}", result.job_result_code.unwrap_or(-1))
                        });

                    let _ = sqlx::query(
                        r#"
                        UPDATE async_job_tracking
                        SET status = 'failed', external_status = 'failure',
                            response_payload = $1, error_message = $2
                        WHERE id = $3
                        "#,
                    )
                    .bind(&result.job_result)
                    .bind(&error_text)
                    .bind(job.id)
                    .execute(&mut *tx)
                    .await;
                }
            }
        }
        Err(e) => {
            let new_retry_count = job.retry_count + 1;
            if new_retry_count > job.max_retries {
                let _ = sqlx::query(
                    r#"
                    UPDATE async_job_tracking
                    SET status = 'failed', retry_count = $1,
                        error_message = 'max polling retries exceeded'
                    WHERE id = $2
                    "#,
                )
                .bind(new_retry_count)
                .bind(job.id)
                .execute(&mut *tx)
                .await;
            } else {
                let backoff = poll_interval * 2;
                let next_poll = Utc::now() + chrono::Duration::from_std(backoff).unwrap();
                let _ = sqlx::query(
                    "UPDATE async_job_tracking SET retry_count = $1, next_poll_at = $2 WHERE id = $3",
                )
                .bind(new_retry_count)
                .bind(next_poll)
                .bind(job.id)
                .execute(&mut *tx)
                .await;
                warn!(job_id = %job.id, error = %e, retry_count = new_retry_count, "async poll failed, rescheduled");
            }
        }
    }

    if let Err(e) = tx.commit().await {
        error!(job_id = %job.id, error = %e, "failed to commit poll result");
        return;
    }

    // Inspect correlation group only once this job is terminal and has no
    // parent, so a child's completion never double-fires the group signal
    // (spec §4.2: "inspect correlation group" happens on root terminalization).
    if job.parent_job_id.is_none() {
        if let Ok(Some(outcome)) = tracker.inspect_correlation_group(&job.correlation_id).await {
            info!(correlation_id = %job.correlation_id, ?outcome, "correlation group signal fired");
        }
    }
}

#[async_trait]
impl Service for AsyncPoller {
    fn name(&self) -> &'static str {
        "async-job-poller"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> AnyResult<()> {
        let mut interval = tokio::time::interval(self.config.poll_tick);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::iaas::fake::FakeIaasClient;
    use crate::clients::iaas::AsyncJobResult;

    #[test]
    fn external_status_mapping_matches_spec_table() {
        assert!(ExternalStatus::from_code(0).is_still_running());
        assert!(ExternalStatus::from_code(1).is_still_running());
        assert!(!ExternalStatus::from_code(2).is_still_running());
        assert!(!ExternalStatus::from_code(3).is_still_running());
    }

    #[tokio::test]
    async fn failure_error_text_prefers_errortext_key() {
        let fake = FakeIaasClient::default();
        fake.set_job_result(
            "ext-1",
            AsyncJobResult {
                job_status: 3,
                job_result: serde_json::json!({"errortext": "disk attach rejected"}),
                job_result_code: Some(4),
            },
        );
        let result = fake.query_async_job_result("ext-1").await.unwrap();
        let text = result
            .job_result
            .get("errortext")
            .and_then(|v| v.as_str())
            .unwrap();
        assert_eq!(text, "disk attach rejected");
    }

    #[tokio::test]
    async fn failure_error_text_synthesized_without_errortext() {
        let fake = FakeIaasClient::default();
        fake.set_job_result(
            "ext-2",
            AsyncJobResult {
                job_status: 3,
                job_result: serde_json::json!({}),
                job_result_code: Some(7),
            },
        );
        let result = fake.query_async_job_result("ext-2").await.unwrap();
        let text = result
            .job_result
            .get("errortext")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("job failed with code {}", result.job_result_code.unwrap()));
        assert_eq!(text, "job failed with code 7");
    }
}
