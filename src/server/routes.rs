use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::bulk_ops::{self, GroupLookup, GroupState, OpRequest};
use crate::error::{AppError, Result};
use crate::models::{AsyncJobTracking, JobStatus, ReplicationJob};

use super::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn parse_job_status(raw: &str) -> Result<JobStatus> {
    match raw {
        "pending" => Ok(JobStatus::Pending),
        "provisioning" => Ok(JobStatus::Provisioning),
        "attaching" => Ok(JobStatus::Attaching),
        "configuring" => Ok(JobStatus::Configuring),
        "analyzing" => Ok(JobStatus::Analyzing),
        "initializing" => Ok(JobStatus::Initializing),
        "ready_for_sync" => Ok(JobStatus::ReadyForSync),
        "replicating" => Ok(JobStatus::Replicating),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(AppError::Validation(format!("unknown job status {other}"))),
    }
}

#[derive(Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub vm_context_id: Uuid,
    pub status: JobStatus,
    pub progress_percent: i32,
}

impl From<ReplicationJob> for JobView {
    fn from(job: ReplicationJob) -> Self {
        Self {
            id: job.id,
            vm_context_id: job.vm_context_id,
            status: job.status,
            progress_percent: job.progress_percent,
        }
    }
}

pub async fn list_jobs_by_status(
    State(state): State<Arc<AppState>>,
    axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>,
) -> Result<Json<Vec<JobView>>> {
    let status = match params.get("status").map(String::as_str) {
        Some(raw) => parse_job_status(raw)?,
        None => JobStatus::Replicating,
    };

    let jobs = ReplicationJob::find_by_status(status, &state.db).await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    pub operation_type: String,
    pub correlation_id: String,
    pub parent_job_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct SubmitJobResponse {
    pub tracking_id: Uuid,
}

/// `POST /jobs` — C1's start-tracking operation (spec §4.1/§6).
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<Json<SubmitJobResponse>> {
    let tracking_id = state
        .tracker
        .start_tracking(&request.operation_type, &request.correlation_id, request.parent_job_id)
        .await?;
    Ok(Json(SubmitJobResponse { tracking_id }))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>> {
    let job = ReplicationJob::find_by_id(id, &state.db)
        .await?
        .ok_or_else(|| AppError::Validation(format!("unknown job {id}")))?;
    Ok(Json(job.into()))
}

#[derive(Serialize)]
pub struct CorrelationGroupView {
    pub correlation_id: String,
    pub members: Vec<AsyncJobMemberView>,
}

#[derive(Serialize)]
pub struct AsyncJobMemberView {
    pub id: Uuid,
    pub operation_type: String,
    pub status: String,
}

impl From<AsyncJobTracking> for AsyncJobMemberView {
    fn from(job: AsyncJobTracking) -> Self {
        Self {
            id: job.id,
            operation_type: job.operation_type,
            status: format!("{:?}", job.status),
        }
    }
}

pub async fn get_correlation_group(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<String>,
) -> Result<Json<CorrelationGroupView>> {
    let members = state.tracker.get_jobs_by_correlation_id(&correlation_id).await?;
    Ok(Json(CorrelationGroupView {
        correlation_id,
        members: members.into_iter().map(AsyncJobMemberView::from).collect(),
    }))
}

pub async fn list_cached_vms(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "vms": state.state_cache.all_vms() }))
}

pub async fn list_cached_volumes(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "volumes": state.state_cache.all_volumes() }))
}

/// `GET /state-sync/status` — cache size and auto-fix totals (spec §4.7/§6).
pub async fn state_sync_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "cached_vms": state.state_cache.all_vms().len(),
        "cached_volumes": state.state_cache.all_volumes().len(),
        "stopped": state.state_sync.is_stopped(),
        "fixed_count": state.state_sync.fixed_count(),
    }))
}

/// `GET /pollers/status` — how much work the async/progress pollers have
/// outstanding, derived from the DB rather than in-memory poller state
/// since the polling maps are process-local (spec §9).
pub async fn poller_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let due_for_async_poll = state.tracker.get_jobs_due_for_polling(i64::MAX).await?.len();
    let replicating = ReplicationJob::find_by_status(JobStatus::Replicating, &state.db).await?.len();
    Ok(Json(json!({
        "async_jobs_due_for_polling": due_for_async_poll,
        "jobs_replicating": replicating,
    })))
}

struct EmptyGroups;

impl GroupLookup for EmptyGroups {
    fn group(&self, _group_id: Uuid) -> Option<GroupState> {
        None
    }
}

pub async fn apply_bulk_ops(Json(requests): Json<Vec<OpRequest>>) -> Json<Value> {
    // Group lookup is a caller-supplied snapshot (spec §4.8); the HTTP
    // surface has no group registry of its own yet, so requests against
    // unknown groups fail validation rather than silently applying.
    let result = bulk_ops::apply(requests, &EmptyGroups);
    Json(json!({
        "applied": result.applied_count,
        "failed": result.failed_count,
        "skipped": result.skipped_count,
    }))
}
