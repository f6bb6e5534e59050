//! IaaS API adapter (spec §6): submit-async / query-async-job-result,
//! ListVMs, ListVolumes, GetVM, GetVolume. Treated as an opaque adapter
//! surface — response fields beyond the fixed ones are never statically
//! typed (spec §9).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncJobResult {
    /// 0=pending, 1=in_progress, 2=success, 3=failure (spec §4.2/§6).
    pub job_status: i32,
    pub job_result: Value,
    #[serde(default)]
    pub job_result_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IaasVm {
    pub id: String,
    pub state: String,
    pub service_offering: String,
    pub attached_volumes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IaasVolume {
    pub id: String,
    pub state: String,
    pub attached_to_vm_id: Option<String>,
    pub device_index: Option<i32>,
    pub size_bytes: i64,
}

#[async_trait]
pub trait IaasClient: Send + Sync {
    async fn submit_async(&self, operation_type: &str, params: Value) -> Result<String>;
    async fn query_async_job_result(&self, external_job_id: &str) -> Result<AsyncJobResult>;
    async fn list_vms(&self) -> Result<Vec<IaasVm>>;
    async fn list_volumes(&self) -> Result<Vec<IaasVolume>>;
    async fn get_vm(&self, id: &str) -> Result<Option<IaasVm>>;
    async fn get_volume(&self, id: &str) -> Result<Option<IaasVolume>>;
}

pub struct ReqwestIaasClient {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestIaasClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .expect("failed to build IaaS HTTP client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl IaasClient for ReqwestIaasClient {
    async fn submit_async(&self, operation_type: &str, params: Value) -> Result<String> {
        #[derive(Deserialize)]
        struct SubmitResponse {
            job_id: String,
        }

        let resp = self
            .client
            .post(format!("{}/asyncJob/{}", self.base_url, operation_type))
            .json(&params)
            .send()
            .await
            .map_err(|e| AppError::ExternalUnavailable(format!("submit_async: {e}")))?;

        let body: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| AppError::ExternalFailure(format!("submit_async decode: {e}")))?;

        Ok(body.job_id)
    }

    async fn query_async_job_result(&self, external_job_id: &str) -> Result<AsyncJobResult> {
        let resp = self
            .client
            .get(format!(
                "{}/queryAsyncJobResult?jobId={}",
                self.base_url, external_job_id
            ))
            .send()
            .await
            .map_err(|e| AppError::ExternalUnavailable(format!("query_async_job_result: {e}")))?;

        resp.json()
            .await
            .map_err(|e| AppError::ExternalFailure(format!("query_async_job_result decode: {e}")))
    }

    async fn list_vms(&self) -> Result<Vec<IaasVm>> {
        let resp = self
            .client
            .get(format!("{}/listVirtualMachines", self.base_url))
            .send()
            .await
            .map_err(|e| AppError::ExternalUnavailable(format!("list_vms: {e}")))?;

        resp.json()
            .await
            .map_err(|e| AppError::ExternalFailure(format!("list_vms decode: {e}")))
    }

    async fn list_volumes(&self) -> Result<Vec<IaasVolume>> {
        let resp = self
            .client
            .get(format!("{}/listVolumes", self.base_url))
            .send()
            .await
            .map_err(|e| AppError::ExternalUnavailable(format!("list_volumes: {e}")))?;

        resp.json()
            .await
            .map_err(|e| AppError::ExternalFailure(format!("list_volumes decode: {e}")))
    }

    async fn get_vm(&self, id: &str) -> Result<Option<IaasVm>> {
        Ok(self.list_vms().await?.into_iter().find(|v| v.id == id))
    }

    async fn get_volume(&self, id: &str) -> Result<Option<IaasVolume>> {
        Ok(self
            .list_volumes()
            .await?
            .into_iter()
            .find(|v| v.id == id))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeIaasClient {
        pub jobs: Mutex<std::collections::HashMap<String, AsyncJobResult>>,
        pub vms: Mutex<Vec<IaasVm>>,
        pub volumes: Mutex<Vec<IaasVolume>>,
        pub unreachable: std::sync::atomic::AtomicBool,
    }

    impl FakeIaasClient {
        pub fn set_job_result(&self, external_job_id: &str, result: AsyncJobResult) {
            self.jobs
                .lock()
                .unwrap()
                .insert(external_job_id.to_string(), result);
        }

        pub fn set_vms(&self, vms: Vec<IaasVm>) {
            *self.vms.lock().unwrap() = vms;
        }

        pub fn set_volumes(&self, volumes: Vec<IaasVolume>) {
            *self.volumes.lock().unwrap() = volumes;
        }
    }

    #[async_trait]
    impl IaasClient for FakeIaasClient {
        async fn submit_async(&self, _operation_type: &str, _params: Value) -> Result<String> {
            Ok(uuid::Uuid::new_v4().to_string())
        }

        async fn query_async_job_result(&self, external_job_id: &str) -> Result<AsyncJobResult> {
            if self.unreachable.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(AppError::ExternalUnavailable("fake unreachable".into()));
            }
            self.jobs
                .lock()
                .unwrap()
                .get(external_job_id)
                .cloned()
                .ok_or_else(|| AppError::ExternalFailure("unknown external job id".into()))
        }

        async fn list_vms(&self) -> Result<Vec<IaasVm>> {
            Ok(self.vms.lock().unwrap().clone())
        }

        async fn list_volumes(&self) -> Result<Vec<IaasVolume>> {
            Ok(self.volumes.lock().unwrap().clone())
        }

        async fn get_vm(&self, id: &str) -> Result<Option<IaasVm>> {
            Ok(self.vms.lock().unwrap().iter().find(|v| v.id == id).cloned())
        }

        async fn get_volume(&self, id: &str) -> Result<Option<IaasVolume>> {
            Ok(self
                .volumes
                .lock()
                .unwrap()
                .iter()
                .find(|v| v.id == id)
                .cloned())
        }
    }
}
