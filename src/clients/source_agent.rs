//! Source Agent HTTP API adapter (spec §6), consumed by C3/C4/C5.
//!
//! Centralizes the single `reqwest::Client` construction point and the
//! "200 with `not found` body" workaround (spec §9 open question) so
//! every caller sees the same normalized [`SourceAgentReply`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentProgress {
    pub percentage: i32,
    pub phase: String,
    /// "running" | "completed" | "failed"
    pub status: String,
    /// "incremental" | "full" | "initial" | other (mapped by the caller)
    pub sync_type: String,
    pub bytes_transferred: i64,
    pub total_bytes: i64,
    #[serde(default)]
    pub throughput_current_mbps: Option<f64>,
    #[serde(default)]
    pub eta_seconds: Option<i64>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Normalized reply from the source agent's progress/status endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceAgentReply {
    Found(AgentProgress),
    NotFound,
    Unreachable,
}

#[async_trait]
pub trait SourceAgentClient: Send + Sync {
    /// `GET /progress/{key}`, trying the per-volume export-name key first
    /// and falling back to the job id (spec §4.3/§4.4).
    async fn get_progress(&self, key: &str) -> Result<SourceAgentReply>;

    async fn health(&self) -> bool;
}

pub struct HttpSourceAgentClient {
    client: reqwest::Client,
    base_url: String,
    /// Gates the `"not found"`-body workaround (spec §9).
    legacy_not_found_body: bool,
}

impl HttpSourceAgentClient {
    pub fn new(base_url: impl Into<String>, legacy_not_found_body: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .expect("failed to build source-agent HTTP client");
        Self {
            client,
            base_url: base_url.into(),
            legacy_not_found_body,
        }
    }
}

#[async_trait]
impl SourceAgentClient for HttpSourceAgentClient {
    async fn get_progress(&self, key: &str) -> Result<SourceAgentReply> {
        let resp = match self
            .client
            .get(format!("{}/progress/{}", self.base_url, key))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(_) => return Ok(SourceAgentReply::Unreachable),
        };

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(SourceAgentReply::NotFound);
        }

        if !resp.status().is_success() {
            return Ok(SourceAgentReply::Unreachable);
        }

        let text = resp.text().await.unwrap_or_default();

        if self.legacy_not_found_body && text.to_lowercase().contains("not found") {
            warn!(key, "source agent returned 200 with a 'not found' body (legacy quirk)");
            return Ok(SourceAgentReply::NotFound);
        }

        match serde_json::from_str::<AgentProgress>(&text) {
            Ok(progress) => Ok(SourceAgentReply::Found(progress)),
            Err(_) => Ok(SourceAgentReply::Unreachable),
        }
    }

    async fn health(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSourceAgentClient {
        replies: Mutex<std::collections::HashMap<String, SourceAgentReply>>,
    }

    impl FakeSourceAgentClient {
        pub fn set_reply(&self, key: &str, reply: SourceAgentReply) {
            self.replies.lock().unwrap().insert(key.to_string(), reply);
        }
    }

    #[async_trait]
    impl SourceAgentClient for FakeSourceAgentClient {
        async fn get_progress(&self, key: &str) -> Result<SourceAgentReply> {
            Ok(self
                .replies
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .unwrap_or(SourceAgentReply::NotFound))
        }

        async fn health(&self) -> bool {
            true
        }
    }
}
