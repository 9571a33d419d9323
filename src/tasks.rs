//! Task-dispatch port.
//!
//! Publish and pull work (the actual byte copy, hashing, and archival
//! retrieval) runs on an external asynchronous executor. The workflow only
//! constructs a task descriptor and hands it over, fire-and-forget:
//! completion is never tracked here, it is inferred the next time the
//! affected record is viewed.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{AppError, AppResult};

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Submit a named task with a JSON payload. At-least-once execution is
    /// the executor's responsibility; no retry happens here.
    async fn submit(&self, task: &str, payload: Value) -> AppResult<()>;

    /// Whether any executor is reachable. Publish requests are refused when
    /// no worker would ever pick the task up.
    async fn available(&self) -> bool;
}

/// Dispatcher posting task descriptors to an HTTP queue frontend.
pub struct HttpTaskDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaskDispatcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl TaskDispatcher for HttpTaskDispatcher {
    async fn submit(&self, task: &str, payload: Value) -> AppResult<()> {
        let url = format!("{}/tasks", self.base_url.trim_end_matches('/'));
        info!(target: "datapub::tasks", "submitting task '{}' payload={}", task, payload);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "task": task, "payload": payload }))
            .send()
            .await
            .map_err(|e| AppError::unavailable("dispatch_failed".to_string(), format!("task executor unreachable: {}", e)))?;
        if !resp.status().is_success() {
            return Err(AppError::unavailable(
                "dispatch_failed".to_string(),
                format!("task executor refused '{}' with status {}", task, resp.status()),
            ));
        }
        Ok(())
    }

    async fn available(&self) -> bool {
        let url = format!("{}/ping", self.base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
