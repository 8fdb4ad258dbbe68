// Client for Engine.Execute. The scheduler only ever starts executions and
// (for sync webhooks) polls for settlement; everything else is the
// engine's surface.

use async_trait::async_trait;
use loomline_contracts::{
    ErrorBody, ExecuteRequest, ExecuteResponse, Execution, ExecutionStatus, TriggerInfo,
};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

#[async_trait]
pub trait ExecutionDispatcher: Send + Sync {
    async fn start_execution(&self, workflow_id: Uuid, trigger_info: TriggerInfo) -> Result<Uuid>;

    /// Poll until the execution settles (terminal or paused) or the cap
    /// expires; returns the last snapshot seen.
    async fn wait_settled(&self, execution_id: Uuid, cap: Duration) -> Result<Option<Execution>>;
}

/// HTTP client against the engine service
pub struct HttpEngineClient {
    base_url: String,
    client: reqwest::Client,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl HttpEngineClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ExecutionDispatcher for HttpEngineClient {
    async fn start_execution(&self, workflow_id: Uuid, trigger_info: TriggerInfo) -> Result<Uuid> {
        let request = ExecuteRequest {
            actor: trigger_info.actor,
            input_data: trigger_info.input_data.clone(),
            trigger_info,
        };

        let response = self
            .client
            .post(format!("{}/v1/workflows/{workflow_id}/execute", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| SchedulerError::Internal(anyhow::anyhow!("engine unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body: Option<ErrorBody> = response.json().await.ok();
            let message = body
                .map(|b| b.message)
                .unwrap_or_else(|| format!("engine returned {status}"));
            return Err(match status.as_u16() {
                404 => SchedulerError::not_found(message),
                400 => SchedulerError::validation(message),
                _ => SchedulerError::Internal(anyhow::anyhow!(message)),
            });
        }

        let body: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| SchedulerError::Internal(anyhow::anyhow!("bad engine response: {e}")))?;
        Ok(body.execution_id)
    }

    async fn wait_settled(&self, execution_id: Uuid, cap: Duration) -> Result<Option<Execution>> {
        let deadline = tokio::time::Instant::now() + cap;
        loop {
            let response = self
                .client
                .get(format!("{}/v1/executions/{execution_id}", self.base_url))
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|e| SchedulerError::Internal(anyhow::anyhow!("engine unreachable: {e}")))?;

            if response.status().is_success() {
                let execution: Execution = response.json().await.map_err(|e| {
                    SchedulerError::Internal(anyhow::anyhow!("bad engine response: {e}"))
                })?;
                if execution.status.is_terminal() || execution.status == ExecutionStatus::Paused {
                    return Ok(Some(execution));
                }
                if tokio::time::Instant::now() >= deadline {
                    return Ok(Some(execution));
                }
            } else if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// Records dispatches instead of calling out; used by tests.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub calls: std::sync::Mutex<Vec<(Uuid, TriggerInfo)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_ids(&self) -> Vec<Uuid> {
        self.calls.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl ExecutionDispatcher for RecordingDispatcher {
    async fn start_execution(&self, workflow_id: Uuid, trigger_info: TriggerInfo) -> Result<Uuid> {
        self.calls.lock().unwrap().push((workflow_id, trigger_info));
        Ok(Uuid::now_v7())
    }

    async fn wait_settled(&self, _execution_id: Uuid, _cap: Duration) -> Result<Option<Execution>> {
        Ok(None)
    }
}
