// Execution DTOs: one attempt to run a deployed workflow from a trigger event.
// The engine owns these rows; the scheduler only ever creates them indirectly
// through Engine.Execute.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// Execution lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    New,
    Running,
    Paused,
    Success,
    Error,
    Canceled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Error | ExecutionStatus::Canceled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::New => "NEW",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Paused => "PAUSED",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Error => "ERROR",
            ExecutionStatus::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

impl From<&str> for ExecutionStatus {
    fn from(s: &str) -> Self {
        match s {
            "RUNNING" => ExecutionStatus::Running,
            "PAUSED" => ExecutionStatus::Paused,
            "SUCCESS" => ExecutionStatus::Success,
            "ERROR" => ExecutionStatus::Error,
            "CANCELED" => ExecutionStatus::Canceled,
            _ => ExecutionStatus::New,
        }
    }
}

/// Per-node result status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeResultStatus {
    Success,
    Error,
    Skipped,
    Paused,
}

/// Cap on per-result inline logs; older entries are dropped first
pub const NODE_LOG_RING_CAPACITY: usize = 64;

/// Result of one node dispatch
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeExecutionResult {
    pub status: NodeResultStatus,
    /// Port name → emitted value
    #[serde(default)]
    pub output_data: HashMap<String, serde_json::Value>,
    /// Port the node emitted on, for single-port emits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Bounded ring of runner log lines
    #[serde(default)]
    pub logs: Vec<String>,
}

impl NodeExecutionResult {
    /// Successful emit of `value` on `port`
    pub fn success_on(port: impl Into<String>, value: serde_json::Value) -> Self {
        let port = port.into();
        let mut output_data = HashMap::new();
        output_data.insert(port.clone(), value);
        Self {
            status: NodeResultStatus::Success,
            output_data,
            output_port: Some(port),
            error_message: None,
            error_details: None,
            started_at: None,
            finished_at: None,
            logs: Vec::new(),
        }
    }

    /// Successful emit on the default `main` port
    pub fn success(value: serde_json::Value) -> Self {
        Self::success_on("main", value)
    }

    pub fn error(kind: crate::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: NodeResultStatus::Error,
            output_data: HashMap::new(),
            output_port: None,
            error_message: Some(message.into()),
            error_details: Some(serde_json::json!({ "error_kind": kind })),
            started_at: None,
            finished_at: None,
            logs: Vec::new(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: NodeResultStatus::Skipped,
            output_data: HashMap::new(),
            output_port: None,
            error_message: None,
            error_details: None,
            started_at: None,
            finished_at: None,
            logs: Vec::new(),
        }
    }

    /// Error kind recorded in `error_details`, defaulting to INTERNAL
    pub fn error_kind(&self) -> Option<crate::ErrorKind> {
        self.error_details
            .as_ref()
            .and_then(|d| d.get("error_kind"))
            .and_then(|k| serde_json::from_value(k.clone()).ok())
    }

    /// Value emitted on `port`, if the node activated it
    pub fn port_value(&self, port: &str) -> Option<&serde_json::Value> {
        self.output_data.get(port)
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        if self.logs.len() >= NODE_LOG_RING_CAPACITY {
            self.logs.remove(0);
        }
        self.logs.push(line.into());
    }
}

/// How an execution came to exist
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TriggerInfo {
    pub trigger_type: String,
    pub trigger_subtype: String,
    /// Trigger node id within the workflow
    pub trigger_node_id: String,
    /// Raw transport event, untouched
    #[serde(default)]
    pub raw_event: serde_json::Value,
    /// Normalized payload the trigger node will emit
    #[serde(default)]
    pub input_data: serde_json::Value,
    /// User the execution acts as (credential lookups, audit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Uuid>,
}

/// State persisted when a HUMAN_LOOP node suspends the execution
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PendingPause {
    pub node_id: String,
    pub interaction_id: String,
    pub resume_token: String,
    /// Channel the question was posted to (e.g. a Slack channel)
    #[serde(default)]
    pub channel_config: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    pub timeout_seconds: u64,
    /// Node ids that were ready but not yet dispatched when the pause hit
    #[serde(default)]
    pub remaining_frontier: Vec<String>,
    pub paused_at: DateTime<Utc>,
}

/// Execution snapshot
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i64,
    pub trigger_info: TriggerInfo,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Node ids in dispatch order
    #[serde(default)]
    pub execution_sequence: Vec<String>,
    #[serde(default)]
    pub node_results: HashMap<String, NodeExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_pause: Option<PendingPause>,
}

/// Body of POST /v1/executions/:id/resume
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResumeRequest {
    pub interaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_data: Option<serde_json::Value>,
}

/// Body of POST /v1/workflows/:id/execute
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExecuteRequest {
    pub trigger_info: TriggerInfo,
    #[serde(default)]
    pub input_data: serde_json::Value,
    #[serde(default)]
    pub actor: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExecuteResponse {
    pub execution_id: Uuid,
}

/// Body of POST /v1/workflows/:id/nodes/:node_id/execute
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SingleNodeRequest {
    #[serde(default)]
    pub input_data: serde_json::Value,
    #[serde(default)]
    pub actor: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        assert_eq!(ExecutionStatus::from("SUCCESS"), ExecutionStatus::Success);
        assert_eq!(ExecutionStatus::from("bogus"), ExecutionStatus::New);
        assert!(ExecutionStatus::Canceled.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }

    #[test]
    fn test_node_result_helpers() {
        let ok = NodeExecutionResult::success(serde_json::json!({"a": 1}));
        assert_eq!(ok.output_port.as_deref(), Some("main"));
        assert_eq!(ok.port_value("main").unwrap()["a"], 1);
        assert!(ok.port_value("error").is_none());

        let err = NodeExecutionResult::error(crate::ErrorKind::RateLimit, "slow down");
        assert_eq!(err.error_kind(), Some(crate::ErrorKind::RateLimit));
    }

    #[test]
    fn test_log_ring_bounded() {
        let mut r = NodeExecutionResult::success(serde_json::json!(null));
        for i in 0..(NODE_LOG_RING_CAPACITY + 10) {
            r.push_log(format!("line {i}"));
        }
        assert_eq!(r.logs.len(), NODE_LOG_RING_CAPACITY);
        assert_eq!(r.logs[0], "line 10");
    }
}
