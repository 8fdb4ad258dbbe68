// Trigger index and deployment DTOs (scheduler surface)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Index row status; paused rows stay in the index but never match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Active,
    Paused,
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerStatus::Active => f.write_str("active"),
            TriggerStatus::Paused => f.write_str("paused"),
        }
    }
}

impl From<&str> for TriggerStatus {
    fn from(s: &str) -> Self {
        match s {
            "paused" => TriggerStatus::Paused,
            _ => TriggerStatus::Active,
        }
    }
}

/// One registered trigger: lookup by `index_key` yields candidate workflows
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TriggerIndexEntry {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub trigger_node_id: String,
    pub trigger_type: String,
    pub trigger_subtype: String,
    pub index_key: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub status: TriggerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of POST /deployments/:workflow_id
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeployRequest {
    pub workflow_spec: crate::WorkflowSpec,
    #[serde(default)]
    pub actor: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeployResponse {
    pub deployment_id: Uuid,
    pub status: crate::DeploymentStatus,
    pub message: String,
    pub trigger_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UndeployResponse {
    pub success: bool,
    pub message: String,
}

/// Body of POST /executions/workflows/:workflow_id/trigger
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TriggerExecutionRequest {
    #[serde(default)]
    pub trigger_metadata: serde_json::Value,
    #[serde(default)]
    pub input_data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TriggerExecutionResponse {
    pub execution_id: Uuid,
    /// Workflow name and node count, for manual-invocation summaries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count: Option<usize>,
}

/// Outcome of routing one event to one workflow
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RoutedExecution {
    pub workflow_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Ack returned by event ingestion endpoints; routing never waits on
/// execution completion unless the webhook declared sync response mode
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EventAck {
    pub message: String,
    pub processed_workflows: usize,
    #[serde(default)]
    pub results: Vec<RoutedExecution>,
}

/// One deployment history row
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeploymentHistoryEntry {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub action: String,
    pub actor: String,
    pub trigger_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}
