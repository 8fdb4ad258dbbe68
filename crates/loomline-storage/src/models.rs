// Row types and write inputs for the repository layer.
// Rows mirror the migration schema; conversions to contract DTOs live here
// so handlers never touch raw rows.

use chrono::{DateTime, Utc};
use loomline_contracts::{
    DeploymentHistoryEntry, Execution, ExecutionLogEntry, ExecutionStatus, LogEventType, LogLevel,
    NodeExecutionResult, PendingPause, TriggerIndexEntry, TriggerInfo, TriggerStatus, WorkflowSpec,
};
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub name: String,
    pub version: i64,
    pub spec: serde_json::Value,
    pub deployment_status: String,
    pub deployment_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    pub fn spec(&self) -> anyhow::Result<WorkflowSpec> {
        Ok(serde_json::from_value(self.spec.clone())?)
    }
}

#[derive(Debug, Clone)]
pub struct CreateWorkflow {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub name: String,
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowVersionRow {
    pub workflow_id: Uuid,
    pub version: i64,
    pub spec: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TriggerIndexRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub trigger_node_id: String,
    pub trigger_type: String,
    pub trigger_subtype: String,
    pub index_key: String,
    pub config: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TriggerIndexRow> for TriggerIndexEntry {
    fn from(row: TriggerIndexRow) -> Self {
        TriggerIndexEntry {
            id: row.id,
            workflow_id: row.workflow_id,
            trigger_node_id: row.trigger_node_id,
            trigger_type: row.trigger_type,
            trigger_subtype: row.trigger_subtype,
            index_key: row.index_key,
            config: row.config,
            status: TriggerStatus::from(row.status.as_str()),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Index rows written during deploy, one per TRIGGER node
#[derive(Debug, Clone)]
pub struct CreateTriggerIndexEntry {
    pub trigger_node_id: String,
    pub trigger_type: String,
    pub trigger_subtype: String,
    pub index_key: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, FromRow)]
pub struct DeploymentHistoryRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub action: String,
    pub actor: String,
    pub trigger_count: i32,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<DeploymentHistoryRow> for DeploymentHistoryEntry {
    fn from(row: DeploymentHistoryRow) -> Self {
        DeploymentHistoryEntry {
            id: row.id,
            workflow_id: row.workflow_id,
            action: row.action,
            actor: row.actor,
            trigger_count: row.trigger_count,
            message: row.message,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i64,
    pub trigger_info: serde_json::Value,
    pub status: String,
    pub is_debug: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_sequence: serde_json::Value,
    pub node_results: serde_json::Value,
    pub final_output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub pending_pause: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRow {
    pub fn into_execution(self) -> anyhow::Result<Execution> {
        let trigger_info: TriggerInfo = serde_json::from_value(self.trigger_info)?;
        let execution_sequence: Vec<String> = serde_json::from_value(self.execution_sequence)?;
        let node_results: HashMap<String, NodeExecutionResult> =
            serde_json::from_value(self.node_results)?;
        let pending_pause: Option<PendingPause> = self
            .pending_pause
            .map(serde_json::from_value)
            .transpose()?;

        Ok(Execution {
            id: self.id,
            workflow_id: self.workflow_id,
            workflow_version: self.workflow_version,
            trigger_info,
            status: ExecutionStatus::from(self.status.as_str()),
            start_time: self.start_time,
            end_time: self.end_time,
            execution_sequence,
            node_results,
            final_output: self.final_output,
            error_message: self.error_message,
            pending_pause,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CreateExecution {
    pub workflow_id: Uuid,
    pub workflow_version: i64,
    pub trigger_info: TriggerInfo,
    pub is_debug: bool,
}

/// Incremental state write performed after every node boundary
#[derive(Debug, Clone)]
pub struct ExecutionStateUpdate {
    pub status: ExecutionStatus,
    pub execution_sequence: Vec<String>,
    pub node_results: HashMap<String, NodeExecutionResult>,
    pub final_output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub pending_pause: Option<PendingPause>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionLogRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: Option<String>,
    pub level: String,
    pub event_type: String,
    pub message: String,
    pub data: serde_json::Value,
    pub is_milestone: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLogRow {
    pub fn into_entry(self) -> ExecutionLogEntry {
        let event_type = serde_json::from_value(serde_json::Value::String(self.event_type.clone()))
            .unwrap_or(LogEventType::RunnerLog);
        ExecutionLogEntry {
            id: self.id,
            execution_id: self.execution_id,
            node_id: self.node_id,
            level: LogLevel::from(self.level.as_str()),
            event_type,
            message: self.message,
            data: self.data,
            is_milestone: self.is_milestone,
            priority: self.priority,
            timestamp: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppendLog {
    pub execution_id: Uuid,
    pub node_id: Option<String>,
    pub level: LogLevel,
    pub event_type: LogEventType,
    pub message: String,
    pub data: serde_json::Value,
    pub is_milestone: bool,
    pub priority: i32,
}

impl AppendLog {
    /// Milestone entry at the engine's lifecycle priority
    pub fn milestone(
        execution_id: Uuid,
        event_type: LogEventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            node_id: None,
            level: LogLevel::Info,
            event_type,
            message: message.into(),
            data: serde_json::json!({}),
            is_milestone: true,
            priority: 8,
        }
    }

    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CredentialRow {
    pub user_id: Uuid,
    pub provider: String,
    pub credential_type: String,
    pub encrypted_access_token: Vec<u8>,
    pub encrypted_refresh_token: Option<Vec<u8>>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scopes: serde_json::Value,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MemoryRow {
    pub workflow_id: Uuid,
    pub collection: String,
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}
