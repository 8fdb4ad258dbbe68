// Per-dispatch context handed to node runners: resolved parameters, gathered
// inputs, trigger info, token source, memory handle, and the execution
// logger. Runners never touch the database directly.

use chrono::{DateTime, Utc};
use loomline_contracts::{LogEventType, LogLevel, Node, ResumeRequest, TriggerInfo};
use loomline_storage::AppendLog;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::credentials::TokenSource;
use crate::store::StateStore;

/// Structured log writer bound to one execution.
/// Write failures are reported via tracing and never fail the node.
#[derive(Clone)]
pub struct ExecutionLogger {
    store: Arc<dyn StateStore>,
    execution_id: Uuid,
}

impl ExecutionLogger {
    pub fn new(store: Arc<dyn StateStore>, execution_id: Uuid) -> Self {
        Self {
            store,
            execution_id,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub async fn append(&self, entry: AppendLog) {
        if let Err(e) = self.store.append_log(entry).await {
            tracing::warn!(execution_id = %self.execution_id, error = %e, "Failed to append execution log");
        }
    }

    /// Milestone lifecycle entry (priority 8)
    pub async fn milestone(&self, event_type: LogEventType, message: impl Into<String>) {
        self.append(AppendLog::milestone(self.execution_id, event_type, message))
            .await;
    }

    /// Milestone entry scoped to a node
    pub async fn node_milestone(
        &self,
        node_id: &str,
        event_type: LogEventType,
        message: impl Into<String>,
    ) {
        self.append(
            AppendLog::milestone(self.execution_id, event_type, message).for_node(node_id),
        )
        .await;
    }

    /// Runner detail entry (priority 5)
    pub async fn node_log(
        &self,
        node_id: &str,
        level: LogLevel,
        message: impl Into<String>,
        data: Value,
    ) {
        self.append(AppendLog {
            execution_id: self.execution_id,
            node_id: Some(node_id.to_string()),
            level,
            event_type: LogEventType::RunnerLog,
            message: message.into(),
            data,
            is_milestone: false,
            priority: 5,
        })
        .await;
    }
}

/// Workflow-namespaced key-value handle for TOOL/MEMORY runners
#[derive(Clone)]
pub struct MemoryHandle {
    store: Arc<dyn StateStore>,
    workflow_id: Uuid,
}

impl MemoryHandle {
    pub fn new(store: Arc<dyn StateStore>, workflow_id: Uuid) -> Self {
        Self { store, workflow_id }
    }

    pub async fn get(&self, collection: &str, key: &str) -> anyhow::Result<Option<Value>> {
        self.store.memory_get(self.workflow_id, collection, key).await
    }

    pub async fn set(&self, collection: &str, key: &str, value: &Value) -> anyhow::Result<()> {
        self.store
            .memory_set(self.workflow_id, collection, key, value)
            .await
    }

    pub async fn append(&self, collection: &str, key: &str, value: &Value) -> anyhow::Result<()> {
        self.store
            .memory_append(self.workflow_id, collection, key, value)
            .await
    }

    pub async fn query(
        &self,
        collection: &str,
        key_prefix: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<(String, Value)>> {
        self.store
            .memory_query(self.workflow_id, collection, key_prefix, limit)
            .await
    }
}

/// Everything a runner sees for one dispatch
pub struct NodeExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub node: Node,
    /// Node configuration with templates resolved
    pub resolved_config: Value,
    /// Declared input params with templates resolved
    pub resolved_params: Value,
    /// Gathered edge inputs keyed by to_port
    pub inputs: HashMap<String, Value>,
    pub trigger: TriggerInfo,
    pub static_data: Value,
    pub actor: Option<Uuid>,
    pub credentials: Arc<dyn TokenSource>,
    pub memory: MemoryHandle,
    pub logger: ExecutionLogger,
    /// Set by the engine when the execution is being cancelled
    pub cancelled: Arc<AtomicBool>,
    /// Execution-level deadline
    pub deadline: DateTime<Utc>,
    /// Present only when re-dispatching a HUMAN_LOOP node on resume
    pub resume: Option<ResumeRequest>,
    /// LOOP nodes: the current iteration counter
    pub iteration: u64,
}

impl NodeExecutionContext {
    /// The value on the default input port, null when absent
    pub fn main_input(&self) -> Value {
        self.inputs.get("main").cloned().unwrap_or(Value::Null)
    }

    /// All inputs merged into one object keyed by port
    pub fn merged_inputs(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (port, value) in &self.inputs {
            map.insert(port.clone(), value.clone());
        }
        Value::Object(map)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.resolved_config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.resolved_config.get(key).and_then(|v| v.as_u64())
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.resolved_config.get(key).and_then(|v| v.as_bool())
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.resolved_config.get(key)
    }
}
