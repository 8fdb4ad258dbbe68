// State store seam between the executor and persistence.
// PgStateStore is the production implementation over the repository layer;
// InMemoryStateStore backs tests and is not durable across restarts.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loomline_contracts::{
    DeploymentStatus, Execution, ExecutionStatus, LogPage, LogQuery, WorkflowSpec,
};
use loomline_storage::{AppendLog, CreateExecution, Database, ExecutionStateUpdate};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Workflow fields the engine needs to start an execution
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub id: Uuid,
    pub name: String,
    pub version: i64,
    pub deployment_status: DeploymentStatus,
    pub spec: WorkflowSpec,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_workflow(&self, id: Uuid) -> Result<Option<WorkflowInfo>>;

    /// Spec pinned at a deploy version; falls back to the workflow's
    /// current spec when no pin exists.
    async fn load_pinned_spec(&self, workflow_id: Uuid, version: i64)
        -> Result<Option<WorkflowSpec>>;

    async fn create_execution(&self, input: CreateExecution) -> Result<Execution>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>>;
    async fn mark_execution_started(&self, id: Uuid) -> Result<()>;
    async fn update_execution_state(&self, id: Uuid, update: ExecutionStateUpdate) -> Result<()>;
    async fn transition_execution_status(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool>;
    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>>;
    async fn find_timed_out_pauses(&self, now: DateTime<Utc>) -> Result<Vec<Execution>>;

    async fn append_log(&self, input: AppendLog) -> Result<()>;
    async fn query_logs(&self, execution_id: Uuid, query: &LogQuery) -> Result<LogPage>;
    async fn prune_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn memory_get(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
    ) -> Result<Option<Value>>;
    async fn memory_set(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
        value: &Value,
    ) -> Result<()>;
    async fn memory_append(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
        value: &Value,
    ) -> Result<()>;
    async fn memory_query(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key_prefix: &str,
        limit: i64,
    ) -> Result<Vec<(String, Value)>>;
}

// ---------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------

pub struct PgStateStore {
    db: Database,
}

impl PgStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load_workflow(&self, id: Uuid) -> Result<Option<WorkflowInfo>> {
        let Some(row) = self.db.get_workflow(id).await? else {
            return Ok(None);
        };
        let spec = row.spec()?;
        Ok(Some(WorkflowInfo {
            id: row.id,
            name: row.name,
            version: row.version,
            deployment_status: DeploymentStatus::from(row.deployment_status.as_str()),
            spec,
        }))
    }

    async fn load_pinned_spec(
        &self,
        workflow_id: Uuid,
        version: i64,
    ) -> Result<Option<WorkflowSpec>> {
        if let Some(pinned) = self.db.get_workflow_version(workflow_id, version).await? {
            return Ok(Some(serde_json::from_value(pinned.spec)?));
        }
        match self.db.get_workflow(workflow_id).await? {
            Some(row) => Ok(Some(row.spec()?)),
            None => Ok(None),
        }
    }

    async fn create_execution(&self, input: CreateExecution) -> Result<Execution> {
        self.db.create_execution(input).await?.into_execution()
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        match self.db.get_execution(id).await? {
            Some(row) => Ok(Some(row.into_execution()?)),
            None => Ok(None),
        }
    }

    async fn mark_execution_started(&self, id: Uuid) -> Result<()> {
        self.db.mark_execution_started(id).await
    }

    async fn update_execution_state(&self, id: Uuid, update: ExecutionStateUpdate) -> Result<()> {
        self.db.update_execution_state(id, update).await
    }

    async fn transition_execution_status(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool> {
        self.db.transition_execution_status(id, from, to).await
    }

    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>> {
        let rows = self.db.list_executions(workflow_id, limit, offset).await?;
        rows.into_iter().map(|r| r.into_execution()).collect()
    }

    async fn find_timed_out_pauses(&self, now: DateTime<Utc>) -> Result<Vec<Execution>> {
        let rows = self.db.find_timed_out_pauses(now).await?;
        rows.into_iter().map(|r| r.into_execution()).collect()
    }

    async fn append_log(&self, input: AppendLog) -> Result<()> {
        self.db.append_log(input).await.map(|_| ())
    }

    async fn query_logs(&self, execution_id: Uuid, query: &LogQuery) -> Result<LogPage> {
        self.db.query_logs(execution_id, query).await
    }

    async fn prune_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.db.prune_logs_before(cutoff).await
    }

    async fn memory_get(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
    ) -> Result<Option<Value>> {
        self.db.memory_get(workflow_id, collection, key).await
    }

    async fn memory_set(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        self.db.memory_set(workflow_id, collection, key, value).await
    }

    async fn memory_append(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        self.db
            .memory_append(workflow_id, collection, key, value)
            .await
    }

    async fn memory_query(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key_prefix: &str,
        limit: i64,
    ) -> Result<Vec<(String, Value)>> {
        let rows = self
            .db
            .memory_query(workflow_id, collection, key_prefix, limit)
            .await?;
        Ok(rows.into_iter().map(|r| (r.key, r.value)).collect())
    }
}

// ---------------------------------------------------------------------
// In-memory (tests, single-process setups)
// ---------------------------------------------------------------------

#[derive(Default)]
struct InMemoryInner {
    workflows: HashMap<Uuid, WorkflowInfo>,
    pinned: HashMap<(Uuid, i64), WorkflowSpec>,
    executions: HashMap<Uuid, Execution>,
    logs: Vec<(Uuid, AppendLog, DateTime<Utc>, Uuid)>,
    memory: HashMap<(Uuid, String, String), Value>,
}

#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<InMemoryInner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_workflow(&self, info: WorkflowInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .pinned
            .insert((info.id, info.version), info.spec.clone());
        inner.workflows.insert(info.id, info);
    }

    /// Log lines captured so far (message only), oldest first
    pub fn log_messages(&self, execution_id: Uuid) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .logs
            .iter()
            .filter(|(id, ..)| *id == execution_id)
            .map(|(_, entry, ..)| entry.message.clone())
            .collect()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_workflow(&self, id: Uuid) -> Result<Option<WorkflowInfo>> {
        Ok(self.inner.lock().unwrap().workflows.get(&id).cloned())
    }

    async fn load_pinned_spec(
        &self,
        workflow_id: Uuid,
        version: i64,
    ) -> Result<Option<WorkflowSpec>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pinned
            .get(&(workflow_id, version))
            .cloned()
            .or_else(|| inner.workflows.get(&workflow_id).map(|w| w.spec.clone())))
    }

    async fn create_execution(&self, input: CreateExecution) -> Result<Execution> {
        let execution = Execution {
            id: Uuid::now_v7(),
            workflow_id: input.workflow_id,
            workflow_version: input.workflow_version,
            trigger_info: input.trigger_info,
            status: ExecutionStatus::New,
            start_time: None,
            end_time: None,
            execution_sequence: Vec::new(),
            node_results: HashMap::new(),
            final_output: None,
            error_message: None,
            pending_pause: None,
        };
        self.inner
            .lock()
            .unwrap()
            .executions
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.inner.lock().unwrap().executions.get(&id).cloned())
    }

    async fn mark_execution_started(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(execution) = inner.executions.get_mut(&id) {
            execution.status = ExecutionStatus::Running;
            execution.start_time.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn update_execution_state(&self, id: Uuid, update: ExecutionStateUpdate) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(execution) = inner.executions.get_mut(&id) {
            execution.status = update.status;
            execution.execution_sequence = update.execution_sequence;
            execution.node_results = update.node_results;
            execution.final_output = update.final_output;
            execution.error_message = update.error_message;
            execution.pending_pause = update.pending_pause;
            if update.end_time.is_some() {
                execution.end_time = update.end_time;
            }
        }
        Ok(())
    }

    async fn transition_execution_status(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.executions.get_mut(&id) {
            Some(execution) if execution.status == from => {
                execution.status = to;
                if to.is_terminal() {
                    execution.end_time = Some(Utc::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| std::cmp::Reverse(e.id));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn find_timed_out_pauses(&self, now: DateTime<Utc>) -> Result<Vec<Execution>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Paused
                    && e.pending_pause.as_ref().is_some_and(|p| {
                        p.paused_at + chrono::Duration::seconds(p.timeout_seconds as i64) <= now
                    })
            })
            .cloned()
            .collect())
    }

    async fn append_log(&self, input: AppendLog) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .logs
            .push((input.execution_id, input, Utc::now(), Uuid::now_v7()));
        Ok(())
    }

    async fn query_logs(&self, execution_id: Uuid, query: &LogQuery) -> Result<LogPage> {
        use loomline_contracts::{ExecutionLogEntry, LogCursor, MAX_LOG_PAGE_SIZE};

        let page_size = query.page_size.unwrap_or(50).clamp(1, MAX_LOG_PAGE_SIZE) as usize;
        let cursor = query.cursor.as_deref().and_then(LogCursor::decode);

        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<ExecutionLogEntry> = inner
            .logs
            .iter()
            .filter(|(id, entry, ts, log_id)| {
                *id == execution_id
                    && query.min_priority.map_or(true, |p| entry.priority >= p)
                    && (!query.milestones_only.unwrap_or(false) || entry.is_milestone)
                    && query.level.map_or(true, |l| entry.level == l)
                    && cursor.map_or(true, |c| (*ts, *log_id) > (c.ts, c.id))
            })
            .map(|(_, entry, ts, log_id)| ExecutionLogEntry {
                id: *log_id,
                execution_id,
                node_id: entry.node_id.clone(),
                level: entry.level,
                event_type: entry.event_type,
                message: entry.message.clone(),
                data: entry.data.clone(),
                is_milestone: entry.is_milestone,
                priority: entry.priority,
                timestamp: *ts,
            })
            .collect();
        entries.sort_by_key(|e| (e.timestamp, e.id));

        let has_next = entries.len() > page_size;
        entries.truncate(page_size);
        let next_cursor = if has_next {
            entries.last().map(|e| {
                LogCursor {
                    ts: e.timestamp,
                    id: e.id,
                }
                .encode()
            })
        } else {
            None
        };

        Ok(LogPage {
            entries,
            next_cursor,
            has_next,
        })
    }

    async fn prune_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.logs.len();
        inner.logs.retain(|(_, _, ts, _)| *ts >= cutoff);
        Ok((before - inner.logs.len()) as u64)
    }

    async fn memory_get(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
    ) -> Result<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .memory
            .get(&(workflow_id, collection.to_string(), key.to_string()))
            .cloned())
    }

    async fn memory_set(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        self.inner.lock().unwrap().memory.insert(
            (workflow_id, collection.to_string(), key.to_string()),
            value.clone(),
        );
        Ok(())
    }

    async fn memory_append(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .memory
            .entry((workflow_id, collection.to_string(), key.to_string()))
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => items.push(value.clone()),
            other => {
                *other = Value::Array(vec![other.clone(), value.clone()]);
            }
        }
        Ok(())
    }

    async fn memory_query(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key_prefix: &str,
        limit: i64,
    ) -> Result<Vec<(String, Value)>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<(String, Value)> = inner
            .memory
            .iter()
            .filter(|((wf, coll, key), _)| {
                *wf == workflow_id && coll == collection && key.starts_with(key_prefix)
            })
            .map(|((_, _, key), value)| (key.clone(), value.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}
