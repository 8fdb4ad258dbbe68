// Workflow execution engine.
// Walks the node graph from the triggering node: a node dispatches once all
// of its gating inbound edges have settled, branch decisions skip through
// port activation, ready nodes run in waves bounded by the concurrency cap,
// and HUMAN_LOOP nodes suspend the whole execution to the store.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use loomline_contracts::{
    Execution, ExecutionStatus, LogEventType, LogLevel, Node, NodeExecutionResult,
    NodeResultStatus, NodeType, PendingPause, ResumeRequest, TriggerInfo, WorkflowSpec,
};
use loomline_storage::{AppendLog, CreateExecution, ExecutionStateUpdate};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::{ExecutionLogger, MemoryHandle, NodeExecutionContext};
use crate::convert::ConvExpr;
use crate::credentials::TokenSource;
use crate::error::{EngineError, NodeError, Result};
use crate::registry::RunnerRegistry;
use crate::retry::OnErrorPolicy;
use crate::runners::flow::{LOOP_CONTINUE_PORT, LOOP_FEEDBACK_PORT};
use crate::runners::human::{pause_payload, TIMEOUT_PORT, TIMED_OUT_MARKER};
use crate::store::StateStore;
use crate::template::{resolve_value, TemplateContext};

pub const DEFAULT_NODE_CONCURRENCY: usize = 4;
pub const DEFAULT_DEADLINE_SECONDS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Nodes at the same topological level run concurrently up to this cap
    pub concurrency: usize,
    /// Execution-level deadline
    pub deadline_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_NODE_CONCURRENCY,
            deadline_seconds: DEFAULT_DEADLINE_SECONDS,
        }
    }
}

pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    registry: Arc<RunnerRegistry>,
    credentials: Arc<dyn TokenSource>,
    config: EngineConfig,
    cancel_flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
    active: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<RunnerRegistry>,
        credentials: Arc<dyn TokenSource>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            credentials,
            config,
            cancel_flags: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<RunnerRegistry> {
        self.registry.clone()
    }

    /// Start an execution of a deployed workflow. Async: returns the
    /// execution id as soon as the row exists.
    pub async fn execute(
        self: &Arc<Self>,
        workflow_id: Uuid,
        trigger_info: TriggerInfo,
    ) -> Result<Uuid> {
        let workflow = self
            .store
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("workflow {workflow_id}")))?;

        if workflow.deployment_status != loomline_contracts::DeploymentStatus::Deployed {
            return Err(EngineError::state(format!(
                "workflow {workflow_id} is {} (expected DEPLOYED)",
                workflow.deployment_status
            )));
        }

        match workflow.spec.node(&trigger_info.trigger_node_id) {
            Some(node) if node.node_type == NodeType::Trigger => {}
            Some(_) => {
                return Err(EngineError::validation(format!(
                    "node '{}' is not a trigger",
                    trigger_info.trigger_node_id
                )))
            }
            None => {
                return Err(EngineError::validation(format!(
                    "unknown trigger node '{}'",
                    trigger_info.trigger_node_id
                )))
            }
        }

        let execution = self
            .store
            .create_execution(CreateExecution {
                workflow_id,
                workflow_version: workflow.version,
                trigger_info,
                is_debug: false,
            })
            .await?;

        self.spawn_run(execution.id, None);
        Ok(execution.id)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("execution {id}")))
    }

    /// Cancel takes effect at the next node boundary; terminal executions
    /// are a no-op.
    pub async fn cancel(&self, id: Uuid) -> Result<ExecutionStatus> {
        let execution = self.get_execution(id).await?;
        match execution.status {
            status if status.is_terminal() => Ok(status),
            ExecutionStatus::New | ExecutionStatus::Paused => {
                self.store
                    .transition_execution_status(id, execution.status, ExecutionStatus::Canceled)
                    .await?;
                self.set_cancel_flag(id);
                Ok(ExecutionStatus::Canceled)
            }
            ExecutionStatus::Running => {
                self.set_cancel_flag(id);
                Ok(ExecutionStatus::Running)
            }
            other => Ok(other),
        }
    }

    /// Resume a PAUSED execution with the human's answer.
    pub async fn resume(self: &Arc<Self>, id: Uuid, request: ResumeRequest) -> Result<()> {
        let execution = self.get_execution(id).await?;
        if execution.status != ExecutionStatus::Paused {
            return Err(EngineError::state(format!(
                "execution {id} is {} (expected PAUSED)",
                execution.status
            )));
        }
        let pending = execution
            .pending_pause
            .as_ref()
            .ok_or_else(|| EngineError::state(format!("execution {id} has no pending pause")))?;
        if pending.interaction_id != request.interaction_id {
            return Err(EngineError::validation(
                "interaction_id does not match the pending interaction",
            ));
        }

        self.spawn_run(id, Some(request));
        Ok(())
    }

    /// Used by the timeout sweep: resume a lapsed pause with the timed_out
    /// marker so the HUMAN_LOOP runner can post its timeout message.
    pub async fn force_timeout(self: &Arc<Self>, execution: &Execution) -> Result<()> {
        let Some(pending) = execution.pending_pause.as_ref() else {
            return Ok(());
        };
        let request = ResumeRequest {
            interaction_id: pending.interaction_id.clone(),
            approved: Some(false),
            output_port: None,
            resume_data: Some(serde_json::json!({ TIMED_OUT_MARKER: true })),
        };
        self.resume(execution.id, request).await
    }

    /// Debug re-run of a single node, bypassing the graph walk.
    pub async fn execute_single_node(
        self: &Arc<Self>,
        workflow_id: Uuid,
        node_id: &str,
        input: Value,
        actor: Option<Uuid>,
    ) -> Result<NodeExecutionResult> {
        let workflow = self
            .store
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("workflow {workflow_id}")))?;
        let node = workflow
            .spec
            .node(node_id)
            .ok_or_else(|| EngineError::not_found(format!("node '{node_id}'")))?
            .clone();

        let runner = self
            .registry
            .get(node.node_type, &node.subtype)
            .ok_or_else(|| {
                EngineError::NotImplemented(format!("({}, {})", node.node_type, node.subtype))
            })?;

        let trigger_info = TriggerInfo {
            trigger_type: "TRIGGER".to_string(),
            trigger_subtype: "MANUAL".to_string(),
            trigger_node_id: node_id.to_string(),
            raw_event: Value::Null,
            input_data: input.clone(),
            actor,
        };
        let execution = self
            .store
            .create_execution(CreateExecution {
                workflow_id,
                workflow_version: workflow.version,
                trigger_info: trigger_info.clone(),
                is_debug: true,
            })
            .await?;
        self.store.mark_execution_started(execution.id).await?;

        let logger = ExecutionLogger::new(self.store.clone(), execution.id);
        let template_ctx = TemplateContext {
            payload: input.clone(),
            trigger: serde_json::to_value(&trigger_info).unwrap_or(Value::Null),
            workflow: serde_json::json!({"static_data": workflow.spec.static_data()}),
            execution: serde_json::json!({"id": execution.id, "workflow_id": workflow_id}),
            env: TemplateContext::capture_env(),
            node_outputs: HashMap::new(),
        };

        let ctx = NodeExecutionContext {
            execution_id: execution.id,
            workflow_id,
            node: node.clone(),
            resolved_config: resolve_value(&node.configurations, &template_ctx),
            resolved_params: resolve_value(&node.input_params, &template_ctx),
            inputs: HashMap::from([("main".to_string(), input)]),
            trigger: trigger_info,
            static_data: workflow.spec.static_data(),
            actor,
            credentials: self.credentials.clone(),
            memory: MemoryHandle::new(self.store.clone(), workflow_id),
            logger,
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Utc::now() + ChronoDuration::seconds(self.config.deadline_seconds as i64),
            resume: None,
            iteration: 0,
        };

        let started = Utc::now();
        let mut result = match runner.execute(&ctx).await {
            Ok(result) => result,
            Err(e) => error_result(&e),
        };
        result.started_at = Some(started);
        result.finished_at = Some(Utc::now());

        let status = match result.status {
            NodeResultStatus::Error => ExecutionStatus::Error,
            _ => ExecutionStatus::Success,
        };
        self.store
            .update_execution_state(
                execution.id,
                ExecutionStateUpdate {
                    status,
                    execution_sequence: vec![node_id.to_string()],
                    node_results: HashMap::from([(node_id.to_string(), result.clone())]),
                    final_output: result.port_value("main").cloned(),
                    error_message: result.error_message.clone(),
                    pending_pause: None,
                    end_time: Some(Utc::now()),
                },
            )
            .await?;

        Ok(result)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    fn set_cancel_flag(&self, id: Uuid) {
        let mut flags = self.cancel_flags.lock().unwrap();
        flags
            .entry(id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .store(true, Ordering::Relaxed);
    }

    fn cancel_flag(&self, id: Uuid) -> Arc<AtomicBool> {
        self.cancel_flags
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn spawn_run(self: &Arc<Self>, execution_id: Uuid, resume: Option<ResumeRequest>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = engine.run(execution_id, resume).await {
                warn!(execution_id = %execution_id, error = %e, "Execution task failed");
                let _ = engine
                    .store
                    .transition_execution_status(
                        execution_id,
                        ExecutionStatus::Running,
                        ExecutionStatus::Error,
                    )
                    .await;
            }
            engine.active.lock().unwrap().remove(&execution_id);
            engine.cancel_flags.lock().unwrap().remove(&execution_id);
        });
        self.active.lock().unwrap().insert(execution_id, handle);
    }

    /// Join the spawned run task for an execution (tests and sync paths).
    pub async fn join(&self, execution_id: Uuid) {
        let handle = self.active.lock().unwrap().remove(&execution_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // -----------------------------------------------------------------
    // The walk
    // -----------------------------------------------------------------

    async fn run(
        self: &Arc<Self>,
        execution_id: Uuid,
        resume: Option<ResumeRequest>,
    ) -> anyhow::Result<()> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            anyhow::bail!("execution {execution_id} disappeared");
        };
        let Some(spec) = self
            .store
            .load_pinned_spec(execution.workflow_id, execution.workflow_version)
            .await?
        else {
            anyhow::bail!("workflow {} has no spec", execution.workflow_id);
        };

        let logger = ExecutionLogger::new(self.store.clone(), execution_id);
        let cancelled = self.cancel_flag(execution_id);
        let resuming = resume.is_some();

        self.store.mark_execution_started(execution_id).await?;
        if resuming {
            logger
                .milestone(LogEventType::ExecutionResumed, "Execution resumed")
                .await;
        } else {
            logger
                .milestone(
                    LogEventType::ExecutionStarted,
                    format!("Execution started from {}", execution.trigger_info.trigger_node_id),
                )
                .await;
        }

        // A resumed execution gets a fresh window; pauses can legitimately
        // outlive the running-time deadline
        let deadline_base = if resuming {
            Utc::now()
        } else {
            execution.start_time.unwrap_or_else(Utc::now)
        };
        let deadline = deadline_base + ChronoDuration::seconds(self.config.deadline_seconds as i64);

        let mut state = RunState::new(spec, &execution);

        // Re-dispatch the paused node first, feeding it the human's answer
        if let Some(request) = resume {
            let Some(pending) = execution.pending_pause.clone() else {
                anyhow::bail!("resume without pending pause");
            };
            state.results.remove(&pending.node_id);
            let node = state
                .spec
                .node(&pending.node_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("paused node '{}' missing", pending.node_id))?;

            let outcome = self
                .dispatch(
                    &state,
                    &node,
                    execution_id,
                    &logger,
                    cancelled.clone(),
                    deadline,
                    Some(request),
                )
                .await;

            if self
                .apply_result(
                    &mut state,
                    &node,
                    outcome,
                    execution_id,
                    &logger,
                    cancelled.clone(),
                )
                .await?
            {
                return Ok(());
            }
        }

        loop {
            if cancelled.load(Ordering::Relaxed) {
                self.finish_cancelled(&state, execution_id, &logger).await?;
                return Ok(());
            }
            if Utc::now() > deadline {
                self.finish_error(
                    &state,
                    execution_id,
                    &logger,
                    "Execution deadline exceeded".to_string(),
                    LogEventType::ExecutionTimedOut,
                )
                .await?;
                return Ok(());
            }

            state.settle_skips();
            let ready = state.ready_nodes();
            if ready.is_empty() {
                self.finish_success(&state, execution_id, &logger).await?;
                return Ok(());
            }

            let wave: Vec<Node> = ready
                .iter()
                .take(self.config.concurrency)
                .filter_map(|id| state.spec.node(id).cloned())
                .collect();

            let dispatches = wave.iter().map(|node| {
                self.dispatch(
                    &state,
                    node,
                    execution_id,
                    &logger,
                    cancelled.clone(),
                    deadline,
                    None,
                )
            });
            let outcomes: Vec<DispatchOutcome> = join_all(dispatches).await;

            for (node, outcome) in wave.iter().zip(outcomes) {
                if self
                    .apply_result(
                        &mut state,
                        node,
                        outcome,
                        execution_id,
                        &logger,
                        cancelled.clone(),
                    )
                    .await?
                {
                    return Ok(());
                }
            }

            self.persist(&state, execution_id, ExecutionStatus::Running, None, None)
                .await?;
        }
    }

    /// Apply one node outcome to the run state. Returns true when the
    /// execution reached a terminal or paused state.
    async fn apply_result(
        self: &Arc<Self>,
        state: &mut RunState,
        node: &Node,
        outcome: DispatchOutcome,
        execution_id: Uuid,
        logger: &ExecutionLogger,
        cancelled: Arc<AtomicBool>,
    ) -> anyhow::Result<bool> {
        let DispatchOutcome { result, abort } = outcome;

        if state.sequence.last().map(String::as_str) != Some(node.id.as_str()) {
            state.sequence.push(node.id.clone());
        }

        match result.status {
            NodeResultStatus::Paused => {
                let Some((interaction_id, resume_token, channel_config, question, timeout_seconds)) =
                    pause_payload(&result)
                else {
                    anyhow::bail!("PAUSED result without pause payload from '{}'", node.id);
                };
                state.results.insert(node.id.clone(), result);
                state.settle_skips();
                let mut remaining = state.ready_nodes();
                remaining.retain(|id| id != &node.id);

                let pending = PendingPause {
                    node_id: node.id.clone(),
                    interaction_id,
                    resume_token,
                    channel_config,
                    question,
                    timeout_seconds,
                    remaining_frontier: remaining,
                    paused_at: Utc::now(),
                };
                logger
                    .node_milestone(
                        &node.id,
                        LogEventType::ExecutionPaused,
                        format!("Paused awaiting interaction {}", pending.interaction_id),
                    )
                    .await;
                self.persist(
                    state,
                    execution_id,
                    ExecutionStatus::Paused,
                    None,
                    Some(pending),
                )
                .await?;
                return Ok(true);
            }
            NodeResultStatus::Error if abort => {
                let message = result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "node failed".to_string());
                state.results.insert(node.id.clone(), result);
                // A node interrupted by cancellation is not a failure
                if cancelled.load(Ordering::Relaxed) {
                    self.finish_cancelled(state, execution_id, logger).await?;
                } else {
                    self.finish_error(
                        state,
                        execution_id,
                        logger,
                        format!("node '{}': {message}", node.id),
                        LogEventType::ExecutionFailed,
                    )
                    .await?;
                }
                return Ok(true);
            }
            _ => {}
        }

        // A timed-out human node with no timeout edge fails the execution
        if result.output_port.as_deref() == Some(TIMEOUT_PORT)
            && !state
                .spec
                .outbound(&node.id)
                .any(|c| c.from_port == TIMEOUT_PORT)
        {
            state.results.insert(node.id.clone(), result);
            self.finish_error(
                state,
                execution_id,
                logger,
                format!("node '{}': human input timed out", node.id),
                LogEventType::ExecutionTimedOut,
            )
            .await?;
            return Ok(true);
        }

        // LOOP bookkeeping: continuing clears the body for the next pass
        if node.node_type == NodeType::Flow && node.subtype.eq_ignore_ascii_case("LOOP") {
            if result.output_port.as_deref() == Some(LOOP_CONTINUE_PORT) {
                let body = state.loop_body(&node.id);
                for body_node in &body {
                    state.results.remove(body_node);
                }
            }
        }

        // Body tail feeding a LOOP node re-arms that loop
        let feedback_targets: Vec<String> = state
            .spec
            .outbound(&node.id)
            .filter(|c| c.to_port == LOOP_FEEDBACK_PORT)
            .map(|c| c.to_node.clone())
            .collect();
        state.results.insert(node.id.clone(), result);
        for loop_id in feedback_targets {
            if state.results.remove(&loop_id).is_some() {
                *state.loop_iterations.entry(loop_id).or_insert(0) += 1;
            }
        }

        Ok(false)
    }

    async fn dispatch(
        self: &Arc<Self>,
        state: &RunState,
        node: &Node,
        execution_id: Uuid,
        logger: &ExecutionLogger,
        cancelled: Arc<AtomicBool>,
        deadline: DateTime<Utc>,
        resume: Option<ResumeRequest>,
    ) -> DispatchOutcome {
        logger
            .node_milestone(&node.id, LogEventType::NodeStarted, format!("{} started", node.id))
            .await;

        let Some(runner) = self.registry.get(node.node_type, &node.subtype) else {
            let e = NodeError::new(
                loomline_contracts::ErrorKind::NotImplemented,
                format!("no runner for ({}, {})", node.node_type, node.subtype),
            );
            logger
                .node_milestone(&node.id, LogEventType::NodeFailed, e.to_string())
                .await;
            return DispatchOutcome {
                result: error_result(&e),
                abort: true,
            };
        };

        let inputs = state.gather_inputs(node);
        let template_ctx = state.template_context(execution_id);
        let policy = OnErrorPolicy::from_config(&node.configurations);

        let ctx = NodeExecutionContext {
            execution_id,
            workflow_id: state.workflow_id,
            node: node.clone(),
            resolved_config: resolve_value(&node.configurations, &template_ctx),
            resolved_params: resolve_value(&node.input_params, &template_ctx),
            inputs,
            trigger: state.trigger.clone(),
            static_data: state.spec.static_data(),
            actor: state.actor,
            credentials: self.credentials.clone(),
            memory: MemoryHandle::new(self.store.clone(), state.workflow_id),
            logger: logger.clone(),
            cancelled,
            deadline,
            resume,
            iteration: state.loop_iterations.get(&node.id).copied().unwrap_or(0),
        };

        let started = Utc::now();
        let mut attempt = 0u32;
        let final_error = loop {
            attempt += 1;
            let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
            let attempt_result =
                match tokio::time::timeout(remaining, runner.execute(&ctx)).await {
                    Ok(r) => r,
                    Err(_) => Err(NodeError::timeout("node exceeded the execution deadline")),
                };

            match attempt_result {
                Ok(mut result) => {
                    result.started_at = Some(started);
                    result.finished_at = Some(Utc::now());
                    let event = match result.status {
                        NodeResultStatus::Paused => LogEventType::ExecutionPaused,
                        _ => LogEventType::NodeCompleted,
                    };
                    logger
                        .node_milestone(&node.id, event, format!("{} completed", node.id))
                        .await;
                    return DispatchOutcome {
                        result,
                        abort: false,
                    };
                }
                Err(e) => {
                    if let OnErrorPolicy::Retry(retry) = policy {
                        if attempt < retry.max_tries {
                            let delay = retry.backoff_delay(attempt);
                            logger
                                .append(
                                    AppendLog::milestone(
                                        execution_id,
                                        LogEventType::RetryScheduled,
                                        format!(
                                            "{}: attempt {attempt} failed ({e}), retrying in {}ms",
                                            node.id,
                                            delay.as_millis()
                                        ),
                                    )
                                    .for_node(&node.id)
                                    .with_level(LogLevel::Warn),
                                )
                                .await;
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    break e;
                }
            }
        };

        logger
            .node_milestone(
                &node.id,
                LogEventType::NodeFailed,
                format!("{} failed: {final_error}", node.id),
            )
            .await;

        match policy {
            OnErrorPolicy::Continue => {
                logger
                    .node_log(
                        &node.id,
                        LogLevel::Warn,
                        format!("continuing past error: {final_error}"),
                        serde_json::json!({}),
                    )
                    .await;
                let mut result = NodeExecutionResult::success(serde_json::json!({}));
                result.started_at = Some(started);
                result.finished_at = Some(Utc::now());
                DispatchOutcome {
                    result,
                    abort: false,
                }
            }
            _ => {
                let mut result = error_result(&final_error);
                result.started_at = Some(started);
                result.finished_at = Some(Utc::now());
                DispatchOutcome {
                    result,
                    abort: true,
                }
            }
        }
    }

    async fn persist(
        &self,
        state: &RunState,
        execution_id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
        pending_pause: Option<PendingPause>,
    ) -> anyhow::Result<()> {
        let end_time = if status.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };
        let final_output = if status == ExecutionStatus::Success {
            Some(state.final_output())
        } else {
            None
        };
        self.store
            .update_execution_state(
                execution_id,
                ExecutionStateUpdate {
                    status,
                    execution_sequence: state.sequence.clone(),
                    node_results: state.results.clone(),
                    final_output,
                    error_message,
                    pending_pause,
                    end_time,
                },
            )
            .await?;
        Ok(())
    }

    async fn finish_success(
        &self,
        state: &RunState,
        execution_id: Uuid,
        logger: &ExecutionLogger,
    ) -> anyhow::Result<()> {
        self.persist(state, execution_id, ExecutionStatus::Success, None, None)
            .await?;
        logger
            .milestone(LogEventType::ExecutionCompleted, "Execution completed")
            .await;
        info!(execution_id = %execution_id, nodes = state.sequence.len(), "Execution completed");
        Ok(())
    }

    async fn finish_error(
        &self,
        state: &RunState,
        execution_id: Uuid,
        logger: &ExecutionLogger,
        message: String,
        event: LogEventType,
    ) -> anyhow::Result<()> {
        self.persist(
            state,
            execution_id,
            ExecutionStatus::Error,
            Some(message.clone()),
            None,
        )
        .await?;
        logger.milestone(event, message).await;
        Ok(())
    }

    async fn finish_cancelled(
        &self,
        state: &RunState,
        execution_id: Uuid,
        logger: &ExecutionLogger,
    ) -> anyhow::Result<()> {
        self.persist(state, execution_id, ExecutionStatus::Canceled, None, None)
            .await?;
        logger
            .milestone(LogEventType::ExecutionCanceled, "Execution cancelled")
            .await;
        Ok(())
    }
}

struct DispatchOutcome {
    result: NodeExecutionResult,
    abort: bool,
}

fn error_result(e: &NodeError) -> NodeExecutionResult {
    let mut result = NodeExecutionResult::error(e.kind, e.message.clone());
    if let Some(details) = &e.details {
        result.error_details = Some(serde_json::json!({
            "error_kind": e.kind,
            "details": details,
        }));
    }
    result
}

// ---------------------------------------------------------------------
// Run state: readiness, gating, skips, loops
// ---------------------------------------------------------------------

struct RunState {
    spec: WorkflowSpec,
    workflow_id: Uuid,
    trigger: TriggerInfo,
    actor: Option<Uuid>,
    results: HashMap<String, NodeExecutionResult>,
    sequence: Vec<String>,
    loop_iterations: HashMap<String, u64>,
    reachable: HashSet<String>,
    env: HashMap<String, String>,
}

impl RunState {
    fn new(spec: WorkflowSpec, execution: &Execution) -> Self {
        let reachable = reachable_from(&spec, &execution.trigger_info.trigger_node_id);
        Self {
            workflow_id: execution.workflow_id,
            trigger: execution.trigger_info.clone(),
            actor: execution.trigger_info.actor,
            results: execution.node_results.clone(),
            sequence: execution.execution_sequence.clone(),
            loop_iterations: HashMap::new(),
            reachable,
            env: TemplateContext::capture_env(),
            spec,
        }
    }

    /// Gating inbound edges for readiness: edges from outside this run are
    /// ignored, and LOOP feedback edges never gate.
    fn gating_inbound(&self, node: &Node) -> Vec<&loomline_contracts::Connection> {
        self.spec
            .inbound(&node.id)
            .filter(|c| self.reachable.contains(&c.from_node))
            .filter(|c| {
                !(node.node_type == NodeType::Flow
                    && node.subtype.eq_ignore_ascii_case("LOOP")
                    && c.to_port == LOOP_FEEDBACK_PORT)
            })
            .collect()
    }

    fn edge_settled(&self, connection: &loomline_contracts::Connection) -> bool {
        self.results.contains_key(&connection.from_node)
    }

    fn edge_active(&self, connection: &loomline_contracts::Connection) -> bool {
        self.results
            .get(&connection.from_node)
            .map(|r| {
                matches!(r.status, NodeResultStatus::Success | NodeResultStatus::Paused)
                    && r.output_data.contains_key(&connection.from_port)
            })
            .unwrap_or(false)
    }

    /// Nodes whose gating inputs all settled but none activated are
    /// branch-skipped, cascading downstream.
    fn settle_skips(&mut self) {
        loop {
            let mut skipped: Vec<String> = Vec::new();
            for node in &self.spec.nodes {
                if !self.reachable.contains(&node.id) || self.results.contains_key(&node.id) {
                    continue;
                }
                let inbound = self.gating_inbound(node);
                if inbound.is_empty() {
                    continue;
                }
                let all_settled = inbound.iter().all(|c| self.edge_settled(c));
                let any_active = inbound.iter().any(|c| self.edge_active(c));
                if all_settled && !any_active {
                    skipped.push(node.id.clone());
                }
            }
            if skipped.is_empty() {
                break;
            }
            for id in skipped {
                self.results.insert(id, NodeExecutionResult::skipped());
            }
        }
    }

    /// Ready nodes in stable spec order.
    fn ready_nodes(&self) -> Vec<String> {
        let mut ready = Vec::new();
        for node in &self.spec.nodes {
            if !self.reachable.contains(&node.id) || self.results.contains_key(&node.id) {
                continue;
            }
            let inbound = self.gating_inbound(node);
            if inbound.is_empty() {
                // Only the triggering node starts without inputs
                if node.id == self.trigger.trigger_node_id {
                    ready.push(node.id.clone());
                }
                continue;
            }
            let all_settled = inbound.iter().all(|c| self.edge_settled(c));
            let any_active = inbound.iter().any(|c| self.edge_active(c));
            if all_settled && any_active {
                ready.push(node.id.clone());
            }
        }
        ready
    }

    /// Gather inputs from active inbound edges, applying edge conversions.
    fn gather_inputs(&self, node: &Node) -> HashMap<String, Value> {
        let mut inputs: HashMap<String, Value> = HashMap::new();
        for connection in self.spec.inbound(&node.id) {
            let Some(upstream) = self.results.get(&connection.from_node) else {
                continue;
            };
            let Some(value) = upstream.port_value(&connection.from_port) else {
                continue;
            };
            let mut value = value.clone();
            if let Some(src) = connection.conversion_function.as_deref() {
                match ConvExpr::parse(src) {
                    Ok(expr) => value = expr.eval(&value),
                    Err(e) => {
                        warn!(connection = %connection.id, error = %e, "Skipping bad conversion function");
                    }
                }
            }
            merge_input(&mut inputs, &connection.to_port, value);
        }
        inputs
    }

    fn template_context(&self, execution_id: Uuid) -> TemplateContext {
        let mut node_outputs = HashMap::new();
        for (node_id, result) in &self.results {
            let value = match result.port_value("main") {
                Some(v) => v.clone(),
                None => serde_json::to_value(&result.output_data).unwrap_or(Value::Null),
            };
            node_outputs.insert(node_id.clone(), value);
        }
        TemplateContext {
            payload: self.trigger.input_data.clone(),
            trigger: serde_json::to_value(&self.trigger).unwrap_or(Value::Null),
            workflow: serde_json::json!({"static_data": self.spec.static_data()}),
            execution: serde_json::json!({
                "id": execution_id,
                "workflow_id": self.workflow_id,
            }),
            env: self.env.clone(),
            node_outputs,
        }
    }

    /// Nodes between a LOOP's `loop` port and its feedback edge.
    fn loop_body(&self, loop_id: &str) -> HashSet<String> {
        let mut body = HashSet::new();
        let mut queue: VecDeque<String> = self
            .spec
            .outbound(loop_id)
            .filter(|c| c.from_port == LOOP_CONTINUE_PORT)
            .map(|c| c.to_node.clone())
            .collect();
        while let Some(id) = queue.pop_front() {
            if id == loop_id || !body.insert(id.clone()) {
                continue;
            }
            for connection in self.spec.outbound(&id) {
                if connection.to_node != loop_id {
                    queue.push_back(connection.to_node.clone());
                }
            }
        }
        body
    }

    /// Merged output of terminal nodes; a single terminal's value passes
    /// through unwrapped.
    fn final_output(&self) -> Value {
        let mut terminals: Vec<(&String, Value)> = Vec::new();
        for node in &self.spec.nodes {
            if !self.reachable.contains(&node.id) {
                continue;
            }
            let Some(result) = self.results.get(&node.id) else {
                continue;
            };
            if result.status != NodeResultStatus::Success {
                continue;
            }
            if self.spec.outbound(&node.id).next().is_some() {
                continue;
            }
            let value = result
                .port_value("main")
                .cloned()
                .or_else(|| result.output_port.as_deref().and_then(|p| result.port_value(p).cloned()))
                .unwrap_or(Value::Null);
            terminals.push((&node.id, value));
        }
        match terminals.len() {
            0 => Value::Null,
            1 => terminals.remove(0).1,
            _ => Value::Object(
                terminals
                    .into_iter()
                    .map(|(id, v)| (id.clone(), v))
                    .collect(),
            ),
        }
    }
}

fn merge_input(inputs: &mut HashMap<String, Value>, port: &str, value: Value) {
    match inputs.entry(port.to_string()) {
        std::collections::hash_map::Entry::Occupied(mut slot) => {
            match (slot.get_mut(), value) {
                (Value::Object(existing), Value::Object(incoming)) => {
                    for (k, v) in incoming {
                        existing.insert(k, v);
                    }
                }
                (slot_value, incoming) => *slot_value = incoming,
            }
        }
        std::collections::hash_map::Entry::Vacant(slot) => {
            slot.insert(value);
        }
    }
}

/// Nodes reachable from the triggering node over any port, loops included.
fn reachable_from(spec: &WorkflowSpec, start: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for connection in spec.outbound(&id) {
            queue.push_back(connection.to_node.clone());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticTokenSource;
    use crate::registry::NodeRunner;
    use crate::runners::standard_registry;
    use crate::store::{InMemoryStateStore, WorkflowInfo};
    use async_trait::async_trait;
    use loomline_contracts::DeploymentStatus;
    use serde_json::json;

    fn spec_from(json: Value) -> WorkflowSpec {
        serde_json::from_value(json).unwrap()
    }

    fn setup_with_registry(
        spec: WorkflowSpec,
        registry: RunnerRegistry,
        config: EngineConfig,
    ) -> (Arc<WorkflowEngine>, Arc<InMemoryStateStore>, Uuid) {
        let workflow_id = spec.id;
        let store = Arc::new(InMemoryStateStore::new());
        store.insert_workflow(WorkflowInfo {
            id: workflow_id,
            name: "test".to_string(),
            version: 1,
            deployment_status: DeploymentStatus::Deployed,
            spec,
        });
        let engine = WorkflowEngine::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(StaticTokenSource::new()),
            config,
        );
        (engine, store, workflow_id)
    }

    fn setup(spec: WorkflowSpec) -> (Arc<WorkflowEngine>, Arc<InMemoryStateStore>, Uuid) {
        setup_with_registry(spec, standard_registry(), EngineConfig::default())
    }

    fn manual_trigger(node_id: &str, input: Value) -> TriggerInfo {
        TriggerInfo {
            trigger_type: "TRIGGER".to_string(),
            trigger_subtype: "MANUAL".to_string(),
            trigger_node_id: node_id.to_string(),
            raw_event: json!({}),
            input_data: input,
            actor: None,
        }
    }

    async fn run_to_settled(
        engine: &Arc<WorkflowEngine>,
        workflow_id: Uuid,
        trigger: TriggerInfo,
    ) -> Execution {
        let id = engine.execute(workflow_id, trigger).await.unwrap();
        engine.join(id).await;
        engine.get_execution(id).await.unwrap()
    }

    fn echo_spec() -> WorkflowSpec {
        spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "echo",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "x", "type": "ACTION", "subtype": "DATA_TRANSFORMATION",
                 "configurations": {"transformation_type": "field_mapping",
                                    "field_mapping": {"value": "value"}}}
            ],
            "connections": [
                {"id": "c1", "from_node": "t", "to_node": "x"}
            ],
            "triggers": ["t"]
        }))
    }

    #[tokio::test]
    async fn test_linear_execution_succeeds() {
        let (engine, _store, workflow_id) = setup(echo_spec());
        let execution =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({"value": 9}))).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.execution_sequence, vec!["t", "x"]);
        assert_eq!(execution.final_output, Some(json!({"value": 9})));
        assert!(execution.start_time.is_some());
        assert!(execution.end_time.is_some());
    }

    #[tokio::test]
    async fn test_execute_rejects_unknown_and_undeployed() {
        let (engine, store, workflow_id) = setup(echo_spec());

        let err = engine
            .execute(Uuid::now_v7(), manual_trigger("t", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let err = engine
            .execute(workflow_id, manual_trigger("nope", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Non-trigger node as entry point
        let err = engine
            .execute(workflow_id, manual_trigger("x", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let mut info = store.load_workflow(workflow_id).await.unwrap().unwrap();
        info.deployment_status = DeploymentStatus::Undeployed;
        store.insert_workflow(info);
        let err = engine
            .execute(workflow_id, manual_trigger("t", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
    }

    #[tokio::test]
    async fn test_branching_skips_untaken_branch() {
        let spec = spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "branch",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "gate", "type": "FLOW", "subtype": "IF",
                 "configurations": {"condition": "input.value > 10"}},
                {"id": "a", "type": "ACTION", "subtype": "DATA_TRANSFORMATION",
                 "configurations": {"transformation_type": "field_mapping",
                                    "field_mapping": {"taken": "value"}}},
                {"id": "b", "type": "ACTION", "subtype": "DATA_TRANSFORMATION",
                 "configurations": {"transformation_type": "field_mapping",
                                    "field_mapping": {"taken": "value"}}},
                {"id": "m", "type": "FLOW", "subtype": "MERGE"},
                {"id": "c", "type": "ACTION", "subtype": "DATA_TRANSFORMATION",
                 "configurations": {"transformation_type": "jq", "filter": "."}}
            ],
            "connections": [
                {"id": "c1", "from_node": "t", "to_node": "gate"},
                {"id": "c2", "from_node": "gate", "from_port": "true", "to_node": "a"},
                {"id": "c3", "from_node": "gate", "from_port": "false", "to_node": "b"},
                {"id": "c4", "from_node": "a", "to_node": "m", "to_port": "a"},
                {"id": "c5", "from_node": "b", "to_node": "m", "to_port": "b"},
                {"id": "c6", "from_node": "m", "to_node": "c"}
            ],
            "triggers": ["t"]
        }));
        let (engine, _store, workflow_id) = setup(spec);
        let execution =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({"value": 5}))).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(
            execution.node_results["a"].status,
            NodeResultStatus::Skipped
        );
        assert_eq!(
            execution.node_results["b"].status,
            NodeResultStatus::Success
        );
        assert_eq!(
            execution.node_results["c"].status,
            NodeResultStatus::Success
        );
        assert!(!execution.execution_sequence.contains(&"a".to_string()));
        assert!(execution.execution_sequence.contains(&"b".to_string()));
        assert!(execution.execution_sequence.contains(&"c".to_string()));

        // Only the taken branch reaches the merge
        assert_eq!(
            execution.node_results["m"].port_value("main").unwrap()["b"],
            json!({"taken": 5})
        );
    }

    #[tokio::test]
    async fn test_sequence_is_topological() {
        let (engine, _store, workflow_id) = setup(echo_spec());
        let execution =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({}))).await;

        let pos = |id: &str| {
            execution
                .execution_sequence
                .iter()
                .position(|n| n == id)
                .unwrap()
        };
        assert!(pos("t") < pos("x"));
    }

    fn approval_spec() -> WorkflowSpec {
        spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "approval",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "gate", "type": "HUMAN_LOOP", "subtype": "APP",
                 "configurations": {"question": "Proceed?", "timeout_seconds": 120}},
                {"id": "out", "type": "ACTION", "subtype": "DATA_TRANSFORMATION",
                 "configurations": {"transformation_type": "field_mapping",
                                    "field_mapping": {"ok": "approved"}}}
            ],
            "connections": [
                {"id": "c1", "from_node": "t", "to_node": "gate"},
                {"id": "c2", "from_node": "gate", "to_node": "out"}
            ],
            "triggers": ["t"]
        }))
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (engine, _store, workflow_id) = setup(approval_spec());
        let execution =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({}))).await;

        assert_eq!(execution.status, ExecutionStatus::Paused);
        let pending = execution.pending_pause.clone().unwrap();
        assert_eq!(pending.node_id, "gate");
        assert_eq!(pending.timeout_seconds, 120);

        // Wrong interaction id is rejected
        let err = engine
            .resume(
                execution.id,
                ResumeRequest {
                    interaction_id: "wrong".to_string(),
                    approved: Some(true),
                    output_port: None,
                    resume_data: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        engine
            .resume(
                execution.id,
                ResumeRequest {
                    interaction_id: pending.interaction_id.clone(),
                    approved: Some(true),
                    output_port: None,
                    resume_data: Some(json!({"note": "go"})),
                },
            )
            .await
            .unwrap();
        engine.join(execution.id).await;

        let finished = engine.get_execution(execution.id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Success);
        assert_eq!(finished.final_output, Some(json!({"ok": true})));
        assert_eq!(
            finished.node_results["gate"].port_value("main").unwrap()["approved"],
            json!(true)
        );

        // Resume of a finished execution is a state error
        let err = engine
            .resume(
                execution.id,
                ResumeRequest {
                    interaction_id: pending.interaction_id,
                    approved: Some(true),
                    output_port: None,
                    resume_data: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
    }

    #[tokio::test]
    async fn test_resume_matches_synchronous_result_shape() {
        // Pause/resume fidelity: the downstream results match what a
        // synchronous approval would have produced
        let (engine, _store, workflow_id) = setup(approval_spec());
        let paused =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({}))).await;
        let pending = paused.pending_pause.clone().unwrap();
        engine
            .resume(
                paused.id,
                ResumeRequest {
                    interaction_id: pending.interaction_id,
                    approved: Some(true),
                    output_port: None,
                    resume_data: None,
                },
            )
            .await
            .unwrap();
        engine.join(paused.id).await;
        let finished = engine.get_execution(paused.id).await.unwrap();

        assert_eq!(finished.status, ExecutionStatus::Success);
        assert_eq!(
            finished.node_results["out"].port_value("main").unwrap(),
            &json!({"ok": true})
        );
        // The paused node's partial result was replaced by the final one
        assert_eq!(
            finished.node_results["gate"].status,
            NodeResultStatus::Success
        );
        assert!(finished.pending_pause.is_none());
    }

    #[tokio::test]
    async fn test_cancel_takes_effect_at_node_boundary() {
        let spec = spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "slow",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "nap", "type": "ACTION", "subtype": "SLEEP",
                 "configurations": {"duration_seconds": 30}}
            ],
            "connections": [{"id": "c1", "from_node": "t", "to_node": "nap"}],
            "triggers": ["t"]
        }));
        let (engine, _store, workflow_id) = setup(spec);
        let id = engine
            .execute(workflow_id, manual_trigger("t", json!({})))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        engine.cancel(id).await.unwrap();
        engine.join(id).await;

        let execution = engine.get_execution(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Canceled);

        // Cancelling a terminal execution is a no-op
        let status = engine.cancel(id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Canceled);
    }

    struct FlakyRunner {
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl NodeRunner for FlakyRunner {
        fn validate(&self, _node: &Node) -> Vec<String> {
            vec![]
        }

        async fn execute(
            &self,
            ctx: &NodeExecutionContext,
        ) -> std::result::Result<NodeExecutionResult, NodeError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(NodeError::rate_limit("simulated 429"));
            }
            Ok(NodeExecutionResult::success(ctx.main_input()))
        }
    }

    #[tokio::test]
    async fn test_retry_policy_recovers() {
        let mut registry = standard_registry();
        registry.register(
            NodeType::Action,
            "FLAKY",
            Arc::new(FlakyRunner {
                failures: Mutex::new(2),
            }),
        );
        let spec = spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "flaky",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "f", "type": "ACTION", "subtype": "FLAKY",
                 "configurations": {"on_error": "retry",
                                    "retry": {"max_tries": 3, "base_ms": 10}}}
            ],
            "connections": [{"id": "c1", "from_node": "t", "to_node": "f"}],
            "triggers": ["t"]
        }));
        let (engine, store, workflow_id) =
            setup_with_registry(spec, registry, EngineConfig::default());
        let execution =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({"v": 1}))).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        let retries = store
            .log_messages(execution.id)
            .iter()
            .filter(|m| m.contains("retrying"))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_stops() {
        let mut registry = standard_registry();
        registry.register(
            NodeType::Action,
            "FLAKY",
            Arc::new(FlakyRunner {
                failures: Mutex::new(10),
            }),
        );
        let spec = spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "flaky",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "f", "type": "ACTION", "subtype": "FLAKY",
                 "configurations": {"on_error": "retry",
                                    "retry": {"max_tries": 2, "base_ms": 5}}}
            ],
            "connections": [{"id": "c1", "from_node": "t", "to_node": "f"}],
            "triggers": ["t"]
        }));
        let (engine, _store, workflow_id) =
            setup_with_registry(spec, registry, EngineConfig::default());
        let execution =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({}))).await;

        assert_eq!(execution.status, ExecutionStatus::Error);
        assert!(execution.error_message.unwrap().contains("f"));
    }

    #[tokio::test]
    async fn test_on_error_continue_keeps_going() {
        let mut registry = standard_registry();
        registry.register(
            NodeType::Action,
            "FLAKY",
            Arc::new(FlakyRunner {
                failures: Mutex::new(10),
            }),
        );
        let spec = spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "tolerant",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "f", "type": "ACTION", "subtype": "FLAKY",
                 "configurations": {"on_error": "continue"}},
                {"id": "after", "type": "ACTION", "subtype": "DATA_TRANSFORMATION",
                 "configurations": {"transformation_type": "jq", "filter": "."}}
            ],
            "connections": [
                {"id": "c1", "from_node": "t", "to_node": "f"},
                {"id": "c2", "from_node": "f", "to_node": "after"}
            ],
            "triggers": ["t"]
        }));
        let (engine, _store, workflow_id) =
            setup_with_registry(spec, registry, EngineConfig::default());
        let execution =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({}))).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(
            execution.node_results["after"].status,
            NodeResultStatus::Success
        );
        // The failed node contributed an empty object downstream
        assert_eq!(
            execution.node_results["after"].port_value("main").unwrap(),
            &json!({})
        );
    }

    struct CountRunner;

    #[async_trait]
    impl NodeRunner for CountRunner {
        fn validate(&self, _node: &Node) -> Vec<String> {
            vec![]
        }

        async fn execute(
            &self,
            ctx: &NodeExecutionContext,
        ) -> std::result::Result<NodeExecutionResult, NodeError> {
            let count = ctx.main_input()["count"].as_u64().unwrap_or(0) + 1;
            Ok(NodeExecutionResult::success(json!({
                "count": count,
                "done": count >= 3,
            })))
        }
    }

    #[tokio::test]
    async fn test_loop_until_predicate() {
        let mut registry = standard_registry();
        registry.register(NodeType::Action, "COUNT", Arc::new(CountRunner));
        let spec = spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "looper",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "lp", "type": "FLOW", "subtype": "LOOP",
                 "configurations": {"until": "input.done == true", "max_iterations": 10}},
                {"id": "body", "type": "ACTION", "subtype": "COUNT"},
                {"id": "sink", "type": "ACTION", "subtype": "DATA_TRANSFORMATION",
                 "configurations": {"transformation_type": "jq", "filter": ".count"}}
            ],
            "connections": [
                {"id": "c1", "from_node": "t", "to_node": "lp"},
                {"id": "c2", "from_node": "lp", "from_port": "loop", "to_node": "body"},
                {"id": "c3", "from_node": "body", "to_node": "lp", "to_port": "feedback"},
                {"id": "c4", "from_node": "lp", "from_port": "done", "to_node": "sink"}
            ],
            "triggers": ["t"]
        }));
        let (engine, _store, workflow_id) =
            setup_with_registry(spec, registry, EngineConfig::default());
        let execution = run_to_settled(
            &engine,
            workflow_id,
            manual_trigger("t", json!({"count": 0, "done": false})),
        )
        .await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.final_output, Some(json!(3)));
        // The body ran once per iteration
        let body_runs = execution
            .execution_sequence
            .iter()
            .filter(|n| n.as_str() == "body")
            .count();
        assert_eq!(body_runs, 3);
    }

    #[tokio::test]
    async fn test_execution_deadline() {
        let spec = echo_spec();
        let (engine, _store, workflow_id) = setup_with_registry(
            spec,
            standard_registry(),
            EngineConfig {
                concurrency: 4,
                deadline_seconds: 0,
            },
        );
        let execution =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({}))).await;

        assert_eq!(execution.status, ExecutionStatus::Error);
        assert!(execution
            .error_message
            .unwrap()
            .contains("deadline"));
    }

    #[tokio::test]
    async fn test_execute_single_node() {
        let (engine, _store, workflow_id) = setup(echo_spec());
        let result = engine
            .execute_single_node(workflow_id, "x", json!({"value": 3}), None)
            .await
            .unwrap();

        assert_eq!(result.status, NodeResultStatus::Success);
        assert_eq!(result.port_value("main").unwrap(), &json!({"value": 3}));
    }

    #[tokio::test]
    async fn test_timeout_sweep_without_timeout_edge_errors() {
        let (engine, _store, workflow_id) = setup(approval_spec());
        let paused =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({}))).await;
        assert_eq!(paused.status, ExecutionStatus::Paused);

        engine.force_timeout(&paused).await.unwrap();
        engine.join(paused.id).await;

        let finished = engine.get_execution(paused.id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Error);
        assert!(finished.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_conversion_function_applied_on_edge() {
        let spec = spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "convert",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "x", "type": "ACTION", "subtype": "DATA_TRANSFORMATION",
                 "configurations": {"transformation_type": "jq", "filter": "."}}
            ],
            "connections": [
                {"id": "c1", "from_node": "t", "to_node": "x",
                 "conversion_function": "{doubled: input.n, label: \"n={{input.n}}\"}"}
            ],
            "triggers": ["t"]
        }));
        let (engine, _store, workflow_id) = setup(spec);
        let execution =
            run_to_settled(&engine, workflow_id, manual_trigger("t", json!({"n": 21}))).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(
            execution.final_output,
            Some(json!({"doubled": 21, "label": "n=21"}))
        );
    }
}
