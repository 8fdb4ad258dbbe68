// Scheduler service: deploy/undeploy/pause/resume against the trigger
// index, and event routing. Candidate keys and per-subtype filter
// predicates are pure functions over index rows so the matching logic is
// testable without a database; the service wires them to storage and the
// engine dispatcher.

use chrono::Utc;
use loomline_contracts::{
    DeployResponse, DeploymentStatus, EventAck, Execution, NodeType, RoutedExecution,
    TriggerExecutionResponse, TriggerIndexEntry, TriggerInfo, TriggerStatus, UndeployResponse,
    WorkflowSpec,
};
use loomline_engine::RunnerRegistry;
use loomline_storage::{CreateTriggerIndexEntry, CreateWorkflow, Database};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine_client::ExecutionDispatcher;
use crate::error::{Result, SchedulerError};
use crate::index;
use crate::signature::verify_webhook_signature;

/// Cap on how long a sync-mode webhook holds its connection
pub const SYNC_WEBHOOK_CAP: Duration = Duration::from_secs(30);

pub struct SchedulerService {
    db: Database,
    dispatcher: Arc<dyn ExecutionDispatcher>,
    registry: Arc<RunnerRegistry>,
}

impl SchedulerService {
    pub fn new(
        db: Database,
        dispatcher: Arc<dyn ExecutionDispatcher>,
        registry: Arc<RunnerRegistry>,
    ) -> Self {
        Self {
            db,
            dispatcher,
            registry,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // -----------------------------------------------------------------
    // Deployment
    // -----------------------------------------------------------------

    pub async fn deploy(
        &self,
        workflow_id: Uuid,
        spec: WorkflowSpec,
        actor: Option<Uuid>,
    ) -> Result<DeployResponse> {
        let mut problems = index::validate_structure(&spec);
        problems.extend(self.registry.validate_spec(&spec));
        if !problems.is_empty() {
            return Err(SchedulerError::validation(problems.join("; ")));
        }

        let mut entries: Vec<CreateTriggerIndexEntry> = Vec::new();
        for trigger_id in &spec.triggers {
            let node = spec.node(trigger_id).ok_or_else(|| {
                SchedulerError::validation(format!("trigger '{trigger_id}' does not exist"))
            })?;
            let built = index::build_entries(workflow_id, node)
                .map_err(SchedulerError::validation)?;
            entries.extend(built);
        }

        // Webhook paths are globally unique among active entries
        for entry in entries.iter().filter(|e| e.trigger_subtype == "WEBHOOK") {
            if self
                .db
                .webhook_key_conflicts(&entry.index_key, workflow_id)
                .await
                .map_err(SchedulerError::from)?
            {
                return Err(SchedulerError::conflict(format!(
                    "webhook path already registered: {}",
                    entry.index_key
                )));
            }
        }

        let spec_json = serde_json::to_value(&spec)
            .map_err(|e| SchedulerError::Internal(anyhow::anyhow!(e)))?;
        let version = match self.db.get_workflow(workflow_id).await? {
            Some(_) => {
                let updated = self
                    .db
                    .update_workflow_spec(workflow_id, &spec.name, &spec_json)
                    .await?
                    .ok_or_else(|| SchedulerError::not_found(format!("workflow {workflow_id}")))?;
                updated.version
            }
            None => {
                let created = self
                    .db
                    .create_workflow(CreateWorkflow {
                        id: workflow_id,
                        owner_user_id: actor.unwrap_or(Uuid::nil()),
                        name: spec.name.clone(),
                        spec: spec_json.clone(),
                    })
                    .await?;
                created.version
            }
        };

        let actor_str = actor.map(|a| a.to_string()).unwrap_or_else(|| "system".to_string());
        let deployment_id = self
            .db
            .deploy_workflow(workflow_id, version, &spec_json, &entries, &actor_str)
            .await?;

        info!(
            workflow_id = %workflow_id,
            deployment_id = %deployment_id,
            triggers = entries.len(),
            "Workflow deployed"
        );

        Ok(DeployResponse {
            deployment_id,
            status: DeploymentStatus::Deployed,
            message: format!("deployed with {} trigger(s)", entries.len()),
            trigger_count: entries.len(),
        })
    }

    /// Idempotent: undeploying an undeployed workflow still succeeds.
    pub async fn undeploy(&self, workflow_id: Uuid, actor: Option<Uuid>) -> Result<UndeployResponse> {
        if self.db.get_workflow(workflow_id).await?.is_none() {
            return Err(SchedulerError::not_found(format!("workflow {workflow_id}")));
        }
        let actor_str = actor.map(|a| a.to_string()).unwrap_or_else(|| "system".to_string());
        let removed = self.db.undeploy_workflow(workflow_id, &actor_str).await?;

        info!(workflow_id = %workflow_id, removed, "Workflow undeployed");
        Ok(UndeployResponse {
            success: true,
            message: format!("removed {removed} trigger(s)"),
        })
    }

    pub async fn pause(&self, workflow_id: Uuid, actor: Option<Uuid>) -> Result<UndeployResponse> {
        self.set_trigger_status(workflow_id, TriggerStatus::Paused, actor)
            .await
    }

    pub async fn resume(&self, workflow_id: Uuid, actor: Option<Uuid>) -> Result<UndeployResponse> {
        self.set_trigger_status(workflow_id, TriggerStatus::Active, actor)
            .await
    }

    async fn set_trigger_status(
        &self,
        workflow_id: Uuid,
        status: TriggerStatus,
        actor: Option<Uuid>,
    ) -> Result<UndeployResponse> {
        if self.db.get_workflow(workflow_id).await?.is_none() {
            return Err(SchedulerError::not_found(format!("workflow {workflow_id}")));
        }
        let actor_str = actor.map(|a| a.to_string()).unwrap_or_else(|| "system".to_string());
        let affected = self
            .db
            .set_trigger_status(workflow_id, status, &actor_str)
            .await?;
        Ok(UndeployResponse {
            success: true,
            message: format!("{status} on {affected} trigger(s)"),
        })
    }

    // -----------------------------------------------------------------
    // Manual invocation
    // -----------------------------------------------------------------

    pub async fn trigger_execution(
        &self,
        workflow_id: Uuid,
        trigger_metadata: Value,
        input_data: Value,
    ) -> Result<TriggerExecutionResponse> {
        let workflow = self
            .db
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("workflow {workflow_id}")))?;
        let spec = workflow.spec().map_err(SchedulerError::from)?;

        let node_id = trigger_metadata
            .get("node_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                spec.triggers
                    .iter()
                    .find(|id| {
                        spec.node(id)
                            .map(|n| n.subtype.eq_ignore_ascii_case("MANUAL"))
                            .unwrap_or(false)
                    })
                    .cloned()
            })
            .or_else(|| spec.triggers.first().cloned())
            .ok_or_else(|| SchedulerError::validation("workflow has no trigger nodes"))?;

        let trigger_info = TriggerInfo {
            trigger_type: NodeType::Trigger.to_string(),
            trigger_subtype: "MANUAL".to_string(),
            trigger_node_id: node_id,
            raw_event: trigger_metadata,
            input_data,
            actor: Some(workflow.owner_user_id),
        };

        let execution_id = self
            .dispatcher
            .start_execution(workflow_id, trigger_info)
            .await?;

        Ok(TriggerExecutionResponse {
            execution_id,
            workflow_name: Some(workflow.name),
            node_count: Some(spec.nodes.len()),
        })
    }

    // -----------------------------------------------------------------
    // Event routing
    // -----------------------------------------------------------------

    pub async fn route_webhook(
        &self,
        path: &str,
        method: &str,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<(EventAck, Option<Execution>)> {
        let key = index::webhook_key(path, method);
        let rows = self.db.find_triggers_by_key(&key).await?;
        let entries: Vec<TriggerIndexEntry> = rows.into_iter().map(Into::into).collect();

        let body_json: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        let decisions = webhook_decisions(&entries, path, method, signature_header, body, &body_json);

        let sync_requested = decisions.iter().any(|d| d.sync_response);
        let mut results = Vec::new();
        let mut first_execution: Option<Uuid> = None;

        for decision in decisions {
            let routed = self.dispatch(decision).await;
            if first_execution.is_none() {
                first_execution = routed.execution_id;
            }
            results.push(routed);
        }

        // sync mode waits (capped) for the first matched execution
        let settled = match (sync_requested, first_execution) {
            (true, Some(execution_id)) => self
                .dispatcher
                .wait_settled(execution_id, SYNC_WEBHOOK_CAP)
                .await
                .unwrap_or(None),
            _ => None,
        };

        Ok((
            EventAck {
                message: "webhook processed".to_string(),
                processed_workflows: results.len(),
                results,
            },
            settled,
        ))
    }

    pub async fn route_github(&self, event_type: &str, delivery_id: &str, payload: &Value) -> Result<EventAck> {
        let installation_id = payload
            .pointer("/installation/id")
            .and_then(Value::as_u64)
            .map(|v| v.to_string());
        let repository = payload
            .pointer("/repository/full_name")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (Some(installation_id), Some(repository)) = (installation_id, repository) else {
            warn!(event_type, delivery_id, "GitHub event missing installation or repository");
            return Ok(EventAck {
                message: "invalid github event".to_string(),
                processed_workflows: 0,
                results: vec![],
            });
        };

        let key = index::github_key(&installation_id, &repository);
        let rows = self.db.find_triggers_by_key(&key).await?;
        let entries: Vec<TriggerIndexEntry> = rows.into_iter().map(Into::into).collect();
        let decisions = github_decisions(&entries, event_type, delivery_id, payload);

        let mut results = Vec::new();
        for decision in decisions {
            results.push(self.dispatch(decision).await);
        }

        Ok(EventAck {
            message: "github event processed".to_string(),
            processed_workflows: results.len(),
            results,
        })
    }

    pub async fn route_slack(&self, payload: &Value) -> Result<EventAck> {
        let team_id = payload.get("team_id").and_then(Value::as_str);

        let mut entries: Vec<TriggerIndexEntry> = Vec::new();
        for key in [index::slack_key(team_id), index::slack_key(None)] {
            let rows = self.db.find_triggers_by_key(&key).await?;
            entries.extend(rows.into_iter().map(Into::into));
        }
        // A trigger registered for both buckets still fires once
        entries.sort_by_key(|e| e.id);
        entries.dedup_by_key(|e| e.id);

        let decisions = slack_decisions(&entries, payload);

        let mut results = Vec::new();
        for decision in decisions {
            results.push(self.dispatch(decision).await);
        }

        Ok(EventAck {
            message: "slack event processed".to_string(),
            processed_workflows: results.len(),
            results,
        })
    }

    /// Inbound email delivered by the mail relay.
    pub async fn route_email(&self, mailbox: &str, message: &Value) -> Result<EventAck> {
        let key = index::email_key(mailbox);
        let rows = self.db.find_triggers_by_key(&key).await?;

        let mut results = Vec::new();
        for row in rows {
            let entry: TriggerIndexEntry = row.into();
            let decision = Decision {
                workflow_id: entry.workflow_id,
                trigger_info: TriggerInfo {
                    trigger_type: entry.trigger_type,
                    trigger_subtype: entry.trigger_subtype,
                    trigger_node_id: entry.trigger_node_id,
                    raw_event: json!({"mailbox": mailbox}),
                    input_data: message.clone(),
                    actor: None,
                },
                sync_response: false,
            };
            results.push(self.dispatch(decision).await);
        }

        Ok(EventAck {
            message: "email routed".to_string(),
            processed_workflows: results.len(),
            results,
        })
    }

    /// Fire a due cron trigger (the driver owns the due/lock logic).
    pub async fn fire_cron(&self, entry: &TriggerIndexEntry, fired_at: chrono::DateTime<Utc>) -> RoutedExecution {
        let decision = Decision {
            workflow_id: entry.workflow_id,
            trigger_info: TriggerInfo {
                trigger_type: entry.trigger_type.clone(),
                trigger_subtype: entry.trigger_subtype.clone(),
                trigger_node_id: entry.trigger_node_id.clone(),
                raw_event: json!({"index_key": entry.index_key}),
                input_data: json!({"fired_at": fired_at.to_rfc3339()}),
                actor: None,
            },
            sync_response: false,
        };
        self.dispatch(decision).await
    }

    async fn dispatch(&self, mut decision: Decision) -> RoutedExecution {
        // The execution acts as the workflow owner
        if decision.trigger_info.actor.is_none() {
            match self.db.get_workflow(decision.workflow_id).await {
                Ok(Some(workflow)) => decision.trigger_info.actor = Some(workflow.owner_user_id),
                Ok(None) => {}
                Err(e) => warn!(workflow_id = %decision.workflow_id, error = %e, "Owner lookup failed"),
            }
        }

        match self
            .dispatcher
            .start_execution(decision.workflow_id, decision.trigger_info)
            .await
        {
            Ok(execution_id) => RoutedExecution {
                workflow_id: decision.workflow_id,
                execution_id: Some(execution_id),
                status: "started".to_string(),
                message: None,
            },
            Err(e) => {
                warn!(workflow_id = %decision.workflow_id, error = %e, "Execution start failed");
                RoutedExecution {
                    workflow_id: decision.workflow_id,
                    execution_id: None,
                    status: "error".to_string(),
                    message: Some(e.to_string()),
                }
            }
        }
    }
}

/// One matched trigger about to become an execution
#[derive(Debug, Clone)]
pub struct Decision {
    pub workflow_id: Uuid,
    pub trigger_info: TriggerInfo,
    pub sync_response: bool,
}

/// Webhook matches: method must be allowed, and entries carrying a
/// signing_secret require a valid body signature.
pub fn webhook_decisions(
    entries: &[TriggerIndexEntry],
    path: &str,
    method: &str,
    signature_header: Option<&str>,
    raw_body: &[u8],
    body_json: &Value,
) -> Vec<Decision> {
    let method = method.to_ascii_uppercase();
    entries
        .iter()
        .filter(|entry| {
            entry
                .config
                .get("allowed_methods")
                .and_then(Value::as_array)
                .map(|methods| {
                    methods
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|m| m.eq_ignore_ascii_case(&method))
                })
                .unwrap_or(method == "POST")
        })
        .filter(|entry| {
            match entry.config.get("signing_secret").and_then(Value::as_str) {
                Some(secret) => match signature_header {
                    Some(signature) => verify_webhook_signature(secret, raw_body, signature),
                    None => false,
                },
                None => true,
            }
        })
        .map(|entry| Decision {
            workflow_id: entry.workflow_id,
            trigger_info: TriggerInfo {
                trigger_type: entry.trigger_type.clone(),
                trigger_subtype: entry.trigger_subtype.clone(),
                trigger_node_id: entry.trigger_node_id.clone(),
                raw_event: json!({
                    "path": index::normalize_path(path),
                    "method": method,
                }),
                input_data: body_json.clone(),
                actor: None,
            },
            sync_response: entry.config.get("response_mode").and_then(Value::as_str)
                == Some("sync"),
        })
        .collect()
}

/// GitHub matches: optional event filter, optional branch filter for push.
pub fn github_decisions(
    entries: &[TriggerIndexEntry],
    event_type: &str,
    delivery_id: &str,
    payload: &Value,
) -> Vec<Decision> {
    entries
        .iter()
        .filter(|entry| {
            entry
                .config
                .get("events")
                .and_then(Value::as_array)
                .map(|events| {
                    events
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|e| e.eq_ignore_ascii_case(event_type))
                })
                .unwrap_or(true)
        })
        .filter(|entry| {
            if event_type != "push" {
                return true;
            }
            let Some(branches) = entry.config.get("branches").and_then(Value::as_array) else {
                return true;
            };
            let Some(reference) = payload.get("ref").and_then(Value::as_str) else {
                return false;
            };
            branches
                .iter()
                .filter_map(Value::as_str)
                .any(|b| reference == format!("refs/heads/{b}"))
        })
        .map(|entry| Decision {
            workflow_id: entry.workflow_id,
            trigger_info: TriggerInfo {
                trigger_type: entry.trigger_type.clone(),
                trigger_subtype: entry.trigger_subtype.clone(),
                trigger_node_id: entry.trigger_node_id.clone(),
                raw_event: json!({
                    "event_type": event_type,
                    "delivery_id": delivery_id,
                }),
                input_data: payload.clone(),
                actor: None,
            },
            sync_response: false,
        })
        .collect()
}

/// Slack matches: optional event-type, channel, and user filters.
pub fn slack_decisions(entries: &[TriggerIndexEntry], payload: &Value) -> Vec<Decision> {
    let event = payload.get("event").cloned().unwrap_or_else(|| payload.clone());
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
    let channel = event
        .get("channel")
        .and_then(Value::as_str)
        .or_else(|| event.get("channel_id").and_then(Value::as_str));
    let user = event
        .get("user")
        .and_then(Value::as_str)
        .or_else(|| event.get("user_id").and_then(Value::as_str));

    entries
        .iter()
        .filter(|entry| {
            entry
                .config
                .get("event_types")
                .and_then(Value::as_array)
                .map(|types| {
                    types
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|t| t.eq_ignore_ascii_case(event_type))
                })
                .unwrap_or(true)
        })
        .filter(|entry| {
            match entry.config.get("channel").and_then(Value::as_str) {
                Some(wanted) => channel == Some(wanted),
                None => true,
            }
        })
        .filter(|entry| {
            match entry.config.get("user").and_then(Value::as_str) {
                Some(wanted) => user == Some(wanted),
                None => true,
            }
        })
        .map(|entry| Decision {
            workflow_id: entry.workflow_id,
            trigger_info: TriggerInfo {
                trigger_type: entry.trigger_type.clone(),
                trigger_subtype: entry.trigger_subtype.clone(),
                trigger_node_id: entry.trigger_node_id.clone(),
                raw_event: payload.clone(),
                input_data: event.clone(),
                actor: None,
            },
            sync_response: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::hmac_hex;
    use chrono::Utc;

    fn entry(workflow: Uuid, subtype: &str, key: &str, config: Value) -> TriggerIndexEntry {
        TriggerIndexEntry {
            id: Uuid::now_v7(),
            workflow_id: workflow,
            trigger_node_id: "t".to_string(),
            trigger_type: "TRIGGER".to_string(),
            trigger_subtype: subtype.to_string(),
            index_key: key.to_string(),
            config,
            status: TriggerStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_webhook_decisions_method_filter() {
        let wf_a = Uuid::now_v7();
        let wf_b = Uuid::now_v7();
        let entries = vec![
            entry(wf_a, "WEBHOOK", "webhook:/joke:POST", json!({"allowed_methods": ["POST"]})),
            entry(wf_b, "WEBHOOK", "webhook:/joke:POST", json!({"allowed_methods": ["GET"]})),
        ];

        let decisions = webhook_decisions(&entries, "/joke", "POST", None, b"{}", &json!({}));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].workflow_id, wf_a);
        assert_eq!(decisions[0].trigger_info.trigger_subtype, "WEBHOOK");
    }

    #[test]
    fn test_webhook_decisions_signature_filter() {
        let secret = "per-workflow-secret-0123456789ab";
        let body = br#"{"n": 1}"#;
        let good = hmac_hex(secret, body);
        let entries = vec![entry(
            Uuid::now_v7(),
            "WEBHOOK",
            "webhook:/x:POST",
            json!({"signing_secret": secret}),
        )];

        assert_eq!(
            webhook_decisions(&entries, "/x", "POST", Some(&good), body, &json!({"n": 1})).len(),
            1
        );
        assert!(webhook_decisions(&entries, "/x", "POST", Some("bad"), body, &json!({})).is_empty());
        assert!(webhook_decisions(&entries, "/x", "POST", None, body, &json!({})).is_empty());
    }

    #[test]
    fn test_webhook_sync_flag() {
        let entries = vec![entry(
            Uuid::now_v7(),
            "WEBHOOK",
            "webhook:/x:POST",
            json!({"response_mode": "sync"}),
        )];
        let decisions = webhook_decisions(&entries, "/x", "POST", None, b"{}", &json!({}));
        assert!(decisions[0].sync_response);
    }

    #[test]
    fn test_github_decisions_event_and_branch_filters() {
        let wf_push_main = Uuid::now_v7();
        let wf_issues = Uuid::now_v7();
        let wf_any = Uuid::now_v7();
        let entries = vec![
            entry(wf_push_main, "GITHUB", "github:1:o/r", json!({"events": ["push"], "branches": ["main"]})),
            entry(wf_issues, "GITHUB", "github:1:o/r", json!({"events": ["issues"]})),
            entry(wf_any, "GITHUB", "github:1:o/r", json!({})),
        ];

        let push_main = json!({"ref": "refs/heads/main"});
        let matched: Vec<Uuid> = github_decisions(&entries, "push", "d1", &push_main)
            .into_iter()
            .map(|d| d.workflow_id)
            .collect();
        assert_eq!(matched, vec![wf_push_main, wf_any]);

        let push_dev = json!({"ref": "refs/heads/dev"});
        let matched: Vec<Uuid> = github_decisions(&entries, "push", "d2", &push_dev)
            .into_iter()
            .map(|d| d.workflow_id)
            .collect();
        assert_eq!(matched, vec![wf_any]);

        let matched: Vec<Uuid> = github_decisions(&entries, "issues", "d3", &json!({}))
            .into_iter()
            .map(|d| d.workflow_id)
            .collect();
        assert_eq!(matched, vec![wf_issues, wf_any]);
    }

    #[test]
    fn test_slack_decisions_filters() {
        let wf_msgs = Uuid::now_v7();
        let wf_channel = Uuid::now_v7();
        let entries = vec![
            entry(wf_msgs, "SLACK", "slack:T01", json!({"event_types": ["message"]})),
            entry(wf_channel, "SLACK", "slack:T01", json!({"channel": "C42"})),
        ];

        let payload = json!({
            "team_id": "T01",
            "event": {"type": "message", "channel": "C42", "user": "U1", "text": "hi"}
        });
        let matched: Vec<Uuid> = slack_decisions(&entries, &payload)
            .into_iter()
            .map(|d| d.workflow_id)
            .collect();
        assert_eq!(matched, vec![wf_msgs, wf_channel]);

        let other_channel = json!({
            "team_id": "T01",
            "event": {"type": "message", "channel": "C99", "user": "U1"}
        });
        let matched: Vec<Uuid> = slack_decisions(&entries, &other_channel)
            .into_iter()
            .map(|d| d.workflow_id)
            .collect();
        assert_eq!(matched, vec![wf_msgs]);

        let reaction = json!({
            "team_id": "T01",
            "event": {"type": "reaction_added", "channel": "C42"}
        });
        let matched: Vec<Uuid> = slack_decisions(&entries, &reaction)
            .into_iter()
            .map(|d| d.workflow_id)
            .collect();
        assert_eq!(matched, vec![wf_channel]);
    }

    #[test]
    fn test_slack_event_payload_becomes_input() {
        let entries = vec![entry(Uuid::now_v7(), "SLACK", "slack:*", json!({}))];
        let payload = json!({
            "team_id": "T01",
            "event": {"type": "app_mention", "text": "hello"}
        });
        let decisions = slack_decisions(&entries, &payload);
        assert_eq!(decisions[0].trigger_info.input_data["text"], "hello");
        assert_eq!(decisions[0].trigger_info.raw_event["team_id"], "T01");
    }
}
