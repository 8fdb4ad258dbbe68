// HUMAN_LOOP runner. First dispatch posts the question to the configured
// channel and suspends the execution (PAUSED result carrying the
// interaction id and resume token). Re-dispatch with resume data records
// the human's answer as the node output and posts the templated follow-up.
// A timed-out pause arrives here as a resume carrying the timed_out marker.

use async_trait::async_trait;
use loomline_contracts::{Node, NodeExecutionResult, NodeResultStatus};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::context::NodeExecutionContext;
use crate::credentials::TokenSource;
use crate::error::NodeError;
use crate::registry::NodeRunner;
use crate::runners::external::ExternalActionRunner;
use crate::template::{resolve_value, TemplateContext};

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;
/// Port carrying the pause payload on suspension
pub const PAUSE_PORT: &str = "pause";
/// Port a timed-out interaction emits on (gated to ERROR by the engine
/// when the node has no timeout edge)
pub const TIMEOUT_PORT: &str = "timeout";
/// Marker inserted into resume_data by the timeout sweep
pub const TIMED_OUT_MARKER: &str = "timed_out";

pub struct HumanLoopRunner {
    external: ExternalActionRunner,
}

impl HumanLoopRunner {
    pub fn new() -> Self {
        Self {
            external: ExternalActionRunner::new(),
        }
    }
}

impl Default for HumanLoopRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeRunner for HumanLoopRunner {
    fn validate(&self, node: &Node) -> Vec<String> {
        let mut problems = Vec::new();
        if node.config_str("question").map(str::trim).unwrap_or("").is_empty() {
            problems.push("question is required".to_string());
        }
        if node.subtype.to_ascii_uppercase() == "SLACK"
            && node.config_str("channel").map(str::trim).unwrap_or("").is_empty()
        {
            problems.push("slack approval requires a channel".to_string());
        }
        problems
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        match &ctx.resume {
            None => self.suspend(ctx).await,
            Some(resume) => {
                let timed_out = resume
                    .resume_data
                    .as_ref()
                    .and_then(|d| d.get(TIMED_OUT_MARKER))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if timed_out {
                    self.finish_timeout(ctx).await
                } else {
                    self.finish(ctx, resume.approved, resume.output_port.clone(), resume.resume_data.clone())
                        .await
                }
            }
        }
    }
}

impl HumanLoopRunner {
    async fn suspend(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let question = ctx
            .config_str("question")
            .ok_or_else(|| NodeError::validation("question missing"))?
            .to_string();
        let timeout_seconds = ctx
            .config_u64("timeout_seconds")
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let interaction_id = Uuid::now_v7().to_string();
        let resume_token = Uuid::now_v7().to_string();
        let channel_config = self.channel_config(ctx);

        self.post(ctx, &question).await?;

        let mut result = NodeExecutionResult::success_on(
            PAUSE_PORT,
            json!({
                "interaction_id": interaction_id,
                "resume_token": resume_token,
                "channel_config": channel_config,
                "question": question,
                "timeout_seconds": timeout_seconds,
            }),
        );
        result.status = NodeResultStatus::Paused;
        Ok(result)
    }

    async fn finish(
        &self,
        ctx: &NodeExecutionContext,
        approved: Option<bool>,
        output_port: Option<String>,
        resume_data: Option<Value>,
    ) -> Result<NodeExecutionResult, NodeError> {
        let approved = approved.unwrap_or(true);
        let template_key = if approved {
            "approved_message"
        } else {
            "rejected_message"
        };

        if let Some(template) = ctx.config_str(template_key) {
            let message = render_followup(template, approved, &resume_data);
            self.post(ctx, &message).await?;
        }

        let port = output_port.unwrap_or_else(|| "main".to_string());
        Ok(NodeExecutionResult::success_on(
            port,
            json!({
                "approved": approved,
                "resume_data": resume_data,
            }),
        ))
    }

    async fn finish_timeout(
        &self,
        ctx: &NodeExecutionContext,
    ) -> Result<NodeExecutionResult, NodeError> {
        if let Some(template) = ctx.config_str("timeout_message") {
            let message = render_followup(template, false, &None);
            // Best effort: the channel may be the thing that went away
            if let Err(e) = self.post(ctx, &message).await {
                tracing::warn!(node_id = %ctx.node.id, error = %e, "Failed to post timeout message");
            }
        }

        Ok(NodeExecutionResult::success_on(
            TIMEOUT_PORT,
            json!({"approved": false, "timed_out": true}),
        ))
    }

    /// Deliver a message over the node's channel.
    async fn post(&self, ctx: &NodeExecutionContext, text: &str) -> Result<(), NodeError> {
        match ctx.node.subtype.to_ascii_uppercase().as_str() {
            "SLACK" => {
                let actor = ctx
                    .actor
                    .ok_or_else(|| NodeError::auth("Slack approval requires an acting user"))?;
                let token = ctx.credentials.access_token(actor, "slack").await?;
                let channel = ctx
                    .config_str("channel")
                    .ok_or_else(|| NodeError::validation("channel missing"))?;
                self.external
                    .call_provider(
                        "slack",
                        "post_message",
                        &json!({"channel": channel, "text": text}),
                        &token,
                        ctx.config_str("api_base_url"),
                    )
                    .await?;
                Ok(())
            }
            "EMAIL" => {
                let actor = ctx
                    .actor
                    .ok_or_else(|| NodeError::auth("Email approval requires an acting user"))?;
                let token = ctx.credentials.access_token(actor, "email").await?;
                let to = ctx
                    .config_str("to")
                    .ok_or_else(|| NodeError::validation("to missing for email approval"))?;
                self.external
                    .call_provider(
                        "email",
                        "send",
                        &json!({"to": to, "subject": "Approval requested", "body": text}),
                        &token,
                        ctx.config_str("api_base_url"),
                    )
                    .await?;
                Ok(())
            }
            // APP approvals surface through the execution snapshot; there
            // is no outbound delivery
            "APP" => Ok(()),
            other => Err(NodeError::validation(format!(
                "unknown human-loop channel '{other}'"
            ))),
        }
    }

    fn channel_config(&self, ctx: &NodeExecutionContext) -> Value {
        json!({
            "subtype": ctx.node.subtype,
            "channel": ctx.config_str("channel"),
            "to": ctx.config_str("to"),
        })
    }
}

/// Follow-up templates resolve against {approved, resume_data}.
fn render_followup(template: &str, approved: bool, resume_data: &Option<Value>) -> String {
    let local = TemplateContext {
        payload: json!({
            "approved": approved,
            "resume_data": resume_data.clone().unwrap_or(Value::Null),
        }),
        ..Default::default()
    };
    match resolve_value(&Value::String(template.to_string()), &local) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Parse the pause payload out of a PAUSED node result.
pub fn pause_payload(result: &NodeExecutionResult) -> Option<(String, String, Value, Option<String>, u64)> {
    let payload = result.output_data.get(PAUSE_PORT)?;
    Some((
        payload.get("interaction_id")?.as_str()?.to_string(),
        payload.get("resume_token")?.as_str()?.to_string(),
        payload.get("channel_config").cloned().unwrap_or(Value::Null),
        payload.get("question").and_then(Value::as_str).map(str::to_string),
        payload.get("timeout_seconds").and_then(Value::as_u64).unwrap_or(DEFAULT_TIMEOUT_SECONDS),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_followup_templates() {
        let msg = render_followup("Approved: {{payload.approved}}", true, &None);
        assert_eq!(msg, "Approved: true");

        let msg = render_followup(
            "Note: {{payload.resume_data.note}}",
            false,
            &Some(json!({"note": "go ahead"})),
        );
        assert_eq!(msg, "Note: go ahead");
    }

    #[test]
    fn test_pause_payload_roundtrip() {
        let mut result = NodeExecutionResult::success_on(
            PAUSE_PORT,
            json!({
                "interaction_id": "i-1",
                "resume_token": "t-1",
                "channel_config": {"channel": "#approvals"},
                "question": "Proceed?",
                "timeout_seconds": 120,
            }),
        );
        result.status = NodeResultStatus::Paused;

        let (interaction_id, token, channel, question, timeout) =
            pause_payload(&result).unwrap();
        assert_eq!(interaction_id, "i-1");
        assert_eq!(token, "t-1");
        assert_eq!(channel["channel"], "#approvals");
        assert_eq!(question.as_deref(), Some("Proceed?"));
        assert_eq!(timeout, 120);
    }
}
