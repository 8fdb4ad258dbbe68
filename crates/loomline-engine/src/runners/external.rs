// EXTERNAL_ACTION runner: OAuth-brokered SaaS calls. The credential broker
// hands back an already-valid token; this runner maps the logical operation
// onto the provider endpoint, retries 429/503 honoring Retry-After, and
// emits the provider response on `main` (or `error` when declared).
//
// An optional AI-directed mode (wired for Notion) lets an LLM plan up to N
// provider calls; every round is logged with the model's rationale.

use async_trait::async_trait;
use loomline_contracts::{ErrorKind, LogEventType, LogLevel, Node, NodeExecutionResult};
use serde_json::{json, Value};
use std::time::Duration;

use crate::context::NodeExecutionContext;
use crate::credentials::TokenSource;
use crate::error::NodeError;
use crate::registry::NodeRunner;
use crate::runners::ai::{AiAgentRunner, AiProvider, AiRequest};

pub const PROVIDER_SUBTYPES: &[&str] = &[
    "SLACK",
    "GITHUB",
    "NOTION",
    "GOOGLE_CALENDAR",
    "DISCORD",
    "EMAIL",
];

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const RATE_LIMIT_TRIES: u32 = 3;
const DEFAULT_AI_ROUNDS: u64 = 10;

pub struct ExternalActionRunner {
    client: reqwest::Client,
    ai: AiAgentRunner,
}

impl ExternalActionRunner {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            ai: AiAgentRunner::new(),
        }
    }
}

impl Default for ExternalActionRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeRunner for ExternalActionRunner {
    fn validate(&self, node: &Node) -> Vec<String> {
        let mut problems = Vec::new();
        let subtype = node.subtype.to_ascii_uppercase();
        if !PROVIDER_SUBTYPES.contains(&subtype.as_str()) {
            problems.push(format!("unknown provider subtype '{}'", node.subtype));
        }
        if node.config_str("operation").map(str::trim).unwrap_or("").is_empty() {
            problems.push("operation is required".to_string());
        }
        if node
            .configurations
            .get("ai_directed")
            .and_then(|v| v.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
            && subtype != "NOTION"
        {
            problems.push("ai_directed mode is only available for NOTION".to_string());
        }
        problems
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let actor = ctx
            .actor
            .ok_or_else(|| NodeError::auth("External actions require an acting user"))?;
        let provider = ctx.node.subtype.to_ascii_lowercase();
        let token = ctx.credentials.access_token(actor, &provider).await?;

        let operation = ctx
            .config_str("operation")
            .ok_or_else(|| NodeError::validation("operation missing"))?
            .to_string();
        let params = ctx
            .config_value("parameters")
            .cloned()
            .unwrap_or_else(|| ctx.main_input());
        let base_url = ctx.config_str("api_base_url").map(str::to_string);

        let ai_directed = ctx
            .config_value("ai_directed")
            .and_then(|v| v.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let result = if ai_directed {
            self.run_ai_directed(ctx, &provider, &operation, &params, &token, base_url.as_deref())
                .await
        } else {
            self.call_provider(&provider, &operation, &params, &token, base_url.as_deref())
                .await
        };

        match result {
            Ok(response) => Ok(NodeExecutionResult::success(response)),
            Err(e) if ctx.config_bool("use_error_port").unwrap_or(false) => {
                Ok(NodeExecutionResult::success_on(
                    "error",
                    json!({"error_kind": e.kind, "message": e.message, "details": e.details}),
                ))
            }
            Err(e) => Err(e),
        }
    }
}

impl ExternalActionRunner {
    /// Map a logical operation to the provider request and send it with
    /// rate-limit-aware retry.
    pub async fn call_provider(
        &self,
        provider: &str,
        operation: &str,
        params: &Value,
        token: &str,
        base_url: Option<&str>,
    ) -> Result<Value, NodeError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = self.build_request(provider, operation, params, token, base_url)?;
            let response = request.send().await.map_err(NodeError::from_reqwest)?;
            let status = response.status().as_u16();

            if (status == 429 || status == 503) && attempt < RATE_LIMIT_TRIES {
                let delay = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| Duration::from_millis(500 * 2u64.pow(attempt - 1)));
                tokio::time::sleep(delay).await;
                continue;
            }

            return classify_provider_response(provider, status, response).await;
        }
    }

    fn build_request(
        &self,
        provider: &str,
        operation: &str,
        params: &Value,
        token: &str,
        base_url: Option<&str>,
    ) -> Result<reqwest::RequestBuilder, NodeError> {
        let unknown = || {
            NodeError::validation(format!(
                "unknown operation '{operation}' for provider '{provider}'"
            ))
        };
        let p = |key: &str| -> Result<String, NodeError> {
            params
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| NodeError::validation(format!("parameter '{key}' is required")))
        };

        let request = match provider {
            "slack" => {
                let base = base_url.unwrap_or("https://slack.com/api").trim_end_matches('/').to_string();
                match operation {
                    "post_message" => self
                        .client
                        .post(format!("{base}/chat.postMessage"))
                        .bearer_auth(token)
                        .json(&json!({
                            "channel": p("channel")?,
                            "text": params.get("text").cloned().unwrap_or(Value::Null),
                            "thread_ts": params.get("thread_ts").cloned().unwrap_or(Value::Null),
                        })),
                    "update_message" => self
                        .client
                        .post(format!("{base}/chat.update"))
                        .bearer_auth(token)
                        .json(&json!({
                            "channel": p("channel")?,
                            "ts": p("ts")?,
                            "text": params.get("text").cloned().unwrap_or(Value::Null),
                        })),
                    "list_channels" => self
                        .client
                        .get(format!("{base}/conversations.list"))
                        .bearer_auth(token),
                    _ => return Err(unknown()),
                }
            }
            "github" => {
                let base = base_url.unwrap_or("https://api.github.com").trim_end_matches('/').to_string();
                let builder = match operation {
                    "create_issue" => self
                        .client
                        .post(format!("{base}/repos/{}/issues", p("repo")?))
                        .json(&json!({
                            "title": p("title")?,
                            "body": params.get("body").cloned().unwrap_or(Value::Null),
                            "labels": params.get("labels").cloned().unwrap_or(json!([])),
                        })),
                    "create_comment" => self
                        .client
                        .post(format!(
                            "{base}/repos/{}/issues/{}/comments",
                            p("repo")?,
                            p("issue_number")?
                        ))
                        .json(&json!({"body": p("body")?})),
                    "get_repo" => self.client.get(format!("{base}/repos/{}", p("repo")?)),
                    _ => return Err(unknown()),
                };
                builder
                    .bearer_auth(token)
                    .header("Accept", "application/vnd.github+json")
                    .header("User-Agent", "loomline")
            }
            "notion" => {
                let base = base_url.unwrap_or("https://api.notion.com").trim_end_matches('/').to_string();
                let builder = match operation {
                    "search" => self
                        .client
                        .post(format!("{base}/v1/search"))
                        .json(&json!({"query": params.get("query").cloned().unwrap_or(Value::Null)})),
                    "create_page" => self
                        .client
                        .post(format!("{base}/v1/pages"))
                        .json(params),
                    "query_database" => self
                        .client
                        .post(format!("{base}/v1/databases/{}/query", p("database_id")?))
                        .json(&params.get("filter").map(|f| json!({"filter": f})).unwrap_or(json!({}))),
                    "get_page" => self
                        .client
                        .get(format!("{base}/v1/pages/{}", p("page_id")?)),
                    "append_block_children" => self
                        .client
                        .patch(format!("{base}/v1/blocks/{}/children", p("block_id")?))
                        .json(&json!({"children": params.get("children").cloned().unwrap_or(json!([]))})),
                    _ => return Err(unknown()),
                };
                builder
                    .bearer_auth(token)
                    .header("Notion-Version", "2022-06-28")
            }
            "google_calendar" => {
                let base = base_url.unwrap_or("https://www.googleapis.com").trim_end_matches('/').to_string();
                let calendar = params
                    .get("calendar_id")
                    .and_then(Value::as_str)
                    .unwrap_or("primary")
                    .to_string();
                match operation {
                    "create_event" => self
                        .client
                        .post(format!("{base}/calendar/v3/calendars/{calendar}/events"))
                        .bearer_auth(token)
                        .json(&params.get("event").cloned().unwrap_or_else(|| params.clone())),
                    "list_events" => self
                        .client
                        .get(format!("{base}/calendar/v3/calendars/{calendar}/events"))
                        .bearer_auth(token),
                    "delete_event" => self
                        .client
                        .delete(format!(
                            "{base}/calendar/v3/calendars/{calendar}/events/{}",
                            p("event_id")?
                        ))
                        .bearer_auth(token),
                    _ => return Err(unknown()),
                }
            }
            "discord" => {
                let base = base_url.unwrap_or("https://discord.com/api/v10").trim_end_matches('/').to_string();
                match operation {
                    "send_message" => self
                        .client
                        .post(format!("{base}/channels/{}/messages", p("channel_id")?))
                        .header("Authorization", format!("Bot {token}"))
                        .json(&json!({"content": p("content")?})),
                    _ => return Err(unknown()),
                }
            }
            "email" => {
                // Outbound mail goes through the deployment's relay
                let relay = base_url
                    .map(str::to_string)
                    .or_else(|| std::env::var("EMAIL_RELAY_URL").ok())
                    .ok_or_else(|| {
                        NodeError::validation("EMAIL_RELAY_URL not configured for email actions")
                    })?;
                match operation {
                    "send" => self.client.post(relay).bearer_auth(token).json(&json!({
                        "to": p("to")?,
                        "subject": params.get("subject").cloned().unwrap_or(Value::Null),
                        "body": params.get("body").cloned().unwrap_or(Value::Null),
                    })),
                    _ => return Err(unknown()),
                }
            }
            other => {
                return Err(NodeError::validation(format!("unknown provider '{other}'")))
            }
        };

        Ok(request.timeout(CALL_TIMEOUT))
    }

    /// AI-directed mode: the model plans one provider call per round until
    /// it emits action_type=complete or the round cap is reached.
    async fn run_ai_directed(
        &self,
        ctx: &NodeExecutionContext,
        provider: &str,
        goal: &str,
        params: &Value,
        token: &str,
        base_url: Option<&str>,
    ) -> Result<Value, NodeError> {
        let ai_config = ctx
            .config_value("ai_directed")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let max_rounds = ai_config
            .get("max_rounds")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_AI_ROUNDS);
        let model = ai_config
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("gpt-4o-mini")
            .to_string();
        let ai_provider = ai_config
            .get("provider")
            .and_then(Value::as_str)
            .and_then(AiProvider::from_subtype)
            .unwrap_or(AiProvider::OpenAi);

        let mut history: Vec<Value> = Vec::new();

        for round in 1..=max_rounds {
            if ctx.is_cancelled() {
                return Err(NodeError::new(ErrorKind::StateError, "Execution cancelled"));
            }

            let request = AiRequest {
                model: model.clone(),
                system_prompt: Some(planning_system_prompt(provider)),
                user_prompt: json!({
                    "goal": goal,
                    "initial_parameters": params,
                    "rounds_so_far": history,
                })
                .to_string(),
                timeout: Duration::from_secs(60),
                base_url: ai_config
                    .get("api_base_url")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                ..Default::default()
            };

            let completion = self.ai.complete(ai_provider, &request).await?;
            let decision: Value = serde_json::from_str(extract_json(&completion.content))
                .map_err(|e| {
                    NodeError::response(format!("AI planner returned non-JSON decision: {e}"))
                })?;

            let action_type = decision
                .get("action_type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let reasoning = decision
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            ctx.logger
                .append(loomline_storage::AppendLog {
                    execution_id: ctx.execution_id,
                    node_id: Some(ctx.node.id.clone()),
                    level: LogLevel::Info,
                    event_type: LogEventType::AiPlanningRound,
                    message: format!("round {round}: {action_type}"),
                    data: json!({"reasoning": reasoning, "round": round}),
                    is_milestone: false,
                    priority: 6,
                })
                .await;

            if action_type == "complete" {
                return Ok(json!({
                    "completed": true,
                    "rounds": round - 1,
                    "summary": decision.get("summary").cloned().unwrap_or(Value::Null),
                    "history": history,
                }));
            }

            let call_params = decision.get("parameters").cloned().unwrap_or(json!({}));
            let outcome = self
                .call_provider(provider, &action_type, &call_params, token, base_url)
                .await;

            match outcome {
                Ok(result) => history.push(json!({
                    "action_type": action_type,
                    "parameters": call_params,
                    "result": result,
                })),
                Err(e) => history.push(json!({
                    "action_type": action_type,
                    "parameters": call_params,
                    "error": e.message,
                })),
            }
        }

        Ok(json!({
            "completed": false,
            "rounds": max_rounds,
            "history": history,
        }))
    }
}

fn planning_system_prompt(provider: &str) -> String {
    format!(
        "You drive a {provider} integration one API call at a time. Respond with \
         a single JSON object: {{\"action_type\": <operation or \"complete\">, \
         \"parameters\": {{...}}, \"reasoning\": <one sentence>, \"summary\": <when complete>}}. \
         No prose outside the JSON."
    )
}

/// Providers sometimes wrap JSON in a code fence; take the outermost object.
fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &trimmed[s..=e],
        _ => trimmed,
    }
}

async fn classify_provider_response(
    provider: &str,
    status: u16,
    response: reqwest::Response,
) -> Result<Value, NodeError> {
    let text = response.text().await.map_err(NodeError::from_reqwest)?;
    let body: Value = serde_json::from_str(&text).unwrap_or(json!({"raw": text}));

    if !(200..300).contains(&status) {
        let kind = match status {
            401 | 403 => ErrorKind::AuthError,
            404 => ErrorKind::NotFound,
            429 => ErrorKind::RateLimit,
            400 | 422 => ErrorKind::ValidationError,
            _ => ErrorKind::ResponseError,
        };
        return Err(
            NodeError::new(kind, format!("{provider} returned status {status}"))
                .with_details(body),
        );
    }

    // Slack reports failures inside a 200 envelope
    if provider == "slack" && body.get("ok") == Some(&Value::Bool(false)) {
        let error = body.get("error").and_then(Value::as_str).unwrap_or("unknown");
        let kind = match error {
            "invalid_auth" | "token_revoked" | "token_expired" | "not_authed" => {
                ErrorKind::AuthError
            }
            "ratelimited" => ErrorKind::RateLimit,
            _ => ErrorKind::ResponseError,
        };
        return Err(
            NodeError::new(kind, format!("slack error: {error}")).with_details(body),
        );
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_content() {
        let content = "```json\n{\"action_type\": \"complete\"}\n```";
        assert_eq!(extract_json(content), "{\"action_type\": \"complete\"}");
        assert_eq!(extract_json("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(extract_json("no json here"), "no json here");
    }

    #[test]
    fn test_validate_flags_ai_mode_outside_notion() {
        let runner = ExternalActionRunner::new();
        let node: Node = serde_json::from_value(json!({
            "id": "n1",
            "type": "EXTERNAL_ACTION",
            "subtype": "SLACK",
            "configurations": {
                "operation": "post_message",
                "ai_directed": {"enabled": true}
            }
        }))
        .unwrap();
        let problems = runner.validate(&node);
        assert!(problems.iter().any(|p| p.contains("only available for NOTION")));
    }

    #[test]
    fn test_validate_requires_operation() {
        let runner = ExternalActionRunner::new();
        let node: Node = serde_json::from_value(json!({
            "id": "n1",
            "type": "EXTERNAL_ACTION",
            "subtype": "GITHUB",
            "configurations": {}
        }))
        .unwrap();
        let problems = runner.validate(&node);
        assert!(problems.iter().any(|p| p.contains("operation is required")));
    }
}
