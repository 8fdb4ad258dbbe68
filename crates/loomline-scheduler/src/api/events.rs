// Event ingestion: webhook ingress, GitHub events forwarded by the
// gateway, Slack Events API (with URL-verification echo) and slash
// commands. Signatures are verified against the raw body before any JSON
// parsing; routing acks with counts and never waits on completion unless
// a webhook declared sync response mode.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method},
    routing::{any, post},
    Form, Json, Router,
};
use chrono::Utc;
use loomline_contracts::{ErrorBody, EventAck};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use utoipa::ToSchema;

use super::{ApiError, AppState};
use crate::error::SchedulerError;
use crate::signature::{verify_github_signature, verify_slack_signature};

const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Deserialize, ToSchema)]
pub struct GithubTriggerRequest {
    pub event_type: String,
    pub delivery_id: String,
    pub github_payload: Value,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/*path", any(handle_webhook))
        .route("/github/trigger", post(handle_github_trigger))
        .route("/slack/events", post(handle_slack_events))
        .route("/slack/commands", post(handle_slack_command))
        .route("/email/inbound", post(handle_inbound_email))
        .with_state(state)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct InboundEmailRequest {
    pub mailbox: String,
    #[serde(default)]
    pub message: Value,
}

/// Webhook ingress; matched by `webhook:<path>:<method>`.
#[utoipa::path(
    post,
    path = "/webhooks/{path}",
    params(("path" = String, Path, description = "Registered webhook path")),
    request_body(content = String, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Routed", body = EventAck),
        (status = 500, description = "Routing failure", body = ErrorBody)
    ),
    tag = "events"
)]
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let (ack, settled) = state
        .service
        .route_webhook(&path, method.as_str(), signature, &body)
        .await?;

    tracing::info!(
        path = %path,
        method = %method,
        matched = ack.processed_workflows,
        "Webhook routed"
    );

    // Sync mode returns the settled execution when it finished in time
    let response = match settled {
        Some(execution) => json!({
            "ack": ack,
            "execution_id": execution.id,
            "status": execution.status,
            "final_output": execution.final_output,
        }),
        None => serde_json::to_value(&ack)
            .map_err(|e| SchedulerError::Internal(anyhow::anyhow!(e)))?,
    };
    Ok(Json(response))
}

/// GitHub App event forwarded by the gateway; HMAC required.
#[utoipa::path(
    post,
    path = "/github/trigger",
    request_body = GithubTriggerRequest,
    responses(
        (status = 200, description = "Routed", body = EventAck),
        (status = 401, description = "Bad signature", body = ErrorBody)
    ),
    tag = "events"
)]
pub async fn handle_github_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<EventAck>, ApiError> {
    if let Some(secret) = state.config.github_webhook_secret.as_deref() {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SchedulerError::auth("missing X-Hub-Signature-256"))?;
        if !verify_github_signature(secret, &body, signature) {
            return Err(SchedulerError::auth("invalid GitHub signature").into());
        }
    } else {
        tracing::warn!("GITHUB_WEBHOOK_SECRET not configured, skipping signature verification");
    }

    let request: GithubTriggerRequest = serde_json::from_slice(&body)
        .map_err(|e| SchedulerError::validation(format!("invalid JSON body: {e}")))?;

    let ack = state
        .service
        .route_github(
            &request.event_type,
            &request.delivery_id,
            &request.github_payload,
        )
        .await?;

    tracing::info!(
        event_type = %request.event_type,
        delivery_id = %request.delivery_id,
        matched = ack.processed_workflows,
        "GitHub event routed"
    );
    Ok(Json(ack))
}

/// Slack Events API; echoes the URL-verification challenge.
#[utoipa::path(
    post,
    path = "/slack/events",
    request_body(content = String, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Routed or challenge echoed"),
        (status = 401, description = "Bad signature", body = ErrorBody)
    ),
    tag = "events"
)]
pub async fn handle_slack_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    verify_slack(&state, &headers, &body)?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| SchedulerError::validation(format!("invalid JSON body: {e}")))?;

    if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = payload.get("challenge").cloned().unwrap_or(Value::Null);
        tracing::info!("Responding to Slack URL verification challenge");
        return Ok(Json(json!({"challenge": challenge})));
    }

    let ack = state.service.route_slack(&payload).await?;
    tracing::info!(matched = ack.processed_workflows, "Slack event routed");
    Ok(Json(
        serde_json::to_value(&ack).map_err(|e| SchedulerError::Internal(anyhow::anyhow!(e)))?,
    ))
}

/// Slack slash command (form-encoded), routed as a slash_command event.
#[utoipa::path(
    post,
    path = "/slack/commands",
    responses(
        (status = 200, description = "Routed", body = EventAck)
    ),
    tag = "events"
)]
pub async fn handle_slack_command(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<EventAck>, ApiError> {
    let field = |key: &str| form.get(key).cloned().unwrap_or_default();
    let payload = json!({
        "type": "event_callback",
        "team_id": field("team_id"),
        "event": {
            "type": "slash_command",
            "command": field("command"),
            "text": field("text"),
            "channel_id": field("channel_id"),
            "user_id": field("user_id"),
            "response_url": field("response_url"),
        }
    });

    let ack = state.service.route_slack(&payload).await?;
    tracing::info!(
        command = %field("command"),
        matched = ack.processed_workflows,
        "Slash command routed"
    );
    Ok(Json(ack))
}

/// Inbound email forwarded by the mail relay; matched by `email:<mailbox>`.
#[utoipa::path(
    post,
    path = "/email/inbound",
    request_body = InboundEmailRequest,
    responses(
        (status = 200, description = "Routed", body = EventAck)
    ),
    tag = "events"
)]
pub async fn handle_inbound_email(
    State(state): State<AppState>,
    Json(req): Json<InboundEmailRequest>,
) -> Result<Json<EventAck>, ApiError> {
    let ack = state.service.route_email(&req.mailbox, &req.message).await?;
    tracing::info!(
        mailbox = %req.mailbox,
        matched = ack.processed_workflows,
        "Inbound email routed"
    );
    Ok(Json(ack))
}

fn verify_slack(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), ApiError> {
    let Some(secret) = state.config.slack_signing_secret.as_deref() else {
        tracing::warn!("SLACK_SIGNING_SECRET not configured, skipping signature verification");
        return Ok(());
    };

    let timestamp = headers
        .get("x-slack-request-timestamp")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| SchedulerError::auth("missing X-Slack-Request-Timestamp"))?;
    let signature = headers
        .get("x-slack-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| SchedulerError::auth("missing X-Slack-Signature"))?;

    if !verify_slack_signature(secret, timestamp, body, signature, Utc::now().timestamp()) {
        return Err(SchedulerError::auth("invalid Slack signature").into());
    }
    Ok(())
}
