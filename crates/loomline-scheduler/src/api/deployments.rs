// Deployment CRUD routes and manual invocation

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use loomline_contracts::{
    DeployRequest, DeployResponse, DeploymentHistoryEntry, ErrorBody, ListResponse,
    TriggerExecutionRequest, TriggerExecutionResponse, UndeployResponse,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::error::SchedulerError;

#[derive(Debug, Deserialize, ToSchema)]
pub struct HistoryParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/deployments/:workflow_id",
            post(deploy_workflow).delete(undeploy_workflow),
        )
        .route("/deployments/:workflow_id/pause", post(pause_workflow))
        .route("/deployments/:workflow_id/resume", post(resume_workflow))
        .route("/deployments/:workflow_id/history", get(deployment_history))
        .route(
            "/executions/workflows/:workflow_id/trigger",
            post(trigger_execution),
        )
        .with_state(state)
}

/// POST /deployments/:workflow_id - Deploy a workflow's triggers
#[utoipa::path(
    post,
    path = "/deployments/{workflow_id}",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    request_body = DeployRequest,
    responses(
        (status = 200, description = "Deployed", body = DeployResponse),
        (status = 400, description = "Spec validation failed", body = ErrorBody),
        (status = 409, description = "Webhook path collision", body = ErrorBody)
    ),
    tag = "deployments"
)]
pub async fn deploy_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(req): Json<DeployRequest>,
) -> Result<Json<DeployResponse>, ApiError> {
    let response = state
        .service
        .deploy(workflow_id, req.workflow_spec, req.actor)
        .await?;
    Ok(Json(response))
}

/// DELETE /deployments/:workflow_id - Undeploy (idempotent)
#[utoipa::path(
    delete,
    path = "/deployments/{workflow_id}",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Undeployed", body = UndeployResponse),
        (status = 404, description = "Workflow not found", body = ErrorBody)
    ),
    tag = "deployments"
)]
pub async fn undeploy_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<UndeployResponse>, ApiError> {
    Ok(Json(state.service.undeploy(workflow_id, None).await?))
}

/// POST /deployments/:workflow_id/pause - Pause trigger matching
#[utoipa::path(
    post,
    path = "/deployments/{workflow_id}/pause",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Paused", body = UndeployResponse),
        (status = 404, description = "Workflow not found", body = ErrorBody)
    ),
    tag = "deployments"
)]
pub async fn pause_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<UndeployResponse>, ApiError> {
    Ok(Json(state.service.pause(workflow_id, None).await?))
}

/// POST /deployments/:workflow_id/resume - Reactivate paused triggers
#[utoipa::path(
    post,
    path = "/deployments/{workflow_id}/resume",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Resumed", body = UndeployResponse),
        (status = 404, description = "Workflow not found", body = ErrorBody)
    ),
    tag = "deployments"
)]
pub async fn resume_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<UndeployResponse>, ApiError> {
    Ok(Json(state.service.resume(workflow_id, None).await?))
}

/// GET /deployments/:workflow_id/history
#[utoipa::path(
    get,
    path = "/deployments/{workflow_id}/history",
    params(
        ("workflow_id" = Uuid, Path, description = "Workflow ID"),
        ("limit" = Option<i64>, Query, description = "Max entries (default 50)")
    ),
    responses(
        (status = 200, description = "Deployment history", body = ListResponse<DeploymentHistoryEntry>)
    ),
    tag = "deployments"
)]
pub async fn deployment_history(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<ListResponse<DeploymentHistoryEntry>>, ApiError> {
    let rows = state
        .service
        .database()
        .list_deployment_history(workflow_id, params.limit.clamp(1, 200))
        .await
        .map_err(SchedulerError::from)?;
    Ok(Json(ListResponse::new(
        rows.into_iter().map(Into::into).collect(),
    )))
}

/// POST /executions/workflows/:workflow_id/trigger - Manual invocation
#[utoipa::path(
    post,
    path = "/executions/workflows/{workflow_id}/trigger",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    request_body = TriggerExecutionRequest,
    responses(
        (status = 200, description = "Execution started", body = TriggerExecutionResponse),
        (status = 404, description = "Workflow not found", body = ErrorBody)
    ),
    tag = "executions"
)]
pub async fn trigger_execution(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(req): Json<TriggerExecutionRequest>,
) -> Result<(StatusCode, Json<TriggerExecutionResponse>), ApiError> {
    let response = state
        .service
        .trigger_execution(workflow_id, req.trigger_metadata, req.input_data)
        .await?;
    tracing::info!(
        workflow_id = %workflow_id,
        execution_id = %response.execution_id,
        "Manual execution started"
    );
    Ok((StatusCode::OK, Json(response)))
}
