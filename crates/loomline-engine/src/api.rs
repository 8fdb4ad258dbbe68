// Engine HTTP surface: execute, snapshot, cancel, resume, single-node
// debug runs, execution history, and the paged log query.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use loomline_contracts::{
    ErrorBody, ErrorKind, ExecuteRequest, ExecuteResponse, Execution, ListResponse, LogPage,
    LogQuery, NodeExecutionResult, ResumeRequest, SingleNodeRequest,
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::EngineError;
use crate::executor::WorkflowEngine;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
}

/// EngineError rendered as the wire error body
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        if kind == ErrorKind::Internal {
            tracing::error!(error = %self.0, "Internal error");
        }
        let status =
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody::new(kind, self.0.to_string());
        (status, Json(body)).into_response()
    }
}

/// Query parameters for execution history
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListExecutionsParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

/// Create engine routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows/:id/execute", post(execute_workflow))
        .route("/v1/workflows/:id/executions", get(list_executions))
        .route(
            "/v1/workflows/:id/nodes/:node_id/execute",
            post(execute_single_node),
        )
        .route("/v1/executions/:id", get(get_execution))
        .route("/v1/executions/:id/cancel", post(cancel_execution))
        .route("/v1/executions/:id/resume", post(resume_execution))
        .route("/v1/executions/:id/logs", get(get_execution_logs))
        .with_state(state)
}

/// POST /v1/workflows/:id/execute - Enqueue an execution
#[utoipa::path(
    post,
    path = "/v1/workflows/{id}/execute",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    request_body = ExecuteRequest,
    responses(
        (status = 202, description = "Execution accepted", body = ExecuteResponse),
        (status = 400, description = "Workflow not deployed or bad trigger", body = ErrorBody),
        (status = 404, description = "Workflow not found", body = ErrorBody)
    ),
    tag = "executions"
)]
pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecuteResponse>), ApiError> {
    let mut trigger_info = req.trigger_info;
    if trigger_info.actor.is_none() {
        trigger_info.actor = req.actor;
    }
    if trigger_info.input_data.is_null() {
        trigger_info.input_data = req.input_data;
    }

    let execution_id = state.engine.execute(id, trigger_info).await?;
    tracing::info!(workflow_id = %id, execution_id = %execution_id, "Execution enqueued");

    Ok((StatusCode::ACCEPTED, Json(ExecuteResponse { execution_id })))
}

/// GET /v1/executions/:id - Execution snapshot
#[utoipa::path(
    get,
    path = "/v1/executions/{id}",
    params(("id" = Uuid, Path, description = "Execution ID")),
    responses(
        (status = 200, description = "Execution found", body = Execution),
        (status = 404, description = "Execution not found", body = ErrorBody)
    ),
    tag = "executions"
)]
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Execution>, ApiError> {
    Ok(Json(state.engine.get_execution(id).await?))
}

/// POST /v1/executions/:id/cancel
#[utoipa::path(
    post,
    path = "/v1/executions/{id}/cancel",
    params(("id" = Uuid, Path, description = "Execution ID")),
    responses(
        (status = 200, description = "Cancellation requested"),
        (status = 404, description = "Execution not found", body = ErrorBody)
    ),
    tag = "executions"
)]
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.engine.cancel(id).await?;
    tracing::info!(execution_id = %id, "Cancellation requested");
    Ok(StatusCode::OK)
}

/// POST /v1/executions/:id/resume
#[utoipa::path(
    post,
    path = "/v1/executions/{id}/resume",
    params(("id" = Uuid, Path, description = "Execution ID")),
    request_body = ResumeRequest,
    responses(
        (status = 200, description = "Resume accepted"),
        (status = 400, description = "Not paused or interaction mismatch", body = ErrorBody),
        (status = 404, description = "Execution not found", body = ErrorBody)
    ),
    tag = "executions"
)]
pub async fn resume_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResumeRequest>,
) -> Result<StatusCode, ApiError> {
    state.engine.resume(id, req).await?;
    tracing::info!(execution_id = %id, "Resume accepted");
    Ok(StatusCode::OK)
}

/// POST /v1/workflows/:id/nodes/:node_id/execute - Debug single-node run
#[utoipa::path(
    post,
    path = "/v1/workflows/{id}/nodes/{node_id}/execute",
    params(
        ("id" = Uuid, Path, description = "Workflow ID"),
        ("node_id" = String, Path, description = "Node ID")
    ),
    request_body = SingleNodeRequest,
    responses(
        (status = 200, description = "Node result", body = NodeExecutionResult),
        (status = 404, description = "Workflow or node not found", body = ErrorBody)
    ),
    tag = "executions"
)]
pub async fn execute_single_node(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(Uuid, String)>,
    Json(req): Json<SingleNodeRequest>,
) -> Result<Json<NodeExecutionResult>, ApiError> {
    let result = state
        .engine
        .execute_single_node(id, &node_id, req.input_data, req.actor)
        .await?;
    Ok(Json(result))
}

/// GET /v1/workflows/:id/executions - Execution history (paged)
#[utoipa::path(
    get,
    path = "/v1/workflows/{id}/executions",
    params(
        ("id" = Uuid, Path, description = "Workflow ID"),
        ("limit" = Option<i64>, Query, description = "Max results (default 20)"),
        ("offset" = Option<i64>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "Executions", body = ListResponse<Execution>)
    ),
    tag = "executions"
)]
pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ListExecutionsParams>,
) -> Result<Json<ListResponse<Execution>>, ApiError> {
    let rows = state
        .engine
        .store()
        .list_executions(id, params.limit.clamp(1, 100), params.offset.max(0))
        .await
        .map_err(EngineError::from)?;
    Ok(Json(ListResponse::new(rows)))
}

/// GET /v1/executions/:id/logs - Paged log query
#[utoipa::path(
    get,
    path = "/v1/executions/{id}/logs",
    params(
        ("id" = Uuid, Path, description = "Execution ID"),
        ("min_priority" = Option<i32>, Query, description = "Minimum priority (1-10)"),
        ("milestones_only" = Option<bool>, Query, description = "Milestone entries only"),
        ("level" = Option<String>, Query, description = "Level filter"),
        ("page_size" = Option<i64>, Query, description = "Page size (max 100)"),
        ("cursor" = Option<String>, Query, description = "Opaque cursor from a previous page")
    ),
    responses(
        (status = 200, description = "Log page", body = LogPage),
        (status = 404, description = "Execution not found", body = ErrorBody)
    ),
    tag = "logs"
)]
pub async fn get_execution_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>, ApiError> {
    // 404 for unknown executions rather than an empty page
    state.engine.get_execution(id).await?;
    let page = state
        .engine
        .store()
        .query_logs(id, &query)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(page))
}
