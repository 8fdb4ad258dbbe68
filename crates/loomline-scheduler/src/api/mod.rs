// Scheduler HTTP surface: deployment management, manual invocation, and
// the event ingestion endpoints (webhooks, GitHub, Slack).

pub mod deployments;
pub mod events;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use loomline_contracts::{ErrorBody, ErrorKind};
use std::sync::Arc;

use crate::config::Config;
use crate::error::SchedulerError;
use crate::service::SchedulerService;

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SchedulerService>,
    pub config: Arc<Config>,
}

/// SchedulerError rendered as the wire error body
pub struct ApiError(pub SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
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

pub fn routes(state: AppState) -> Router {
    Router::new()
        .merge(deployments::routes(state.clone()))
        .merge(events::routes(state))
}
