// Loomline engine server

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use loomline_engine::api;
use loomline_engine::config::{init_tracing, Config};
use loomline_engine::sweep;
use loomline_engine::{
    standard_registry, CredentialBroker, PgStateStore, WorkflowEngine,
};
use loomline_storage::{CredentialCipher, Database, DistributedLock};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        api::execute_workflow,
        api::get_execution,
        api::cancel_execution,
        api::resume_execution,
        api::execute_single_node,
        api::list_executions,
        api::get_execution_logs,
    ),
    components(schemas(
        loomline_contracts::Execution,
        loomline_contracts::ExecutionStatus,
        loomline_contracts::NodeExecutionResult,
        loomline_contracts::NodeResultStatus,
        loomline_contracts::TriggerInfo,
        loomline_contracts::PendingPause,
        loomline_contracts::ExecuteRequest,
        loomline_contracts::ExecuteResponse,
        loomline_contracts::ResumeRequest,
        loomline_contracts::SingleNodeRequest,
        loomline_contracts::ErrorBody,
        loomline_contracts::LogPage,
        loomline_contracts::ExecutionLogEntry,
    )),
    tags(
        (name = "executions", description = "Workflow execution endpoints"),
        (name = "logs", description = "Execution log endpoints")
    ),
    info(
        title = "Loomline Engine API",
        version = "0.2.0",
        description = "Workflow execution engine"
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("loomline_engine=debug,tower_http=debug");

    tracing::info!("loomline-engine starting...");

    let config = Config::from_env()?;

    // Startup checks: catalog store, redis, encryption key
    let db = Database::from_url(&config.catalog_store_url)
        .await
        .context("Failed to connect to catalog store")?;
    db.ping().await?;
    tracing::info!("Connected to catalog store");

    let lock = DistributedLock::new(&config.redis_url)?;
    lock.ping().await.context("Failed to connect to Redis")?;
    tracing::info!("Connected to Redis");

    let cipher = CredentialCipher::from_env().context("Credential encryption not configured")?;

    let store = Arc::new(PgStateStore::new(db.clone()));
    let broker = Arc::new(CredentialBroker::new(db, cipher, lock));
    let registry = Arc::new(standard_registry());
    let engine = WorkflowEngine::new(store, registry, broker, config.engine.clone());

    sweep::spawn_pause_sweep(engine.clone());
    sweep::spawn_log_retention_sweep(engine.clone(), config.log_retention_hours);

    let state = api::AppState {
        engine: engine.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .merge(api::routes(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
