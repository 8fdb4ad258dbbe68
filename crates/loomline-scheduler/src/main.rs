// Loomline scheduler server

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use loomline_engine::config::init_tracing;
use loomline_engine::standard_registry;
use loomline_scheduler::api::{self, AppState};
use loomline_scheduler::{Config, CronDriver, HttpEngineClient, SchedulerService};
use loomline_storage::{Database, DistributedLock};
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
        api::deployments::deploy_workflow,
        api::deployments::undeploy_workflow,
        api::deployments::pause_workflow,
        api::deployments::resume_workflow,
        api::deployments::deployment_history,
        api::deployments::trigger_execution,
        api::events::handle_webhook,
        api::events::handle_github_trigger,
        api::events::handle_slack_events,
        api::events::handle_slack_command,
        api::events::handle_inbound_email,
    ),
    components(schemas(
        loomline_contracts::WorkflowSpec,
        loomline_contracts::Node,
        loomline_contracts::Connection,
        loomline_contracts::DeployRequest,
        loomline_contracts::DeployResponse,
        loomline_contracts::UndeployResponse,
        loomline_contracts::TriggerExecutionRequest,
        loomline_contracts::TriggerExecutionResponse,
        loomline_contracts::EventAck,
        loomline_contracts::RoutedExecution,
        loomline_contracts::DeploymentHistoryEntry,
        loomline_contracts::ErrorBody,
    )),
    tags(
        (name = "deployments", description = "Trigger deployment endpoints"),
        (name = "executions", description = "Manual invocation endpoints"),
        (name = "events", description = "Event ingestion endpoints")
    ),
    info(
        title = "Loomline Scheduler API",
        version = "0.2.0",
        description = "Trigger index and event routing"
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("loomline_scheduler=debug,tower_http=debug");

    tracing::info!("loomline-scheduler starting...");

    let config = Arc::new(Config::from_env()?);

    // Startup checks: catalog store and redis
    let db = Database::from_url(&config.catalog_store_url)
        .await
        .context("Failed to connect to catalog store")?;
    db.ping().await?;
    tracing::info!("Connected to catalog store");

    let lock = DistributedLock::new(&config.redis_url)?;
    lock.ping().await.context("Failed to connect to Redis")?;
    tracing::info!("Connected to Redis");

    let dispatcher = Arc::new(HttpEngineClient::new(&config.engine_url));
    let registry = Arc::new(standard_registry());
    let service = Arc::new(SchedulerService::new(db, dispatcher, registry));

    // Cron driver: one task per replica, double fires suppressed by lock
    let driver = CronDriver::new(service.clone(), lock);
    tokio::spawn(driver.run());

    let state = AppState {
        service,
        config: config.clone(),
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
