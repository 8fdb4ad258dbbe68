// End-to-end engine runs against mocked provider endpoints.

use loomline_contracts::{
    ExecutionStatus, LogQuery, NodeResultStatus, TriggerInfo, WorkflowSpec,
};
use loomline_engine::{
    standard_registry, EngineConfig, InMemoryStateStore, StateStore, StaticTokenSource,
    WorkflowEngine, WorkflowInfo,
};
use loomline_storage::AppendLog;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn spec_from(json: Value) -> WorkflowSpec {
    serde_json::from_value(json).unwrap()
}

fn setup(
    spec: WorkflowSpec,
    tokens: StaticTokenSource,
) -> (Arc<WorkflowEngine>, Arc<InMemoryStateStore>, Uuid) {
    let workflow_id = spec.id;
    let store = Arc::new(InMemoryStateStore::new());
    store.insert_workflow(WorkflowInfo {
        id: workflow_id,
        name: "e2e".to_string(),
        version: 1,
        deployment_status: loomline_contracts::DeploymentStatus::Deployed,
        spec,
    });
    let engine = WorkflowEngine::new(
        store.clone(),
        Arc::new(standard_registry()),
        Arc::new(tokens),
        EngineConfig::default(),
    );
    (engine, store, workflow_id)
}

fn manual(node_id: &str, input: Value, actor: Option<Uuid>) -> TriggerInfo {
    TriggerInfo {
        trigger_type: "TRIGGER".to_string(),
        trigger_subtype: "MANUAL".to_string(),
        trigger_node_id: node_id.to_string(),
        raw_event: json!({}),
        input_data: input,
        actor,
    }
}

#[tokio::test]
async fn test_http_request_retries_rate_limit_then_succeeds() {
    let server = MockServer::start().await;

    // Two 429s, then success
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"pong": true})))
        .expect(1)
        .mount(&server)
        .await;

    let spec = spec_from(json!({
        "id": Uuid::now_v7(),
        "name": "retry",
        "nodes": [
            {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
            {"id": "ping", "type": "ACTION", "subtype": "HTTP_REQUEST",
             "configurations": {
                 "method": "GET",
                 "url": format!("{}/ping", server.uri()),
                 "retry": {"max_tries": 3, "base_ms": 10}
             }}
        ],
        "connections": [{"id": "c1", "from_node": "t", "to_node": "ping"}],
        "triggers": ["t"]
    }));

    let (engine, _store, workflow_id) = setup(spec, StaticTokenSource::new());
    let id = engine
        .execute(workflow_id, manual("t", json!({}), None))
        .await
        .unwrap();
    engine.join(id).await;

    let execution = engine.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    let result = &execution.node_results["ping"];
    assert_eq!(result.status, NodeResultStatus::Success);
    assert_eq!(result.port_value("main").unwrap()["status_code"], 200);
    assert_eq!(result.port_value("main").unwrap()["json"]["pong"], true);
}

#[tokio::test]
async fn test_http_error_status_routes_to_error_port() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let spec = spec_from(json!({
        "id": Uuid::now_v7(),
        "name": "dual-port",
        "nodes": [
            {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
            {"id": "call", "type": "ACTION", "subtype": "HTTP_REQUEST",
             "configurations": {
                 "method": "GET",
                 "url": format!("{}/broken", server.uri()),
                 "use_error_port": true
             }},
            {"id": "recover", "type": "ACTION", "subtype": "DATA_TRANSFORMATION",
             "configurations": {"transformation_type": "jq", "filter": ".status_code"}}
        ],
        "connections": [
            {"id": "c1", "from_node": "t", "to_node": "call"},
            {"id": "c2", "from_node": "call", "from_port": "error", "to_node": "recover"}
        ],
        "triggers": ["t"]
    }));

    let (engine, _store, workflow_id) = setup(spec, StaticTokenSource::new());
    let id = engine
        .execute(workflow_id, manual("t", json!({}), None))
        .await
        .unwrap();
    engine.join(id).await;

    let execution = engine.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.final_output, Some(json!(500)));
}

#[tokio::test]
async fn test_ai_then_slack_pipeline() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-4o-mini",
            "choices": [{
                "message": {"role": "assistant", "content": "why did the crab never share"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 8}
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .and(body_string_contains("🎭 why did the crab never share"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "ts": "1.2"})))
        .expect(1)
        .mount(&server)
        .await;

    std::env::set_var("OPENAI_API_KEY", "sk-test-not-real");

    let actor = Uuid::now_v7();
    let spec = spec_from(json!({
        "id": Uuid::now_v7(),
        "name": "joke pipeline",
        "nodes": [
            {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
            {"id": "ai", "type": "AI_AGENT", "subtype": "OPENAI_CHATGPT",
             "configurations": {
                 "model": "gpt-4o-mini",
                 "user_prompt": "Tell me a short joke",
                 "api_base_url": server.uri()
             }},
            {"id": "slack", "type": "EXTERNAL_ACTION", "subtype": "SLACK",
             "configurations": {
                 "operation": "post_message",
                 "api_base_url": server.uri(),
                 "parameters": {
                     "channel": "#jokes",
                     "text": "🎭 {{$node[\"ai\"].json.content}}"
                 }
             }}
        ],
        "connections": [
            {"id": "c1", "from_node": "t", "to_node": "ai"},
            {"id": "c2", "from_node": "ai", "to_node": "slack"}
        ],
        "triggers": ["t"]
    }));

    let tokens = StaticTokenSource::new().with_token("slack", "xoxb-test");
    let (engine, _store, workflow_id) = setup(spec, tokens);
    let id = engine
        .execute(workflow_id, manual("t", json!({}), Some(actor)))
        .await
        .unwrap();
    engine.join(id).await;

    let execution = engine.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(
        execution.node_results["ai"].port_value("main").unwrap()["content"],
        "why did the crab never share"
    );
    assert_eq!(
        execution.node_results["slack"].port_value("main").unwrap()["ok"],
        true
    );
}

#[tokio::test]
async fn test_ai_auth_failure_maps_to_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key provided"}
        })))
        .mount(&server)
        .await;

    std::env::set_var("OPENAI_API_KEY", "sk-test-not-real");

    let spec = spec_from(json!({
        "id": Uuid::now_v7(),
        "name": "auth-fail",
        "nodes": [
            {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
            {"id": "ai", "type": "AI_AGENT", "subtype": "OPENAI_CHATGPT",
             "configurations": {
                 "model": "gpt-4o-mini",
                 "user_prompt": "hi there",
                 "api_base_url": server.uri()
             }}
        ],
        "connections": [{"id": "c1", "from_node": "t", "to_node": "ai"}],
        "triggers": ["t"]
    }));

    let (engine, _store, workflow_id) = setup(spec, StaticTokenSource::new());
    let id = engine
        .execute(workflow_id, manual("t", json!({}), None))
        .await
        .unwrap();
    engine.join(id).await;

    let execution = engine.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Error);
    assert_eq!(
        execution.node_results["ai"].error_kind(),
        Some(loomline_contracts::ErrorKind::AuthError)
    );
}

#[tokio::test]
async fn test_log_pagination_yields_each_entry_exactly_once() {
    let store = Arc::new(InMemoryStateStore::new());
    let execution_id = Uuid::now_v7();

    for i in 0..25 {
        store
            .append_log(AppendLog {
                execution_id,
                node_id: None,
                level: loomline_contracts::LogLevel::Info,
                event_type: loomline_contracts::LogEventType::RunnerLog,
                message: format!("entry {i}"),
                data: json!({}),
                is_milestone: i % 5 == 0,
                priority: 5,
            })
            .await
            .unwrap();
    }

    let mut seen = HashSet::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = store
            .query_logs(
                execution_id,
                &LogQuery {
                    page_size: Some(10),
                    cursor: cursor.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        for entry in &page.entries {
            assert!(seen.insert(entry.id), "entry yielded twice: {}", entry.id);
        }
        if !page.has_next {
            break;
        }
        cursor = page.next_cursor.clone();
    }
    assert_eq!(seen.len(), 25);

    // Milestone filter
    let page = store
        .query_logs(
            execution_id,
            &LogQuery {
                milestones_only: Some(true),
                page_size: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 5);
    assert!(!page.has_next);
}
