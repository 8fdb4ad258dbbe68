// Trivial ACTION utilities: sleep, JSON parsing, string formatting.

use async_trait::async_trait;
use loomline_contracts::{ErrorKind, Node, NodeExecutionResult};
use serde_json::Value;
use std::time::Duration;

use crate::context::NodeExecutionContext;
use crate::error::NodeError;
use crate::registry::NodeRunner;

const MAX_SLEEP_SECONDS: u64 = 3600;
const CANCEL_POLL: Duration = Duration::from_millis(250);

pub struct SleepRunner;

#[async_trait]
impl NodeRunner for SleepRunner {
    fn validate(&self, node: &Node) -> Vec<String> {
        match node.config_u64("duration_seconds") {
            Some(secs) if secs <= MAX_SLEEP_SECONDS => vec![],
            Some(_) => vec![format!("duration_seconds must be <= {MAX_SLEEP_SECONDS}")],
            None => vec!["duration_seconds is required".to_string()],
        }
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let total = Duration::from_secs(ctx.config_u64("duration_seconds").unwrap_or(0));
        let mut slept = Duration::ZERO;

        // Sleep in slices so cancellation takes effect promptly
        while slept < total {
            if ctx.is_cancelled() {
                return Err(NodeError::new(ErrorKind::StateError, "Execution cancelled"));
            }
            let slice = CANCEL_POLL.min(total - slept);
            tokio::time::sleep(slice).await;
            slept += slice;
        }

        Ok(NodeExecutionResult::success(ctx.main_input()))
    }
}

pub struct ParseJsonRunner;

#[async_trait]
impl NodeRunner for ParseJsonRunner {
    fn validate(&self, _node: &Node) -> Vec<String> {
        vec![]
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let input = ctx.main_input();
        // Accept either a raw string or a field selected by `source_field`
        let source = match ctx.config_str("source_field") {
            Some(field) => input.get(field).cloned().unwrap_or(Value::Null),
            None => input,
        };

        let text = source.as_str().ok_or_else(|| {
            NodeError::validation("parse input is not a string")
        })?;

        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| NodeError::new(ErrorKind::ValidationError, format!("Invalid JSON: {e}")))?;

        Ok(NodeExecutionResult::success(parsed))
    }
}

pub struct FormatRunner;

#[async_trait]
impl NodeRunner for FormatRunner {
    fn validate(&self, node: &Node) -> Vec<String> {
        if node.config_str("template").is_none() {
            vec!["template is required".to_string()]
        } else {
            vec![]
        }
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        // The template was already resolved with the node's full context;
        // emit it as-is alongside the input it was built from
        let formatted = ctx
            .config_str("template")
            .unwrap_or_default()
            .to_string();
        Ok(NodeExecutionResult::success(serde_json::json!({
            "formatted": formatted,
            "input": ctx.main_input(),
        })))
    }
}
