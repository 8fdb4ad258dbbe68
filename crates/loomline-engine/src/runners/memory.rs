// TOOL/MEMORY runner: get/set/append/query against the per-workflow
// key-value store. Namespacing by workflow_id happens in the handle.

use async_trait::async_trait;
use loomline_contracts::{Node, NodeExecutionResult};
use serde_json::Value;

use crate::context::NodeExecutionContext;
use crate::error::NodeError;
use crate::registry::NodeRunner;

const DEFAULT_COLLECTION: &str = "default";
const QUERY_LIMIT: i64 = 100;

pub struct MemoryRunner;

#[async_trait]
impl NodeRunner for MemoryRunner {
    fn validate(&self, node: &Node) -> Vec<String> {
        let mut problems = Vec::new();
        match node.config_str("operation") {
            Some("get" | "set" | "append") => {
                if node.config_str("key").map(str::trim).unwrap_or("").is_empty() {
                    problems.push("key is required".to_string());
                }
            }
            Some("query") => {}
            Some(other) => problems.push(format!("unknown operation '{other}'")),
            None => problems.push("operation is required".to_string()),
        }
        problems
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let operation = ctx
            .config_str("operation")
            .ok_or_else(|| NodeError::validation("operation missing"))?;
        let collection = ctx.config_str("collection").unwrap_or(DEFAULT_COLLECTION);

        let output = match operation {
            "get" => {
                let key = required_key(ctx)?;
                let value = ctx
                    .memory
                    .get(collection, &key)
                    .await
                    .map_err(|e| NodeError::internal(format!("memory get failed: {e}")))?;
                serde_json::json!({"key": key, "value": value, "found": value_found(&value)})
            }
            "set" => {
                let key = required_key(ctx)?;
                let value = write_value(ctx);
                ctx.memory
                    .set(collection, &key, &value)
                    .await
                    .map_err(|e| NodeError::internal(format!("memory set failed: {e}")))?;
                serde_json::json!({"key": key, "value": value})
            }
            "append" => {
                let key = required_key(ctx)?;
                let value = write_value(ctx);
                ctx.memory
                    .append(collection, &key, &value)
                    .await
                    .map_err(|e| NodeError::internal(format!("memory append failed: {e}")))?;
                serde_json::json!({"key": key, "appended": value})
            }
            "query" => {
                let prefix = ctx.config_str("key_prefix").unwrap_or("");
                let entries = ctx
                    .memory
                    .query(collection, prefix, QUERY_LIMIT)
                    .await
                    .map_err(|e| NodeError::internal(format!("memory query failed: {e}")))?;
                let items: Vec<Value> = entries
                    .into_iter()
                    .map(|(key, value)| serde_json::json!({"key": key, "value": value}))
                    .collect();
                serde_json::json!({"entries": items})
            }
            other => {
                return Err(NodeError::validation(format!("unknown operation '{other}'")))
            }
        };

        Ok(NodeExecutionResult::success(output))
    }
}

fn required_key(ctx: &NodeExecutionContext) -> Result<String, NodeError> {
    ctx.config_str("key")
        .map(str::to_string)
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| NodeError::validation("key missing"))
}

/// Value to store: explicit config `value` wins, else the main input
fn write_value(ctx: &NodeExecutionContext) -> Value {
    ctx.config_value("value")
        .cloned()
        .unwrap_or_else(|| ctx.main_input())
}

fn value_found(value: &Option<Value>) -> bool {
    value.is_some()
}
