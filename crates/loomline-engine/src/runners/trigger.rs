// TRIGGER nodes perform no I/O at execution time: they emit the normalized
// trigger payload on `main`. Subtypes only differ in the payload shape and
// in the index-key builder the scheduler used at deploy time.

use async_trait::async_trait;
use loomline_contracts::{Node, NodeExecutionResult};

use crate::context::NodeExecutionContext;
use crate::error::NodeError;
use crate::registry::NodeRunner;

pub struct TriggerRunner;

#[async_trait]
impl NodeRunner for TriggerRunner {
    fn validate(&self, node: &Node) -> Vec<String> {
        let mut problems = Vec::new();
        match node.subtype.to_ascii_uppercase().as_str() {
            "WEBHOOK" => {
                if node.config_str("path").map(str::trim).unwrap_or("").is_empty() {
                    problems.push("webhook trigger requires a path".to_string());
                }
            }
            "CRON" => {
                if node.config_str("cron_expression").map(str::trim).unwrap_or("").is_empty() {
                    problems.push("cron trigger requires cron_expression".to_string());
                }
            }
            _ => {}
        }
        problems
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        Ok(NodeExecutionResult::success(ctx.trigger.input_data.clone()))
    }
}
