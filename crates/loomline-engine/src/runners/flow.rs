// FLOW nodes: IF (boolean branch), SWITCH (multi-way), MERGE (wait-all),
// LOOP (bounded iteration). Branch decisions work through ports: the value
// is emitted on exactly one port, and edges reading other ports stay
// inactive, which is how downstream skipping happens.

use async_trait::async_trait;
use loomline_contracts::{Node, NodeExecutionResult};
use serde_json::Value;

use crate::context::NodeExecutionContext;
use crate::convert::ConvExpr;
use crate::error::NodeError;
use crate::registry::NodeRunner;

pub const DEFAULT_MAX_ITERATIONS: u64 = 100;

/// Port a LOOP node emits on to re-enter its body
pub const LOOP_CONTINUE_PORT: &str = "loop";
/// Port a LOOP node emits on when finished
pub const LOOP_DONE_PORT: &str = "done";
/// Inbound port carrying the body's result back into the LOOP node
pub const LOOP_FEEDBACK_PORT: &str = "feedback";

pub struct FlowRunner;

#[async_trait]
impl NodeRunner for FlowRunner {
    fn validate(&self, node: &Node) -> Vec<String> {
        let mut problems = Vec::new();
        match node.subtype.to_ascii_uppercase().as_str() {
            "IF" => match node.config_str("condition") {
                Some(cond) => {
                    if let Err(e) = ConvExpr::parse(cond) {
                        problems.push(format!("invalid condition: {e}"));
                    }
                }
                None => problems.push("IF requires a condition".to_string()),
            },
            "SWITCH" => {
                match node.config_str("expression") {
                    Some(expr) => {
                        if let Err(e) = ConvExpr::parse(expr) {
                            problems.push(format!("invalid expression: {e}"));
                        }
                    }
                    None => problems.push("SWITCH requires an expression".to_string()),
                }
                if !node
                    .configurations
                    .get("cases")
                    .map(Value::is_object)
                    .unwrap_or(false)
                {
                    problems.push("SWITCH requires a cases object".to_string());
                }
            }
            "LOOP" => {
                if let Some(cond) = node.config_str("until") {
                    if let Err(e) = ConvExpr::parse(cond) {
                        problems.push(format!("invalid until predicate: {e}"));
                    }
                }
            }
            _ => {}
        }
        problems
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        match ctx.node.subtype.to_ascii_uppercase().as_str() {
            "IF" => self.run_if(ctx),
            "SWITCH" => self.run_switch(ctx),
            "MERGE" => self.run_merge(ctx),
            "LOOP" => self.run_loop(ctx),
            other => Err(NodeError::validation(format!("unknown flow subtype {other}"))),
        }
    }
}

impl FlowRunner {
    fn run_if(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let condition = ctx
            .config_str("condition")
            .ok_or_else(|| NodeError::validation("IF condition missing"))?;
        let expr = ConvExpr::parse(condition)
            .map_err(|e| NodeError::validation(format!("invalid condition: {e}")))?;

        let input = ctx.main_input();
        let port = if truthy(&expr.eval(&input)) { "true" } else { "false" };
        Ok(NodeExecutionResult::success_on(port, input))
    }

    fn run_switch(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let expression = ctx
            .config_str("expression")
            .ok_or_else(|| NodeError::validation("SWITCH expression missing"))?;
        let expr = ConvExpr::parse(expression)
            .map_err(|e| NodeError::validation(format!("invalid expression: {e}")))?;

        let input = ctx.main_input();
        let key = match expr.eval(&input) {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let cases = ctx
            .config_value("cases")
            .and_then(Value::as_object)
            .ok_or_else(|| NodeError::validation("SWITCH cases missing"))?;

        let port = cases
            .get(&key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| ctx.config_str("default_port").map(str::to_string))
            .unwrap_or_else(|| "default".to_string());

        Ok(NodeExecutionResult::success_on(port, input))
    }

    fn run_merge(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        // The engine only dispatches MERGE once every inbound edge has
        // settled; skipped branches simply contribute nothing
        Ok(NodeExecutionResult::success(ctx.merged_inputs()))
    }

    fn run_loop(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let max_iterations = ctx
            .config_u64("max_iterations")
            .unwrap_or(DEFAULT_MAX_ITERATIONS);

        // First entry carries the seed on main; later entries carry the
        // body's output on the feedback port
        let current = ctx
            .inputs
            .get(LOOP_FEEDBACK_PORT)
            .or_else(|| ctx.inputs.get("main"))
            .cloned()
            .unwrap_or(Value::Null);

        if ctx.iteration >= max_iterations {
            return Ok(NodeExecutionResult::success_on(LOOP_DONE_PORT, current));
        }

        let done = match ctx.config_str("until") {
            Some(cond) => {
                let expr = ConvExpr::parse(cond)
                    .map_err(|e| NodeError::validation(format!("invalid until predicate: {e}")))?;
                truthy(&expr.eval(&current))
            }
            None => false,
        };

        let port = if done { LOOP_DONE_PORT } else { LOOP_CONTINUE_PORT };
        let mut result = NodeExecutionResult::success_on(port, current);
        result.push_log(format!("iteration {}", ctx.iteration));
        Ok(result)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!(true)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!(0.5)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!({"a": 1})));
    }
}
