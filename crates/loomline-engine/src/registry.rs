// Runner registry: (type, subtype) → runner.
// Registered once at process start; a missing pair is a VALIDATION_ERROR at
// deploy time and NOT_IMPLEMENTED if somehow reached at run time.

use async_trait::async_trait;
use loomline_contracts::{Node, NodeExecutionResult, NodeType, WorkflowSpec};
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::NodeExecutionContext;
use crate::error::NodeError;

/// Uniform capability set every node kind implements
#[async_trait]
pub trait NodeRunner: Send + Sync {
    /// Deploy-time configuration check; returns human-readable problems
    fn validate(&self, node: &Node) -> Vec<String>;

    /// Execute one dispatch. Structured failures come back as NodeError;
    /// the engine applies the node's on_error policy.
    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError>;
}

pub struct RunnerRegistry {
    runners: HashMap<(NodeType, String), Arc<dyn NodeRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            runners: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        node_type: NodeType,
        subtype: impl Into<String>,
        runner: Arc<dyn NodeRunner>,
    ) {
        self.runners
            .insert((node_type, subtype.into().to_ascii_uppercase()), runner);
    }

    pub fn get(&self, node_type: NodeType, subtype: &str) -> Option<Arc<dyn NodeRunner>> {
        self.runners
            .get(&(node_type, subtype.to_ascii_uppercase()))
            .cloned()
    }

    pub fn contains(&self, node_type: NodeType, subtype: &str) -> bool {
        self.runners
            .contains_key(&(node_type, subtype.to_ascii_uppercase()))
    }

    /// Deploy-time validation: every node must map to a registered runner
    /// and pass that runner's own config checks.
    pub fn validate_spec(&self, spec: &WorkflowSpec) -> Vec<String> {
        let mut problems = Vec::new();
        for node in &spec.nodes {
            match self.get(node.node_type, &node.subtype) {
                Some(runner) => {
                    for problem in runner.validate(node) {
                        problems.push(format!("node '{}': {}", node.id, problem));
                    }
                }
                None => problems.push(format!(
                    "node '{}': no runner for ({}, {})",
                    node.id, node.node_type, node.subtype
                )),
            }
        }
        problems
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoRunner;

    #[async_trait]
    impl NodeRunner for EchoRunner {
        fn validate(&self, node: &Node) -> Vec<String> {
            if node.configurations.get("url").is_none() {
                vec!["url is required".to_string()]
            } else {
                vec![]
            }
        }

        async fn execute(
            &self,
            ctx: &NodeExecutionContext,
        ) -> Result<NodeExecutionResult, NodeError> {
            Ok(NodeExecutionResult::success(ctx.main_input()))
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive_on_subtype() {
        let mut registry = RunnerRegistry::new();
        registry.register(NodeType::Action, "HTTP_REQUEST", Arc::new(EchoRunner));

        assert!(registry.get(NodeType::Action, "http_request").is_some());
        assert!(registry.get(NodeType::Action, "HTTP_REQUEST").is_some());
        assert!(registry.get(NodeType::Trigger, "HTTP_REQUEST").is_none());
    }

    #[test]
    fn test_validate_spec_reports_missing_runner_and_config() {
        let mut registry = RunnerRegistry::new();
        registry.register(NodeType::Action, "HTTP_REQUEST", Arc::new(EchoRunner));

        let spec: WorkflowSpec = serde_json::from_value(serde_json::json!({
            "id": "01936b2d-7c4e-7000-8000-00000000000a",
            "name": "t",
            "nodes": [
                {"id": "bad", "type": "ACTION", "subtype": "HTTP_REQUEST"},
                {"id": "unknown", "type": "ACTION", "subtype": "NO_SUCH"}
            ],
            "triggers": []
        }))
        .unwrap();

        let problems = registry.validate_spec(&spec);
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("url is required"));
        assert!(problems[1].contains("no runner"));
    }
}
