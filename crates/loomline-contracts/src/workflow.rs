// Workflow spec DTOs: the wire format produced by the design agent and
// consumed by deploy. Structural validation lives in the scheduler.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Node kind; together with `subtype` it selects exactly one runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Trigger,
    Action,
    ExternalAction,
    AiAgent,
    Flow,
    HumanLoop,
    Tool,
    Memory,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeType::Trigger => "TRIGGER",
            NodeType::Action => "ACTION",
            NodeType::ExternalAction => "EXTERNAL_ACTION",
            NodeType::AiAgent => "AI_AGENT",
            NodeType::Flow => "FLOW",
            NodeType::HumanLoop => "HUMAN_LOOP",
            NodeType::Tool => "TOOL",
            NodeType::Memory => "MEMORY",
        };
        f.write_str(s)
    }
}

/// A single node of the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub subtype: String,
    #[serde(default)]
    pub configurations: serde_json::Value,
    #[serde(default)]
    pub input_params: serde_json::Value,
    #[serde(default)]
    pub output_params: serde_json::Value,
}

impl Node {
    /// Registry key for runner dispatch
    pub fn runner_key(&self) -> (NodeType, String) {
        (self.node_type, self.subtype.to_ascii_uppercase())
    }

    /// Typed configuration lookup, `None` when absent or mismatched
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.configurations.get(key).and_then(|v| v.as_str())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.configurations.get(key).and_then(|v| v.as_u64())
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.configurations.get(key).and_then(|v| v.as_bool())
    }
}

fn default_port() -> String {
    "main".to_string()
}

/// Directed edge between two node ports
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Connection {
    pub id: String,
    pub from_node: String,
    pub to_node: String,
    #[serde(default = "default_port")]
    pub from_port: String,
    #[serde(default = "default_port")]
    pub to_port: String,
    /// Restricted pure expression applied to the upstream value, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_function: Option<String>,
}

/// Workflow spec wire format
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowSpec {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: i64,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Node ids whose type must be TRIGGER
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_version() -> i64 {
    1
}

impl WorkflowSpec {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Connections entering `node_id`
    pub fn inbound<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a Connection> + 'a {
        let node_id = node_id.to_string();
        self.connections.iter().filter(move |c| c.to_node == node_id)
    }

    /// Connections leaving `node_id`
    pub fn outbound<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a Connection> + 'a {
        let node_id = node_id.to_string();
        self.connections
            .iter()
            .filter(move |c| c.from_node == node_id)
    }

    /// Static data block from metadata, `{}` when absent
    pub fn static_data(&self) -> serde_json::Value {
        self.metadata
            .get("static_data")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

/// Workflow deployment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Draft,
    Deployed,
    Paused,
    Undeployed,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Draft => "DRAFT",
            DeploymentStatus::Deployed => "DEPLOYED",
            DeploymentStatus::Paused => "PAUSED",
            DeploymentStatus::Undeployed => "UNDEPLOYED",
        };
        f.write_str(s)
    }
}

impl From<&str> for DeploymentStatus {
    fn from(s: &str) -> Self {
        match s {
            "DEPLOYED" => DeploymentStatus::Deployed,
            "PAUSED" => DeploymentStatus::Paused,
            "UNDEPLOYED" => DeploymentStatus::Undeployed,
            _ => DeploymentStatus::Draft,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_wire_format_roundtrip() {
        let json = serde_json::json!({
            "id": "01936b2d-7c4e-7000-8000-000000000001",
            "name": "joke pipeline",
            "version": 1,
            "nodes": [
                {
                    "id": "n1",
                    "type": "TRIGGER",
                    "subtype": "WEBHOOK",
                    "configurations": {"path": "/joke", "allowed_methods": ["POST"]}
                },
                {
                    "id": "n2",
                    "type": "ACTION",
                    "subtype": "HTTP_REQUEST",
                    "configurations": {"url": "https://example.test/ping"}
                }
            ],
            "connections": [
                {"id": "c1", "from_node": "n1", "to_node": "n2"}
            ],
            "triggers": ["n1"]
        });

        let spec: WorkflowSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.nodes.len(), 2);
        assert_eq!(spec.nodes[0].node_type, NodeType::Trigger);
        assert_eq!(spec.connections[0].from_port, "main");
        assert_eq!(spec.connections[0].to_port, "main");
        assert!(spec.connections[0].conversion_function.is_none());
        assert_eq!(spec.node("n2").unwrap().config_str("url").unwrap(), "https://example.test/ping");
    }

    #[test]
    fn test_inbound_outbound() {
        let spec: WorkflowSpec = serde_json::from_value(serde_json::json!({
            "id": "01936b2d-7c4e-7000-8000-000000000002",
            "name": "t",
            "nodes": [
                {"id": "a", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "b", "type": "ACTION", "subtype": "HTTP_REQUEST"},
                {"id": "c", "type": "ACTION", "subtype": "HTTP_REQUEST"}
            ],
            "connections": [
                {"id": "c1", "from_node": "a", "to_node": "b"},
                {"id": "c2", "from_node": "a", "to_node": "c"},
                {"id": "c3", "from_node": "b", "to_node": "c"}
            ],
            "triggers": ["a"]
        }))
        .unwrap();

        assert_eq!(spec.outbound("a").count(), 2);
        assert_eq!(spec.inbound("c").count(), 2);
        assert_eq!(spec.inbound("a").count(), 0);
    }

    #[test]
    fn test_node_type_display_matches_wire() {
        assert_eq!(NodeType::ExternalAction.to_string(), "EXTERNAL_ACTION");
        let parsed: NodeType = serde_json::from_str("\"HUMAN_LOOP\"").unwrap();
        assert_eq!(parsed, NodeType::HumanLoop);
    }
}
