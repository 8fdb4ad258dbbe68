// Trigger index keys and deploy-time structural validation.
// One deterministic key per trigger subtype; events hash against the same
// builders on the routing path so deploy and routing can never disagree.

use cron::Schedule;
use loomline_contracts::{Node, NodeType, WorkflowSpec};
use loomline_engine::convert::ConvExpr;
use loomline_storage::CreateTriggerIndexEntry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use uuid::Uuid;

/// Inbound port that marks a loop boundary; back edges into it are exempt
/// from the acyclicity check.
const LOOP_FEEDBACK_PORT: &str = "feedback";

pub fn webhook_key(path: &str, method: &str) -> String {
    let path = normalize_path(path);
    format!("webhook:{path}:{}", method.to_ascii_uppercase())
}

pub fn cron_key(expression: &str, timezone: &str) -> String {
    format!("cron:{expression}:{timezone}")
}

pub fn github_key(installation_id: &str, repo_full_name: &str) -> String {
    format!("github:{installation_id}:{repo_full_name}")
}

pub fn slack_key(team_id: Option<&str>) -> String {
    match team_id {
        Some(team) if !team.is_empty() => format!("slack:{team}"),
        _ => "slack:*".to_string(),
    }
}

pub fn email_key(mailbox: &str) -> String {
    format!("email:{}", mailbox.to_ascii_lowercase())
}

pub fn manual_key(workflow_id: Uuid, node_id: &str) -> String {
    format!("manual:{workflow_id}:{node_id}")
}

pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Index rows for one TRIGGER node. WEBHOOK produces one row per allowed
/// method.
pub fn build_entries(
    workflow_id: Uuid,
    node: &Node,
) -> Result<Vec<CreateTriggerIndexEntry>, String> {
    let subtype = node.subtype.to_ascii_uppercase();
    let config = node.configurations.clone();
    let entry = |index_key: String| CreateTriggerIndexEntry {
        trigger_node_id: node.id.clone(),
        trigger_type: NodeType::Trigger.to_string(),
        trigger_subtype: subtype.clone(),
        index_key,
        config: config.clone(),
    };

    match subtype.as_str() {
        "WEBHOOK" => {
            let path = node
                .config_str("path")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| "webhook trigger requires a path".to_string())?;
            let methods: Vec<String> = node
                .configurations
                .get("allowed_methods")
                .and_then(|v| v.as_array())
                .map(|methods| {
                    methods
                        .iter()
                        .filter_map(|m| m.as_str())
                        .map(|m| m.to_ascii_uppercase())
                        .collect()
                })
                .unwrap_or_else(|| vec!["POST".to_string()]);
            if methods.is_empty() {
                return Err("allowed_methods must not be empty".to_string());
            }
            Ok(methods
                .iter()
                .map(|method| entry(webhook_key(path, method)))
                .collect())
        }
        "CRON" => {
            let expression = node
                .config_str("cron_expression")
                .ok_or_else(|| "cron trigger requires cron_expression".to_string())?;
            parse_cron(expression)?;
            let timezone = node.config_str("timezone").unwrap_or("UTC");
            Ok(vec![entry(cron_key(expression, timezone))])
        }
        "GITHUB" => {
            let installation_id = node
                .config_str("installation_id")
                .map(str::to_string)
                .or_else(|| node.config_u64("installation_id").map(|v| v.to_string()))
                .ok_or_else(|| "github trigger requires installation_id".to_string())?;
            let repo = node
                .config_str("repository")
                .ok_or_else(|| "github trigger requires repository".to_string())?;
            Ok(vec![entry(github_key(&installation_id, repo))])
        }
        "SLACK" => Ok(vec![entry(slack_key(node.config_str("team_id")))]),
        "EMAIL" => {
            let mailbox = node
                .config_str("mailbox")
                .ok_or_else(|| "email trigger requires a mailbox".to_string())?;
            Ok(vec![entry(email_key(mailbox))])
        }
        "MANUAL" => Ok(vec![entry(manual_key(workflow_id, &node.id))]),
        other => Err(format!("unknown trigger subtype '{other}'")),
    }
}

/// The five-or-six-field cron grammar the `cron` crate accepts; classic
/// five-field expressions get a seconds column prepended.
pub fn parse_cron(expression: &str) -> Result<Schedule, String> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| format!("invalid cron expression: {e}"))
}

/// Structural invariants from the data model: endpoints exist, declared
/// triggers are TRIGGER nodes, node ids are unique, conversion functions
/// parse, and the non-trigger graph is acyclic outside loop boundaries.
pub fn validate_structure(spec: &WorkflowSpec) -> Vec<String> {
    let mut problems = Vec::new();

    let mut ids = HashSet::new();
    for node in &spec.nodes {
        if !ids.insert(node.id.as_str()) {
            problems.push(format!("duplicate node id '{}'", node.id));
        }
    }

    for connection in &spec.connections {
        if spec.node(&connection.from_node).is_none() {
            problems.push(format!(
                "connection '{}' references unknown node '{}'",
                connection.id, connection.from_node
            ));
        }
        if spec.node(&connection.to_node).is_none() {
            problems.push(format!(
                "connection '{}' references unknown node '{}'",
                connection.id, connection.to_node
            ));
        }
        if let Some(src) = connection.conversion_function.as_deref() {
            if let Err(e) = ConvExpr::parse(src) {
                problems.push(format!(
                    "connection '{}' has an invalid conversion function: {e}",
                    connection.id
                ));
            }
        }
    }

    if spec.triggers.is_empty() {
        problems.push("workflow declares no triggers".to_string());
    }
    for trigger_id in &spec.triggers {
        match spec.node(trigger_id) {
            Some(node) if node.node_type == NodeType::Trigger => {}
            Some(_) => problems.push(format!("trigger '{trigger_id}' is not a TRIGGER node")),
            None => problems.push(format!("trigger '{trigger_id}' does not exist")),
        }
    }

    if let Some(cycle) = find_cycle(spec) {
        problems.push(format!(
            "graph contains a cycle outside a loop boundary: {}",
            cycle.join(" -> ")
        ));
    }

    problems
}

/// Kahn's algorithm over non-trigger edges, with loop-boundary back edges
/// (into a feedback port) excluded. Any leftover nodes form a cycle.
fn find_cycle(spec: &WorkflowSpec) -> Option<Vec<String>> {
    let mut indegree: HashMap<&str, usize> = spec.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();

    for connection in &spec.connections {
        if connection.to_port == LOOP_FEEDBACK_PORT {
            continue;
        }
        if !indegree.contains_key(connection.from_node.as_str())
            || !indegree.contains_key(connection.to_node.as_str())
        {
            continue;
        }
        edges
            .entry(connection.from_node.as_str())
            .or_default()
            .push(connection.to_node.as_str());
        *indegree.get_mut(connection.to_node.as_str()).unwrap() += 1;
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for next in edges.get(id).into_iter().flatten() {
            let d = indegree.get_mut(next).unwrap();
            *d -= 1;
            if *d == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited == spec.nodes.len() {
        None
    } else {
        let mut cycle: Vec<String> = indegree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        cycle.sort();
        Some(cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_from(json: serde_json::Value) -> WorkflowSpec {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_key_builders() {
        assert_eq!(webhook_key("joke", "post"), "webhook:/joke:POST");
        assert_eq!(webhook_key("/joke/", "GET"), "webhook:/joke:GET");
        assert_eq!(cron_key("*/5 * * * *", "UTC"), "cron:*/5 * * * *:UTC");
        assert_eq!(github_key("123", "org/repo"), "github:123:org/repo");
        assert_eq!(slack_key(Some("T01")), "slack:T01");
        assert_eq!(slack_key(None), "slack:*");
        assert_eq!(email_key("Ops@Example.Com"), "email:ops@example.com");
    }

    #[test]
    fn test_parse_cron_five_and_six_fields() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 0 9 * * Mon").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_build_webhook_entries_per_method() {
        let node: Node = serde_json::from_value(json!({
            "id": "t", "type": "TRIGGER", "subtype": "WEBHOOK",
            "configurations": {"path": "/joke", "allowed_methods": ["POST", "get"]}
        }))
        .unwrap();
        let entries = build_entries(Uuid::now_v7(), &node).unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.index_key.as_str()).collect();
        assert_eq!(keys, vec!["webhook:/joke:POST", "webhook:/joke:GET"]);
    }

    #[test]
    fn test_build_entries_rejects_bad_cron() {
        let node: Node = serde_json::from_value(json!({
            "id": "t", "type": "TRIGGER", "subtype": "CRON",
            "configurations": {"cron_expression": "whenever"}
        }))
        .unwrap();
        assert!(build_entries(Uuid::now_v7(), &node).is_err());
    }

    #[test]
    fn test_validate_structure_catches_problems() {
        let spec = spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "broken",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "a", "type": "ACTION", "subtype": "HTTP_REQUEST",
                 "configurations": {"url": "https://x.test"}}
            ],
            "connections": [
                {"id": "c1", "from_node": "t", "to_node": "ghost"},
                {"id": "c2", "from_node": "t", "to_node": "a",
                 "conversion_function": "exec(...)"}
            ],
            "triggers": ["t", "a", "ghost"]
        }));
        let problems = validate_structure(&spec);
        assert!(problems.iter().any(|p| p.contains("unknown node 'ghost'")));
        assert!(problems.iter().any(|p| p.contains("invalid conversion function")));
        assert!(problems.iter().any(|p| p.contains("'a' is not a TRIGGER node")));
        assert!(problems.iter().any(|p| p.contains("'ghost' does not exist")));
    }

    #[test]
    fn test_cycle_detection_allows_loop_feedback() {
        let looped = spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "loop-ok",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "lp", "type": "FLOW", "subtype": "LOOP"},
                {"id": "body", "type": "ACTION", "subtype": "HTTP_REQUEST",
                 "configurations": {"url": "https://x.test"}}
            ],
            "connections": [
                {"id": "c1", "from_node": "t", "to_node": "lp"},
                {"id": "c2", "from_node": "lp", "from_port": "loop", "to_node": "body"},
                {"id": "c3", "from_node": "body", "to_node": "lp", "to_port": "feedback"}
            ],
            "triggers": ["t"]
        }));
        assert!(validate_structure(&looped).is_empty());

        let cyclic = spec_from(json!({
            "id": Uuid::now_v7(),
            "name": "cycle",
            "nodes": [
                {"id": "t", "type": "TRIGGER", "subtype": "MANUAL"},
                {"id": "a", "type": "ACTION", "subtype": "HTTP_REQUEST",
                 "configurations": {"url": "https://x.test"}},
                {"id": "b", "type": "ACTION", "subtype": "HTTP_REQUEST",
                 "configurations": {"url": "https://x.test"}}
            ],
            "connections": [
                {"id": "c1", "from_node": "t", "to_node": "a"},
                {"id": "c2", "from_node": "a", "to_node": "b"},
                {"id": "c3", "from_node": "b", "to_node": "a"}
            ],
            "triggers": ["t"]
        }));
        let problems = validate_structure(&cyclic);
        assert!(problems.iter().any(|p| p.contains("cycle")));
    }
}
