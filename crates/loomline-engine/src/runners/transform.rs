// DATA_TRANSFORMATION: field_mapping (dotted-path reads into a new object),
// a jq-style selector subset (identity, field access, array index, pipe),
// or a string template over the input.

use async_trait::async_trait;
use loomline_contracts::{Node, NodeExecutionResult};
use serde_json::{Map, Value};

use crate::context::NodeExecutionContext;
use crate::error::NodeError;
use crate::registry::NodeRunner;
use crate::template::{resolve_value, TemplateContext};

pub struct DataTransformationRunner;

#[async_trait]
impl NodeRunner for DataTransformationRunner {
    fn validate(&self, node: &Node) -> Vec<String> {
        let mut problems = Vec::new();
        match node.config_str("transformation_type") {
            Some("field_mapping") => {
                if !node
                    .configurations
                    .get("field_mapping")
                    .map(Value::is_object)
                    .unwrap_or(false)
                {
                    problems.push("field_mapping must be an object".to_string());
                }
            }
            Some("jq") => match node.config_str("filter") {
                Some(filter) => {
                    if let Err(e) = JqFilter::parse(filter) {
                        problems.push(format!("invalid jq filter: {e}"));
                    }
                }
                None => problems.push("jq transformation requires a filter".to_string()),
            },
            Some("template") => {
                if node.config_str("template").is_none() {
                    problems.push("template transformation requires a template".to_string());
                }
            }
            Some(other) => problems.push(format!("unknown transformation_type '{other}'")),
            None => problems.push("transformation_type is required".to_string()),
        }
        problems
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let input = ctx.main_input();

        let output = match ctx.config_str("transformation_type") {
            Some("field_mapping") => {
                let mapping = ctx
                    .config_value("field_mapping")
                    .and_then(Value::as_object)
                    .ok_or_else(|| NodeError::validation("field_mapping must be an object"))?;
                field_mapping(&input, mapping)
            }
            Some("jq") => {
                let filter = ctx
                    .config_str("filter")
                    .ok_or_else(|| NodeError::validation("jq filter missing"))?;
                let filter = JqFilter::parse(filter)
                    .map_err(|e| NodeError::validation(format!("invalid jq filter: {e}")))?;
                filter.apply(&input)
            }
            Some("template") => {
                let template = ctx
                    .config_str("template")
                    .ok_or_else(|| NodeError::validation("template missing"))?;
                let local = TemplateContext {
                    payload: input.clone(),
                    trigger: serde_json::to_value(&ctx.trigger).unwrap_or(Value::Null),
                    workflow: serde_json::json!({"static_data": ctx.static_data}),
                    ..Default::default()
                };
                resolve_value(&Value::String(template.to_string()), &local)
            }
            other => {
                return Err(NodeError::validation(format!(
                    "unknown transformation_type {other:?}"
                )))
            }
        };

        Ok(NodeExecutionResult::success(output))
    }
}

/// Build an object from dotted-path reads of the input
fn field_mapping(input: &Value, mapping: &Map<String, Value>) -> Value {
    let mut out = Map::new();
    for (target, source) in mapping {
        let value = match source.as_str() {
            Some(path) => read_dotted(input, path),
            // Non-string mapping values are carried through as constants
            None => source.clone(),
        };
        out.insert(target.clone(), value);
    }
    Value::Object(out)
}

fn read_dotted(input: &Value, path: &str) -> Value {
    let mut current = input;
    for part in path.split('.') {
        let (key, indices) = split_indices(part);
        if !key.is_empty() {
            match current.get(key) {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
        for idx in indices {
            match current.get(idx) {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
    }
    current.clone()
}

fn split_indices(part: &str) -> (&str, Vec<usize>) {
    match part.find('[') {
        None => (part, Vec::new()),
        Some(open) => {
            let key = &part[..open];
            let indices = part[open..]
                .split('[')
                .filter(|s| !s.is_empty())
                .filter_map(|s| s.trim_end_matches(']').parse().ok())
                .collect();
            (key, indices)
        }
    }
}

/// Minimal jq subset: `.`, `.field`, `.a.b`, `.a[0]`, and pipes.
#[derive(Debug, Clone, PartialEq)]
pub struct JqFilter {
    stages: Vec<Vec<JqStep>>,
}

#[derive(Debug, Clone, PartialEq)]
enum JqStep {
    Key(String),
    Index(usize),
}

impl JqFilter {
    pub fn parse(src: &str) -> Result<Self, String> {
        let mut stages = Vec::new();
        for stage in src.split('|') {
            let stage = stage.trim();
            if stage == "." {
                stages.push(Vec::new());
                continue;
            }
            let rest = stage
                .strip_prefix('.')
                .ok_or_else(|| format!("stage '{stage}' must start with '.'"))?;
            let mut steps = Vec::new();
            for part in rest.split('.') {
                if part.is_empty() {
                    return Err(format!("empty path segment in '{stage}'"));
                }
                let (key, indices) = split_key_indices(part)?;
                if !key.is_empty() {
                    steps.push(JqStep::Key(key.to_string()));
                }
                for idx in indices {
                    steps.push(JqStep::Index(idx));
                }
            }
            stages.push(steps);
        }
        Ok(Self { stages })
    }

    pub fn apply(&self, input: &Value) -> Value {
        let mut current = input.clone();
        for stage in &self.stages {
            for step in stage {
                current = match step {
                    JqStep::Key(k) => current.get(k).cloned().unwrap_or(Value::Null),
                    JqStep::Index(i) => current.get(i).cloned().unwrap_or(Value::Null),
                };
            }
        }
        current
    }
}

fn split_key_indices(part: &str) -> Result<(&str, Vec<usize>), String> {
    match part.find('[') {
        None => Ok((part, Vec::new())),
        Some(open) => {
            let key = &part[..open];
            let mut indices = Vec::new();
            for chunk in part[open..].split('[').filter(|s| !s.is_empty()) {
                let idx = chunk
                    .strip_suffix(']')
                    .ok_or_else(|| format!("unterminated index in '{part}'"))?;
                indices.push(
                    idx.parse()
                        .map_err(|_| format!("bad array index '{idx}'"))?,
                );
            }
            Ok((key, indices))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_mapping_dotted_paths() {
        let input = json!({"user": {"name": "ada", "tags": ["x", "y"]}, "n": 7});
        let mapping = json!({
            "who": "user.name",
            "first_tag": "user.tags[0]",
            "count": "n",
            "constant": 42
        });
        let out = field_mapping(&input, mapping.as_object().unwrap());
        assert_eq!(
            out,
            json!({"who": "ada", "first_tag": "x", "count": 7, "constant": 42})
        );
    }

    #[test]
    fn test_field_mapping_missing_is_null() {
        let out = field_mapping(&json!({}), json!({"a": "no.such.path"}).as_object().unwrap());
        assert_eq!(out, json!({"a": null}));
    }

    #[test]
    fn test_jq_identity() {
        let f = JqFilter::parse(".").unwrap();
        assert_eq!(f.apply(&json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_jq_field_and_index() {
        let f = JqFilter::parse(".items[1].name").unwrap();
        assert_eq!(
            f.apply(&json!({"items": [{"name": "a"}, {"name": "b"}]})),
            json!("b")
        );
    }

    #[test]
    fn test_jq_pipe() {
        let f = JqFilter::parse(".data | .values[0]").unwrap();
        assert_eq!(f.apply(&json!({"data": {"values": [9, 8]}})), json!(9));
    }

    #[test]
    fn test_jq_rejects_garbage() {
        assert!(JqFilter::parse("map(.x)").is_err());
        assert!(JqFilter::parse(".a[b]").is_err());
        assert!(JqFilter::parse("..a").is_err());
    }
}
