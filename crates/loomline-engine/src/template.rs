// Template resolution for node parameters.
// Supported delimiters: {{path}}, ${path}, <%path%>. Paths are dotted with
// [i] for array indices; `$node["<id>"].json.<path>` reads an upstream
// node's output. A template that is the entire string resolves to the
// native value; mixed templates fold to a string. Unresolved paths become
// null (whole-string) or the empty string (mixed) with a warning, never a
// hard failure.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

/// Env var prefixes exposed to templates
const ENV_ALLOWLIST: &[&str] = &["WORKFLOW_", "APP_", "NODE_"];

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}|\$\{([^}]+)\}|<%([^%]+)%>").unwrap())
}

/// One parsed segment of a template string
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Path(PathExpr),
}

/// Where a path starts reading from
#[derive(Debug, Clone, PartialEq)]
pub enum PathRoot {
    /// First step names a context source (payload, trigger, workflow, ...)
    Context,
    /// `$node["<id>"].json`, an upstream node's output
    Node(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    pub root: PathRoot,
    pub steps: Vec<Step>,
}

/// A template string parsed once into segments
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(input: &str) -> Self {
        let re = template_regex();
        let mut segments = Vec::new();
        let mut last_end = 0;

        for caps in re.captures_iter(input) {
            let whole = caps.get(0).unwrap();
            if whole.start() > last_end {
                segments.push(Segment::Literal(input[last_end..whole.start()].to_string()));
            }

            let inner = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().trim())
                .unwrap_or_default();

            match parse_path(inner) {
                Some(path) => segments.push(Segment::Path(path)),
                // Malformed path: keep the raw text so nothing is silently eaten
                None => segments.push(Segment::Literal(whole.as_str().to_string())),
            }
            last_end = whole.end();
        }

        if last_end < input.len() {
            segments.push(Segment::Literal(input[last_end..].to_string()));
        }

        Self { segments }
    }

    pub fn is_templated(input: &str) -> bool {
        template_regex().is_match(input)
    }

    /// True when the whole string is one path expression
    pub fn is_single_path(&self) -> bool {
        self.segments.len() == 1 && matches!(self.segments[0], Segment::Path(_))
    }

    /// Evaluate against a context. Single-path templates keep the source
    /// value's type; mixed templates fold to a string.
    pub fn evaluate(&self, ctx: &TemplateContext) -> Value {
        if self.is_single_path() {
            let Segment::Path(path) = &self.segments[0] else {
                unreachable!()
            };
            return match ctx.lookup(path) {
                Some(v) => v,
                None => {
                    warn!(path = %path_display(path), "Unresolved template path");
                    Value::Null
                }
            };
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Path(path) => match ctx.lookup(path) {
                    Some(v) => out.push_str(&stringify(&v)),
                    None => {
                        warn!(path = %path_display(path), "Unresolved template path");
                    }
                },
            }
        }
        Value::String(out)
    }
}

/// Parse a dotted path with [i] indices; handles the `$node["id"].json` head.
pub fn parse_path(input: &str) -> Option<PathExpr> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Some(rest) = input.strip_prefix("$node[") {
        // $node["<id>"].json(.path)?
        let close = rest.find(']')?;
        let id = rest[..close].trim().trim_matches(|c| c == '"' || c == '\'');
        if id.is_empty() {
            return None;
        }
        let tail = &rest[close + 1..];
        let tail = tail.strip_prefix(".json").unwrap_or(tail);
        let tail = tail.strip_prefix('.').unwrap_or(tail);
        let steps = if tail.is_empty() {
            Vec::new()
        } else {
            parse_steps(tail)?
        };
        return Some(PathExpr {
            root: PathRoot::Node(id.to_string()),
            steps,
        });
    }

    Some(PathExpr {
        root: PathRoot::Context,
        steps: parse_steps(input)?,
    })
}

fn parse_steps(input: &str) -> Option<Vec<Step>> {
    let mut steps = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    steps.push(Step::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    steps.push(Step::Key(std::mem::take(&mut current)));
                }
                let mut idx = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    idx.push(c);
                }
                steps.push(Step::Index(idx.trim().parse().ok()?));
            }
            c if c.is_whitespace() => return None,
            c => current.push(c),
        }
    }

    if !current.is_empty() {
        steps.push(Step::Key(current));
    }

    if steps.is_empty() {
        None
    } else {
        Some(steps)
    }
}

fn path_display(path: &PathExpr) -> String {
    let mut s = match &path.root {
        PathRoot::Context => String::new(),
        PathRoot::Node(id) => format!("$node[\"{id}\"].json"),
    };
    for step in &path.steps {
        match step {
            Step::Key(k) => {
                if !s.is_empty() {
                    s.push('.');
                }
                s.push_str(k);
            }
            Step::Index(i) => s.push_str(&format!("[{i}]")),
        }
    }
    s
}

/// Mixed-template stringification: strings stay raw, scalars use their
/// JSON form, containers serialize compactly.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolution sources available to a node's templates
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub payload: Value,
    pub trigger: Value,
    pub workflow: Value,
    pub execution: Value,
    pub env: HashMap<String, String>,
    pub node_outputs: HashMap<String, Value>,
}

impl TemplateContext {
    /// Snapshot allowlisted env vars
    pub fn capture_env() -> HashMap<String, String> {
        std::env::vars()
            .filter(|(k, _)| ENV_ALLOWLIST.iter().any(|p| k.starts_with(p)))
            .collect()
    }

    pub fn lookup(&self, path: &PathExpr) -> Option<Value> {
        match &path.root {
            PathRoot::Node(id) => {
                let base = self.node_outputs.get(id)?;
                walk(base, &path.steps).cloned()
            }
            PathRoot::Context => {
                let (head, rest) = path.steps.split_first()?;
                let Step::Key(source) = head else {
                    return None;
                };
                match source.as_str() {
                    "payload" => walk(&self.payload, rest).cloned(),
                    // `data` is a legacy alias for the trigger payload
                    "trigger" | "data" => walk(&self.trigger, rest).cloned(),
                    "workflow" => walk(&self.workflow, rest).cloned(),
                    "static" => {
                        let static_data = self.workflow.get("static_data")?;
                        walk(static_data, rest).cloned()
                    }
                    "execution" => walk(&self.execution, rest).cloned(),
                    "env" => match rest {
                        [Step::Key(name)] => {
                            self.env.get(name).map(|v| Value::String(v.clone()))
                        }
                        _ => None,
                    },
                    _ => None,
                }
            }
        }
    }
}

fn walk<'a>(base: &'a Value, steps: &[Step]) -> Option<&'a Value> {
    let mut current = base;
    for step in steps {
        current = match step {
            Step::Key(k) => current.get(k)?,
            Step::Index(i) => current.get(i)?,
        };
    }
    Some(current)
}

/// Recursively resolve every template inside a JSON value.
pub fn resolve_value(value: &Value, ctx: &TemplateContext) -> Value {
    match value {
        Value::String(s) => {
            if Template::is_templated(s) {
                Template::parse(s).evaluate(ctx)
            } else {
                value.clone()
            }
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TemplateContext {
        let mut node_outputs = HashMap::new();
        node_outputs.insert("ai".to_string(), json!({"content": "why did the crab blush"}));
        TemplateContext {
            payload: json!({"number": 42, "items": [{"id": "a"}, {"id": "b"}], "name": "pr-7"}),
            trigger: json!({"type": "WEBHOOK", "payload": {"number": 42}}),
            workflow: json!({"static_data": {"channel": "#jokes"}}),
            execution: json!({"id": "e-1"}),
            env: HashMap::from([("WORKFLOW_REGION".to_string(), "eu".to_string())]),
            node_outputs,
        }
    }

    #[test]
    fn test_whole_string_keeps_native_type() {
        let v = resolve_value(&json!("{{payload.number}}"), &ctx());
        assert_eq!(v, json!(42));
    }

    #[test]
    fn test_mixed_template_folds_to_string() {
        let v = resolve_value(&json!("issue {{payload.number}} ready"), &ctx());
        assert_eq!(v, json!("issue 42 ready"));
    }

    #[test]
    fn test_all_three_delimiters() {
        let c = ctx();
        assert_eq!(resolve_value(&json!("{{payload.name}}"), &c), json!("pr-7"));
        assert_eq!(resolve_value(&json!("${payload.name}"), &c), json!("pr-7"));
        assert_eq!(resolve_value(&json!("<%payload.name%>"), &c), json!("pr-7"));
    }

    #[test]
    fn test_array_index_path() {
        let v = resolve_value(&json!("{{payload.items[1].id}}"), &ctx());
        assert_eq!(v, json!("b"));
    }

    #[test]
    fn test_node_output_reference() {
        let v = resolve_value(&json!("🎭 {{$node[\"ai\"].json.content}}"), &ctx());
        assert_eq!(v, json!("🎭 why did the crab blush"));
    }

    #[test]
    fn test_bare_node_reference_yields_whole_output() {
        let v = resolve_value(&json!("{{$node[\"ai\"].json}}"), &ctx());
        assert_eq!(v, json!({"content": "why did the crab blush"}));
    }

    #[test]
    fn test_unresolved_whole_string_is_null() {
        let v = resolve_value(&json!("{{payload.missing.deep}}"), &ctx());
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn test_unresolved_mixed_renders_empty() {
        let v = resolve_value(&json!("x={{payload.missing}}!"), &ctx());
        assert_eq!(v, json!("x=!"));
    }

    #[test]
    fn test_env_allowlist() {
        let v = resolve_value(&json!("{{env.WORKFLOW_REGION}}"), &ctx());
        assert_eq!(v, json!("eu"));
        // Not in the captured map → unresolved
        let v = resolve_value(&json!("{{env.HOME}}"), &ctx());
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn test_static_data_source() {
        let v = resolve_value(&json!("{{static.channel}}"), &ctx());
        assert_eq!(v, json!("#jokes"));
    }

    #[test]
    fn test_nested_object_resolution() {
        let v = resolve_value(
            &json!({"url": "https://x.test/{{payload.name}}", "count": "{{payload.number}}"}),
            &ctx(),
        );
        assert_eq!(v, json!({"url": "https://x.test/pr-7", "count": 42}));
    }

    #[test]
    fn test_resolution_idempotent_for_resolvable_paths() {
        let c = ctx();
        let input = json!({"a": "{{payload.number}}", "b": "n={{payload.name}}"});
        let once = resolve_value(&input, &c);
        let twice = resolve_value(&once, &c);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_non_templates_untouched() {
        let c = ctx();
        let input = json!({"plain": "hello", "n": 3, "b": true});
        assert_eq!(resolve_value(&input, &c), input);
    }

    #[test]
    fn test_malformed_path_kept_as_literal() {
        let v = resolve_value(&json!("{{not a path}}"), &ctx());
        assert_eq!(v, json!("{{not a path}}"));
    }
}
