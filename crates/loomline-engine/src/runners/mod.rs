// Node runners, one module per kind. `standard_registry` wires every
// (type, subtype) pair the deploy validator will accept.

pub mod action;
pub mod ai;
pub mod external;
pub mod flow;
pub mod http;
pub mod human;
pub mod memory;
pub mod transform;
pub mod trigger;

use loomline_contracts::NodeType;
use std::sync::Arc;

use crate::registry::RunnerRegistry;

pub const TRIGGER_SUBTYPES: &[&str] = &["WEBHOOK", "CRON", "MANUAL", "GITHUB", "SLACK", "EMAIL"];

/// Build the full production registry.
pub fn standard_registry() -> RunnerRegistry {
    let mut registry = RunnerRegistry::new();

    let trigger = Arc::new(trigger::TriggerRunner);
    for subtype in TRIGGER_SUBTYPES {
        registry.register(NodeType::Trigger, *subtype, trigger.clone());
    }

    registry.register(NodeType::Action, "HTTP_REQUEST", Arc::new(http::HttpRequestRunner::new()));
    registry.register(
        NodeType::Action,
        "DATA_TRANSFORMATION",
        Arc::new(transform::DataTransformationRunner),
    );
    registry.register(NodeType::Action, "SLEEP", Arc::new(action::SleepRunner));
    registry.register(NodeType::Action, "PARSE_JSON", Arc::new(action::ParseJsonRunner));
    registry.register(NodeType::Action, "FORMAT", Arc::new(action::FormatRunner));

    let external = Arc::new(external::ExternalActionRunner::new());
    for subtype in external::PROVIDER_SUBTYPES {
        registry.register(NodeType::ExternalAction, *subtype, external.clone());
    }

    let ai = Arc::new(ai::AiAgentRunner::new());
    for subtype in ai::PROVIDER_SUBTYPES {
        registry.register(NodeType::AiAgent, *subtype, ai.clone());
    }

    let flow = Arc::new(flow::FlowRunner);
    for subtype in ["IF", "SWITCH", "MERGE", "LOOP"] {
        registry.register(NodeType::Flow, subtype, flow.clone());
    }

    let human = Arc::new(human::HumanLoopRunner::new());
    for subtype in ["SLACK", "EMAIL", "APP"] {
        registry.register(NodeType::HumanLoop, subtype, human.clone());
    }

    let mem = Arc::new(memory::MemoryRunner);
    registry.register(NodeType::Tool, "KEY_VALUE", mem.clone());
    registry.register(NodeType::Memory, "KEY_VALUE", mem);

    registry
}
