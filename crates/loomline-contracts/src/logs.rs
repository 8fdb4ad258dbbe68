// Execution log DTOs and the opaque pagination cursor.
// Cursor is base64 of {"ts": rfc3339, "id": uuid}; keyset pagination over
// (created_at, id) stays stable under concurrent appends.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Hard cap on log page size
pub const MAX_LOG_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Structured lifecycle event classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogEventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionPaused,
    ExecutionResumed,
    ExecutionCanceled,
    ExecutionTimedOut,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    RetryScheduled,
    CredentialRefreshed,
    AiPlanningRound,
    RunnerLog,
}

impl std::fmt::Display for LogEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

/// One append-only log row
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub level: LogLevel,
    pub event_type: LogEventType,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub is_milestone: bool,
    /// 1–10; milestones default to 8, runner detail to 5
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
}

/// Query parameters for the log surface
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct LogQuery {
    #[serde(default)]
    pub min_priority: Option<i32>,
    #[serde(default)]
    pub milestones_only: Option<bool>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogPage {
    pub entries: Vec<ExecutionLogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_next: bool,
}

/// Keyset position inside the log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCursor {
    pub ts: DateTime<Utc>,
    pub id: Uuid,
}

impl LogCursor {
    pub fn encode(&self) -> String {
        let json = serde_json::json!({ "ts": self.ts.to_rfc3339(), "id": self.id });
        BASE64.encode(json.to_string())
    }

    pub fn decode(s: &str) -> Option<Self> {
        let bytes = BASE64.decode(s).ok()?;
        let v: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        let ts = v.get("ts")?.as_str()?;
        let id = v.get("id")?.as_str()?;
        Some(Self {
            ts: DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc),
            id: id.parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = LogCursor {
            ts: Utc::now(),
            id: Uuid::now_v7(),
        };
        let decoded = LogCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded.id, cursor.id);
        assert_eq!(decoded.ts.timestamp_micros(), cursor.ts.timestamp_micros());
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(LogCursor::decode("not base64 ***").is_none());
        let bogus = BASE64.encode("{\"nope\": 1}");
        assert!(LogCursor::decode(&bogus).is_none());
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(LogEventType::NodeCompleted.to_string(), "node_completed");
        assert_eq!(LogEventType::AiPlanningRound.to_string(), "ai_planning_round");
    }
}
