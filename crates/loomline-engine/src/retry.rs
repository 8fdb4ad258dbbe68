// Node error policy and retry backoff.
// `configurations.on_error` selects stop/continue/retry; retry uses
// exponential backoff with ±20% jitter, capped by max_tries.

use rand::Rng;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_MAX_TRIES: u32 = 3;
pub const DEFAULT_BASE_MS: u64 = 1000;
pub const BACKOFF_FACTOR: u32 = 2;
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            base_ms: DEFAULT_BASE_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based: the delay after the
    /// attempt-th failure), jittered ±20%.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.base_ms.saturating_mul(BACKOFF_FACTOR.pow(exp) as u64);
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let with_jitter = (base as f64 * (1.0 + jitter)).max(0.0);
        Duration::from_millis(with_jitter as u64)
    }
}

/// What the engine does with a node ERROR
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OnErrorPolicy {
    /// Mark the execution ERROR and abort
    Stop,
    /// Treat as an empty emit on the default port and keep going
    Continue,
    /// Re-dispatch with backoff; apply Stop on exhaustion
    Retry(RetryPolicy),
}

impl OnErrorPolicy {
    /// Read a node's policy from its configurations; defaults to Stop.
    pub fn from_config(config: &Value) -> Self {
        match config.get("on_error").and_then(|v| v.as_str()) {
            Some("continue") => OnErrorPolicy::Continue,
            Some("retry") => {
                let retry = config.get("retry");
                let max_tries = retry
                    .and_then(|r| r.get("max_tries"))
                    .and_then(|v| v.as_u64())
                    .map(|v| v.max(1) as u32)
                    .unwrap_or(DEFAULT_MAX_TRIES);
                let base_ms = retry
                    .and_then(|r| r.get("base_ms"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(DEFAULT_BASE_MS);
                OnErrorPolicy::Retry(RetryPolicy { max_tries, base_ms })
            }
            _ => OnErrorPolicy::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_policy_is_stop() {
        assert_eq!(OnErrorPolicy::from_config(&json!({})), OnErrorPolicy::Stop);
        assert_eq!(
            OnErrorPolicy::from_config(&json!({"on_error": "bogus"})),
            OnErrorPolicy::Stop
        );
    }

    #[test]
    fn test_retry_policy_parsing() {
        let policy = OnErrorPolicy::from_config(&json!({
            "on_error": "retry",
            "retry": {"max_tries": 5, "base_ms": 10}
        }));
        assert_eq!(
            policy,
            OnErrorPolicy::Retry(RetryPolicy {
                max_tries: 5,
                base_ms: 10
            })
        );

        let defaulted = OnErrorPolicy::from_config(&json!({"on_error": "retry"}));
        assert_eq!(defaulted, OnErrorPolicy::Retry(RetryPolicy::default()));
    }

    #[test]
    fn test_backoff_grows_exponentially_within_jitter() {
        let policy = RetryPolicy {
            max_tries: 3,
            base_ms: 100,
        };
        let d1 = policy.backoff_delay(1).as_millis() as f64;
        let d2 = policy.backoff_delay(2).as_millis() as f64;
        let d3 = policy.backoff_delay(3).as_millis() as f64;

        assert!((80.0..=120.0).contains(&d1), "d1 = {d1}");
        assert!((160.0..=240.0).contains(&d2), "d2 = {d2}");
        assert!((320.0..=480.0).contains(&d3), "d3 = {d3}");
    }
}
