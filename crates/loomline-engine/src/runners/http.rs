// HTTP_REQUEST action: method, url, headers, body, timeout, retry policy.
// Emits {status_code, headers, body, json} on `main`; when the node enables
// the dual-port policy, responses with status >= 400 go to `error` instead
// of failing the node.

use async_trait::async_trait;
use loomline_contracts::{Node, NodeExecutionResult};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;

use crate::context::NodeExecutionContext;
use crate::error::NodeError;
use crate::registry::NodeRunner;
use crate::retry::RetryPolicy;

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

pub struct HttpRequestRunner {
    client: reqwest::Client,
}

impl HttpRequestRunner {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeRunner for HttpRequestRunner {
    fn validate(&self, node: &Node) -> Vec<String> {
        let mut problems = Vec::new();
        match node.config_str("url") {
            // Templated URLs resolve at dispatch; only reject literal junk
            Some(url) if url.trim().is_empty() => problems.push("url must not be empty".to_string()),
            Some(_) => {}
            None => problems.push("url is required".to_string()),
        }
        if let Some(method) = node.config_str("method") {
            if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
                problems.push(format!("invalid method '{method}'"));
            }
        }
        problems
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let url = ctx
            .config_str("url")
            .ok_or_else(|| NodeError::validation("url missing"))?
            .to_string();
        let method = ctx
            .config_str("method")
            .map(|m| m.to_ascii_uppercase())
            .unwrap_or_else(|| "GET".to_string());
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| NodeError::validation(format!("invalid method '{method}'")))?;

        let timeout = Duration::from_secs(
            ctx.config_u64("timeout_seconds")
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        );

        let retry = match ctx.config_value("retry") {
            Some(cfg) => RetryPolicy {
                max_tries: cfg
                    .get("max_tries")
                    .and_then(Value::as_u64)
                    .map(|v| v.max(1) as u32)
                    .unwrap_or(1),
                base_ms: cfg.get("base_ms").and_then(Value::as_u64).unwrap_or(1000),
            },
            None => RetryPolicy {
                max_tries: 1,
                base_ms: 1000,
            },
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if ctx.is_cancelled() {
                return Err(NodeError::new(
                    loomline_contracts::ErrorKind::StateError,
                    "Execution cancelled",
                ));
            }

            match self.send_once(ctx, method.clone(), &url, timeout).await {
                Ok(outcome) => match outcome {
                    Outcome::Done(result) => return Ok(result),
                    Outcome::RetryAfter(delay, last_status) => {
                        if attempt >= retry.max_tries {
                            return Err(NodeError::rate_limit(format!(
                                "Gave up after {attempt} attempts, last status {last_status}"
                            )));
                        }
                        let backoff = delay.unwrap_or_else(|| retry.backoff_delay(attempt));
                        ctx.logger
                            .node_log(
                                &ctx.node.id,
                                loomline_contracts::LogLevel::Warn,
                                format!("HTTP {last_status}, retrying in {}ms", backoff.as_millis()),
                                serde_json::json!({"attempt": attempt}),
                            )
                            .await;
                        tokio::time::sleep(backoff).await;
                    }
                },
                Err(e) if e.kind.is_retryable() && attempt < retry.max_tries => {
                    let backoff = retry.backoff_delay(attempt);
                    ctx.logger
                        .node_log(
                            &ctx.node.id,
                            loomline_contracts::LogLevel::Warn,
                            format!("{e}, retrying in {}ms", backoff.as_millis()),
                            serde_json::json!({"attempt": attempt}),
                        )
                        .await;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

enum Outcome {
    Done(NodeExecutionResult),
    RetryAfter(Option<Duration>, u16),
}

impl HttpRequestRunner {
    async fn send_once(
        &self,
        ctx: &NodeExecutionContext,
        method: Method,
        url: &str,
        timeout: Duration,
    ) -> Result<Outcome, NodeError> {
        let mut request = self.client.request(method, url).timeout(timeout);

        if let Some(headers) = ctx.config_value("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(name, v);
                }
            }
        }

        if let Some(body) = ctx.config_value("body") {
            request = match body {
                Value::String(s) => request.body(s.clone()),
                other => request.json(other),
            };
        }

        let response = request.send().await.map_err(NodeError::from_reqwest)?;

        let status = response.status();
        let status_code = status.as_u16();

        // 429/503 are retried, honoring Retry-After when present
        if status_code == 429 || status_code == 503 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Ok(Outcome::RetryAfter(retry_after, status_code));
        }

        let headers: serde_json::Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), Value::String(v.to_string())))
            })
            .collect();

        let body_bytes = response.bytes().await.map_err(NodeError::from_reqwest)?;
        if body_bytes.len() > MAX_RESPONSE_BYTES {
            return Err(NodeError::response(format!(
                "Response body exceeds {MAX_RESPONSE_BYTES} bytes"
            )));
        }
        let body_text = String::from_utf8_lossy(&body_bytes).to_string();
        let json: Value = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);

        let payload = serde_json::json!({
            "status_code": status_code,
            "headers": headers,
            "body": body_text,
            "json": json,
        });

        if status_code >= 400 {
            if ctx.config_bool("use_error_port").unwrap_or(false) {
                return Ok(Outcome::Done(NodeExecutionResult::success_on(
                    "error", payload,
                )));
            }
            let kind = if status_code == 401 || status_code == 403 {
                loomline_contracts::ErrorKind::AuthError
            } else {
                loomline_contracts::ErrorKind::ResponseError
            };
            return Err(NodeError::new(
                kind,
                format!("HTTP {status_code} from {url}"),
            )
            .with_details(payload));
        }

        Ok(Outcome::Done(NodeExecutionResult::success(payload)))
    }
}
