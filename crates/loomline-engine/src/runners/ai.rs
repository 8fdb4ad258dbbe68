// AI_AGENT runner: one awaited chat completion against the configured
// provider. All providers map onto the same error taxonomy, and responses
// are sanity-checked (empty, ultra-short, or error-looking content flips
// the node to RESPONSE_ERROR).

use async_trait::async_trait;
use loomline_contracts::{ErrorKind, Node, NodeExecutionResult};
use serde_json::{json, Value};
use std::time::Duration;

use crate::context::NodeExecutionContext;
use crate::error::NodeError;
use crate::registry::NodeRunner;

pub const PROVIDER_SUBTYPES: &[&str] = &[
    "OPENAI_CHATGPT",
    "ANTHROPIC_CLAUDE",
    "GOOGLE_GEMINI",
    "OPENROUTER",
];

const DEFAULT_TIMEOUT_SECONDS: u64 = 120;
const DEFAULT_ANTHROPIC_MAX_TOKENS: u64 = 1024;
const SUSPICIOUS_CONTENT_LEN: usize = 3;
const ERROR_PATTERNS: &[&str] = &["Error:", "Unauthorized", "Rate limit"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AiProvider {
    OpenAi,
    Anthropic,
    Gemini,
    OpenRouter,
}

impl AiProvider {
    pub fn from_subtype(subtype: &str) -> Option<Self> {
        match subtype.to_ascii_uppercase().as_str() {
            "OPENAI_CHATGPT" => Some(AiProvider::OpenAi),
            "ANTHROPIC_CLAUDE" => Some(AiProvider::Anthropic),
            "GOOGLE_GEMINI" => Some(AiProvider::Gemini),
            "OPENROUTER" => Some(AiProvider::OpenRouter),
            _ => None,
        }
    }

    fn api_key_var(&self) -> &'static str {
        match self {
            AiProvider::OpenAi => "OPENAI_API_KEY",
            AiProvider::Anthropic => "ANTHROPIC_API_KEY",
            AiProvider::Gemini => "GEMINI_API_KEY",
            AiProvider::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            AiProvider::OpenAi => "https://api.openai.com/v1",
            AiProvider::Anthropic => "https://api.anthropic.com",
            AiProvider::Gemini => "https://generativelanguage.googleapis.com",
            AiProvider::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }
}

/// One chat completion request, provider-agnostic
#[derive(Debug, Clone, Default)]
pub struct AiRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    /// Prior conversation, [{role, content}]
    pub messages: Vec<Value>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub timeout: Duration,
    /// Test/proxy override for the provider endpoint
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AiCompletion {
    pub content: String,
    pub model: String,
    pub usage: Value,
    pub finish_reason: String,
}

pub struct AiAgentRunner {
    client: reqwest::Client,
}

impl AiAgentRunner {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Shared by the AI-directed external-action mode.
    pub async fn complete(
        &self,
        provider: AiProvider,
        request: &AiRequest,
    ) -> Result<AiCompletion, NodeError> {
        let api_key = std::env::var(provider.api_key_var())
            .map_err(|_| NodeError::auth(format!("{} not configured", provider.api_key_var())))?;
        let base_url = request
            .base_url
            .clone()
            .unwrap_or_else(|| provider.default_base_url().to_string());
        let base_url = base_url.trim_end_matches('/').to_string();

        let completion = match provider {
            AiProvider::OpenAi | AiProvider::OpenRouter => {
                self.complete_openai_style(&base_url, &api_key, request).await?
            }
            AiProvider::Anthropic => self.complete_anthropic(&base_url, &api_key, request).await?,
            AiProvider::Gemini => self.complete_gemini(&base_url, &api_key, request).await?,
        };

        check_content(&completion.content)?;
        Ok(completion)
    }

    async fn complete_openai_style(
        &self,
        base_url: &str,
        api_key: &str,
        request: &AiRequest,
    ) -> Result<AiCompletion, NodeError> {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(request.messages.iter().cloned());
        messages.push(json!({"role": "user", "content": request.user_prompt}));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            // Newer model families renamed the parameter
            if uses_max_completion_tokens(&request.model) {
                body["max_completion_tokens"] = json!(max);
            } else {
                body["max_tokens"] = json!(max);
            }
        }

        let response = self
            .client
            .post(format!("{base_url}/chat/completions"))
            .bearer_auth(api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(NodeError::from_reqwest)?;

        let body = classify_response(response).await?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(AiCompletion {
            content,
            model: body["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_string(),
            usage: body.get("usage").cloned().unwrap_or(Value::Null),
            finish_reason: body["choices"][0]["finish_reason"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn complete_anthropic(
        &self,
        base_url: &str,
        api_key: &str,
        request: &AiRequest,
    ) -> Result<AiCompletion, NodeError> {
        let mut messages: Vec<Value> = request.messages.clone();
        messages.push(json!({"role": "user", "content": request.user_prompt}));

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_ANTHROPIC_MAX_TOKENS),
            "messages": messages,
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = json!(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }

        let response = self
            .client
            .post(format!("{base_url}/v1/messages"))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(NodeError::from_reqwest)?;

        let body = classify_response(response).await?;

        let content = body["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(AiCompletion {
            content,
            model: body["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_string(),
            usage: body.get("usage").cloned().unwrap_or(Value::Null),
            finish_reason: body["stop_reason"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn complete_gemini(
        &self,
        base_url: &str,
        api_key: &str,
        request: &AiRequest,
    ) -> Result<AiCompletion, NodeError> {
        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": request.user_prompt}]}],
        });
        if let Some(system) = &request.system_prompt {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        let mut generation = serde_json::Map::new();
        if let Some(t) = request.temperature {
            generation.insert("temperature".to_string(), json!(t));
        }
        if let Some(max) = request.max_tokens {
            generation.insert("maxOutputTokens".to_string(), json!(max));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        let url = format!(
            "{base_url}/v1beta/models/{}:generateContent?key={api_key}",
            request.model
        );
        let response = self
            .client
            .post(url)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(NodeError::from_reqwest)?;

        let body = classify_response(response).await?;

        // Safety blocks come back as a success envelope with no candidates
        if body.get("candidates").map(|c| c.as_array().map(Vec::is_empty).unwrap_or(true)).unwrap_or(true) {
            let reason = body["promptFeedback"]["blockReason"]
                .as_str()
                .unwrap_or("no candidates returned");
            return Err(NodeError::model(format!("Gemini returned no content: {reason}")));
        }

        let content = body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(AiCompletion {
            content,
            model: request.model.clone(),
            usage: body.get("usageMetadata").cloned().unwrap_or(Value::Null),
            finish_reason: body["candidates"][0]["finishReason"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        })
    }
}

impl Default for AiAgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeRunner for AiAgentRunner {
    fn validate(&self, node: &Node) -> Vec<String> {
        let mut problems = Vec::new();
        if AiProvider::from_subtype(&node.subtype).is_none() {
            problems.push(format!("unknown AI provider subtype '{}'", node.subtype));
        }
        if node.config_str("model").map(str::trim).unwrap_or("").is_empty() {
            problems.push("model is required".to_string());
        }
        if node.config_str("user_prompt").is_none()
            && node.input_params.get("user_prompt").is_none()
        {
            problems.push("user_prompt is required".to_string());
        }
        problems
    }

    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<NodeExecutionResult, NodeError> {
        let provider = AiProvider::from_subtype(&ctx.node.subtype)
            .ok_or_else(|| NodeError::validation("unknown AI provider"))?;

        let user_prompt = ctx
            .config_str("user_prompt")
            .map(str::to_string)
            .or_else(|| {
                ctx.resolved_params
                    .get("user_prompt")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| NodeError::validation("user_prompt missing"))?;

        let request = AiRequest {
            model: ctx
                .config_str("model")
                .ok_or_else(|| NodeError::validation("model missing"))?
                .to_string(),
            system_prompt: ctx.config_str("system_prompt").map(str::to_string),
            user_prompt,
            messages: ctx
                .config_value("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            temperature: ctx
                .resolved_config
                .get("temperature")
                .and_then(Value::as_f64),
            max_tokens: ctx.config_u64("max_tokens"),
            timeout: Duration::from_secs(
                ctx.config_u64("timeout_seconds")
                    .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            ),
            base_url: ctx.config_str("api_base_url").map(str::to_string),
        };

        let completion = self.complete(provider, &request).await?;

        Ok(NodeExecutionResult::success(json!({
            "content": completion.content,
            "model": completion.model,
            "usage": completion.usage,
            "finish_reason": completion.finish_reason,
        })))
    }
}

/// Map a provider HTTP response onto the taxonomy, returning the parsed
/// success body.
async fn classify_response(response: reqwest::Response) -> Result<Value, NodeError> {
    let status = response.status();
    let status_code = status.as_u16();
    let text = response.text().await.map_err(NodeError::from_reqwest)?;

    if status.is_success() {
        return serde_json::from_str(&text)
            .map_err(|e| NodeError::response(format!("Malformed provider response: {e}")));
    }

    let detail = extract_error_message(&text).unwrap_or_else(|| truncate(&text, 200));

    let kind = match status_code {
        401 | 403 => ErrorKind::AuthError,
        429 => ErrorKind::RateLimit,
        400 | 422 => ErrorKind::ValidationError,
        404 => ErrorKind::ModelError,
        _ => ErrorKind::ModelError,
    };

    Err(NodeError::new(kind, format!("Provider error ({status_code}): {detail}")))
}

fn extract_error_message(body: &str) -> Option<String> {
    let v: Value = serde_json::from_str(body).ok()?;
    v.get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Success envelopes with semantically bad content still fail the node.
fn check_content(content: &str) -> Result<(), NodeError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(NodeError::response("Provider returned empty content"));
    }
    if trimmed.len() <= SUSPICIOUS_CONTENT_LEN {
        return Err(NodeError::response(format!(
            "Provider returned suspiciously short content: {trimmed:?}"
        )));
    }
    for pattern in ERROR_PATTERNS {
        if trimmed.contains(pattern) {
            return Err(NodeError::response(format!(
                "Provider content looks like an error ({pattern})"
            )));
        }
    }
    Ok(())
}

/// Newer OpenAI model families take max_completion_tokens
fn uses_max_completion_tokens(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") || m.starts_with("gpt-5")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_checks() {
        assert!(check_content("a perfectly fine joke").is_ok());
        assert!(check_content("").is_err());
        assert!(check_content("  ").is_err());
        assert!(check_content("ok").is_err());
        assert!(check_content("Error: something broke").is_err());
        assert!(check_content("You are Unauthorized here").is_err());
        assert!(check_content("Rate limit exceeded").is_err());
    }

    #[test]
    fn test_max_completion_tokens_quirk() {
        assert!(uses_max_completion_tokens("o1-preview"));
        assert!(uses_max_completion_tokens("gpt-5-turbo"));
        assert!(!uses_max_completion_tokens("gpt-4o"));
        assert!(!uses_max_completion_tokens("claude-sonnet"));
    }

    #[test]
    fn test_provider_from_subtype() {
        assert_eq!(
            AiProvider::from_subtype("openai_chatgpt"),
            Some(AiProvider::OpenAi)
        );
        assert_eq!(
            AiProvider::from_subtype("ANTHROPIC_CLAUDE"),
            Some(AiProvider::Anthropic)
        );
        assert_eq!(AiProvider::from_subtype("MISTRAL"), None);
    }
}
