// Error taxonomy shared by every runner and both HTTP surfaces.
// Runners map provider-specific failures onto these kinds; the HTTP layer
// maps kinds onto status codes.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Uniform error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad input to an operation (malformed spec, missing required param)
    ValidationError,
    /// Unknown workflow/execution/trigger/credential
    NotFound,
    /// Webhook path collision, duplicate deploy in progress
    Conflict,
    /// Missing/invalid/expired credential or API key
    AuthError,
    /// Provider 429 or equivalent
    RateLimit,
    /// Operation exceeded its declared deadline
    Timeout,
    /// Transport failure before a response arrived
    NetworkError,
    /// LLM reported its own error (unknown model, safety block)
    ModelError,
    /// Provider returned a success envelope with semantically bad content
    ResponseError,
    /// Operation invalid for the current lifecycle state
    StateError,
    /// Unimplemented (type, subtype) pair reached at run time
    NotImplemented,
    /// Bugs
    Internal,
}

impl ErrorKind {
    /// HTTP status this kind surfaces as
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::ValidationError | ErrorKind::StateError => 400,
            ErrorKind::AuthError => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimit => 429,
            ErrorKind::Timeout => 504,
            ErrorKind::NotImplemented => 501,
            ErrorKind::NetworkError
            | ErrorKind::ModelError
            | ErrorKind::ResponseError
            | ErrorKind::Internal => 500,
        }
    }

    /// Whether a node-level error of this kind is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::NetworkError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::AuthError => "AUTH_ERROR",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::ModelError => "MODEL_ERROR",
            ErrorKind::ResponseError => "RESPONSE_ERROR",
            ErrorKind::StateError => "STATE_ERROR",
            ErrorKind::NotImplemented => "NOT_IMPLEMENTED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::RateLimit).unwrap();
        assert_eq!(json, "\"RATE_LIMIT\"");

        let kind: ErrorKind = serde_json::from_str("\"AUTH_ERROR\"").unwrap();
        assert_eq!(kind, ErrorKind::AuthError);
    }

    #[test]
    fn test_caller_correctable_kinds_are_4xx() {
        for kind in [
            ErrorKind::ValidationError,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::StateError,
            ErrorKind::AuthError,
            ErrorKind::RateLimit,
        ] {
            assert!(kind.http_status() < 500, "{kind} should be 4xx");
        }
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(!ErrorKind::AuthError.is_retryable());
        assert!(!ErrorKind::ValidationError.is_retryable());
    }
}
