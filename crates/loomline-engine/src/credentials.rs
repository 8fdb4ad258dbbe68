// Credential broker: the single place tokens are read, refreshed, and
// invalidated. Runners receive an already-valid access token. Refreshes
// are serialized per (user, provider) with a local mutex plus a short-TTL
// Redis lock so concurrent nodes and sibling replicas coalesce into one
// refresh request.

use chrono::{Duration as ChronoDuration, Utc};
use loomline_contracts::ErrorKind;
use loomline_storage::{token_digest, CredentialCipher, CredentialRow, Database, DistributedLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::NodeError;

/// Refresh when expiry is within this window
const REFRESH_WINDOW_SECONDS: i64 = 60;
const REFRESH_LOCK_TTL: Duration = Duration::from_secs(30);
const REFRESH_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Hands runners an already-valid access token for (user, provider).
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, user_id: Uuid, provider: &str) -> Result<String, NodeError>;
}

/// Fixed token map for tests and single-node debug runs.
#[derive(Default)]
pub struct StaticTokenSource {
    tokens: HashMap<String, String>,
}

impl StaticTokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, provider: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(provider.into(), token.into());
        self
    }
}

#[async_trait::async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self, _user_id: Uuid, provider: &str) -> Result<String, NodeError> {
        self.tokens
            .get(provider)
            .cloned()
            .ok_or_else(|| NodeError::auth(format!("No {provider} credential connected")))
    }
}

/// OAuth client settings for one provider's refresh endpoint
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl OAuthClient {
    /// Read `{PREFIX}_CLIENT_ID` / `{PREFIX}_CLIENT_SECRET` for a provider.
    fn from_env(provider: &str, token_url: &str) -> Option<Self> {
        let prefix = provider.to_ascii_uppercase();
        let client_id = std::env::var(format!("{prefix}_CLIENT_ID")).ok()?;
        let client_secret = std::env::var(format!("{prefix}_CLIENT_SECRET")).ok()?;
        Some(Self {
            token_url: token_url.to_string(),
            client_id,
            client_secret,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct CredentialBroker {
    db: Database,
    cipher: CredentialCipher,
    lock: DistributedLock,
    http: reqwest::Client,
    oauth_clients: HashMap<String, OAuthClient>,
    /// Per-(user, provider) local serialization of refreshes
    refresh_guards: Mutex<HashMap<(Uuid, String), Arc<Mutex<()>>>>,
}

#[async_trait::async_trait]
impl TokenSource for CredentialBroker {
    async fn access_token(&self, user_id: Uuid, provider: &str) -> Result<String, NodeError> {
        CredentialBroker::access_token(self, user_id, provider).await
    }
}

impl CredentialBroker {
    pub fn new(db: Database, cipher: CredentialCipher, lock: DistributedLock) -> Self {
        let mut oauth_clients = HashMap::new();
        for (provider, token_url) in [
            ("slack", "https://slack.com/api/oauth.v2.access"),
            ("github", "https://github.com/login/oauth/access_token"),
            ("notion", "https://api.notion.com/v1/oauth/token"),
            ("google_calendar", "https://oauth2.googleapis.com/token"),
            ("discord", "https://discord.com/api/oauth2/token"),
        ] {
            if let Some(client) = OAuthClient::from_env(provider, token_url) {
                oauth_clients.insert(provider.to_string(), client);
            }
        }

        Self {
            db,
            cipher,
            lock,
            http: reqwest::Client::new(),
            oauth_clients,
            refresh_guards: Mutex::new(HashMap::new()),
        }
    }

    /// A valid access token for (user, provider), refreshed when close to
    /// expiry. AUTH_ERROR when no usable credential exists.
    pub async fn access_token(&self, user_id: Uuid, provider: &str) -> Result<String, NodeError> {
        let row = self.load(user_id, provider).await?;

        if !needs_refresh(&row) {
            return self.decrypt_access(&row);
        }

        // Serialize refreshes within this process
        let guard = self.guard_for(user_id, provider).await;
        let _held = guard.lock().await;

        // Another task may have refreshed while we waited
        let row = self.load(user_id, provider).await?;
        if !needs_refresh(&row) {
            return self.decrypt_access(&row);
        }

        self.refresh(row).await
    }

    async fn load(&self, user_id: Uuid, provider: &str) -> Result<CredentialRow, NodeError> {
        let row = self
            .db
            .get_credential(user_id, provider)
            .await
            .map_err(|e| NodeError::internal(format!("Credential lookup failed: {e}")))?
            .ok_or_else(|| {
                NodeError::auth(format!("No {provider} credential connected for this user"))
            })?;

        if !row.is_valid {
            return Err(NodeError::auth(format!(
                "{provider} credential is marked invalid; reconnect the integration"
            )));
        }

        Ok(row)
    }

    fn decrypt_access(&self, row: &CredentialRow) -> Result<String, NodeError> {
        self.cipher
            .decrypt_to_string(&row.encrypted_access_token)
            .map_err(|e| NodeError::auth(format!("Credential decryption failed: {e}")))
    }

    async fn guard_for(&self, user_id: Uuid, provider: &str) -> Arc<Mutex<()>> {
        let mut guards = self.refresh_guards.lock().await;
        guards
            .entry((user_id, provider.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn refresh(&self, row: CredentialRow) -> Result<String, NodeError> {
        let provider = row.provider.clone();
        let user_id = row.user_id;

        let Some(oauth) = self.oauth_clients.get(&provider) else {
            // No refresh endpoint configured (api_key / bot_token style):
            // the stored token is all we have
            return self.decrypt_access(&row);
        };

        let Some(encrypted_refresh) = row.encrypted_refresh_token.as_deref() else {
            return self.decrypt_access(&row);
        };

        // Cross-replica coalescing; losing the race means a sibling is
        // refreshing, so wait briefly and re-read
        let lock_key = format!("credrefresh:{user_id}:{provider}");
        let held = self
            .lock
            .acquire(&lock_key, REFRESH_LOCK_TTL)
            .await
            .map_err(|e| NodeError::internal(format!("Refresh lock failed: {e}")))?;

        let Some(held) = held else {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let row = self.load(user_id, &provider).await?;
            return self.decrypt_access(&row);
        };

        let refresh_token = self
            .cipher
            .decrypt_to_string(encrypted_refresh)
            .map_err(|e| NodeError::auth(format!("Refresh token decryption failed: {e}")))?;

        let result = self
            .request_refresh(oauth, &refresh_token)
            .await;

        let release = held.release().await;
        if let Err(e) = release {
            warn!(provider = %provider, error = %e, "Failed to release refresh lock");
        }

        match result {
            Ok(resp) => {
                let expires_at = resp
                    .expires_in
                    .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
                let encrypted_access = self
                    .cipher
                    .encrypt_string(&resp.access_token)
                    .map_err(|e| NodeError::internal(format!("Token encryption failed: {e}")))?;
                let encrypted_refresh = resp
                    .refresh_token
                    .as_deref()
                    .map(|t| self.cipher.encrypt_string(t))
                    .transpose()
                    .map_err(|e| NodeError::internal(format!("Token encryption failed: {e}")))?;

                self.db
                    .update_credential_tokens(
                        user_id,
                        &provider,
                        &encrypted_access,
                        encrypted_refresh.as_deref(),
                        expires_at,
                    )
                    .await
                    .map_err(|e| NodeError::internal(format!("Token persist failed: {e}")))?;

                info!(
                    provider = %provider,
                    token = %token_digest(&resp.access_token),
                    "Refreshed access token"
                );

                Ok(resp.access_token)
            }
            Err(e) => {
                // A dead refresh token will not heal on retry
                if e.kind == ErrorKind::AuthError {
                    if let Err(err) = self.db.mark_credential_invalid(user_id, &provider).await {
                        warn!(provider = %provider, error = %err, "Failed to invalidate credential");
                    }
                }
                Err(e)
            }
        }
    }

    async fn request_refresh(
        &self,
        oauth: &OAuthClient,
        refresh_token: &str,
    ) -> Result<RefreshResponse, NodeError> {
        let response = self
            .http
            .post(&oauth.token_url)
            .timeout(REFRESH_HTTP_TIMEOUT)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(NodeError::from_reqwest)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::BAD_REQUEST
        {
            let body = response.text().await.unwrap_or_default();
            return Err(NodeError::auth(format!(
                "Token refresh rejected ({status}): {body}"
            )));
        }
        if !status.is_success() {
            return Err(NodeError::network(format!(
                "Token refresh failed with status {status}"
            )));
        }

        response
            .json::<RefreshResponse>()
            .await
            .map_err(|e| NodeError::response(format!("Malformed token response: {e}")))
    }
}

fn needs_refresh(row: &CredentialRow) -> bool {
    match row.token_expires_at {
        Some(expires_at) => {
            expires_at <= Utc::now() + ChronoDuration::seconds(REFRESH_WINDOW_SECONDS)
        }
        // No recorded expiry: long-lived token, never refreshed
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_expiring_in(seconds: i64) -> CredentialRow {
        CredentialRow {
            user_id: Uuid::now_v7(),
            provider: "slack".to_string(),
            credential_type: "oauth2".to_string(),
            encrypted_access_token: vec![],
            encrypted_refresh_token: None,
            token_expires_at: Some(Utc::now() + ChronoDuration::seconds(seconds)),
            scopes: serde_json::json!([]),
            is_valid: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_refresh_window() {
        assert!(needs_refresh(&row_expiring_in(30)));
        assert!(needs_refresh(&row_expiring_in(-10)));
        assert!(!needs_refresh(&row_expiring_in(600)));

        let mut no_expiry = row_expiring_in(0);
        no_expiry.token_expires_at = None;
        assert!(!needs_refresh(&no_expiry));
    }
}
