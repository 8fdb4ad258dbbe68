// Scheduler process configuration from environment variables.

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string for the catalog store
    pub catalog_store_url: String,
    /// Redis, for cron fire locks
    pub redis_url: String,
    /// Base URL of the engine service
    pub engine_url: String,
    pub bind_addr: String,
    /// Slack Events API signing secret; verification is skipped when unset
    pub slack_signing_secret: Option<String>,
    /// GitHub webhook HMAC secret; verification is skipped when unset
    pub github_webhook_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let catalog_store_url = std::env::var("CATALOG_STORE_URL")
            .context("CATALOG_STORE_URL environment variable required")?;
        let redis_url =
            std::env::var("REDIS_URL").context("REDIS_URL environment variable required")?;
        let engine_url =
            std::env::var("ENGINE_URL").context("ENGINE_URL environment variable required")?;
        let bind_addr =
            std::env::var("SCHEDULER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_string());

        Ok(Self {
            catalog_store_url,
            redis_url,
            engine_url,
            bind_addr,
            slack_signing_secret: std::env::var("SLACK_SIGNING_SECRET").ok(),
            github_webhook_secret: std::env::var("GITHUB_WEBHOOK_SECRET").ok(),
        })
    }
}
