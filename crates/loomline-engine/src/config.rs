// Engine process configuration from environment variables.
// Startup fails fast with context when a required variable is missing.

use anyhow::{Context, Result};

use crate::executor::{EngineConfig, DEFAULT_DEADLINE_SECONDS, DEFAULT_NODE_CONCURRENCY};
use crate::sweep::DEFAULT_LOG_RETENTION_HOURS;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string for the catalog store
    pub catalog_store_url: String,
    /// Redis, for locks
    pub redis_url: String,
    pub bind_addr: String,
    pub engine: EngineConfig,
    pub log_retention_hours: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let catalog_store_url = std::env::var("CATALOG_STORE_URL")
            .context("CATALOG_STORE_URL environment variable required")?;
        let redis_url =
            std::env::var("REDIS_URL").context("REDIS_URL environment variable required")?;
        let bind_addr =
            std::env::var("ENGINE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9001".to_string());

        let concurrency = env_parse("NODE_CONCURRENCY", DEFAULT_NODE_CONCURRENCY)?;
        let deadline_seconds = env_parse("EXECUTION_DEADLINE_SECONDS", DEFAULT_DEADLINE_SECONDS)?;
        let log_retention_hours = env_parse("LOG_RETENTION_HOURS", DEFAULT_LOG_RETENTION_HOURS)?;

        Ok(Self {
            catalog_store_url,
            redis_url,
            bind_addr,
            engine: EngineConfig {
                concurrency,
                deadline_seconds,
            },
            log_retention_hours,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Shared tracing setup honoring LOG_LEVEL and LOG_FORMAT (simple|json).
pub fn init_tracing(default_directive: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| default_directive.into());

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
