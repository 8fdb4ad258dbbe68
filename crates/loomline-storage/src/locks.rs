// Best-effort distributed locks over Redis (SET NX PX with token-checked
// release). Used only where double work is wasteful but harmless: cron
// firings and credential refreshes. Loss of a lock is never fatal.

use anyhow::{Context, Result};
use rand::RngCore;
use std::time::Duration;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct DistributedLock {
    client: redis::Client,
}

impl DistributedLock {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid REDIS_URL")?;
        Ok(Self { client })
    }

    /// Verify connectivity at startup.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .context("Redis PING failed")?;
        Ok(())
    }

    /// Try to take `key` for `ttl`. Returns None when another holder won.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let mut token_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let token = hex::encode(token_bytes);

        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        if acquired.is_none() {
            return Ok(None);
        }

        Ok(Some(LockGuard {
            client: self.client.clone(),
            key: key.to_string(),
            token,
        }))
    }
}

/// Held lock; release checks the token so an expired-and-reacquired key
/// is never deleted out from under its new holder.
pub struct LockGuard {
    client: redis::Client,
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(self) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Minute bucket for cron double-fire suppression keys.
pub fn minute_bucket(at: chrono::DateTime<chrono::Utc>) -> i64 {
    at.timestamp() / 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_minute_bucket_stable_within_minute() {
        let a = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 1).unwrap();
        let b = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 59).unwrap();
        let c = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 31, 0).unwrap();
        assert_eq!(minute_bucket(a), minute_bucket(b));
        assert_ne!(minute_bucket(b), minute_bucket(c));
    }
}
