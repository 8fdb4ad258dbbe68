// Postgres storage layer with sqlx, plus credential encryption and the
// Redis lock primitive used for cron dedup and credential-refresh coalescing.

pub mod encryption;
pub mod locks;
pub mod models;
pub mod repositories;

pub use encryption::{generate_encryption_key, token_digest, CredentialCipher};
pub use locks::{DistributedLock, LockGuard};
pub use models::*;
pub use repositories::Database;
