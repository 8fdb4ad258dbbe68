// Transport signature verification: Slack (v0:<ts>:<body>), GitHub
// (sha256= over the raw body), and per-workflow webhook secrets. All
// comparisons are constant-time; stale timestamps are rejected.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Requests older than this are replays
const MAX_SKEW_SECONDS: i64 = 5 * 60;

pub fn hmac_hex(secret: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

fn verify_hex(secret: &str, data: &[u8], expected_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    mac.verify_slice(&expected).is_ok()
}

/// Slack Events API: signature is `v0=<hex hmac of "v0:<ts>:<body>">`,
/// rejected when the timestamp is more than five minutes old.
pub fn verify_slack_signature(
    signing_secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now_epoch: i64,
) -> bool {
    let Ok(request_time) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now_epoch - request_time).abs() > MAX_SKEW_SECONDS {
        return false;
    }

    let Some(signature_hex) = signature.strip_prefix("v0=") else {
        return false;
    };

    let mut base = Vec::with_capacity(4 + timestamp.len() + body.len());
    base.extend_from_slice(b"v0:");
    base.extend_from_slice(timestamp.as_bytes());
    base.extend_from_slice(b":");
    base.extend_from_slice(body);

    verify_hex(signing_secret, &base, signature_hex)
}

/// GitHub webhooks: `X-Hub-Signature-256: sha256=<hex>` over the raw body.
pub fn verify_github_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    verify_hex(secret, body, signature_hex)
}

/// Per-workflow webhook secret: bare hex HMAC over the raw body.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature_hex = signature.strip_prefix("sha256=").unwrap_or(signature);
    verify_hex(secret, body, signature_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";

    #[test]
    fn test_slack_signature_roundtrip() {
        let body = b"{\"type\":\"event_callback\"}";
        let timestamp = "1700000000";
        let base = format!("v0:{timestamp}:{}", std::str::from_utf8(body).unwrap());
        let signature = format!("v0={}", hmac_hex(SECRET, base.as_bytes()));

        assert!(verify_slack_signature(
            SECRET,
            timestamp,
            body,
            &signature,
            1_700_000_100
        ));
        // Tampered body
        assert!(!verify_slack_signature(
            SECRET,
            timestamp,
            b"{\"type\":\"tampered\"}",
            &signature,
            1_700_000_100
        ));
        // Wrong secret
        assert!(!verify_slack_signature(
            "other-secret",
            timestamp,
            body,
            &signature,
            1_700_000_100
        ));
    }

    #[test]
    fn test_slack_rejects_stale_timestamp() {
        let body = b"{}";
        let timestamp = "1700000000";
        let base = format!("v0:{timestamp}:{}", std::str::from_utf8(body).unwrap());
        let signature = format!("v0={}", hmac_hex(SECRET, base.as_bytes()));

        // Six minutes later
        assert!(!verify_slack_signature(
            SECRET,
            timestamp,
            body,
            &signature,
            1_700_000_000 + 360
        ));
    }

    #[test]
    fn test_github_signature() {
        let body = b"{\"action\":\"opened\"}";
        let signature = format!("sha256={}", hmac_hex(SECRET, body));

        assert!(verify_github_signature(SECRET, body, &signature));
        assert!(!verify_github_signature(SECRET, b"{}", &signature));
        assert!(!verify_github_signature(SECRET, body, "sha256=deadbeef"));
        assert!(!verify_github_signature(SECRET, body, "not-prefixed"));
    }

    #[test]
    fn test_webhook_signature_accepts_bare_and_prefixed() {
        let body = b"payload";
        let hex = hmac_hex(SECRET, body);

        assert!(verify_webhook_signature(SECRET, body, &hex));
        assert!(verify_webhook_signature(SECRET, body, &format!("sha256={hex}")));
        assert!(!verify_webhook_signature(SECRET, body, "bogus"));
    }
}
