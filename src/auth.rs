//! Handshake authentication.
//!
//! A client proves it holds the account key by sending
//! `HMAC-SHA256(key, sessionId)` hex-encoded. Keys are looked up first in
//! the inline `accountId=key` configuration string and then, when a database
//! is configured, through the [`AccountManager`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Byte comparison without an early exit, so the duration does not reveal
/// where two signatures diverge. Length mismatches fail immediately; the
/// length of the expected signature is not a secret.
pub fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    lhs.len() == rhs.len()
        && lhs
            .iter()
            .zip(rhs)
            .fold(0u8, |acc, (l, r)| acc | (l ^ r))
            == 0
}

/// Compute the expected handshake signature: lowercase hex of
/// `HMAC-SHA256(key, sessionId)`.
pub fn session_signature(account_key: &str, session_id: &str) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail.
    let mut mac = HmacSha256::new_from_slice(account_key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(session_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a provided signature against the expected one in constant time.
pub fn verify_session_auth(account_key: &str, session_id: &str, provided: &str) -> bool {
    let expected = session_signature(account_key, session_id);
    constant_time_eq(expected.as_bytes(), provided.to_ascii_lowercase().as_bytes())
}

/// Source of account keys beyond the inline configuration string.
#[async_trait]
pub trait AccountManager: Send + Sync {
    async fn account_key(&self, account_id: &str) -> Result<Option<String>>;
}

/// Account key lookup chain: inline configuration first, then the manager.
pub struct AccountKeys {
    inline: HashMap<String, String>,
    manager: Option<Arc<dyn AccountManager>>,
}

impl AccountKeys {
    pub fn new(inline: HashMap<String, String>, manager: Option<Arc<dyn AccountManager>>) -> Self {
        Self { inline, manager }
    }

    /// Resolve the key for an account, if any source knows it.
    pub async fn lookup(&self, account_id: &str) -> Option<String> {
        if let Some(key) = self.inline.get(account_id) {
            return Some(key.clone());
        }
        if let Some(manager) = &self.manager {
            match manager.account_key(account_id).await {
                Ok(key) => return key,
                Err(e) => {
                    tracing::error!(account_id, error = %e, "Account key lookup failed");
                }
            }
        }
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_time_comparison() {
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_eq(b"deadbeef", b"deadbeef"));
        // A single differing byte anywhere fails, first or last.
        assert!(!constant_time_eq(b"xeadbeef", b"deadbeef"));
        assert!(!constant_time_eq(b"deadbeef", b"deadbeex"));
        // Prefix relationships are not equality.
        assert!(!constant_time_eq(b"dead", b"deadbeef"));
        assert!(!constant_time_eq(b"deadbeef", b"dead"));
    }

    #[test]
    fn signature_is_lowercase_hex() {
        let sig = session_signature("key", "session-1");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn signature_is_keyed_on_both_inputs() {
        let base = session_signature("key", "sess");
        assert_ne!(base, session_signature("other", "sess"));
        assert_ne!(base, session_signature("key", "other"));
        // Deterministic for the same inputs.
        assert_eq!(base, session_signature("key", "sess"));
    }

    #[test]
    fn verify_accepts_valid_and_uppercase_signature() {
        let sig = session_signature("key", "sess");
        assert!(verify_session_auth("key", "sess", &sig));
        assert!(verify_session_auth("key", "sess", &sig.to_ascii_uppercase()));
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let mut sig = session_signature("key", "sess");
        assert!(!verify_session_auth("other", "sess", &sig));

        // Flip one hex digit.
        let last = sig.pop().unwrap();
        sig.push(if last == '0' { '1' } else { '0' });
        assert!(!verify_session_auth("key", "sess", &sig));

        assert!(!verify_session_auth("key", "sess", ""));
    }

    struct FixedManager;

    #[async_trait]
    impl AccountManager for FixedManager {
        async fn account_key(&self, account_id: &str) -> Result<Option<String>> {
            Ok((account_id == "db-acc").then(|| "db-key".to_string()))
        }
    }

    #[tokio::test]
    async fn lookup_prefers_inline_keys() {
        let mut inline = HashMap::new();
        inline.insert("db-acc".to_string(), "inline-key".to_string());
        let keys = AccountKeys::new(inline, Some(Arc::new(FixedManager)));
        assert_eq!(keys.lookup("db-acc").await.as_deref(), Some("inline-key"));
    }

    #[tokio::test]
    async fn lookup_falls_back_to_manager() {
        let keys = AccountKeys::new(HashMap::new(), Some(Arc::new(FixedManager)));
        assert_eq!(keys.lookup("db-acc").await.as_deref(), Some("db-key"));
        assert!(keys.lookup("unknown").await.is_none());
    }

    #[tokio::test]
    async fn lookup_without_manager() {
        let keys = AccountKeys::new(HashMap::new(), None);
        assert!(keys.lookup("anyone").await.is_none());
    }
}
