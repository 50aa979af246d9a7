//! Identity gate for control-channel upgrades.
//!
//! Credentials are opaque bearer tokens. Lookup is hash-indexed: the token
//! is digested with a secret-keyed SHA-256 and the digest is the primary
//! key, so raw tokens never reach the store. Verification compares digests
//! in constant time.

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::debug;
use uniroute_shared::{Error, Result};

use crate::store::Store;

/// Resolved identity for an authenticated connection.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub per_minute_limit: u32,
    pub per_day_limit: u32,
}

pub struct IdentityGate {
    store: Store,
    secret: String,
    usage: DashMap<String, UsageWindow>,
}

#[derive(Debug)]
struct UsageWindow {
    minute_start: Instant,
    minute_count: u32,
    day_start: Instant,
    day_count: u32,
}

impl IdentityGate {
    pub fn new(store: Store, secret: String) -> Self {
        Self {
            store,
            secret,
            usage: DashMap::new(),
        }
    }

    /// Digest used as the token index key.
    pub fn token_hash(secret: &str, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(b"\x00");
        hasher.update(token.as_bytes());
        hex(&hasher.finalize())
    }

    /// Verify a bearer token; returns the identity or `AuthFailed`.
    pub async fn authenticate(&self, bearer: &str) -> Result<Identity> {
        let computed = Self::token_hash(&self.secret, bearer);
        let row = self
            .store
            .token_by_hash(&computed)
            .await?
            .ok_or(Error::AuthFailed)?;

        // The index hit already implies equality; re-check in constant
        // time so a corrupted row cannot authenticate.
        if row.token_hash.as_bytes().ct_eq(computed.as_bytes()).unwrap_u8() != 1 {
            return Err(Error::AuthFailed);
        }
        if row.revoked {
            return Err(Error::AuthFailed);
        }
        if let Some(expires_at) = row.expires_at {
            if expires_at <= Utc::now() {
                return Err(Error::AuthFailed);
            }
        }

        // Usage stamp is best-effort; a store hiccup must not reject.
        let store = self.store.clone();
        let hash = computed.clone();
        tokio::spawn(async move {
            if let Err(e) = store.touch_token(&hash).await {
                debug!("token usage stamp failed: {e}");
            }
        });

        Ok(Identity {
            user_id: row.user_id,
            per_minute_limit: row.per_minute_limit,
            per_day_limit: row.per_day_limit,
        })
    }

    /// Count one control-channel open against the identity's limits.
    pub fn admit(&self, identity: &Identity) -> Result<()> {
        let now = Instant::now();
        let mut entry = self
            .usage
            .entry(identity.user_id.clone())
            .or_insert_with(|| UsageWindow {
                minute_start: now,
                minute_count: 0,
                day_start: now,
                day_count: 0,
            });

        if now.duration_since(entry.minute_start) >= Duration::from_secs(60) {
            entry.minute_start = now;
            entry.minute_count = 0;
        }
        if now.duration_since(entry.day_start) >= Duration::from_secs(86_400) {
            entry.day_start = now;
            entry.day_count = 0;
        }

        if entry.minute_count >= identity.per_minute_limit
            || entry.day_count >= identity.per_day_limit
        {
            return Err(Error::Capacity);
        }
        entry.minute_count += 1;
        entry.day_count += 1;
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TokenRow;

    async fn gate_with_token(token: &str, row: impl FnOnce(String) -> TokenRow) -> IdentityGate {
        let store = Store::connect_in_memory().await.unwrap();
        let hash = IdentityGate::token_hash("secret", token);
        store.insert_token(&row(hash)).await.unwrap();
        IdentityGate::new(store, "secret".into())
    }

    fn valid_row(hash: String) -> TokenRow {
        TokenRow {
            token_hash: hash,
            user_id: "u1".into(),
            per_minute_limit: 2,
            per_day_limit: 100,
            revoked: false,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_valid_token_resolves_identity() {
        let gate = gate_with_token("tok-1", valid_row).await;
        let id = gate.authenticate("tok-1").await.unwrap();
        assert_eq!(id.user_id, "u1");
        assert_eq!(id.per_minute_limit, 2);
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let gate = gate_with_token("tok-1", valid_row).await;
        assert!(matches!(
            gate.authenticate("other").await,
            Err(Error::AuthFailed)
        ));
    }

    #[tokio::test]
    async fn test_revoked_token_rejected() {
        let gate = gate_with_token("tok-1", |hash| TokenRow {
            revoked: true,
            ..valid_row(hash)
        })
        .await;
        assert!(matches!(
            gate.authenticate("tok-1").await,
            Err(Error::AuthFailed)
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let gate = gate_with_token("tok-1", |hash| TokenRow {
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
            ..valid_row(hash)
        })
        .await;
        assert!(matches!(
            gate.authenticate("tok-1").await,
            Err(Error::AuthFailed)
        ));
    }

    #[tokio::test]
    async fn test_per_minute_limit_enforced() {
        let gate = gate_with_token("tok-1", valid_row).await;
        let id = gate.authenticate("tok-1").await.unwrap();
        assert!(gate.admit(&id).is_ok());
        assert!(gate.admit(&id).is_ok());
        assert!(matches!(gate.admit(&id), Err(Error::Capacity)));
    }

    #[test]
    fn test_hash_is_keyed() {
        let a = IdentityGate::token_hash("secret-a", "tok");
        let b = IdentityGate::token_hash("secret-b", "tok");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
