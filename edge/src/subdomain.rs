//! Subdomain allocation, resumption, and release.
//!
//! Claims are the durable record of "this user may have this label back".
//! A live tunnel always blocks allocation by anyone else; a released claim
//! blocks other users only until the grace window elapses, while the owning
//! user may resume indefinitely (bounded by a per-user LRU cap).

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uniroute_shared::{Error, Protocol, Result};

use crate::store::{ClaimRow, Store};

/// Labels never handed out to tunnels.
pub const RESERVED_LABELS: &[&str] = &[
    "www",
    "api",
    "app",
    "admin",
    "dashboard",
    "docs",
    "tunnel",
    "status",
    "mail",
];

const MINT_LENGTH: usize = 8;
const MINT_MAX_LENGTH: usize = 12;
const MINT_ATTEMPTS_PER_LENGTH: usize = 8;
const CLAIMS_PER_USER: usize = 32;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone)]
pub struct Claim {
    pub user_id: String,
    pub tunnel_id: String,
    pub protocol: Protocol,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Result of [`SubdomainAllocator::allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedName {
    pub subdomain: String,
    pub resumed: bool,
}

pub struct SubdomainAllocator {
    claims: RwLock<HashMap<String, Claim>>,
    store: Store,
    grace_window: Duration,
}

impl SubdomainAllocator {
    pub fn new(store: Store, grace_window: Duration) -> Self {
        Self {
            claims: RwLock::new(HashMap::new()),
            store,
            grace_window,
        }
    }

    /// Load persisted claims; called once at boot.
    pub async fn load(&self) -> Result<usize> {
        let rows = self.store.load_claims().await?;
        let mut claims = self.claims.write().await;
        for row in rows {
            claims.insert(
                row.subdomain.clone(),
                Claim {
                    user_id: row.user_id,
                    tunnel_id: row.tunnel_id,
                    protocol: row.protocol,
                    last_used: row.last_used,
                    created_at: row.created_at,
                },
            );
        }
        info!("loaded {} subdomain claims", claims.len());
        Ok(claims.len())
    }

    /// Allocate `desired` (or mint a fresh label) for a new tunnel.
    ///
    /// `is_live` answers "does a live tunnel currently hold this label";
    /// it is consulted inside the allocator's critical section so two
    /// concurrent opens cannot both win the same name.
    pub async fn allocate(
        &self,
        user_id: &str,
        tunnel_id: &str,
        protocol: Protocol,
        desired: Option<&str>,
        is_live: impl Fn(&str) -> bool,
    ) -> Result<AllocatedName> {
        let mut claims = self.claims.write().await;
        let now = Utc::now();

        let (label, resumed) = match desired {
            Some(label) => {
                validate_label(label)?;
                if is_live(label) {
                    return Err(Error::SubdomainTaken(label.to_string()));
                }
                match claims.get(label) {
                    Some(claim) if claim.user_id == user_id => (label.to_string(), true),
                    Some(claim) => {
                        let age = now.signed_duration_since(claim.last_used);
                        if age.to_std().unwrap_or_default() < self.grace_window {
                            return Err(Error::SubdomainTaken(label.to_string()));
                        }
                        debug!(
                            "claim on '{}' by {} lapsed, transferring to {}",
                            label, claim.user_id, user_id
                        );
                        (label.to_string(), false)
                    }
                    None => (label.to_string(), false),
                }
            }
            None => {
                let label = self.mint(&claims, &is_live)?;
                (label, false)
            }
        };

        let claim = Claim {
            user_id: user_id.to_string(),
            tunnel_id: tunnel_id.to_string(),
            protocol,
            last_used: now,
            created_at: claims.get(&label).map(|c| c.created_at).unwrap_or(now),
        };
        // Claim is durable before the name is handed out.
        self.store
            .upsert_claim(&ClaimRow {
                subdomain: label.clone(),
                user_id: claim.user_id.clone(),
                tunnel_id: claim.tunnel_id.clone(),
                protocol: claim.protocol,
                last_used: claim.last_used,
                created_at: claim.created_at,
            })
            .await?;
        claims.insert(label.clone(), claim);

        self.enforce_user_cap(&mut claims, user_id, &label, &is_live)
            .await;

        Ok(AllocatedName {
            subdomain: label,
            resumed,
        })
    }

    /// Look up the label previously claimed for `tunnel_id`.
    pub async fn resume(&self, user_id: &str, tunnel_id: &str) -> Result<String> {
        let claims = self.claims.read().await;
        claims
            .iter()
            .find(|(_, c)| c.tunnel_id == tunnel_id && c.user_id == user_id)
            .map(|(label, _)| label.clone())
            .ok_or(Error::TunnelNotFound)
    }

    /// Stamp a claim at tunnel deactivation; starts the grace countdown.
    pub async fn touch(&self, subdomain: &str) -> Result<()> {
        let now = Utc::now();
        let mut claims = self.claims.write().await;
        if let Some(claim) = claims.get_mut(subdomain) {
            claim.last_used = now;
            self.store.touch_claim(subdomain, now).await?;
        }
        Ok(())
    }

    /// Drop a claim immediately (explicit close or LRU eviction).
    pub async fn release(&self, subdomain: &str) -> Result<()> {
        let mut claims = self.claims.write().await;
        if claims.remove(subdomain).is_some() {
            self.store.delete_claim(subdomain).await?;
            info!("released subdomain claim '{subdomain}'");
        }
        Ok(())
    }

    pub async fn claims_for_user(&self, user_id: &str) -> Vec<(String, Claim)> {
        let claims = self.claims.read().await;
        claims
            .iter()
            .filter(|(_, c)| c.user_id == user_id)
            .map(|(label, c)| (label.clone(), c.clone()))
            .collect()
    }

    fn mint(
        &self,
        claims: &HashMap<String, Claim>,
        is_live: &impl Fn(&str) -> bool,
    ) -> Result<String> {
        let mut rng = rand::thread_rng();
        for length in MINT_LENGTH..=MINT_MAX_LENGTH {
            for _ in 0..MINT_ATTEMPTS_PER_LENGTH {
                let label: String = (0..length)
                    .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                    .collect();
                if RESERVED_LABELS.contains(&label.as_str()) {
                    continue;
                }
                if !claims.contains_key(&label) && !is_live(&label) {
                    return Ok(label);
                }
            }
        }
        Err(Error::Capacity)
    }

    async fn enforce_user_cap(
        &self,
        claims: &mut HashMap<String, Claim>,
        user_id: &str,
        just_allocated: &str,
        is_live: &impl Fn(&str) -> bool,
    ) {
        loop {
            let mut owned: Vec<(String, DateTime<Utc>)> = claims
                .iter()
                .filter(|(label, c)| {
                    c.user_id == user_id && label.as_str() != just_allocated && !is_live(label)
                })
                .map(|(label, c)| (label.clone(), c.last_used))
                .collect();
            if owned.len() + 1 <= CLAIMS_PER_USER {
                return;
            }
            owned.sort_by_key(|(_, last_used)| *last_used);
            let (oldest, _) = owned.remove(0);
            claims.remove(&oldest);
            if let Err(e) = self.store.delete_claim(&oldest).await {
                debug!("failed to evict claim '{oldest}': {e}");
                return;
            }
            info!("evicted oldest claim '{oldest}' for user {user_id}");
        }
    }
}

/// DNS-label rules: `[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?`, reserved set
/// excluded.
pub fn validate_label(label: &str) -> Result<()> {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return Err(Error::invalid(format!(
            "subdomain '{label}' must be 1-63 characters"
        )));
    }
    let inner_ok = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
    let edges_ok = bytes[0] != b'-' && bytes[bytes.len() - 1] != b'-';
    if !inner_ok || !edges_ok {
        return Err(Error::invalid(format!(
            "subdomain '{label}' must match [a-z0-9]([a-z0-9-]*[a-z0-9])?"
        )));
    }
    if RESERVED_LABELS.contains(&label) {
        return Err(Error::invalid(format!("subdomain '{label}' is reserved")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn allocator() -> SubdomainAllocator {
        let store = Store::connect_in_memory().await.unwrap();
        SubdomainAllocator::new(store, Duration::from_secs(60))
    }

    fn no_live(_: &str) -> bool {
        false
    }

    #[test]
    fn test_label_validation() {
        assert!(validate_label("myapp").is_ok());
        assert!(validate_label("a").is_ok());
        assert!(validate_label("my-app-2").is_ok());
        assert!(validate_label("").is_err());
        assert!(validate_label("-bad").is_err());
        assert!(validate_label("bad-").is_err());
        assert!(validate_label("UPPER").is_err());
        assert!(validate_label("under_score").is_err());
        assert!(validate_label(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_reserved_labels_rejected() {
        for label in RESERVED_LABELS {
            assert!(validate_label(label).is_err(), "{label} should be reserved");
        }
    }

    #[tokio::test]
    async fn test_desired_label_allocated_and_persisted() {
        let alloc = allocator().await;
        let got = alloc
            .allocate("u1", "t1", Protocol::Http, Some("myapp"), no_live)
            .await
            .unwrap();
        assert_eq!(got.subdomain, "myapp");
        assert!(!got.resumed);

        // Durable before return.
        let rows = alloc.store.load_claims().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subdomain, "myapp");
    }

    #[tokio::test]
    async fn test_same_user_resumes_desired_label() {
        let alloc = allocator().await;
        alloc
            .allocate("u1", "t1", Protocol::Http, Some("myapp"), no_live)
            .await
            .unwrap();
        let again = alloc
            .allocate("u1", "t2", Protocol::Http, Some("myapp"), no_live)
            .await
            .unwrap();
        assert!(again.resumed);
        assert_eq!(again.subdomain, "myapp");
    }

    #[tokio::test]
    async fn test_other_user_conflicts_inside_grace() {
        let alloc = allocator().await;
        alloc
            .allocate("u1", "t1", Protocol::Http, Some("shared"), no_live)
            .await
            .unwrap();
        let err = alloc
            .allocate("u2", "t2", Protocol::Http, Some("shared"), no_live)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubdomainTaken(_)));
    }

    #[tokio::test]
    async fn test_lapsed_claim_transfers_to_other_user() {
        let store = Store::connect_in_memory().await.unwrap();
        let alloc = SubdomainAllocator::new(store, Duration::from_secs(0));
        alloc
            .allocate("u1", "t1", Protocol::Http, Some("shared"), no_live)
            .await
            .unwrap();
        // Zero grace: the claim lapses immediately once the tunnel is gone.
        let got = alloc
            .allocate("u2", "t2", Protocol::Http, Some("shared"), no_live)
            .await
            .unwrap();
        assert!(!got.resumed);
        let claims = alloc.claims.read().await;
        assert_eq!(claims.get("shared").unwrap().user_id, "u2");
    }

    #[tokio::test]
    async fn test_live_label_blocks_everyone() {
        let alloc = allocator().await;
        let err = alloc
            .allocate("u2", "t2", Protocol::Http, Some("busy"), |l| l == "busy")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubdomainTaken(_)));
    }

    #[tokio::test]
    async fn test_minted_labels_are_valid_and_unreserved() {
        let alloc = allocator().await;
        for i in 0..32 {
            let got = alloc
                .allocate("u1", &format!("t{i}"), Protocol::Http, None, no_live)
                .await
                .unwrap();
            assert!(validate_label(&got.subdomain).is_ok());
            assert!(!got.resumed);
        }
    }

    #[tokio::test]
    async fn test_resume_by_tunnel_id() {
        let alloc = allocator().await;
        alloc
            .allocate("u1", "t1", Protocol::Tcp, Some("db"), no_live)
            .await
            .unwrap();
        assert_eq!(alloc.resume("u1", "t1").await.unwrap(), "db");
        assert!(matches!(
            alloc.resume("u2", "t1").await,
            Err(Error::TunnelNotFound)
        ));
        assert!(matches!(
            alloc.resume("u1", "missing").await,
            Err(Error::TunnelNotFound)
        ));
    }

    #[tokio::test]
    async fn test_release_makes_label_available() {
        let alloc = allocator().await;
        alloc
            .allocate("u1", "t1", Protocol::Http, Some("gone"), no_live)
            .await
            .unwrap();
        alloc.release("gone").await.unwrap();
        let got = alloc
            .allocate("u2", "t2", Protocol::Http, Some("gone"), no_live)
            .await
            .unwrap();
        assert_eq!(got.subdomain, "gone");
        assert!(!got.resumed);
    }

    #[tokio::test]
    async fn test_user_claim_cap_evicts_oldest() {
        let alloc = allocator().await;
        for i in 0..CLAIMS_PER_USER + 4 {
            alloc
                .allocate(
                    "u1",
                    &format!("t{i}"),
                    Protocol::Http,
                    Some(&format!("app-{i}")),
                    no_live,
                )
                .await
                .unwrap();
        }
        let owned = alloc.claims_for_user("u1").await;
        assert!(owned.len() <= CLAIMS_PER_USER);
        // The earliest labels were evicted first.
        assert!(!owned.iter().any(|(label, _)| label == "app-0"));
    }
}
