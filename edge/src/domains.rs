//! Custom-domain registry: ownership, DNS verification, tunnel binding.
//!
//! Verification is advisory; an unverified hostname still routes while
//! bound. Hostnames are normalised (lowercase, trailing dot and port
//! stripped) on write and on lookup.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uniroute_shared::{Error, Result};
use uuid::Uuid;

use crate::store::{DomainRow, Store};

#[derive(Debug, Clone)]
pub struct CustomDomain {
    pub id: String,
    pub user_id: String,
    pub hostname: String,
    pub dns_configured: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub tunnel_id: Option<String>,
}

pub struct DomainRegistry {
    records: RwLock<HashMap<String, CustomDomain>>,
    /// Ingress fast path: normalised hostname → bound tunnel id.
    bound_hosts: DashMap<String, String>,
    store: Store,
    /// CNAME target the public edge answers on.
    edge_target: String,
}

impl DomainRegistry {
    pub fn new(store: Store, edge_target: String) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            bound_hosts: DashMap::new(),
            store,
            edge_target,
        }
    }

    /// Load persisted domains; called once at boot.
    pub async fn load(&self) -> Result<usize> {
        let rows = self.store.load_domains().await?;
        let mut records = self.records.write().await;
        for row in rows {
            if let Some(tunnel_id) = &row.tunnel_id {
                self.bound_hosts
                    .insert(row.hostname.clone(), tunnel_id.clone());
            }
            records.insert(
                row.id.clone(),
                CustomDomain {
                    id: row.id,
                    user_id: row.user_id,
                    hostname: row.hostname,
                    dns_configured: row.dns_configured,
                    verified_at: row.verified_at,
                    tunnel_id: row.tunnel_id,
                },
            );
        }
        info!("loaded {} custom domains", records.len());
        Ok(records.len())
    }

    pub async fn add(&self, user_id: &str, hostname: &str) -> Result<CustomDomain> {
        let hostname = normalize_host(hostname);
        validate_hostname(&hostname)?;
        if hostname == self.edge_target || hostname.ends_with(&format!(".{}", self.edge_target)) {
            return Err(Error::invalid(format!(
                "'{hostname}' is under the edge's own domain"
            )));
        }

        let mut records = self.records.write().await;
        if records.values().any(|d| d.hostname == hostname) {
            return Err(Error::CustomDomainConflict(hostname));
        }

        let domain = CustomDomain {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            hostname,
            dns_configured: false,
            verified_at: None,
            tunnel_id: None,
        };
        self.store
            .insert_domain(&DomainRow {
                id: domain.id.clone(),
                user_id: domain.user_id.clone(),
                hostname: domain.hostname.clone(),
                dns_configured: false,
                verified_at: None,
                tunnel_id: None,
            })
            .await?;
        records.insert(domain.id.clone(), domain.clone());
        info!("added custom domain {} for {}", domain.hostname, user_id);
        Ok(domain)
    }

    /// Resolve the hostname and compare against the edge target. Sets
    /// `dns_configured` on success; never affects routing either way.
    pub async fn verify(&self, user_id: &str, domain_id: &str) -> Result<CustomDomain> {
        let hostname = {
            let records = self.records.read().await;
            let domain = owned(&records, user_id, domain_id)?;
            domain.hostname.clone()
        };

        let configured = self.dns_points_at_edge(&hostname).await;
        let now = Utc::now();
        self.store
            .update_domain_verification(domain_id, configured, now)
            .await?;

        let mut records = self.records.write().await;
        let domain = records
            .get_mut(domain_id)
            .ok_or(Error::TunnelNotFound)?;
        domain.dns_configured = configured;
        domain.verified_at = Some(now);
        info!(
            "verified {}: dns_configured={}",
            domain.hostname, configured
        );
        Ok(domain.clone())
    }

    /// Bind the domain to a tunnel. The caller has already checked that
    /// the tunnel belongs to the same user and speaks HTTP.
    pub async fn assign(&self, user_id: &str, domain_id: &str, tunnel_id: &str) -> Result<CustomDomain> {
        let mut records = self.records.write().await;
        {
            let domain = owned(&records, user_id, domain_id)?;
            if let Some(existing) = &domain.tunnel_id {
                if existing != tunnel_id {
                    // Re-binding is allowed; drop the old route first.
                    self.bound_hosts.remove(&domain.hostname);
                }
            }
        }
        self.store
            .update_domain_binding(domain_id, Some(tunnel_id))
            .await?;
        let domain = records.get_mut(domain_id).ok_or(Error::TunnelNotFound)?;
        domain.tunnel_id = Some(tunnel_id.to_string());
        self.bound_hosts
            .insert(domain.hostname.clone(), tunnel_id.to_string());
        info!("bound {} -> tunnel {}", domain.hostname, tunnel_id);
        Ok(domain.clone())
    }

    pub async fn remove(&self, user_id: &str, domain_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        {
            owned(&records, user_id, domain_id)?;
        }
        self.store.delete_domain(domain_id).await?;
        if let Some(domain) = records.remove(domain_id) {
            self.bound_hosts.remove(&domain.hostname);
            info!("removed custom domain {}", domain.hostname);
        }
        Ok(())
    }

    /// Detach every domain bound to a tunnel (on explicit tunnel close).
    pub async fn unbind_tunnel(&self, tunnel_id: &str) {
        let mut records = self.records.write().await;
        for domain in records.values_mut() {
            if domain.tunnel_id.as_deref() == Some(tunnel_id) {
                domain.tunnel_id = None;
                self.bound_hosts.remove(&domain.hostname);
                if let Err(e) = self.store.update_domain_binding(&domain.id, None).await {
                    warn!("failed to persist unbind of {}: {e}", domain.hostname);
                }
            }
        }
    }

    /// Ingress fast path.
    pub fn lookup_host(&self, hostname: &str) -> Option<String> {
        self.bound_hosts
            .get(&normalize_host(hostname))
            .map(|entry| entry.value().clone())
    }

    pub async fn get(&self, user_id: &str, domain_id: &str) -> Result<CustomDomain> {
        let records = self.records.read().await;
        owned(&records, user_id, domain_id).cloned()
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<CustomDomain> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect()
    }

    async fn dns_points_at_edge(&self, hostname: &str) -> bool {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

        // CNAME/ALIAS directly at the edge target wins.
        if let Ok(lookup) = resolver.lookup(hostname, RecordType::CNAME).await {
            for record in lookup.iter() {
                if let Some(cname) = record.as_cname() {
                    let target = normalize_host(&cname.0.to_utf8());
                    if target == self.edge_target {
                        return true;
                    }
                }
            }
        }

        // Otherwise the hostname's A/AAAA set must intersect the edge's.
        let edge_ips: Vec<IpAddr> = match resolver.lookup_ip(self.edge_target.as_str()).await {
            Ok(lookup) => lookup.iter().collect(),
            Err(e) => {
                debug!("failed to resolve edge target {}: {e}", self.edge_target);
                return false;
            }
        };
        match resolver.lookup_ip(hostname).await {
            Ok(lookup) => lookup.iter().any(|ip| edge_ips.contains(&ip)),
            Err(e) => {
                debug!("failed to resolve {hostname}: {e}");
                false
            }
        }
    }
}

fn owned<'a>(
    records: &'a HashMap<String, CustomDomain>,
    user_id: &str,
    domain_id: &str,
) -> Result<&'a CustomDomain> {
    let domain = records.get(domain_id).ok_or(Error::TunnelNotFound)?;
    if domain.user_id != user_id {
        // Existence of other users' domains is not disclosed.
        return Err(Error::TunnelNotFound);
    }
    Ok(domain)
}

/// Lowercase, strip one trailing dot, strip a port suffix.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    let host = host.strip_suffix('.').unwrap_or(&host);
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
        _ => host.to_string(),
    }
}

fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.len() > 253 || !hostname.contains('.') {
        return Err(Error::invalid(format!("invalid hostname '{hostname}'")));
    }
    for label in hostname.split('.') {
        let bytes = label.as_bytes();
        let ok = !bytes.is_empty()
            && bytes.len() <= 63
            && bytes[0] != b'-'
            && bytes[bytes.len() - 1] != b'-'
            && bytes
                .iter()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
        if !ok {
            return Err(Error::invalid(format!("invalid hostname '{hostname}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> DomainRegistry {
        let store = Store::connect_in_memory().await.unwrap();
        DomainRegistry::new(store, "example.com".into())
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("MyApp.Example.COM"), "myapp.example.com");
        assert_eq!(normalize_host("myapp.example.com."), "myapp.example.com");
        assert_eq!(normalize_host("myapp.example.com:8443"), "myapp.example.com");
        assert_eq!(normalize_host(" host.tld "), "host.tld");
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("app.example.net").is_ok());
        assert!(validate_hostname("no-dots").is_err());
        assert!(validate_hostname("-bad.example.net").is_err());
        assert!(validate_hostname("bad_.example.net").is_err());
    }

    #[tokio::test]
    async fn test_add_then_lookup_after_assign() {
        let reg = registry().await;
        let domain = reg.add("u1", "App.Example.Net").await.unwrap();
        assert_eq!(domain.hostname, "app.example.net");

        // Unbound hostnames do not route.
        assert_eq!(reg.lookup_host("app.example.net"), None);

        reg.assign("u1", &domain.id, "t1").await.unwrap();
        assert_eq!(reg.lookup_host("app.example.net."), Some("t1".into()));
    }

    #[tokio::test]
    async fn test_hostname_globally_unique() {
        let reg = registry().await;
        reg.add("u1", "app.example.net").await.unwrap();
        let err = reg.add("u2", "app.example.net").await.unwrap_err();
        assert!(matches!(err, Error::CustomDomainConflict(_)));
    }

    #[tokio::test]
    async fn test_edge_domain_hostnames_rejected() {
        let reg = registry().await;
        assert!(reg.add("u1", "myapp.example.com").await.is_err());
        assert!(reg.add("u1", "example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_clears_route() {
        let reg = registry().await;
        let domain = reg.add("u1", "app.example.net").await.unwrap();
        reg.assign("u1", &domain.id, "t1").await.unwrap();
        reg.remove("u1", &domain.id).await.unwrap();
        assert_eq!(reg.lookup_host("app.example.net"), None);
        assert!(matches!(
            reg.get("u1", &domain.id).await,
            Err(Error::TunnelNotFound)
        ));
    }

    #[tokio::test]
    async fn test_only_owner_may_mutate() {
        let reg = registry().await;
        let domain = reg.add("u1", "app.example.net").await.unwrap();
        assert!(matches!(
            reg.assign("u2", &domain.id, "t1").await,
            Err(Error::TunnelNotFound)
        ));
        assert!(matches!(
            reg.remove("u2", &domain.id).await,
            Err(Error::TunnelNotFound)
        ));
    }

    #[tokio::test]
    async fn test_unbind_tunnel_detaches_domains() {
        let reg = registry().await;
        let domain = reg.add("u1", "app.example.net").await.unwrap();
        reg.assign("u1", &domain.id, "t1").await.unwrap();
        reg.unbind_tunnel("t1").await;
        assert_eq!(reg.lookup_host("app.example.net"), None);
        let domain = reg.get("u1", &domain.id).await.unwrap();
        assert_eq!(domain.tunnel_id, None);
    }
}
