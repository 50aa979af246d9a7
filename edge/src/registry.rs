//! Canonical in-memory index of tunnels.
//!
//! The registry is the exclusive owner of tunnel records and the arbiter of
//! which control channel currently holds each tunnel. Mutations serialize on
//! a per-record lock; the ingress fast path reads lock-free index maps.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uniroute_shared::frame::{Frame, Shutdown};
use uniroute_shared::{Error, Protocol, Result};
use uuid::Uuid;

use crate::channel::ChannelHandle;
use crate::config::EdgeConfig;
use crate::domains::DomainRegistry;
use crate::subdomain::SubdomainAllocator;

/// Tunnel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Allocating,
    Active,
    Draining,
    Inactive,
}

/// One tunnel record. Identity fields are fixed for the record's lifetime;
/// everything that changes lives behind the per-record lock.
pub struct TunnelEntry {
    pub id: String,
    pub user_id: String,
    pub protocol: Protocol,
    pub subdomain: String,
    pub custom_hostname: Option<String>,
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub requests: AtomicU64,
    last_active_unix: AtomicI64,
    state: Mutex<MutableState>,
}

struct MutableState {
    lifecycle: TunnelState,
    local_target: String,
    channel: Option<ChannelHandle>,
    active_since: Option<DateTime<Utc>>,
    detached_at: Option<Instant>,
}

/// Serializable view for the control-plane API.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub id: String,
    pub protocol: Protocol,
    pub subdomain: String,
    pub custom_hostname: Option<String>,
    pub port: Option<u16>,
    pub state: TunnelState,
    pub local_target: String,
    pub created_at: DateTime<Utc>,
    pub active_since: Option<DateTime<Utc>>,
    pub last_active: DateTime<Utc>,
    pub requests: u64,
}

/// Result of `open`/`resume`: everything the client needs to attach.
#[derive(Debug, Clone)]
pub struct OpenGrant {
    pub tunnel_id: String,
    pub subdomain: String,
    pub custom_hostname: Option<String>,
    pub port: Option<u16>,
    pub public_url: String,
    pub resumed: bool,
}

/// Active route for ingress: tunnel id plus its live channel.
#[derive(Clone)]
pub struct ActiveRoute {
    pub tunnel_id: String,
    pub channel: ChannelHandle,
}

struct PortPool {
    free: BTreeSet<u16>,
}

impl PortPool {
    fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            free: range.collect(),
        }
    }

    /// Lowest free port first.
    fn lease(&mut self) -> Result<u16> {
        let port = *self.free.iter().next().ok_or(Error::Capacity)?;
        self.free.remove(&port);
        Ok(port)
    }

    /// A specific port, if it is in the pool and free.
    fn lease_specific(&mut self, port: u16) -> Result<u16> {
        if self.free.remove(&port) {
            Ok(port)
        } else {
            Err(Error::Capacity)
        }
    }

    fn release(&mut self, port: u16) {
        self.free.insert(port);
    }
}

pub struct TunnelRegistry {
    records: DashMap<String, Arc<TunnelEntry>>,
    by_subdomain: DashMap<String, String>,
    by_port: DashMap<u16, String>,
    active_channels: DashMap<String, ChannelHandle>,
    ports: StdMutex<PortPool>,
    allocator: Arc<SubdomainAllocator>,
    domains: Arc<DomainRegistry>,
    config: Arc<EdgeConfig>,
}

impl TunnelRegistry {
    pub fn new(
        allocator: Arc<SubdomainAllocator>,
        domains: Arc<DomainRegistry>,
        config: Arc<EdgeConfig>,
    ) -> Self {
        Self {
            records: DashMap::new(),
            by_subdomain: DashMap::new(),
            by_port: DashMap::new(),
            active_channels: DashMap::new(),
            ports: StdMutex::new(PortPool::new(config.port_range.clone())),
            allocator,
            domains,
            config,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_channels.len()
    }

    /// Allocate a name (and port, for stream protocols) for a new tunnel.
    /// Partial failures roll back before returning.
    pub async fn open(
        &self,
        user_id: &str,
        protocol: Protocol,
        desired_subdomain: Option<&str>,
        desired_hostname: Option<&str>,
        desired_port: Option<u16>,
    ) -> Result<OpenGrant> {
        if desired_hostname.is_some() && protocol != Protocol::Http {
            return Err(Error::invalid(
                "custom hostnames are only valid for http tunnels",
            ));
        }
        if desired_port.is_some() && !protocol.is_stream() {
            return Err(Error::invalid("ports are only leased for stream tunnels"));
        }

        let tunnel_id = Uuid::new_v4().to_string();
        let allocated = self
            .allocator
            .allocate(user_id, &tunnel_id, protocol, desired_subdomain, |label| {
                self.by_subdomain.contains_key(label)
            })
            .await?;

        let port = if protocol.is_stream() {
            let leased = match desired_port {
                Some(wanted) if !self.config.port_range.contains(&wanted) => {
                    Err(Error::invalid(format!("port {wanted} is outside the pool")))
                }
                Some(wanted) => self
                    .ports
                    .lock()
                    .expect("port pool poisoned")
                    .lease_specific(wanted),
                None => self.lease_port(),
            };
            match leased {
                Ok(port) => Some(port),
                Err(e) => {
                    self.rollback_claim(&allocated.subdomain, allocated.resumed).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let custom_hostname = match desired_hostname {
            Some(host) => match self.bind_hostname(user_id, host, &tunnel_id).await {
                Ok(host) => Some(host),
                Err(e) => {
                    if let Some(port) = port {
                        self.release_port(port);
                    }
                    self.rollback_claim(&allocated.subdomain, allocated.resumed).await;
                    return Err(e);
                }
            },
            None => None,
        };

        let entry = Arc::new(TunnelEntry {
            id: tunnel_id.clone(),
            user_id: user_id.to_string(),
            protocol,
            subdomain: allocated.subdomain.clone(),
            custom_hostname: custom_hostname.clone(),
            port,
            created_at: Utc::now(),
            requests: AtomicU64::new(0),
            last_active_unix: AtomicI64::new(Utc::now().timestamp()),
            state: Mutex::new(MutableState {
                lifecycle: TunnelState::Allocating,
                local_target: String::new(),
                channel: None,
                active_since: None,
                detached_at: Some(Instant::now()),
            }),
        });

        self.by_subdomain
            .insert(allocated.subdomain.clone(), tunnel_id.clone());
        if let Some(port) = port {
            self.by_port.insert(port, tunnel_id.clone());
        }
        self.records.insert(tunnel_id.clone(), entry);

        info!(
            "opened tunnel {tunnel_id} ({protocol}) as '{}' for {user_id}",
            allocated.subdomain
        );
        Ok(OpenGrant {
            tunnel_id,
            subdomain: allocated.subdomain.clone(),
            custom_hostname,
            port,
            public_url: self.public_url(protocol, &allocated.subdomain, port),
            resumed: allocated.resumed,
        })
    }

    /// Atomic re-attach of a known tunnel id within the grace window.
    /// Falls back to the persisted claim when the in-memory record is gone
    /// (edge restart), preserving the subdomain but not the port.
    pub async fn resume(&self, user_id: &str, tunnel_id: &str) -> Result<OpenGrant> {
        if let Some(entry) = self.records.get(tunnel_id).map(|e| e.value().clone()) {
            if entry.user_id != user_id {
                return Err(Error::TunnelNotFound);
            }
            let state = entry.state.lock().await;
            if state.lifecycle == TunnelState::Draining {
                return Err(Error::Refused);
            }
            drop(state);
            return Ok(OpenGrant {
                tunnel_id: entry.id.clone(),
                subdomain: entry.subdomain.clone(),
                custom_hostname: entry.custom_hostname.clone(),
                port: entry.port,
                public_url: self.public_url(entry.protocol, &entry.subdomain, entry.port),
                resumed: true,
            });
        }

        // Record reaped or edge restarted: fall back to the durable claim.
        let subdomain = self.allocator.resume(user_id, tunnel_id).await?;
        let claims = self.allocator.claims_for_user(user_id).await;
        let protocol = claims
            .iter()
            .find(|(label, _)| label == &subdomain)
            .map(|(_, claim)| claim.protocol)
            .ok_or(Error::TunnelNotFound)?;

        let port = if protocol.is_stream() {
            Some(self.lease_port()?)
        } else {
            None
        };
        let entry = Arc::new(TunnelEntry {
            id: tunnel_id.to_string(),
            user_id: user_id.to_string(),
            protocol,
            subdomain: subdomain.clone(),
            custom_hostname: None,
            port,
            created_at: Utc::now(),
            requests: AtomicU64::new(0),
            last_active_unix: AtomicI64::new(Utc::now().timestamp()),
            state: Mutex::new(MutableState {
                lifecycle: TunnelState::Allocating,
                local_target: String::new(),
                channel: None,
                active_since: None,
                detached_at: Some(Instant::now()),
            }),
        });
        self.by_subdomain
            .insert(subdomain.clone(), tunnel_id.to_string());
        if let Some(port) = port {
            self.by_port.insert(port, tunnel_id.to_string());
        }
        self.records.insert(tunnel_id.to_string(), entry);

        Ok(OpenGrant {
            tunnel_id: tunnel_id.to_string(),
            subdomain: subdomain.clone(),
            custom_hostname: None,
            port,
            public_url: self.public_url(protocol, &subdomain, port),
            resumed: true,
        })
    }

    /// Attach a control channel; `allocating → active`. If a previous
    /// channel is still believed live, it is told to shut down and given
    /// one heartbeat interval before being forcibly detached.
    pub async fn attach(
        &self,
        tunnel_id: &str,
        channel: ChannelHandle,
        local_target: String,
    ) -> Result<OpenGrant> {
        let entry = self
            .records
            .get(tunnel_id)
            .map(|e| e.value().clone())
            .ok_or(Error::TunnelNotFound)?;

        let previous = {
            let mut state = entry.state.lock().await;
            match state.lifecycle {
                TunnelState::Draining => return Err(Error::Refused),
                TunnelState::Active => state.channel.take(),
                TunnelState::Allocating | TunnelState::Inactive => None,
            }
        };

        if let Some(old) = previous {
            // Split-brain guard: ask the old channel to leave, then force.
            old.try_send(Frame::Shutdown(Shutdown {
                reason: "superseded by a new connection".into(),
            }))
            .ok();
            if tokio::time::timeout(self.config.heartbeat_interval, old.closed())
                .await
                .is_err()
            {
                warn!("previous channel for {tunnel_id} unresponsive, forcing detach");
            }
            old.abort(&Error::TunnelDisconnected);
        }

        let mut state = entry.state.lock().await;
        if state.lifecycle == TunnelState::Draining {
            return Err(Error::Refused);
        }
        state.lifecycle = TunnelState::Active;
        state.local_target = local_target;
        state.channel = Some(channel.clone());
        state.active_since = Some(Utc::now());
        state.detached_at = None;
        drop(state);

        self.active_channels
            .insert(tunnel_id.to_string(), channel);
        entry
            .last_active_unix
            .store(Utc::now().timestamp(), Ordering::Relaxed);

        info!("tunnel {tunnel_id} active as '{}'", entry.subdomain);
        Ok(OpenGrant {
            tunnel_id: entry.id.clone(),
            subdomain: entry.subdomain.clone(),
            custom_hostname: entry.custom_hostname.clone(),
            port: entry.port,
            public_url: self.public_url(entry.protocol, &entry.subdomain, entry.port),
            resumed: false,
        })
    }

    /// `active → inactive`: fail in-flight work, start the grace timer.
    /// A stale channel (superseded by a newer attach) is a no-op.
    pub async fn detach(&self, tunnel_id: &str, channel_id: u64, reason: &str) {
        let Some(entry) = self.records.get(tunnel_id).map(|e| e.value().clone()) else {
            return;
        };
        let mut state = entry.state.lock().await;
        if state.channel.as_ref().map(|c| c.channel_id()) != Some(channel_id) {
            return;
        }
        let Some(channel) = state.channel.take() else {
            return;
        };
        state.lifecycle = TunnelState::Inactive;
        state.active_since = None;
        state.detached_at = Some(Instant::now());
        drop(state);

        self.active_channels.remove(tunnel_id);
        channel.abort(&Error::TunnelDisconnected);
        if let Err(e) = self.allocator.touch(&entry.subdomain).await {
            warn!("failed to stamp claim '{}': {e}", entry.subdomain);
        }
        info!("tunnel {tunnel_id} detached ({reason})");
    }

    /// Explicit user teardown: immediate release of subdomain and port.
    pub async fn close(&self, user_id: &str, tunnel_id: &str) -> Result<()> {
        let entry = self
            .records
            .get(tunnel_id)
            .map(|e| e.value().clone())
            .ok_or(Error::TunnelNotFound)?;
        if entry.user_id != user_id {
            return Err(Error::TunnelNotFound);
        }

        let channel = {
            let mut state = entry.state.lock().await;
            state.lifecycle = TunnelState::Draining;
            state.channel.take()
        };
        if let Some(channel) = channel {
            channel
                .try_send(Frame::Shutdown(Shutdown {
                    reason: "tunnel closed".into(),
                }))
                .ok();
            channel.abort(&Error::TunnelDisconnected);
        }

        self.active_channels.remove(tunnel_id);
        self.by_subdomain.remove(&entry.subdomain);
        if let Some(port) = entry.port {
            self.by_port.remove(&port);
            self.release_port(port);
        }
        self.allocator.release(&entry.subdomain).await?;
        self.domains.unbind_tunnel(tunnel_id).await;
        self.records.remove(tunnel_id);
        info!("tunnel {tunnel_id} closed by {user_id}");
        Ok(())
    }

    /// Ingress fast path: subdomain label → active route.
    pub fn route_by_subdomain(&self, label: &str) -> Result<ActiveRoute> {
        let tunnel_id = self
            .by_subdomain
            .get(label)
            .map(|e| e.value().clone())
            .ok_or(Error::TunnelNotFound)?;
        self.route_by_tunnel(&tunnel_id)
    }

    /// Ingress fast path: custom hostname → active route.
    pub fn route_by_hostname(&self, hostname: &str) -> Result<ActiveRoute> {
        let tunnel_id = self
            .domains
            .lookup_host(hostname)
            .ok_or(Error::TunnelNotFound)?;
        self.route_by_tunnel(&tunnel_id)
    }

    /// Ingress fast path: leased port → active route.
    pub fn route_by_port(&self, port: u16) -> Result<ActiveRoute> {
        let tunnel_id = self
            .by_port
            .get(&port)
            .map(|e| e.value().clone())
            .ok_or(Error::TunnelNotFound)?;
        self.route_by_tunnel(&tunnel_id)
    }

    pub fn route_by_tunnel(&self, tunnel_id: &str) -> Result<ActiveRoute> {
        match self.active_channels.get(tunnel_id) {
            Some(channel) => Ok(ActiveRoute {
                tunnel_id: tunnel_id.to_string(),
                channel: channel.value().clone(),
            }),
            None if self.records.contains_key(tunnel_id) => Err(Error::TunnelInactive),
            None => Err(Error::TunnelNotFound),
        }
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<TunnelEntry>> {
        self.records.get(tunnel_id).map(|e| e.value().clone())
    }

    /// Stamp traffic on a tunnel; bumps the monotonic request counter.
    pub fn note_request(&self, tunnel_id: &str) {
        if let Some(entry) = self.records.get(tunnel_id) {
            entry.requests.fetch_add(1, Ordering::Relaxed);
            entry
                .last_active_unix
                .store(Utc::now().timestamp(), Ordering::Relaxed);
        }
    }

    pub async fn snapshot(&self, entry: &TunnelEntry) -> TunnelSnapshot {
        let state = entry.state.lock().await;
        TunnelSnapshot {
            id: entry.id.clone(),
            protocol: entry.protocol,
            subdomain: entry.subdomain.clone(),
            custom_hostname: entry.custom_hostname.clone(),
            port: entry.port,
            state: state.lifecycle,
            local_target: state.local_target.clone(),
            created_at: entry.created_at,
            active_since: state.active_since,
            last_active: DateTime::from_timestamp(
                entry.last_active_unix.load(Ordering::Relaxed),
                0,
            )
            .unwrap_or(entry.created_at),
            requests: entry.requests.load(Ordering::Relaxed),
        }
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<TunnelSnapshot> {
        let entries: Vec<Arc<TunnelEntry>> = self
            .records
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(self.snapshot(&entry).await);
        }
        out
    }

    /// Release records whose grace window has elapsed. Ports return to the
    /// pool; durable claims stay (availability to other users is governed
    /// by the claim's own timestamps).
    pub async fn reap_expired(&self) {
        let grace = self.config.grace_window;
        let candidates: Vec<Arc<TunnelEntry>> =
            self.records.iter().map(|e| e.value().clone()).collect();
        for entry in candidates {
            let expired = {
                let state = entry.state.lock().await;
                state.lifecycle != TunnelState::Active
                    && state
                        .detached_at
                        .map(|at| at.elapsed() >= grace)
                        .unwrap_or(false)
            };
            if !expired {
                continue;
            }
            debug!("reaping tunnel {} after grace window", entry.id);
            self.by_subdomain.remove(&entry.subdomain);
            if let Some(port) = entry.port {
                self.by_port.remove(&port);
                self.release_port(port);
            }
            self.records.remove(&entry.id);
        }
    }

    /// Spawn the periodic grace reaper.
    pub fn start_reaper(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let period = (self.config.grace_window / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                registry.reap_expired().await;
            }
        });
    }

    fn lease_port(&self) -> Result<u16> {
        self.ports.lock().expect("port pool poisoned").lease()
    }

    fn release_port(&self, port: u16) {
        self.ports.lock().expect("port pool poisoned").release(port);
    }

    async fn rollback_claim(&self, subdomain: &str, resumed: bool) {
        // A pre-existing claim survives the failed open; a fresh one rolls
        // back so the name is not burned.
        if !resumed {
            if let Err(e) = self.allocator.release(subdomain).await {
                warn!("rollback of claim '{subdomain}' failed: {e}");
            }
        }
    }

    async fn bind_hostname(&self, user_id: &str, hostname: &str, tunnel_id: &str) -> Result<String> {
        let normalized = crate::domains::normalize_host(hostname);
        let owned = self
            .domains
            .list_for_user(user_id)
            .await
            .into_iter()
            .find(|d| d.hostname == normalized)
            .ok_or_else(|| Error::CustomDomainConflict(normalized.clone()))?;
        self.domains.assign(user_id, &owned.id, tunnel_id).await?;
        Ok(normalized)
    }

    fn public_url(&self, protocol: Protocol, subdomain: &str, port: Option<u16>) -> String {
        match (protocol, port) {
            (Protocol::Http, _) => self.config.public_http_url(subdomain),
            (proto, Some(port)) => self.config.public_stream_url(proto.as_str(), port),
            (proto, None) => self.config.public_stream_url(proto.as_str(), 0),
        }
    }
}
