//! Edge configuration from environment variables.

use anyhow::{bail, Context, Result};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Immutable after boot; shared across all components.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Base domain that subdomain tunnels hang off, e.g. "example.com".
    pub base_domain: String,
    /// Public HTTP(S) ingress port.
    pub public_port: u16,
    /// Port pool for TCP/TLS/UDP tunnels.
    pub port_range: RangeInclusive<u16>,
    /// Keys the token-hash index of the identity gate.
    pub jwt_secret: String,
    /// SQLite database URL, e.g. "sqlite://uniroute.db".
    pub database_url: String,
    /// Advertised base URL for public tunnel endpoints.
    pub website_url: String,
    /// Subdomain/port reservation window after a channel drop.
    pub grace_window: Duration,
    /// Deadline for a proxied HTTP request.
    pub request_timeout: Duration,
    /// Control-channel ping cadence; two misses tear the channel down.
    pub heartbeat_interval: Duration,
    /// Soft-state lifetime of an idle UDP session.
    pub udp_idle_timeout: Duration,
    /// Webhook recorder body capture cap, per side.
    pub capture_max_bytes: usize,
    /// Largest request body accepted on public HTTP ingress.
    pub max_body_bytes: usize,
    /// In-flight request cap per tunnel.
    pub per_tunnel_inflight: usize,
    /// Bound of each control channel's outbound frame queue.
    pub outbound_queue: usize,
    /// Captured exchanges kept per tunnel.
    pub capture_ring_size: usize,
    /// Wildcard certificate for the TLS stream ingress and HTTPS, if any.
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl EdgeConfig {
    pub fn from_env() -> Result<Self> {
        let base_domain = std::env::var("TUNNEL_BASE_DOMAIN")
            .context("TUNNEL_BASE_DOMAIN is required")?
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if base_domain.is_empty() {
            bail!("TUNNEL_BASE_DOMAIN must not be empty");
        }

        let public_port = env_parse("PORT", 8080u16)?;
        let port_range = parse_port_range(
            &std::env::var("TUNNEL_TCP_PORT_RANGE").unwrap_or_else(|_| "20000-20100".into()),
        )?;
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET is required")?;
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://uniroute.db".into());
        let website_url =
            std::env::var("WEBSITE_URL").unwrap_or_else(|_| format!("https://{base_domain}"));

        Ok(Self {
            base_domain,
            public_port,
            port_range,
            jwt_secret,
            database_url,
            website_url,
            grace_window: Duration::from_secs(env_parse("TUNNEL_GRACE_SECS", 60u64)?),
            request_timeout: Duration::from_secs(env_parse("TUNNEL_REQUEST_TIMEOUT_SECS", 30u64)?),
            heartbeat_interval: Duration::from_secs(env_parse("TUNNEL_HEARTBEAT_SECS", 15u64)?),
            udp_idle_timeout: Duration::from_secs(env_parse("TUNNEL_UDP_IDLE_SECS", 60u64)?),
            capture_max_bytes: env_parse("TUNNEL_CAPTURE_BYTES", 64 * 1024usize)?,
            max_body_bytes: env_parse("TUNNEL_MAX_BODY_BYTES", 16 * 1024 * 1024usize)?,
            per_tunnel_inflight: env_parse("TUNNEL_INFLIGHT_CAP", 64usize)?,
            outbound_queue: env_parse("TUNNEL_OUTBOUND_QUEUE", 256usize)?,
            capture_ring_size: env_parse("TUNNEL_CAPTURE_RING", 500usize)?,
            tls_cert_path: std::env::var("TUNNEL_TLS_CERT").ok().map(PathBuf::from),
            tls_key_path: std::env::var("TUNNEL_TLS_KEY").ok().map(PathBuf::from),
        })
    }

    /// Public URL for a subdomain tunnel.
    pub fn public_http_url(&self, subdomain: &str) -> String {
        format!("https://{}.{}", subdomain, self.base_domain)
    }

    /// Public URL for a leased stream port.
    pub fn public_stream_url(&self, scheme: &str, port: u16) -> String {
        format!("{}://{}:{}", scheme, self.base_domain, port)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().with_context(|| format!("invalid {key}")),
        Err(_) => Ok(default),
    }
}

fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>> {
    let (lo, hi) = raw
        .split_once('-')
        .with_context(|| format!("TUNNEL_TCP_PORT_RANGE '{raw}' must be LOW-HIGH"))?;
    let lo: u16 = lo.trim().parse().context("invalid range start")?;
    let hi: u16 = hi.trim().parse().context("invalid range end")?;
    if lo > hi {
        bail!("TUNNEL_TCP_PORT_RANGE start {lo} exceeds end {hi}");
    }
    Ok(lo..=hi)
}
