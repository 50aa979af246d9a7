//! Webhook recorder: bounded per-tunnel rings of captured exchanges.
//!
//! Every completed HTTP exchange (success or error) is appended, newest
//! first. Bodies are truncated to the configured cap. Purely in-memory;
//! restart clears it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uniroute_shared::frame::Headers;

/// One captured request/response pair.
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub query: String,
    pub status: u16,
    pub latency_ms: u64,
    pub request_size: u64,
    pub response_size: u64,
    pub remote_addr: String,
    pub req_headers: Headers,
    pub resp_headers: Headers,
    pub req_body: Bytes,
    pub req_body_truncated: bool,
    pub resp_body: Bytes,
    pub resp_body_truncated: bool,
    pub created_at: DateTime<Utc>,
}

/// List filters for the control-plane API.
#[derive(Debug, Clone, Default)]
pub struct ExchangeFilter {
    pub method: Option<String>,
    /// 2–5 selects the status class (2xx … 5xx).
    pub status_class: Option<u16>,
    pub path_prefix: Option<String>,
    pub limit: Option<usize>,
}

pub struct WebhookRecorder {
    rings: DashMap<String, Mutex<VecDeque<Arc<CapturedExchange>>>>,
    ring_size: usize,
    capture_max: usize,
}

impl WebhookRecorder {
    pub fn new(ring_size: usize, capture_max: usize) -> Self {
        Self {
            rings: DashMap::new(),
            ring_size,
            capture_max,
        }
    }

    /// Body-capture cap per side, for callers building exchanges.
    pub fn capture_max(&self) -> usize {
        self.capture_max
    }

    /// Truncate a body to the capture cap; returns (kept, truncated).
    pub fn clamp_body(&self, body: &Bytes) -> (Bytes, bool) {
        if body.len() > self.capture_max {
            (body.slice(..self.capture_max), true)
        } else {
            (body.clone(), false)
        }
    }

    pub fn record(&self, tunnel_id: &str, exchange: CapturedExchange) {
        let ring = self
            .rings
            .entry(tunnel_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::with_capacity(self.ring_size)));
        let mut ring = ring.lock().expect("recorder ring poisoned");
        if ring.len() >= self.ring_size {
            ring.pop_back();
        }
        ring.push_front(Arc::new(exchange));
    }

    pub fn list(&self, tunnel_id: &str, filter: &ExchangeFilter) -> Vec<Arc<CapturedExchange>> {
        let Some(ring) = self.rings.get(tunnel_id) else {
            return Vec::new();
        };
        let ring = ring.lock().expect("recorder ring poisoned");
        let limit = filter.limit.unwrap_or(100);
        ring.iter()
            .filter(|e| matches_filter(e, filter))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, tunnel_id: &str, request_id: &str) -> Option<Arc<CapturedExchange>> {
        let ring = self.rings.get(tunnel_id)?;
        let ring = ring.lock().expect("recorder ring poisoned");
        ring.iter().find(|e| e.request_id == request_id).cloned()
    }

    /// Drop a tunnel's ring (explicit tunnel close).
    pub fn forget(&self, tunnel_id: &str) {
        self.rings.remove(tunnel_id);
    }
}

fn matches_filter(exchange: &CapturedExchange, filter: &ExchangeFilter) -> bool {
    if let Some(method) = &filter.method {
        if !exchange.method.eq_ignore_ascii_case(method) {
            return false;
        }
    }
    if let Some(class) = filter.status_class {
        if u16::from(exchange.status / 100) != class {
            return false;
        }
    }
    if let Some(prefix) = &filter.path_prefix {
        if !exchange.path.starts_with(prefix.as_str()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(request_id: &str, method: &str, path: &str, status: u16) -> CapturedExchange {
        CapturedExchange {
            request_id: request_id.into(),
            method: method.into(),
            path: path.into(),
            query: String::new(),
            status,
            latency_ms: 3,
            request_size: 0,
            response_size: 5,
            remote_addr: "1.2.3.4:5555".into(),
            req_headers: vec![],
            resp_headers: vec![],
            req_body: Bytes::new(),
            req_body_truncated: false,
            resp_body: Bytes::from_static(b"hello"),
            resp_body_truncated: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let recorder = WebhookRecorder::new(3, 1024);
        for i in 0..5 {
            recorder.record("t1", exchange(&format!("r{i}"), "GET", "/", 200));
        }
        let entries = recorder.list("t1", &ExchangeFilter::default());
        assert_eq!(entries.len(), 3);
        // Newest first; r0 and r1 were evicted.
        assert_eq!(entries[0].request_id, "r4");
        assert!(recorder.get("t1", "r0").is_none());
        assert!(recorder.get("t1", "r4").is_some());
    }

    #[test]
    fn test_rings_are_per_tunnel() {
        let recorder = WebhookRecorder::new(10, 1024);
        recorder.record("t1", exchange("r1", "GET", "/", 200));
        recorder.record("t2", exchange("r2", "GET", "/", 200));
        assert_eq!(recorder.list("t1", &ExchangeFilter::default()).len(), 1);
        assert!(recorder.get("t2", "r1").is_none());
    }

    #[test]
    fn test_filters() {
        let recorder = WebhookRecorder::new(10, 1024);
        recorder.record("t1", exchange("r1", "GET", "/api/a", 200));
        recorder.record("t1", exchange("r2", "POST", "/api/b", 500));
        recorder.record("t1", exchange("r3", "GET", "/other", 404));

        let gets = recorder.list(
            "t1",
            &ExchangeFilter {
                method: Some("get".into()),
                ..Default::default()
            },
        );
        assert_eq!(gets.len(), 2);

        let errors = recorder.list(
            "t1",
            &ExchangeFilter {
                status_class: Some(5),
                ..Default::default()
            },
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].request_id, "r2");

        let api = recorder.list(
            "t1",
            &ExchangeFilter {
                path_prefix: Some("/api".into()),
                ..Default::default()
            },
        );
        assert_eq!(api.len(), 2);
    }

    #[test]
    fn test_body_clamp() {
        let recorder = WebhookRecorder::new(10, 4);
        let (kept, truncated) = recorder.clamp_body(&Bytes::from_static(b"0123456789"));
        assert_eq!(kept, Bytes::from_static(b"0123"));
        assert!(truncated);
        let (kept, truncated) = recorder.clamp_body(&Bytes::from_static(b"ok"));
        assert_eq!(kept, Bytes::from_static(b"ok"));
        assert!(!truncated);
    }

    #[test]
    fn test_forget_clears_ring() {
        let recorder = WebhookRecorder::new(10, 1024);
        recorder.record("t1", exchange("r1", "GET", "/", 200));
        recorder.forget("t1");
        assert!(recorder.list("t1", &ExchangeFilter::default()).is_empty());
    }
}
