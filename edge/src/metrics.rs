//! Edge metrics: atomic counters, a latency ring, and Prometheus text.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Edge-wide metrics handle.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    total_requests: AtomicU64,
    active_tunnels: AtomicU64,
    active_streams: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latencies: Mutex<LatencyRing>,
    per_tunnel: Mutex<HashMap<String, TunnelMetrics>>,
}

/// Fixed-size ring of recent latencies for percentile estimates.
struct LatencyRing {
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyRing {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum += latency_us;
    }

    fn percentile(&self, p: f64) -> u64 {
        let filled = self.count.min(self.values.len() as u64) as usize;
        if filled == 0 {
            return 0;
        }
        let mut sorted = self.values[..filled].to_vec();
        sorted.sort_unstable();
        let idx = ((filled as f64 * p / 100.0) as usize).min(filled - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum / self.count
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TunnelMetrics {
    requests: u64,
    errors: u64,
    bytes_in: u64,
    bytes_out: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_requests: AtomicU64::new(0),
                active_tunnels: AtomicU64::new(0),
                active_streams: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                latencies: Mutex::new(LatencyRing::new(10_000)),
                per_tunnel: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn record_request(
        &self,
        subdomain: &str,
        status: u16,
        latency_us: u64,
        bytes_in: u64,
        bytes_out: u64,
    ) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        match status / 100 {
            2 => self.inner.status_2xx.fetch_add(1, Ordering::Relaxed),
            3 => self.inner.status_3xx.fetch_add(1, Ordering::Relaxed),
            4 => self.inner.status_4xx.fetch_add(1, Ordering::Relaxed),
            5 => self.inner.status_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        self.inner
            .latencies
            .lock()
            .expect("latency ring poisoned")
            .record(latency_us);

        let mut per_tunnel = self.inner.per_tunnel.lock().expect("tunnel metrics poisoned");
        let entry = per_tunnel.entry(subdomain.to_string()).or_default();
        entry.requests += 1;
        if status >= 400 {
            entry.errors += 1;
        }
        entry.bytes_in += bytes_in;
        entry.bytes_out += bytes_out;
    }

    pub fn tunnel_opened(&self) {
        self.inner.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        self.inner.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn stream_opened(&self) {
        self.inner.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        self.inner.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn to_prometheus(&self) -> String {
        let (p50, p95, p99, avg) = {
            let lat = self.inner.latencies.lock().expect("latency ring poisoned");
            (
                lat.percentile(50.0),
                lat.percentile(95.0),
                lat.percentile(99.0),
                lat.average(),
            )
        };

        let mut text = format!(
            r#"# HELP uniroute_requests_total Total proxied requests
# TYPE uniroute_requests_total counter
uniroute_requests_total {}

# HELP uniroute_active_tunnels Active tunnel channels
# TYPE uniroute_active_tunnels gauge
uniroute_active_tunnels {}

# HELP uniroute_active_streams Open stream sessions
# TYPE uniroute_active_streams gauge
uniroute_active_streams {}

# HELP uniroute_requests_by_status Requests by HTTP status class
# TYPE uniroute_requests_by_status counter
uniroute_requests_by_status{{status="2xx"}} {}
uniroute_requests_by_status{{status="3xx"}} {}
uniroute_requests_by_status{{status="4xx"}} {}
uniroute_requests_by_status{{status="5xx"}} {}

# HELP uniroute_bytes_total Total bytes transferred
# TYPE uniroute_bytes_total counter
uniroute_bytes_total{{direction="in"}} {}
uniroute_bytes_total{{direction="out"}} {}

# HELP uniroute_latency_us Request latency in microseconds
# TYPE uniroute_latency_us summary
uniroute_latency_us{{quantile="0.5"}} {}
uniroute_latency_us{{quantile="0.95"}} {}
uniroute_latency_us{{quantile="0.99"}} {}
uniroute_latency_us_avg {}
"#,
            self.inner.total_requests.load(Ordering::Relaxed),
            self.inner.active_tunnels.load(Ordering::Relaxed),
            self.inner.active_streams.load(Ordering::Relaxed),
            self.inner.status_2xx.load(Ordering::Relaxed),
            self.inner.status_3xx.load(Ordering::Relaxed),
            self.inner.status_4xx.load(Ordering::Relaxed),
            self.inner.status_5xx.load(Ordering::Relaxed),
            self.inner.bytes_in.load(Ordering::Relaxed),
            self.inner.bytes_out.load(Ordering::Relaxed),
            p50,
            p95,
            p99,
            avg,
        );

        let per_tunnel = self.inner.per_tunnel.lock().expect("tunnel metrics poisoned");
        if !per_tunnel.is_empty() {
            text.push_str("\n# HELP uniroute_tunnel_requests_total Requests per tunnel\n");
            text.push_str("# TYPE uniroute_tunnel_requests_total counter\n");
            for (subdomain, m) in per_tunnel.iter() {
                text.push_str(&format!(
                    "uniroute_tunnel_requests_total{{subdomain=\"{subdomain}\"}} {}\n",
                    m.requests
                ));
                text.push_str(&format!(
                    "uniroute_tunnel_errors_total{{subdomain=\"{subdomain}\"}} {}\n",
                    m.errors
                ));
                text.push_str(&format!(
                    "uniroute_tunnel_bytes_total{{subdomain=\"{subdomain}\",direction=\"in\"}} {}\n",
                    m.bytes_in
                ));
                text.push_str(&format!(
                    "uniroute_tunnel_bytes_total{{subdomain=\"{subdomain}\",direction=\"out\"}} {}\n",
                    m.bytes_out
                ));
            }
        }
        text
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes_counted() {
        let metrics = Metrics::new();
        metrics.record_request("a", 200, 100, 10, 20);
        metrics.record_request("a", 502, 100, 0, 0);
        metrics.record_request("b", 404, 100, 0, 0);

        let text = metrics.to_prometheus();
        assert!(text.contains("uniroute_requests_total 3"));
        assert!(text.contains(r#"uniroute_requests_by_status{status="2xx"} 1"#));
        assert!(text.contains(r#"uniroute_requests_by_status{status="4xx"} 1"#));
        assert!(text.contains(r#"uniroute_requests_by_status{status="5xx"} 1"#));
        assert!(text.contains(r#"uniroute_bytes_total{direction="in"} 10"#));
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = Metrics::new();
        for us in [10, 20, 30, 40, 1000] {
            metrics.record_request("a", 200, us, 0, 0);
        }
        let lat = metrics.inner.latencies.lock().unwrap();
        assert!(lat.percentile(50.0) <= lat.percentile(99.0));
        assert_eq!(lat.average(), (10 + 20 + 30 + 40 + 1000) / 5);
    }
}
