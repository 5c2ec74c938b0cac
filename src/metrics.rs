#![forbid(unsafe_code)]

// Server metrics - lock-free AtomicU64 counters and a Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram bucket upper bounds, in microseconds.
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,
    5_000,
    10_000,
    25_000,
    50_000,
    100_000,
    250_000,
    500_000,
    1_000_000,
    5_000_000,
];

const BUCKET_LABELS: [&str; 10] = [
    "0.001", "0.005", "0.01", "0.025", "0.05", "0.1", "0.25", "0.5", "1", "5",
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Counters {
    connections_total: AtomicU64,
    requests_total: AtomicU64,
    requests_failed_total: AtomicU64,
    rate_limited_total: AtomicU64,
    malformed_frames_total: AtomicU64,
    joins_total: AtomicU64,
    transports_created_total: AtomicU64,
    producers_created_total: AtomicU64,
    disconnects_total: AtomicU64,
}

struct Inner {
    counters: Counters,
    connections_active: AtomicU64,
    request_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: Counters::default(),
                connections_active: AtomicU64::new(0),
                request_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.counters.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_requests(&self) {
        self.inner.counters.requests_total.fetch_add(1, Relaxed);
    }

    pub fn inc_requests_failed(&self) {
        self.inner.counters.requests_failed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.inner.counters.rate_limited_total.fetch_add(1, Relaxed);
    }

    pub fn inc_malformed_frames(&self) {
        self.inner.counters.malformed_frames_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.counters.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_transports_created(&self) {
        self.inner.counters.transports_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.counters.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_disconnects(&self) {
        self.inner.counters.disconnects_total.fetch_add(1, Relaxed);
    }

    /// Increments connections_active and returns a guard that decrements it on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    pub fn observe_request_handling(&self, duration: Duration) {
        self.inner.request_handling.observe(duration);
    }

    /// Renders every metric in Prometheus text exposition format.
    /// The remaining arguments are sampled from the session table by the caller.
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize, resources_released: usize) -> String {
        let mut out = String::with_capacity(4096);
        let c = &self.inner.counters;

        render_counter(&mut out, "sendpath_connections_total", "Total WebSocket connections", c.connections_total.load(Relaxed));
        render_counter(&mut out, "sendpath_requests_total", "Total requests acknowledged", c.requests_total.load(Relaxed));
        render_counter(&mut out, "sendpath_requests_failed_total", "Total failure acknowledgements", c.requests_failed_total.load(Relaxed));
        render_counter(&mut out, "sendpath_rate_limited_total", "Total requests rejected by the rate limiter", c.rate_limited_total.load(Relaxed));
        render_counter(&mut out, "sendpath_malformed_frames_total", "Total frames without a usable request id", c.malformed_frames_total.load(Relaxed));
        render_counter(&mut out, "sendpath_joins_total", "Total room joins", c.joins_total.load(Relaxed));
        render_counter(&mut out, "sendpath_transports_created_total", "Total send transports created", c.transports_created_total.load(Relaxed));
        render_counter(&mut out, "sendpath_producers_created_total", "Total producers created", c.producers_created_total.load(Relaxed));
        render_counter(&mut out, "sendpath_disconnects_total", "Total peer disconnects", c.disconnects_total.load(Relaxed));
        render_counter(&mut out, "sendpath_resources_released_total", "Total transports and producers closed", resources_released as u64);

        render_gauge(&mut out, "sendpath_connections_active", "Currently active WebSocket connections", self.connections_active());
        render_gauge(&mut out, "sendpath_rooms_active", "Currently active rooms", rooms_active as u64);
        render_gauge(&mut out, "sendpath_peers_active", "Currently live peer sessions", peers_active as u64);

        self.inner.request_handling.render(
            "sendpath_request_handling_seconds",
            "Request handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop, even if the connection task panics.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
