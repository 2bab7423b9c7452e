//! Dispatch metrics.
//!
//! Write-only sink for the dispatcher: two global counters, three
//! per-backend counter families and a per-backend latency histogram.
//! Everything is atomics behind a `DashMap`, rendered on demand into
//! Prometheus text exposition format for the `/metrics` endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// Upper bounds of the default Prometheus latency buckets, in seconds.
const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Default)]
struct LatencyHistogram {
    // One counter per finite bucket; observations above the last bound
    // only land in count/sum (the +Inf bucket is rendered from count).
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    fn observe(&self, seconds: f64) {
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct NodeMetrics {
    requests: AtomicU64,
    rate_limit_hits: AtomicU64,
    errors: AtomicU64,
    latency: LatencyHistogram,
}

/// Counters and histograms recorded by the dispatch path.
#[derive(Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    total_rate_limit_hits: AtomicU64,
    per_node: DashMap<String, NodeMetrics>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_total_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_total_rate_limit_hits(&self) {
        self.total_rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_node_requests(&self, node: &str) {
        self.node(node).requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_node_rate_limit_hits(&self, node: &str) {
        self.node(node)
            .rate_limit_hits
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_node_errors(&self, node: &str) {
        self.node(node).errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, node: &str, elapsed: Duration) {
        self.node(node).latency.observe(elapsed.as_secs_f64());
    }

    fn node(&self, node: &str) -> dashmap::mapref::one::Ref<'_, String, NodeMetrics> {
        if let Some(entry) = self.per_node.get(node) {
            return entry;
        }
        self.per_node
            .entry(node.to_string())
            .or_default()
            .downgrade()
    }

    /// Render all series in Prometheus text exposition format. Series are
    /// emitted in sorted label order so the output is deterministic.
    pub fn render(&self) -> String {
        use std::fmt::Write;

        let mut output = String::with_capacity(4096);

        output.push_str("# HELP total_requests Total number of requests received\n");
        output.push_str("# TYPE total_requests counter\n");
        let _ = writeln!(
            output,
            "total_requests {}",
            self.total_requests.load(Ordering::Relaxed)
        );

        output.push_str(
            "# HELP total_rate_limit_hits Requests rejected after exhausting all dispatch attempts\n",
        );
        output.push_str("# TYPE total_rate_limit_hits counter\n");
        let _ = writeln!(
            output,
            "total_rate_limit_hits {}",
            self.total_rate_limit_hits.load(Ordering::Relaxed)
        );

        let mut nodes: Vec<String> = self.per_node.iter().map(|e| e.key().clone()).collect();
        nodes.sort_unstable();

        output.push_str("# HELP per_node_requests Requests dispatched to each backend\n");
        output.push_str("# TYPE per_node_requests counter\n");
        for node in &nodes {
            if let Some(m) = self.per_node.get(node) {
                let _ = writeln!(
                    output,
                    "per_node_requests{{node=\"{node}\"}} {}",
                    m.requests.load(Ordering::Relaxed)
                );
            }
        }

        output.push_str("# HELP rate_limit_hits Admissions denied per backend\n");
        output.push_str("# TYPE rate_limit_hits counter\n");
        for node in &nodes {
            if let Some(m) = self.per_node.get(node) {
                let _ = writeln!(
                    output,
                    "rate_limit_hits{{node=\"{node}\"}} {}",
                    m.rate_limit_hits.load(Ordering::Relaxed)
                );
            }
        }

        output.push_str("# HELP node_errors Transport errors per backend\n");
        output.push_str("# TYPE node_errors counter\n");
        for node in &nodes {
            if let Some(m) = self.per_node.get(node) {
                let _ = writeln!(
                    output,
                    "node_errors{{node=\"{node}\"}} {}",
                    m.errors.load(Ordering::Relaxed)
                );
            }
        }

        output.push_str("# HELP request_latency_seconds Latency of dispatched requests\n");
        output.push_str("# TYPE request_latency_seconds histogram\n");
        for node in &nodes {
            let Some(m) = self.per_node.get(node) else {
                continue;
            };
            let mut cumulative = 0u64;
            for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
                cumulative += m.latency.buckets[i].load(Ordering::Relaxed);
                let _ = writeln!(
                    output,
                    "request_latency_seconds_bucket{{node=\"{node}\",le=\"{bound}\"}} {cumulative}"
                );
            }
            let count = m.latency.count.load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "request_latency_seconds_bucket{{node=\"{node}\",le=\"+Inf\"}} {count}"
            );
            let sum = m.latency.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            let _ = writeln!(output, "request_latency_seconds_sum{{node=\"{node}\"}} {sum}");
            let _ = writeln!(
                output,
                "request_latency_seconds_count{{node=\"{node}\"}} {count}"
            );
        }

        output
    }
}
