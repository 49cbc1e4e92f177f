//! Prometheus metrics (§6 "Metrics"): request counts, batch size, tokens
//! generated, and per-hop latency, registered once at `AppState` construction.

use prometheus::{Histogram, IntCounter, IntGauge};

pub struct CoordinatorMetrics {
    pub requests_total: IntCounter,
    pub requests_active: IntGauge,
    pub tokens_generated_total: IntCounter,
    pub batch_size: IntGauge,
    pub hop_latency_seconds: Histogram,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: prometheus::register_int_counter!(
                "rt_coordinator_requests_total",
                "Total completions admitted"
            )
            .expect("counter"),
            requests_active: prometheus::register_int_gauge!(
                "rt_coordinator_requests_active",
                "Requests not yet stopped"
            )
            .expect("gauge"),
            tokens_generated_total: prometheus::register_int_counter!(
                "rt_coordinator_tokens_generated_total",
                "Total sampled tokens across all requests"
            )
            .expect("counter"),
            batch_size: prometheus::register_int_gauge!("rt_coordinator_batch_size", "Last packed batch size")
                .expect("gauge"),
            hop_latency_seconds: prometheus::register_histogram!(
                "rt_coordinator_hop_latency_seconds",
                "Latency of a single worker hop RPC"
            )
            .expect("histogram"),
        }
    }
}

impl Default for CoordinatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
