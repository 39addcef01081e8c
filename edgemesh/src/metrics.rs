//! Prometheus instrumentation.
//!
//! # Metrics
//!
//! ## Counters
//! - `edgemesh_events_total` - lifecycle events by type
//! - `edgemesh_requests_total` - requests by caller surface
//!
//! ## Gauges
//! - `edgemesh_tasks` - tasks by status
//! - `edgemesh_dlq_depth` - dead-letter queue depth
//! - `edgemesh_nodes` - nodes by freshness state
//!
//! ## Histograms
//! - `edgemesh_claim_latency_seconds` - enqueue-to-claim latency
//!
//! Gauges are refreshed from a store snapshot at render time; counters
//! and the histogram are fed by the runtime's event observer.

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};

use crate::events::{Event, EventKind};
use crate::node::NodeView;
use crate::task::Task;

/// Instance-scoped metrics for one control plane.
pub struct MeshMetrics {
    registry: Registry,
    events_total: IntCounterVec,
    requests_total: IntCounterVec,
    tasks: IntGaugeVec,
    dlq_depth: IntGauge,
    nodes: IntGaugeVec,
    claim_latency: Histogram,
}

impl MeshMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_total = IntCounterVec::new(
            Opts::new("edgemesh_events_total", "Lifecycle events by type"),
            &["type"],
        )
        .expect("edgemesh_events_total metric creation failed");

        let requests_total = IntCounterVec::new(
            Opts::new("edgemesh_requests_total", "Requests by caller surface"),
            &["surface"],
        )
        .expect("edgemesh_requests_total metric creation failed");

        let tasks = IntGaugeVec::new(
            Opts::new("edgemesh_tasks", "Tasks by status"),
            &["status"],
        )
        .expect("edgemesh_tasks metric creation failed");

        let dlq_depth = IntGauge::new("edgemesh_dlq_depth", "Dead-letter queue depth")
            .expect("edgemesh_dlq_depth metric creation failed");

        let nodes = IntGaugeVec::new(
            Opts::new("edgemesh_nodes", "Nodes by freshness state"),
            &["freshness"],
        )
        .expect("edgemesh_nodes metric creation failed");

        let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
        let claim_latency = Histogram::with_opts(
            HistogramOpts::new(
                "edgemesh_claim_latency_seconds",
                "Enqueue-to-claim latency in seconds",
            )
            .buckets(buckets),
        )
        .expect("edgemesh_claim_latency_seconds metric creation failed");

        for collector in [
            Box::new(events_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(requests_total.clone()),
            Box::new(tasks.clone()),
            Box::new(dlq_depth.clone()),
            Box::new(nodes.clone()),
            Box::new(claim_latency.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registration failed");
        }

        Self {
            registry,
            events_total,
            requests_total,
            tasks,
            dlq_depth,
            nodes,
            claim_latency,
        }
    }

    /// Record one lifecycle event. Claimed events also feed the latency
    /// histogram from their `latency_ms` detail.
    pub fn observe_event(&self, event: &Event) {
        self.events_total
            .with_label_values(&[event.kind.as_str()])
            .inc();
        if event.kind == EventKind::TaskClaimed {
            if let Some(latency_ms) = event.detail.get("latency_ms").and_then(|v| v.as_i64()) {
                self.claim_latency.observe(latency_ms as f64 / 1000.0);
            }
        }
    }

    /// Record one request against a named surface (e.g. `task.submit`).
    pub fn record_request(&self, surface: &str) {
        self.requests_total.with_label_values(&[surface]).inc();
    }

    /// Refresh the state gauges from store snapshots.
    pub fn refresh(&self, tasks: &[Task], nodes: &[NodeView], dlq_depth: usize) {
        for status in ["queued", "claimed", "running", "done", "failed", "cancelled"] {
            let count = tasks.iter().filter(|t| t.status.as_str() == status).count();
            self.tasks.with_label_values(&[status]).set(count as i64);
        }
        for freshness in ["healthy", "degraded", "offline"] {
            let count = nodes
                .iter()
                .filter(|n| n.freshness.as_str() == freshness)
                .count();
            self.nodes
                .with_label_values(&[freshness])
                .set(count as i64);
        }
        self.dlq_depth.set(dlq_depth as i64);
    }

    /// Render everything in the Prometheus text format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .map_err(Into::into)
    }
}

impl Default for MeshMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MeshMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn events_and_requests_show_up_in_render() {
        let metrics = MeshMetrics::new();
        metrics.observe_event(&Event::task(
            EventKind::TaskEnqueued,
            Utc::now(),
            TaskId::from("t1"),
        ));
        metrics.record_request("task.submit");

        let output = metrics.render().expect("render");
        assert!(output.contains("edgemesh_events_total"));
        assert!(output.contains("task.enqueued"));
        assert!(output.contains("edgemesh_requests_total"));
    }

    #[test]
    fn claimed_event_feeds_the_latency_histogram() {
        let metrics = MeshMetrics::new();
        let event = Event::task(EventKind::TaskClaimed, Utc::now(), TaskId::from("t1"))
            .with_detail(json!({"attempt": 1, "latency_ms": 250}));
        metrics.observe_event(&event);

        let output = metrics.render().expect("render");
        assert!(output.contains("edgemesh_claim_latency_seconds_count 1"));
    }

    #[test]
    fn refresh_sets_gauges() {
        let metrics = MeshMetrics::new();
        metrics.refresh(&[], &[], 3);
        let output = metrics.render().expect("render");
        assert!(output.contains("edgemesh_dlq_depth 3"));
    }
}
