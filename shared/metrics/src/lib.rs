//! Bazaar Metrics - Prometheus metrics for the marketplace client
//!
//! Client-side counters and latencies: backend calls, deployment tracking,
//! traffic allocation and the realtime feed.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Global metric set
static METRICS: OnceLock<BazaarMetrics> = OnceLock::new();

/// Get or initialize the global registry
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Get or initialize the global metric set
pub fn metrics() -> &'static BazaarMetrics {
    METRICS.get_or_init(BazaarMetrics::new)
}

/// Latency buckets for remote calls (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, // 5ms
    0.01,  // 10ms
    0.025, // 25ms
    0.05,  // 50ms
    0.1,   // 100ms
    0.25,  // 250ms
    0.5,   // 500ms
    1.0,   // 1s
    2.5,   // 2.5s
    5.0,   // 5s
    10.0,  // 10s
];

/// Backend call metrics
pub struct BackendMetrics {
    pub requests: IntCounterVec,
    pub failures: IntCounterVec,
    pub latency: HistogramVec,
}

impl BackendMetrics {
    pub fn new(registry: &Registry) -> Self {
        let requests = IntCounterVec::new(
            Opts::new("bazaar_backend_requests_total", "Total backend requests"),
            &["operation", "target"],
        )
        .expect("Failed to create backend_requests metric");

        let failures = IntCounterVec::new(
            Opts::new("bazaar_backend_failures_total", "Failed backend requests"),
            &["operation", "target"],
        )
        .expect("Failed to create backend_failures metric");

        let latency = HistogramVec::new(
            HistogramOpts::new("bazaar_backend_latency_seconds", "Backend request latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["operation"],
        )
        .expect("Failed to create backend_latency metric");

        registry.register(Box::new(requests.clone())).ok();
        registry.register(Box::new(failures.clone())).ok();
        registry.register(Box::new(latency.clone())).ok();

        Self {
            requests,
            failures,
            latency,
        }
    }
}

/// Deployment tracker metrics
pub struct TrackerMetrics {
    pub polls: IntCounterVec,
    pub poll_errors: IntCounterVec,
    pub outcomes: IntCounterVec,
    pub active: IntGauge,
}

impl TrackerMetrics {
    pub fn new(registry: &Registry) -> Self {
        let polls = IntCounterVec::new(
            Opts::new("bazaar_tracker_polls_total", "Deployment status polls"),
            &["remote_status"],
        )
        .expect("Failed to create tracker_polls metric");

        let poll_errors = IntCounterVec::new(
            Opts::new("bazaar_tracker_poll_errors_total", "Deployment polls that failed"),
            &["kind"],
        )
        .expect("Failed to create tracker_poll_errors metric");

        let outcomes = IntCounterVec::new(
            Opts::new("bazaar_tracker_outcomes_total", "Tracked deployments by terminal state"),
            &["outcome"],
        )
        .expect("Failed to create tracker_outcomes metric");

        let active = IntGauge::new("bazaar_tracker_active", "Deployments currently tracked")
            .expect("Failed to create tracker_active metric");

        registry.register(Box::new(polls.clone())).ok();
        registry.register(Box::new(poll_errors.clone())).ok();
        registry.register(Box::new(outcomes.clone())).ok();
        registry.register(Box::new(active.clone())).ok();

        Self {
            polls,
            poll_errors,
            outcomes,
            active,
        }
    }
}

/// Traffic allocator metrics
pub struct AllocatorMetrics {
    pub operations: IntCounterVec,
    pub rejections: IntCounterVec,
}

impl AllocatorMetrics {
    pub fn new(registry: &Registry) -> Self {
        let operations = IntCounterVec::new(
            Opts::new("bazaar_allocator_operations_total", "Traffic allocation operations"),
            &["operation"],
        )
        .expect("Failed to create allocator_operations metric");

        let rejections = IntCounterVec::new(
            Opts::new("bazaar_allocator_rejections_total", "Rejected allocation operations"),
            &["operation", "reason"],
        )
        .expect("Failed to create allocator_rejections metric");

        registry.register(Box::new(operations.clone())).ok();
        registry.register(Box::new(rejections.clone())).ok();

        Self {
            operations,
            rejections,
        }
    }
}

/// Realtime feed metrics
pub struct RealtimeMetrics {
    pub events: IntCounterVec,
    pub reconnects: IntCounterVec,
    pub connection_status: IntGauge,
    pub subscriptions: IntGauge,
}

impl RealtimeMetrics {
    pub fn new(registry: &Registry) -> Self {
        let events = IntCounterVec::new(
            Opts::new("bazaar_realtime_events_total", "Row change events received"),
            &["table", "event"],
        )
        .expect("Failed to create realtime_events metric");

        let reconnects = IntCounterVec::new(
            Opts::new("bazaar_realtime_reconnects_total", "Realtime reconnection attempts"),
            &["reason"],
        )
        .expect("Failed to create realtime_reconnects metric");

        let connection_status = IntGauge::new(
            "bazaar_realtime_status",
            "Realtime connection status (0=disconnected, 1=connecting, 2=connected)",
        )
        .expect("Failed to create realtime_status metric");

        let subscriptions = IntGauge::new("bazaar_realtime_subscriptions", "Active subscriptions")
            .expect("Failed to create realtime_subscriptions metric");

        registry.register(Box::new(events.clone())).ok();
        registry.register(Box::new(reconnects.clone())).ok();
        registry.register(Box::new(connection_status.clone())).ok();
        registry.register(Box::new(subscriptions.clone())).ok();

        Self {
            events,
            reconnects,
            connection_status,
            subscriptions,
        }
    }
}

/// All Bazaar metrics
pub struct BazaarMetrics {
    pub backend: BackendMetrics,
    pub tracker: TrackerMetrics,
    pub allocator: AllocatorMetrics,
    pub realtime: RealtimeMetrics,
}

impl BazaarMetrics {
    pub fn new() -> Self {
        let registry = registry();
        Self {
            backend: BackendMetrics::new(registry),
            tracker: TrackerMetrics::new(registry),
            allocator: AllocatorMetrics::new(registry),
            realtime: RealtimeMetrics::new(registry),
        }
    }
}

impl Default for BazaarMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Get metrics as Prometheus text format
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
