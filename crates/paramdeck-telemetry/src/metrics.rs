//! Prometheus metrics registry.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

/// Round-trip histogram buckets (in seconds).
/// Covers 5ms to 10s; template evaluation is usually well under a second.
const ROUND_TRIP_BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0];

/// Connection failure labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    /// `connect`, `transport`, `protocol` or `closed`.
    pub kind: String,
}

/// Workspace creation labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CreationLabels {
    pub outcome: String,
}

/// Metrics registry holding all paramdeck metrics.
pub struct MetricsRegistry {
    /// The prometheus-client registry for encoding.
    pub registry: Registry,

    // Connection metrics
    pub connections_opened: Counter,
    pub active_connections: Gauge,
    pub connection_failures: Family<FailureLabels, Counter>,

    // Snapshot metrics
    pub snapshots_applied: Counter,
    pub snapshots_discarded: Counter,
    pub snapshot_round_trip_seconds: Histogram,

    // Outbound request metrics
    pub requests_sent: Counter,
    pub requests_dropped: Counter,

    // Workspace metrics
    pub workspaces_created: Family<CreationLabels, Counter>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connections_opened = Counter::default();
        registry.register(
            "paramdeck_connections_opened",
            "Total number of evaluation connections opened",
            connections_opened.clone(),
        );

        let active_connections = Gauge::default();
        registry.register(
            "paramdeck_active_connections",
            "Number of currently open evaluation connections",
            active_connections.clone(),
        );

        let connection_failures = Family::<FailureLabels, Counter>::default();
        registry.register(
            "paramdeck_connection_failures",
            "Evaluation connections that ended in an error or unexpected close",
            connection_failures.clone(),
        );

        let snapshots_applied = Counter::default();
        registry.register(
            "paramdeck_snapshots_applied",
            "Parameter snapshots that replaced the working set",
            snapshots_applied.clone(),
        );

        let snapshots_discarded = Counter::default();
        registry.register(
            "paramdeck_snapshots_discarded",
            "Stale parameter snapshots ignored by sequence number",
            snapshots_discarded.clone(),
        );

        let snapshot_round_trip_seconds = Histogram::new(ROUND_TRIP_BUCKETS.iter().cloned());
        registry.register(
            "paramdeck_snapshot_round_trip_seconds",
            "Time between sending inputs and applying the matching snapshot",
            snapshot_round_trip_seconds.clone(),
        );

        let requests_sent = Counter::default();
        registry.register(
            "paramdeck_requests_sent",
            "Input requests written to the evaluation connection",
            requests_sent.clone(),
        );

        let requests_dropped = Counter::default();
        registry.register(
            "paramdeck_requests_dropped",
            "Input requests dropped because the connection was not open",
            requests_dropped.clone(),
        );

        let workspaces_created = Family::<CreationLabels, Counter>::default();
        registry.register(
            "paramdeck_workspaces_created",
            "Workspace creation attempts by outcome",
            workspaces_created.clone(),
        );

        Self {
            registry,
            connections_opened,
            active_connections,
            connection_failures,
            snapshots_applied,
            snapshots_discarded,
            snapshot_round_trip_seconds,
            requests_sent,
            requests_dropped,
            workspaces_created,
        }
    }

    /// Record a newly opened connection.
    pub fn connection_opened(&self) {
        self.connections_opened.inc();
        self.active_connections.inc();
    }

    /// Record a connection leaving the open state.
    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    /// Record a connection failure of the given kind.
    pub fn record_connection_failure(&self, kind: &str) {
        self.connection_failures
            .get_or_create(&FailureLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    /// Record the outcome of an inbound snapshot.
    pub fn record_snapshot(&self, applied: bool) {
        if applied {
            self.snapshots_applied.inc();
        } else {
            self.snapshots_discarded.inc();
        }
    }

    /// Record the latency between a send and its applied snapshot.
    pub fn record_round_trip(&self, seconds: f64) {
        self.snapshot_round_trip_seconds.observe(seconds);
    }

    /// Record an outbound request.
    pub fn record_request(&self, sent: bool) {
        if sent {
            self.requests_sent.inc();
        } else {
            self.requests_dropped.inc();
        }
    }

    /// Record a workspace creation attempt.
    pub fn record_workspace_created(&self, outcome: &str) {
        self.workspaces_created
            .get_or_create(&CreationLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
