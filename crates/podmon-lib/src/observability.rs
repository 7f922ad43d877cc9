//! Observability infrastructure for the pod monitor
//!
//! Provides:
//! - Prometheus metrics (events seen, alerts emitted/dropped, watch reconnects)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::{Alert, PodEventKind, Scope};

/// Histogram buckets for alert hand-off latency (in seconds)
const SEND_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PodmonMetricsInner> = OnceLock::new();

struct PodmonMetricsInner {
    events_total: IntCounterVec,
    alerts_emitted: IntCounter,
    alerts_dropped: IntCounter,
    watch_errors: IntCounter,
    watch_reconnects: IntCounter,
    active_watches: IntGauge,
    alert_send_latency_seconds: Histogram,
}

impl PodmonMetricsInner {
    fn new() -> Self {
        Self {
            events_total: register_int_counter_vec!(
                "podmon_events_total",
                "Pod change events read from the watch, by event type",
                &["type"]
            )
            .expect("Failed to register events_total"),

            alerts_emitted: register_int_counter!(
                "podmon_alerts_emitted_total",
                "Container failure alerts handed to the notifier"
            )
            .expect("Failed to register alerts_emitted"),

            alerts_dropped: register_int_counter!(
                "podmon_alerts_dropped_total",
                "Container failure alerts dropped because the alert queue stayed full"
            )
            .expect("Failed to register alerts_dropped"),

            watch_errors: register_int_counter!(
                "podmon_watch_errors_total",
                "Errors read from pod watch subscriptions"
            )
            .expect("Failed to register watch_errors"),

            watch_reconnects: register_int_counter!(
                "podmon_watch_reconnects_total",
                "Pod watch subscriptions reopened after a failure"
            )
            .expect("Failed to register watch_reconnects"),

            active_watches: register_int_gauge!(
                "podmon_active_watches",
                "Number of pod monitors currently running"
            )
            .expect("Failed to register active_watches"),

            alert_send_latency_seconds: register_histogram!(
                "podmon_alert_send_latency_seconds",
                "Time spent handing an alert to the notifier queue",
                SEND_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register alert_send_latency_seconds"),
        }
    }
}

/// Pod monitor metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct PodmonMetrics {
    _private: (),
}

impl Default for PodmonMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PodmonMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PodmonMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PodmonMetricsInner {
        GLOBAL_METRICS.get_or_init(PodmonMetricsInner::new)
    }

    pub fn inc_events(&self, kind: PodEventKind) {
        self.inner()
            .events_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_alerts_emitted(&self) {
        self.inner().alerts_emitted.inc();
    }

    pub fn inc_alerts_dropped(&self) {
        self.inner().alerts_dropped.inc();
    }

    pub fn inc_watch_errors(&self) {
        self.inner().watch_errors.inc();
    }

    pub fn inc_watch_reconnects(&self) {
        self.inner().watch_reconnects.inc();
    }

    pub fn watch_started(&self) {
        self.inner().active_watches.inc();
    }

    pub fn watch_stopped(&self) {
        self.inner().active_watches.dec();
    }

    pub fn observe_send_latency(&self, duration_secs: f64) {
        self.inner().alert_send_latency_seconds.observe(duration_secs);
    }

    pub fn alerts_emitted(&self) -> u64 {
        self.inner().alerts_emitted.get()
    }

    pub fn watch_reconnects(&self) -> u64 {
        self.inner().watch_reconnects.get()
    }
}

/// Structured logger for monitor events
///
/// Provides consistent JSON-formatted logging for alerts,
/// reconnects, and process lifecycle.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Log podmon startup
    pub fn log_startup(&self, version: &str, scopes: &[Scope], annotation_prefix: &str) {
        let scopes: Vec<String> = scopes.iter().map(ToString::to_string).collect();
        info!(
            event = "podmon_started",
            instance = %self.instance,
            version = %version,
            scopes = ?scopes,
            annotation_prefix = %annotation_prefix,
            "Pod monitor started"
        );
    }

    /// Log podmon shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "podmon_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Pod monitor shutting down"
        );
    }

    /// Log a container failure alert received by the notifier
    pub fn log_alert(&self, alert: &Alert) {
        let payload = serde_json::to_string(alert).unwrap_or_default();
        warn!(
            event = "container_failed",
            instance = %self.instance,
            pod_name = %alert.pod_name(),
            namespace = %alert.namespace(),
            container = %alert.container_name(),
            exit_code = alert.container_exit_code(),
            alert = %payload,
            "Container terminated with non-zero exit code"
        );
    }

    /// Log an alert dropped by the queue overflow policy
    pub fn log_alert_dropped(&self, alert: &Alert) {
        warn!(
            event = "alert_dropped",
            instance = %self.instance,
            pod_name = %alert.pod_name(),
            namespace = %alert.namespace(),
            container = %alert.container_name(),
            "Alert queue full, dropping alert"
        );
    }
}
