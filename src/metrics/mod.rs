//! Prometheus metrics for the hermes proxy.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    /// Total client sessions accepted
    pub sessions_total: IntCounter,
    /// Current active client sessions
    pub sessions_active: IntGauge,

    /// Statements forwarded, by route target (master/slave/all)
    pub queries_routed_total: IntCounterVec,
    /// Query errors surfaced to clients, by kind
    pub query_errors_total: IntCounterVec,

    /// Backend connections that failed or broke mid-query
    pub backend_failures_total: IntCounterVec,
    /// Reads transparently re-routed after a slave failure
    pub read_retries_total: IntCounter,

    /// Session commands recorded
    pub sescmds_total: IntCounter,
    /// Session commands replayed onto newly attached backends
    pub sescmd_replays_total: IntCounter,
    /// Broadcast replies that diverged from the reference reply
    pub reply_divergence_total: IntCounter,

    /// Column values rewritten by the masking filter, by rule kind
    pub masking_rewrites_total: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let sessions_total = IntCounter::new(
            "hermes_sessions_total",
            "Total number of client sessions accepted",
        )
        .unwrap();

        let sessions_active = IntGauge::new(
            "hermes_sessions_active",
            "Current number of active client sessions",
        )
        .unwrap();

        let queries_routed_total = IntCounterVec::new(
            Opts::new(
                "hermes_queries_routed_total",
                "Statements forwarded by route target",
            ),
            &["target"],
        )
        .unwrap();

        let query_errors_total = IntCounterVec::new(
            Opts::new(
                "hermes_query_errors_total",
                "Query errors surfaced to clients by kind",
            ),
            &["kind"],
        )
        .unwrap();

        let backend_failures_total = IntCounterVec::new(
            Opts::new(
                "hermes_backend_failures_total",
                "Backend connection failures by server",
            ),
            &["server"],
        )
        .unwrap();

        let read_retries_total = IntCounter::new(
            "hermes_read_retries_total",
            "Reads re-routed to another backend after a failure",
        )
        .unwrap();

        let sescmds_total = IntCounter::new(
            "hermes_sescmds_total",
            "Session commands recorded in session histories",
        )
        .unwrap();

        let sescmd_replays_total = IntCounter::new(
            "hermes_sescmd_replays_total",
            "Session commands replayed onto newly attached backends",
        )
        .unwrap();

        let reply_divergence_total = IntCounter::new(
            "hermes_reply_divergence_total",
            "Broadcast replies that disagreed with the reference reply",
        )
        .unwrap();

        let masking_rewrites_total = IntCounterVec::new(
            Opts::new(
                "hermes_masking_rewrites_total",
                "Column values rewritten by the masking filter",
            ),
            &["kind"],
        )
        .unwrap();

        registry.register(Box::new(sessions_total.clone())).unwrap();
        registry.register(Box::new(sessions_active.clone())).unwrap();
        registry
            .register(Box::new(queries_routed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(query_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(backend_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(read_retries_total.clone()))
            .unwrap();
        registry.register(Box::new(sescmds_total.clone())).unwrap();
        registry
            .register(Box::new(sescmd_replays_total.clone()))
            .unwrap();
        registry
            .register(Box::new(reply_divergence_total.clone()))
            .unwrap();
        registry
            .register(Box::new(masking_rewrites_total.clone()))
            .unwrap();

        Self {
            registry,
            sessions_total,
            sessions_active,
            queries_routed_total,
            query_errors_total,
            backend_failures_total,
            read_retries_total,
            sescmds_total,
            sescmd_replays_total,
            reply_divergence_total,
            masking_rewrites_total,
        }
    }

    pub fn record_session_opened(&self) {
        self.sessions_total.inc();
        self.sessions_active.inc();
    }

    pub fn record_session_closed(&self) {
        self.sessions_active.dec();
    }

    pub fn record_route(&self, target: &str) {
        self.queries_routed_total.with_label_values(&[target]).inc();
    }

    pub fn record_query_error(&self, kind: &str) {
        self.query_errors_total.with_label_values(&[kind]).inc();
    }

    pub fn record_backend_failure(&self, server: &str) {
        self.backend_failures_total
            .with_label_values(&[server])
            .inc();
    }

    pub fn record_read_retry(&self) {
        self.read_retries_total.inc();
    }

    pub fn record_sescmd(&self) {
        self.sescmds_total.inc();
    }

    pub fn record_sescmd_replay(&self) {
        self.sescmd_replays_total.inc();
    }

    pub fn record_reply_divergence(&self) {
        self.reply_divergence_total.inc();
    }

    pub fn record_masking_rewrite(&self, kind: &str) {
        self.masking_rewrites_total.with_label_values(&[kind]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_gather() {
        let m = metrics();
        m.record_route("slave");
        m.record_query_error("no_backend");
        let text = m.gather();
        assert!(text.contains("hermes_queries_routed_total"));
        assert!(text.contains("hermes_query_errors_total"));
    }
}
