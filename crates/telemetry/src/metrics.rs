use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Poller Metrics ====
    pub static ref POLL_TICKS: IntCounter = {
        let metric = IntCounter::new("streammon_poll_ticks_total", "Total number of poll ticks")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref POLL_BACKEND_ERRORS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "streammon_poll_backend_errors_total",
                "Total number of failed backend polls",
            ),
            &["backend"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref POLL_TICK_DURATION: Histogram = {
        let metric = Histogram::with_opts(
            HistogramOpts::new(
                "streammon_poll_tick_duration_seconds",
                "Duration of one poll tick across all backends",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ACTIVE_SESSIONS: IntGauge = {
        let metric = IntGauge::new(
            "streammon_active_sessions",
            "Number of active sessions across all backends",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref SESSIONS_COALESCED: IntCounter = {
        let metric = IntCounter::new(
            "streammon_sessions_coalesced_total",
            "Raw sessions re-bound into an existing viewing",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref HISTORY_WRITES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "streammon_history_writes_total",
                "Watch history write attempts",
            ),
            &["status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Detection Metrics ====
    pub static ref VIOLATIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "streammon_violations_total",
                "Persisted rule violations",
            ),
            &["kind", "severity"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref NOTIFICATIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "streammon_notifications_total",
                "Notification delivery attempts",
            ),
            &["channel", "status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        POLL_TICKS.inc();
        POLL_BACKEND_ERRORS.with_label_values(&["plex-main"]).inc();
        VIOLATIONS.with_label_values(&["concurrent", "warning"]).inc();

        let text = encode_metrics().unwrap();
        assert!(text.contains("streammon_poll_ticks_total"));
        assert!(text.contains("streammon_violations_total"));
    }
}
