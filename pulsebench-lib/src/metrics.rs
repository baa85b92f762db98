//! Metrics sink seam.
//!
//! Components record through [`MetricsSink`]; the process decides whether that
//! lands in a Prometheus registry or nowhere at all.

use std::time::Duration;

use prometheus::{
    Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    exponential_buckets,
};
use rama::error::{ErrorContext as _, OpaqueError};

use crate::config::Transport;

/// Classification used for the request counter: transport failures (status 0)
/// and HTTP >= 400 count as errors, everything else as success.
pub fn status_class(status: u16) -> &'static str {
    if status == 0 || status >= 400 {
        "error"
    } else {
        "success"
    }
}

pub trait MetricsSink: Send + Sync + 'static {
    fn record_request(&self, target: &str, transport: Transport, status: u16, duration: Duration);
    fn set_current_tps(&self, tps: f64);
    fn set_target_tps(&self, tps: f64);
    fn set_active_workers(&self, count: usize);
    fn set_queued_requests(&self, count: usize);
    fn set_spike_active(&self, active: bool);
    fn inc_in_flight(&self);
    fn dec_in_flight(&self);
    fn set_target_health(&self, target: &str, healthy: bool);
}

/// Sink that drops everything. Useful for tests and for embedding the engine
/// without an observability stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _: &str, _: Transport, _: u16, _: Duration) {}
    fn set_current_tps(&self, _: f64) {}
    fn set_target_tps(&self, _: f64) {}
    fn set_active_workers(&self, _: usize) {}
    fn set_queued_requests(&self, _: usize) {}
    fn set_spike_active(&self, _: bool) {}
    fn inc_in_flight(&self) {}
    fn dec_in_flight(&self) {}
    fn set_target_health(&self, _: &str, _: bool) {}
}

/// Prometheus-backed sink.
///
/// Metric families are registered against the registry handed in by the
/// caller, which also owns exposition.
pub struct PrometheusMetrics {
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    requests_in_flight: Gauge,
    current_tps: Gauge,
    target_tps: Gauge,
    active_workers: Gauge,
    queued_requests: Gauge,
    spike_active: Gauge,
    target_health: GaugeVec,
}

const NAMESPACE: &str = "pulsebench";

impl PrometheusMetrics {
    pub fn register(registry: &Registry) -> Result<Self, OpaqueError> {
        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Total requests by target and status").namespace(NAMESPACE),
            &["target", "status", "transport"],
        )
        .context("create requests_total")?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Request latency histogram")
                .namespace(NAMESPACE)
                .buckets(exponential_buckets(0.001, 2.0, 15).context("duration buckets")?),
            &["target", "transport"],
        )
        .context("create request_duration_seconds")?;

        let requests_in_flight = Gauge::with_opts(
            Opts::new(
                "requests_in_flight",
                "Requests currently being processed",
            )
            .namespace(NAMESPACE),
        )
        .context("create requests_in_flight")?;

        let current_tps = Gauge::with_opts(
            Opts::new("current_tps", "Measured transactions per second").namespace(NAMESPACE),
        )
        .context("create current_tps")?;

        let target_tps = Gauge::with_opts(
            Opts::new("target_tps", "Rate limiter target setting").namespace(NAMESPACE),
        )
        .context("create target_tps")?;

        let active_workers = Gauge::with_opts(
            Opts::new("active_workers", "Workers currently executing a request")
                .namespace(NAMESPACE),
        )
        .context("create active_workers")?;

        let queued_requests = Gauge::with_opts(
            Opts::new("queued_requests", "Jobs waiting in the pool queue").namespace(NAMESPACE),
        )
        .context("create queued_requests")?;

        let spike_active = Gauge::with_opts(
            Opts::new(
                "spike_active",
                "Whether a traffic spike is active (1=yes, 0=no)",
            )
            .namespace(NAMESPACE),
        )
        .context("create spike_active")?;

        let target_health = GaugeVec::new(
            Opts::new(
                "target_health",
                "Per-target health (1=healthy, 0=unhealthy)",
            )
            .namespace(NAMESPACE),
            &["target"],
        )
        .context("create target_health")?;

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_duration.clone()),
            Box::new(requests_in_flight.clone()),
            Box::new(current_tps.clone()),
            Box::new(target_tps.clone()),
            Box::new(active_workers.clone()),
            Box::new(queued_requests.clone()),
            Box::new(spike_active.clone()),
            Box::new(target_health.clone()),
        ] {
            registry.register(collector).context("register metric")?;
        }

        Ok(Self {
            requests_total,
            request_duration,
            requests_in_flight,
            current_tps,
            target_tps,
            active_workers,
            queued_requests,
            spike_active,
            target_health,
        })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_request(&self, target: &str, transport: Transport, status: u16, duration: Duration) {
        self.requests_total
            .with_label_values(&[target, status_class(status), transport.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[target, transport.as_str()])
            .observe(duration.as_secs_f64());
    }

    fn set_current_tps(&self, tps: f64) {
        self.current_tps.set(tps);
    }

    fn set_target_tps(&self, tps: f64) {
        self.target_tps.set(tps);
    }

    fn set_active_workers(&self, count: usize) {
        self.active_workers.set(count as f64);
    }

    fn set_queued_requests(&self, count: usize) {
        self.queued_requests.set(count as f64);
    }

    fn set_spike_active(&self, active: bool) {
        self.spike_active.set(if active { 1.0 } else { 0.0 });
    }

    fn inc_in_flight(&self) {
        self.requests_in_flight.inc();
    }

    fn dec_in_flight(&self) {
        self.requests_in_flight.dec();
    }

    fn set_target_health(&self, target: &str, healthy: bool) {
        self.target_health
            .with_label_values(&[target])
            .set(if healthy { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_boundaries() {
        assert_eq!(status_class(0), "error");
        assert_eq!(status_class(200), "success");
        assert_eq!(status_class(302), "success");
        assert_eq!(status_class(399), "success");
        assert_eq!(status_class(400), "error");
        assert_eq!(status_class(503), "error");
    }

    #[test]
    fn prometheus_sink_registers_and_records() {
        let registry = Registry::new();
        let sink = PrometheusMetrics::register(&registry).expect("register");

        sink.record_request("a", Transport::Http, 200, Duration::from_millis(12));
        sink.record_request("a", Transport::Http, 500, Duration::from_millis(40));
        sink.set_target_health("a", false);
        sink.set_spike_active(true);

        let families = registry.gather();
        assert!(
            families
                .iter()
                .any(|f| f.get_name() == "pulsebench_requests_total")
        );

        // Registering the same family names twice must fail.
        assert!(PrometheusMetrics::register(&registry).is_err());
    }
}
