//! Proxy metrics, exposed in Prometheus text format.

use http::{Method, StatusCode};
use prometheus_client::{
    encoding::{EncodeLabelSet, text},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use std::{sync::Arc, time::Duration};

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    method: String,
    status: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct MethodLabels {
    method: String,
}

#[derive(Clone)]
pub struct Metrics {
    requests: Family<RequestLabels, Counter>,
    duration: Family<MethodLabels, Histogram>,
    headers_propagated: Counter,
    active_connections: Gauge,
    registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("ctxforge_proxy");

        let requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "inbound_requests",
            "Requests handled by the proxy, by method and status family",
            requests.clone(),
        );

        let duration = Family::<MethodLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(
                [
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]
                .into_iter(),
            )
        });
        registry.register(
            "inbound_request_duration_seconds",
            "Request handling duration in seconds, by method",
            duration.clone(),
        );

        let headers_propagated = Counter::default();
        registry.register(
            "headers_propagated",
            "Headers recorded for propagation across all requests",
            headers_propagated.clone(),
        );

        let active_connections = Gauge::default();
        registry.register(
            "active_connections",
            "Requests currently being handled",
            active_connections.clone(),
        );

        Self {
            requests,
            duration,
            headers_propagated,
            active_connections,
            registry: Arc::new(registry),
        }
    }

    pub fn record_request(&self, method: &Method, status: StatusCode, elapsed: Duration) {
        self.requests
            .get_or_create(&RequestLabels {
                method: method.to_string(),
                status: status_family(status),
            })
            .inc();
        self.duration
            .get_or_create(&MethodLabels {
                method: method.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_headers_propagated(&self, count: usize) {
        if count > 0 {
            self.headers_propagated.inc_by(count as u64);
        }
    }

    /// Tracks one in-flight request; the gauge drops with the guard.
    pub fn in_flight(&self) -> InFlightGuard {
        self.active_connections.inc();
        InFlightGuard {
            gauge: self.active_connections.clone(),
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Err(error) = text::encode(&mut out, &self.registry) {
            tracing::error!(%error, "failed to encode metrics");
        }
        out
    }
}

pub struct InFlightGuard {
    gauge: Gauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

fn status_family(status: StatusCode) -> String {
    format!("{}xx", status.as_u16() / 100)
}
