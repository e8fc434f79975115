//! Prometheus metrics for the image serving path

use crate::error::FetchErrorKind;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics for image requests
#[derive(Clone)]
pub struct ServingMetrics {
    /// Requests by outcome (hit, miss, stale, redirect, not_found, bad_request)
    pub requests_total: Arc<CounterVec>,

    /// Image bytes written to clients
    pub bytes_served_total: Arc<Counter>,

    /// Origin fetch failures by error kind
    pub fetch_failures_total: Arc<CounterVec>,

    /// Request duration by outcome
    pub request_duration_seconds: Arc<HistogramVec>,
}

impl ServingMetrics {
    /// Create metrics registered against `registry`
    pub fn with_registry(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests_total = CounterVec::new(
            Opts::new(
                "image_cache_requests_total",
                "Total number of image requests by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let bytes_served_total = Counter::new(
            "image_cache_bytes_served_total",
            "Total image bytes sent to clients",
        )?;
        registry.register(Box::new(bytes_served_total.clone()))?;

        let fetch_failures_total = CounterVec::new(
            Opts::new(
                "image_cache_fetch_failures_total",
                "Total number of failed origin fetches by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(fetch_failures_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "image_cache_request_duration_seconds",
                "Duration of image requests in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["outcome"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            requests_total: Arc::new(requests_total),
            bytes_served_total: Arc::new(bytes_served_total),
            fetch_failures_total: Arc::new(fetch_failures_total),
            request_duration_seconds: Arc::new(request_duration_seconds),
        })
    }

    /// Record a finished request
    pub fn record_request(&self, outcome: &str, bytes: usize, duration_secs: f64) {
        self.requests_total.with_label_values(&[outcome]).inc();
        self.bytes_served_total.inc_by(bytes as f64);
        self.request_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    pub fn record_fetch_failure(&self, kind: FetchErrorKind) {
        self.fetch_failures_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }
}

/// Render every metric in `registry` in the text exposition format
pub fn encode_text(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
