//! Prometheus metrics collection for the gateway
//!
//! This module tracks:
//! - Request counts (total, succeeded, failed, active)
//! - Cumulative request latency
//! - Requests per public model id
//! - Failures per error kind
//!
//! Metrics are exposed via the `/metrics` endpoint in Prometheus text format.
//! Every request is tracked by a [`RequestTracker`] that records exactly one
//! terminal transition.

use crate::classifier::ErrorKind;
use prometheus::{Counter, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Process-wide request metrics
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    requests_total: IntCounter,
    requests_succeeded: IntCounter,
    requests_failed: IntCounter,
    requests_active: IntGauge,
    latency_seconds_total: Counter,
    model_requests: IntCounterVec,
    errors: IntCounterVec,
}

/// Point-in-time view used by `/health`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub active: i64,
    pub average_latency_ms: f64,
}

impl Metrics {
    /// Create a new Metrics instance
    ///
    /// Registers all metrics with a new Prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails (e.g., duplicate names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(Opts::new(
            "acp_gateway_requests_total",
            "Total number of chat completion requests received",
        ))?;
        let requests_succeeded = IntCounter::with_opts(Opts::new(
            "acp_gateway_requests_succeeded_total",
            "Total number of chat completion requests that completed successfully",
        ))?;
        let requests_failed = IntCounter::with_opts(Opts::new(
            "acp_gateway_requests_failed_total",
            "Total number of chat completion requests that failed or were aborted",
        ))?;
        let requests_active = IntGauge::with_opts(Opts::new(
            "acp_gateway_requests_active",
            "Number of chat completion requests currently in flight",
        ))?;
        let latency_seconds_total = Counter::with_opts(Opts::new(
            "acp_gateway_request_latency_seconds_total",
            "Cumulative wall-clock time spent serving finished requests",
        ))?;

        // Cardinality is bounded by the configured catalog.
        let model_requests = IntCounterVec::new(
            Opts::new(
                "acp_gateway_model_requests_total",
                "Total requests dispatched per public model id",
            ),
            &["model"],
        )?;

        // Cardinality is bounded by ErrorKind.
        let errors = IntCounterVec::new(
            Opts::new(
                "acp_gateway_errors_total",
                "Total failed requests by error kind",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_succeeded.clone()))?;
        registry.register(Box::new(requests_failed.clone()))?;
        registry.register(Box::new(requests_active.clone()))?;
        registry.register(Box::new(latency_seconds_total.clone()))?;
        registry.register(Box::new(model_requests.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            requests_total,
            requests_succeeded,
            requests_failed,
            requests_active,
            latency_seconds_total,
            model_requests,
            errors,
        })
    }

    /// Start tracking a request
    pub fn start_request(&self) -> RequestTracker {
        self.requests_total.inc();
        self.requests_active.inc();
        RequestTracker {
            metrics: self.clone(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Count a request against a public model id
    pub fn record_model(&self, model: &str) {
        self.model_requests.with_label_values(&[model]).inc();
    }

    fn finish(&self, started: Instant, outcome: Result<(), ErrorKind>) {
        self.requests_active.dec();
        self.latency_seconds_total
            .inc_by(started.elapsed().as_secs_f64());
        match outcome {
            Ok(()) => self.requests_succeeded.inc(),
            Err(kind) => {
                self.requests_failed.inc();
                self.errors.with_label_values(&[kind.as_str()]).inc();
            }
        }
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.get()
    }

    pub fn requests_succeeded(&self) -> u64 {
        self.requests_succeeded.get()
    }

    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.get()
    }

    pub fn requests_active(&self) -> i64 {
        self.requests_active.get()
    }

    pub fn model_requests(&self, model: &str) -> u64 {
        self.model_requests.with_label_values(&[model]).get()
    }

    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors.with_label_values(&[kind.as_str()]).get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let finished = self.requests_succeeded() + self.requests_failed();
        let average_latency_ms = if finished == 0 {
            0.0
        } else {
            self.latency_seconds_total.get() * 1000.0 / finished as f64
        };
        MetricsSnapshot {
            total: self.requests_total(),
            succeeded: self.requests_succeeded(),
            failed: self.requests_failed(),
            active: self.requests_active(),
            average_latency_ms,
        }
    }

    /// Gather all metrics and encode them in Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns an error if metric encoding fails.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();

        tracing::debug!(
            metric_family_count = metric_families.len(),
            "Encoding metrics to Prometheus text format"
        );

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|e| {
                tracing::error!(error = %e, "Prometheus text encoder failed");
                e
            })?;

        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!(
                "Failed to convert metrics to UTF-8 at byte {}: {}",
                e.utf8_error().valid_up_to(),
                e
            ))
        })
    }
}

/// Records the terminal transition of one request
///
/// Dropping an unfinished tracker records an abort (`request_timeout`), which
/// covers handler futures cancelled by a disconnecting caller.
pub struct RequestTracker {
    metrics: Metrics,
    started: Instant,
    finished: bool,
}

impl RequestTracker {
    pub fn succeed(mut self) {
        self.finished = true;
        self.metrics.finish(self.started, Ok(()));
    }

    pub fn fail(mut self, kind: ErrorKind) {
        self.finished = true;
        self.metrics.finish(self.started, Err(kind));
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics
                .finish(self.started, Err(ErrorKind::RequestTimeout));
        }
    }
}
