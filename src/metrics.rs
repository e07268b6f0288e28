//! Prometheus metrics for the gateway.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_request`, `inc_error`, …) are no-ops if `init_metrics` was never
//! called, so library users and tests can dispatch without a registry.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `gateway_requests_total` | Counter | `provider` |
//! | `gateway_errors_total` | Counter | `kind` |
//! | `gateway_routing_total` | Counter | `source` |
//! | `gateway_dispatch_duration_seconds` | Histogram | `provider` |

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;
use std::time::Duration;

use crate::GatewayError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All gateway metrics, stored together in a single [`OnceLock`].
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Successful provider calls per provider.
    pub requests_total: CounterVec,
    /// Failed dispatches per error kind.
    pub errors_total: CounterVec,
    /// Routing outcomes per candidate source (rule, override, default).
    pub routing_total: CounterVec,
    /// Provider call latency per provider.
    pub dispatch_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_error(e: prometheus::Error) -> GatewayError {
    GatewayError::Other(format!("metrics init failed: {e}"))
}

impl Metrics {
    /// Build a metrics bundle with every name prefixed by `prefix`.
    fn build(prefix: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new(
                format!("{prefix}_requests_total"),
                "Completed provider calls",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new(format!("{prefix}_errors_total"), "Dispatch errors by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let routing_total = CounterVec::new(
            Opts::new(
                format!("{prefix}_routing_total"),
                "Routing selections by candidate source",
            ),
            &["source"],
        )?;
        registry.register(Box::new(routing_total.clone()))?;

        let dispatch_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{prefix}_dispatch_duration_seconds"),
                "Provider call duration",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(dispatch_duration.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            errors_total,
            routing_total,
            dispatch_duration,
        })
    }
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`GatewayError::Other`] if metric construction or registration
/// fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), GatewayError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = Metrics::build("gateway").map_err(init_error)?;
    // A racing initialiser produces identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one completed provider call.
///
/// No-op if metrics have not been initialised.
pub fn inc_request(provider: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[provider]) {
            c.inc();
        }
    }
}

/// Count one failed dispatch.
///
/// No-op if metrics have not been initialised.
pub fn inc_error(kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.errors_total.get_metric_with_label_values(&[kind]) {
            c.inc();
        }
    }
}

/// Count one routing selection by source.
///
/// No-op if metrics have not been initialised.
pub fn inc_routing(source: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.routing_total.get_metric_with_label_values(&[source]) {
            c.inc();
        }
    }
}

/// Record provider call latency.
///
/// No-op if metrics have not been initialised.
pub fn record_dispatch_latency(provider: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.dispatch_duration.get_metric_with_label_values(&[provider]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    metrics().map_or_else(String::new, |m| encode(&m.registry))
}

fn encode(registry: &Registry) -> String {
    let families = registry.gather();
    if families.is_empty() {
        return String::new();
    }
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
