//! Prometheus-compatible metrics sink (§6's `metrics_sink()` collaborator,
//! concretely implemented per SPEC_FULL §11): counters/gauges/histograms for
//! request counts by backend and method, latency distributions, cache
//! hit/miss, circuit state, active connections, and current generation,
//! exported on `/metrics`.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramVec, IntCounter, IntGauge, Registry, TextEncoder,
    histogram_opts, opts, register_counter_vec, register_gauge_vec, register_histogram_vec,
    register_int_counter, register_int_gauge,
};

lazy_static! {
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        opts!("only1mcp_requests_total", "Total number of requests routed to a backend"),
        &["backend_id", "method", "status"]
    )
    .unwrap();

    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "only1mcp_request_duration_seconds",
            "Backend request duration in seconds",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        ),
        &["backend_id", "method"]
    )
    .unwrap();

    pub static ref CACHE_HITS_TOTAL: IntCounter = register_int_counter!(
        "only1mcp_aggregation_cache_hits_total",
        "Aggregated list-call cache hits"
    )
    .unwrap();

    pub static ref CACHE_MISSES_TOTAL: IntCounter = register_int_counter!(
        "only1mcp_aggregation_cache_misses_total",
        "Aggregated list-call cache misses"
    )
    .unwrap();

    pub static ref CIRCUIT_STATE: GaugeVec = register_gauge_vec!(
        opts!(
            "only1mcp_circuit_breaker_state",
            "Circuit breaker state per backend (0=closed, 1=open, 2=half-open)"
        ),
        &["backend_id"]
    )
    .unwrap();

    pub static ref ACTIVE_CONNECTIONS: GaugeVec = register_gauge_vec!(
        opts!(
            "only1mcp_active_connections",
            "Current in-flight admitted requests per backend"
        ),
        &["backend_id"]
    )
    .unwrap();

    pub static ref REGISTRY_GENERATION: IntGauge = register_int_gauge!(
        "only1mcp_registry_generation",
        "Current registry generation"
    )
    .unwrap();

    pub static ref BACKEND_HEALTH: GaugeVec = register_gauge_vec!(
        opts!(
            "only1mcp_backend_health_status",
            "Backend health status (0=unhealthy, 1=degraded, 2=healthy, 3=unknown)"
        ),
        &["backend_id"]
    )
    .unwrap();

    static ref REGISTRY: Registry = {
        let registry = Registry::new();
        registry.register(Box::new(REQUESTS_TOTAL.clone())).unwrap();
        registry.register(Box::new(REQUEST_DURATION_SECONDS.clone())).unwrap();
        registry.register(Box::new(CACHE_HITS_TOTAL.clone())).unwrap();
        registry.register(Box::new(CACHE_MISSES_TOTAL.clone())).unwrap();
        registry.register(Box::new(CIRCUIT_STATE.clone())).unwrap();
        registry.register(Box::new(ACTIVE_CONNECTIONS.clone())).unwrap();
        registry.register(Box::new(REGISTRY_GENERATION.clone())).unwrap();
        registry.register(Box::new(BACKEND_HEALTH.clone())).unwrap();
        registry
    };
}

pub fn record_request(backend_id: &str, method: &str, status: &str, duration: Duration) {
    REQUESTS_TOTAL.with_label_values(&[backend_id, method, status]).inc();
    REQUEST_DURATION_SECONDS
        .with_label_values(&[backend_id, method])
        .observe(duration.as_secs_f64());
}

pub fn record_cache_hit() {
    CACHE_HITS_TOTAL.inc();
}

pub fn record_cache_miss() {
    CACHE_MISSES_TOTAL.inc();
}

pub fn set_circuit_state(backend_id: &str, state: crate::router::circuit::CircuitState) {
    use crate::router::circuit::CircuitState::*;
    let value = match state {
        Closed => 0.0,
        Open => 1.0,
        HalfOpen => 2.0,
    };
    CIRCUIT_STATE.with_label_values(&[backend_id]).set(value);
}

pub fn set_active_connections(backend_id: &str, count: i64) {
    ACTIVE_CONNECTIONS.with_label_values(&[backend_id]).set(count as f64);
}

pub fn set_generation(generation: u64) {
    REGISTRY_GENERATION.set(generation as i64);
}

pub fn set_backend_health(backend_id: &str, status: crate::registry::HealthStatus) {
    use crate::registry::HealthStatus::*;
    let value = match status {
        Unhealthy => 0.0,
        Degraded => 1.0,
        Healthy => 2.0,
        Unknown => 3.0,
    };
    BACKEND_HEALTH.with_label_values(&[backend_id]).set(value);
}

/// Render the current state of every registered metric in Prometheus text
/// exposition format, for the `/metrics` HTTP handler.
pub fn gather() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_includes_recorded_request() {
        record_request("backend-a", "tools/call", "success", Duration::from_millis(12));
        let rendered = String::from_utf8(gather().unwrap()).unwrap();
        assert!(rendered.contains("only1mcp_requests_total"));
    }

    #[test]
    fn circuit_state_maps_to_numeric_gauge() {
        set_circuit_state("backend-a", crate::router::circuit::CircuitState::Open);
        let rendered = String::from_utf8(gather().unwrap()).unwrap();
        assert!(rendered.contains("only1mcp_circuit_breaker_state"));
    }
}
