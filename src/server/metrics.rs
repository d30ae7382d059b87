use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all gateway metrics
const PREFIX: &str = "toolgate";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Gateway
    pub static ref GATEWAY_INVOCATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_gateway_invocations_total"), "Tool invocations by result"),
        &["server", "result"]
    ).expect("Failed to create gateway_invocations_total metric");

    pub static ref FORWARD_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_forward_duration_seconds"),
            "Downstream call duration in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["server", "outcome"]
    ).expect("Failed to create forward_duration_seconds metric");

    pub static ref BREAKER_TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_breaker_transitions_total"), "Circuit breaker transitions"),
        &["server", "transition"]
    ).expect("Failed to create breaker_transitions_total metric");

    pub static ref RATE_LIMIT_HITS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_rate_limit_hits_total"), "Rate limit violations"),
        &["scope"]
    ).expect("Failed to create rate_limit_hits_total metric");

    pub static ref AUDIT_WRITE_FAILURES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_audit_write_failures_total"),
        "Audit entries that could not be persisted"
    ).expect("Failed to create audit_write_failures_total metric");

    pub static ref NOTIFICATIONS_DROPPED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_notifications_dropped_total"),
        "Registry change notifications dropped because the queue was full"
    ).expect("Failed to create notifications_dropped_total metric");
}

/// Registers all metrics. Already-registered errors are ignored so tests can
/// call this repeatedly.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(GATEWAY_INVOCATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FORWARD_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(BREAKER_TRANSITIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RATE_LIMIT_HITS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(AUDIT_WRITE_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(NOTIFICATIONS_DROPPED_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

/// `result` is the error code of the invocation, or `OK`.
pub fn record_invocation(server: &str, result: &str) {
    GATEWAY_INVOCATIONS_TOTAL
        .with_label_values(&[server, result])
        .inc();
}

pub fn record_forward(server: &str, outcome: &str, duration: Duration) {
    FORWARD_DURATION_SECONDS
        .with_label_values(&[server, outcome])
        .observe(duration.as_secs_f64());
}

pub fn record_breaker_transition(server: &str, transition: &str) {
    BREAKER_TRANSITIONS_TOTAL
        .with_label_values(&[server, transition])
        .inc();
}

/// `scope` is `api`, `gateway` or `login`.
pub fn record_rate_limit_hit(scope: &str) {
    RATE_LIMIT_HITS_TOTAL.with_label_values(&[scope]).inc();
}

pub fn record_audit_failure() {
    AUDIT_WRITE_FAILURES_TOTAL.inc();
}

pub fn record_notification_dropped() {
    NOTIFICATIONS_DROPPED_TOTAL.inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_metric(name: &str) -> bool {
        REGISTRY.gather().iter().any(|m| m.get_name() == name)
    }

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        record_audit_failure();
        assert!(has_metric("toolgate_audit_write_failures_total"));
    }

    #[test]
    fn test_record_invocation() {
        init_metrics();
        record_invocation("s1", "OK");
        record_invocation("s1", "CIRCUIT_OPEN");

        assert!(
            GATEWAY_INVOCATIONS_TOTAL
                .with_label_values(&["s1", "OK"])
                .get()
                >= 1.0
        );
        assert!(has_metric("toolgate_gateway_invocations_total"));
    }

    #[test]
    fn test_record_breaker_and_forward() {
        init_metrics();
        record_breaker_transition("s1", "opened");
        record_forward("s1", "timeout", Duration::from_millis(30));

        assert!(has_metric("toolgate_breaker_transitions_total"));
        assert!(has_metric("toolgate_forward_duration_seconds"));
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_text() {
        init_metrics();
        record_rate_limit_hit("api");

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("toolgate_rate_limit_hits_total"));
    }
}
