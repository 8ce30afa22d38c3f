//! Integration tests for telemetry initialization and span helpers.

#[test]
fn telemetry_initializes_without_endpoint() {
    let config = rtcache::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "rtcache-test".to_string(),
        log_level: "debug".to_string(),
    };
    // Only the first subscriber per process wins; a second init reports an
    // error instead of panicking.
    let _guard = rtcache::telemetry::init_telemetry(config);
}

#[test]
fn task_span_creates_and_records_outcome() {
    let span = rtcache::telemetry::task::start_task_span("default", "report-42", 3);
    rtcache::telemetry::task::record_outcome(&span, "ok", 12.5);
}

#[test]
fn metric_instruments_build_without_provider() {
    rtcache::telemetry::metrics::cache_requests().add(1, &[]);
    rtcache::telemetry::metrics::task_duration_ms().record(1.0, &[]);
}
