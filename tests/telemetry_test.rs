//! Integration tests for telemetry initialization and span helpers.

use mailq::model::{HostId, Slot, Stage};
use uuid::Uuid;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    let config = mailq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "mailq-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = mailq::telemetry::init_telemetry(config);
}

#[test]
fn run_span_creates() {
    let span =
        mailq::telemetry::work::start_run_span("balance", Stage::Send, "send1", &Uuid::new_v4());
    let _enter = span.enter();
}

#[test]
fn batch_span_records_outcome() {
    let span = mailq::telemetry::work::start_batch_span(
        Stage::Sort,
        Slot {
            host: HostId(1),
            index: 2,
        },
    );
    mailq::telemetry::work::record_outcome(&span, "ok");
}

#[test]
fn metric_instruments_build() {
    use opentelemetry::KeyValue;

    let attrs = [KeyValue::new("stage", "send")];
    mailq::telemetry::metrics::reservations().add(1, &attrs);
    mailq::telemetry::metrics::items_processed().add(1, &attrs);
    mailq::telemetry::metrics::queue_depth().record(5, &attrs);
    mailq::telemetry::metrics::batch_duration_ms().record(1.5, &attrs);
}
