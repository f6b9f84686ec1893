//! Metric instrument factories for mailq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"mailq"` meter.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Returns the shared meter for mailq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("mailq")
}

/// Counter: items reserved or assigned by a balancer.
/// Labels: `stage`, `host`.
pub fn reservations() -> Counter<u64> {
    meter()
        .u64_counter("mailq.balancer.reservations")
        .with_description("Number of work items reserved to hosts")
        .build()
}

/// Counter: work items finished by a worker.
/// Labels: `stage`, `outcome` ("sent" | "removed" | "retry" | "failed" | "zombie").
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("mailq.worker.items")
        .with_description("Number of work items processed")
        .build()
}

/// Counter: host status changes.
/// Labels: `stage`, `to`.
pub fn host_status_changes() -> Counter<u64> {
    meter()
        .u64_counter("mailq.host.status_changes")
        .with_description("Number of host availability changes")
        .build()
}

/// Gauge: backlog depth of a host as last reported by its workers.
/// Labels: `stage`, `host`.
pub fn queue_depth() -> Gauge<u64> {
    meter()
        .u64_gauge("mailq.host.queue_depth")
        .with_description("Backlog depth per host")
        .build()
}

/// Histogram: batch duration in milliseconds.
/// Labels: `stage`.
pub fn batch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("mailq.worker.batch_duration_ms")
        .with_description("Worker batch duration in milliseconds")
        .with_unit("ms")
        .build()
}
