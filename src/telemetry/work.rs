//! Run and batch span helpers.
//!
//! A balancer invocation or a fleet run gets one run span; every worker batch
//! gets a child span whose outcome is filled in when the batch ends.

use tracing::Span;
use uuid::Uuid;

use crate::model::{Slot, Stage};

/// Start a span covering one balancer or fleet run.
pub fn start_run_span(kind: &str, stage: Stage, host: &str, run_id: &Uuid) -> Span {
    tracing::info_span!(
        "mailq.run",
        "run.kind" = kind,
        "run.stage" = %stage,
        "run.host" = host,
        "run.id" = %run_id,
    )
}

/// Start a span for one claimed batch.
///
/// The `batch.outcome` field is declared empty and filled by [`record_outcome`].
pub fn start_batch_span(stage: Stage, slot: Slot) -> Span {
    tracing::info_span!(
        "mailq.batch",
        "batch.stage" = %stage,
        "batch.slot" = %slot,
        "batch.outcome" = tracing::field::Empty,
    )
}

/// Record a batch outcome on its span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("batch.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome = outcome, "batch_finished");
    });
}
