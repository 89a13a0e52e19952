//! Structured observability hooks for unit-of-work lifecycle events.
//!
//! This module provides:
//! - Unit-scoped tracing spans via [`unit_span`]
//! - Emission functions for start, fallback, summary, checkpoint and failure
//!
//! Events are emitted at `info!` level with an `event` field so they can be
//! filtered out of JSON logs. Verbosity follows `RUST_LOG`.

use tracing::{info, warn};

/// Span tagged with the unit's model and event type.
///
/// ```ignore
/// run_unit().instrument(unit_span("hres", "heat_wave")).await;
/// // every log line inside now carries model=hres event_type=heat_wave
/// ```
pub fn unit_span(model: &str, event_type: &str) -> tracing::Span {
    tracing::info_span!("ewb.unit", model = %model, event_type = %event_type)
}

pub fn emit_unit_started(model: &str, event_type: &str, cases: usize) {
    info!(event = "unit.started", model = %model, event_type = %event_type, cases = cases);
}

/// Per-unit outcome counts. Emitted before the checkpoint is written.
pub fn emit_unit_summary(model: &str, event_type: &str, success: usize, empty: usize, failed: usize) {
    info!(
        event = "unit.summary",
        model = %model,
        event_type = %event_type,
        success = success,
        empty = empty,
        failed = failed,
    );
}

pub fn emit_fallback(model: &str, source: &str, cases: usize) {
    info!(event = "unit.fallback", model = %model, source = %source, cases = cases);
}

pub fn emit_unit_checkpointed(model: &str, event_type: &str, path: &std::path::Path, records: usize) {
    info!(
        event = "unit.checkpointed",
        model = %model,
        event_type = %event_type,
        path = %path.display(),
        records = records,
    );
}

pub fn emit_unit_resumed(model: &str, event_type: &str, records: usize) {
    info!(event = "unit.resumed", model = %model, event_type = %event_type, records = records);
}

pub fn emit_unit_failed(model: &str, event_type: &str, error: &dyn std::fmt::Display) {
    warn!(event = "unit.failed", model = %model, event_type = %event_type, error = %error);
}

pub fn emit_source_opened(model: &str, kind: &str, location: &str, elapsed_ms: u64) {
    info!(
        event = "source.opened",
        model = %model,
        kind = %kind,
        location = %location,
        elapsed_ms = elapsed_ms,
    );
}

pub fn emit_source_open_failed(error: &dyn std::fmt::Display) {
    warn!(event = "source.open_failed", error = %error);
}
