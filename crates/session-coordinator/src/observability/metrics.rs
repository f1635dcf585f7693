//! Metrics definitions for the session coordinator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sc_` prefix for session coordinator
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion. Room, participant
//! and producer ids are never used as labels.
//! - `outcome`: admitted, waiting, denied, rejected
//! - `action`: grant, revoke, approve, deny
//! - `operation`: bounded by media engine methods (~10) and signaling types (~16)
//! - `kind`: not_found, rejected, unavailable
//! - `direction`: up, down

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Media engine latency buckets - sidecar HTTP call
        .set_buckets_for_metric(
            Matcher::Prefix("sc_media_engine".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set media engine buckets: {e}"))?
        // Signaling message latency buckets (p99 < 100ms)
        .set_buckets_for_metric(
            Matcher::Prefix("sc_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Connection Metrics (Gauges)
// ============================================================================

/// Metric: `sc_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_rooms_active").set(count as f64);
}

/// Metric: `sc_participants_active`
///
/// Admitted participants across all rooms (waiting entries excluded).
pub fn set_participants_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_participants_active").set(count as f64);
}

/// Metric: `sc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_connections_active").set(count as f64);
}

/// Metric: `sc_actor_mailbox_depth`
/// Labels: `actor_type` (room, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Admission & Permission Metrics (Counters)
// ============================================================================

/// Metric: `sc_admission_total`
/// Labels: `outcome` (admitted, waiting, denied, rejected)
pub fn record_admission(outcome: &str) {
    counter!("sc_admission_total", "outcome" => outcome.to_string()).increment(1);
}

/// Metric: `sc_permission_changes_total`
/// Labels: `action` (grant, revoke), `result` (applied, unchanged, denied)
pub fn record_permission_change(action: &str, result: &str) {
    counter!(
        "sc_permission_changes_total",
        "action" => action.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Metric: `sc_producers_closed_total`
/// Labels: `reason` (owner, revoked, left, media_state, shutdown)
pub fn record_producer_closed(reason: &str) {
    counter!("sc_producers_closed_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Media Engine Metrics
// ============================================================================

/// Metric: `sc_media_engine_latency_seconds`
/// Labels: `operation`
pub fn record_media_engine_latency(operation: &str, duration: Duration) {
    histogram!("sc_media_engine_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `sc_media_engine_errors_total`
/// Labels: `operation`, `kind` (not_found, rejected, unavailable)
pub fn record_media_engine_error(operation: &str, kind: &str) {
    counter!(
        "sc_media_engine_errors_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ============================================================================
// Quality Metrics
// ============================================================================

/// Metric: `sc_quality_tier_changes_total`
/// Labels: `direction` (up, down)
pub fn record_quality_tier_change(direction: &str) {
    counter!("sc_quality_tier_changes_total", "direction" => direction.to_string()).increment(1);
}

/// Metric: `sc_consumer_pauses_total`
///
/// Consumers paused by the quality adapter for a degraded link.
pub fn record_consumer_pause() {
    counter!("sc_consumer_pauses_total").increment(1);
}

// ============================================================================
// Signaling & Actor Health
// ============================================================================

/// Metric: `sc_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("sc_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `sc_messages_dropped_total`
/// Labels: `channel` (presence, mailbox)
///
/// Outbound notifications dropped because a participant's queue was full.
pub fn record_message_dropped(channel: &str) {
    counter!("sc_messages_dropped_total", "channel" => channel.to_string()).increment(1);
}

/// Metric: `sc_projection_failures_total`
pub fn record_projection_failure() {
    counter!("sc_projection_failures_total").increment(1);
}

/// Metric: `sc_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("sc_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Metric: `sc_errors_total`
/// Labels: `operation`, `error_type`
///
/// Every error returned to a participant.
pub fn record_error(operation: &str, error_type: &str) {
    counter!(
        "sc_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}
