//! Metrics definitions for the call signaling service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cs_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (registry, room, connection)
//! - `operation`: bounded by client request types (~11 values)
//! - `kind`: offer, answer, ice_candidate
//! - `outcome`: bounded by error labels plus `success`
//!
//! Room ids and user ids are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle for serving
/// `/metrics`.
///
/// Must be called before any metrics are recorded. Message latency buckets
/// target p99 < 100ms for signaling requests.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("cs_message".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `cs_rooms_active`
pub fn set_rooms_active(count: u64) {
    // Realistic counts stay far below 2^53
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_rooms_active").set(count as f64);
}

/// Metric: `cs_connections_active`
///
/// Open client channels, authenticated and upgraded.
pub fn set_connections_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_connections_active").set(count as f64);
}

/// Metric: `cs_participants_active`
///
/// Participants across all rooms, including those inside a grace period.
pub fn set_participants_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_participants_active").set(count as f64);
}

// ============================================================================
// Latency
// ============================================================================

/// Record client request handling latency.
///
/// Metric: `cs_message_latency_seconds`
/// Labels: `operation`
///
/// SLO target: p99 < 100ms
pub fn record_message_latency(operation: &str, duration: Duration) {
    histogram!("cs_message_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Counters
// ============================================================================

/// Record a relay attempt.
///
/// Metric: `cs_relay_total`
/// Labels: `kind`, `outcome`
pub fn record_relay(kind: &str, outcome: &str) {
    counter!("cs_relay_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a join attempt.
///
/// Metric: `cs_join_total`
/// Labels: `outcome` (success, room_full, room_locked, duplicate_session, ...)
pub fn record_join(outcome: &str) {
    counter!("cs_join_total", "outcome" => outcome.to_string()).increment(1);
}

/// Metric: `cs_grace_expired_total`
///
/// Participants removed because they did not reconnect in time.
pub fn record_grace_expired() {
    counter!("cs_grace_expired_total").increment(1);
}

/// Metric: `cs_reconnect_total`
///
/// Participants resumed from the disconnected state.
pub fn record_reconnect() {
    counter!("cs_reconnect_total").increment(1);
}

/// Record an outbound event dropped because a queue was full.
///
/// Metric: `cs_events_dropped_total`
/// Labels: `actor_type`
pub fn record_event_dropped(actor_type: &str) {
    counter!("cs_events_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record an actor panic event.
///
/// Metric: `cs_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("cs_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}
