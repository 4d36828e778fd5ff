//! Metrics definitions for the SFU controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by enums in this crate:
//! - `type`: 4 signaling message kinds
//! - `message`: 4 bandwidth alert kinds
//! - `kind`: 4 keyframe request sources (slideshow, recovery, fir, request)
//! - `role`: 2 node roles (publisher, subscriber)
//! - `status`: 2 registration outcomes (success, error)
//! - `message_type`: controller mailbox message kinds (~10)
//!
//! Stream and client ids are never used as labels.

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
        // Controller loop latency - in-process work, sub-millisecond expected
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_message".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Metrics (Gauges)
// ============================================================================

/// Set the number of live publishers.
///
/// Metric: `sfu_publishers_active`
/// Labels: none
pub fn set_publishers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_publishers_active").set(count as f64);
}

/// Set the number of live subscribers across all publishers.
///
/// Metric: `sfu_subscribers_active`
/// Labels: none
pub fn set_subscribers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_subscribers_active").set(count as f64);
}

/// Set the number of open Media Engine transports.
///
/// Metric: `sfu_connections_active`
/// Labels: none
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

/// Set the controller mailbox depth.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Event Metrics (Counters)
// ============================================================================

/// Count an inbound signaling message.
///
/// Metric: `sfu_signaling_messages_total`
/// Labels: `type` (sdp, candidate, updatestream, control)
pub fn record_signaling_message(message_type: &str) {
    counter!("sfu_signaling_messages_total", "type" => message_type.to_string()).increment(1);
}

/// Count a bandwidth adaptation alert.
///
/// Metric: `sfu_bandwidth_alerts_total`
/// Labels: `message` (insufficient, recovering, recovered, audio-only)
pub fn record_bandwidth_alert(message: &str) {
    counter!("sfu_bandwidth_alerts_total", "message" => message.to_string()).increment(1);
}

/// Count a keyframe request sent to a publisher.
///
/// Metric: `sfu_keyframe_requests_total`
/// Labels: `kind` (slideshow, recovery, fir, request)
pub fn record_keyframe_request(kind: &str) {
    counter!("sfu_keyframe_requests_total", "kind" => kind.to_string()).increment(1);
}

/// Count a node whose transport failed.
///
/// Metric: `sfu_node_failures_total`
/// Labels: `role` (publisher, subscriber)
pub fn record_node_failure(role: &str) {
    counter!("sfu_node_failures_total", "role" => role.to_string()).increment(1);
}

/// Count an agent registration attempt.
///
/// Metric: `sfu_registration_attempts_total`
/// Labels: `status` (success, error)
pub fn record_registration_attempt(status: &str) {
    counter!("sfu_registration_attempts_total", "status" => status.to_string()).increment(1);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Record controller message handling latency.
///
/// Metric: `sfu_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("sfu_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}
