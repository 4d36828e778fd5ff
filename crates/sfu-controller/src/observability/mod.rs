//! Observability for the SFU controller.
//!
//! # Privacy by Default
//!
//! Actor loops use `#[instrument(skip_all)]`. Client and stream ids appear in
//! log fields only, never as metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_publishers_active` | Gauge | none | Live publishers |
//! | `sfu_subscribers_active` | Gauge | none | Live subscribers |
//! | `sfu_connections_active` | Gauge | none | Open engine transports |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Controller backpressure |
//! | `sfu_signaling_messages_total` | Counter | `type` | Inbound signaling |
//! | `sfu_bandwidth_alerts_total` | Counter | `message` | Adaptation alerts |
//! | `sfu_keyframe_requests_total` | Counter | `kind` | PLI/FIR sent to publishers |
//! | `sfu_node_failures_total` | Counter | `role` | Transport failures |
//! | `sfu_registration_attempts_total` | Counter | `status` | Agent registration |
//! | `sfu_message_latency_seconds` | Histogram | `message_type` | Controller message handling |

pub mod metrics;

pub use metrics::{
    init_metrics_recorder, record_bandwidth_alert, record_keyframe_request,
    record_message_latency, record_node_failure, record_registration_attempt,
    record_signaling_message, set_actor_mailbox_depth, set_connections_active,
    set_publishers_active, set_subscribers_active,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "sfu_controller=debug";

/// Install the global tracing subscriber for an embedding binary.
///
/// Honors `RUST_LOG`; `json` selects structured JSON output.
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
    .map_err(|e| format!("Failed to install tracing subscriber: {e}"))
}
