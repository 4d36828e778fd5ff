//! Media Engine contract.
//!
//! The Media Engine is the native WebRTC transport that performs ICE, DTLS,
//! RTP forwarding and statistics collection. The controller drives it through
//! the `MediaEngine` trait and receives its asynchronous notifications as
//! `EngineEvent`s on a channel handed to the controller actor.
//!
//! Control calls are synchronous and cheap. The two calls that wait on the
//! engine (`get_stats`, `sample_bandwidth`) are async and are always awaited
//! off the controller loop.

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use crate::options::CreateOfferOptions;
use crate::signaling::{IceCandidate, MuteState, QualityLayer, VideoConstraints};
use async_trait::async_trait;
use thiserror::Error;

/// Media Engine failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("engine rejected call: {0}")]
    Rejected(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl From<EngineError> for crate::errors::SfuError {
    fn from(err: EngineError) -> Self {
        crate::errors::SfuError::Engine(err.to_string())
    }
}

/// Transport-level status reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Initial,
    Started,
    Gathered,
    Ready,
    Finished,
    Candidate,
    Sdp,
    SdpProcessed,
    Failed,
}

impl ConnectionStatus {
    /// Numeric status code used by the engine.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            ConnectionStatus::Initial => 101,
            ConnectionStatus::Started => 102,
            ConnectionStatus::Gathered => 103,
            ConnectionStatus::Ready => 104,
            ConnectionStatus::Finished => 105,
            ConnectionStatus::Candidate => 201,
            ConnectionStatus::Sdp => 202,
            ConnectionStatus::SdpProcessed => 203,
            ConnectionStatus::Failed => 500,
        }
    }

    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            101 => Some(ConnectionStatus::Initial),
            102 => Some(ConnectionStatus::Started),
            103 => Some(ConnectionStatus::Gathered),
            104 => Some(ConnectionStatus::Ready),
            105 => Some(ConnectionStatus::Finished),
            201 => Some(ConnectionStatus::Candidate),
            202 => Some(ConnectionStatus::Sdp),
            203 => Some(ConnectionStatus::SdpProcessed),
            500 => Some(ConnectionStatus::Failed),
            _ => None,
        }
    }
}

/// Asynchronous notification from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Transport status change. `stream_id` is set when the status concerns a
    /// single media stream of a multiplexed transport.
    Status {
        connection_id: String,
        status: ConnectionStatus,
        message: String,
        stream_id: Option<String>,
    },

    /// Locally gathered ICE candidate.
    Candidate {
        connection_id: String,
        candidate: IceCandidate,
    },

    /// Engine-side fallback to slideshow below the lowest layer.
    SlideshowFallback {
        erizo_stream_id: String,
        active: bool,
    },
}

/// Feedback (REMB/RR) reporting policy for an outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackPolicy {
    /// Forward the subscriber's own feedback.
    Normal,
    /// Report a fixed bitrate.
    Limited { rate_bps: u64 },
    /// Report the engine minimum.
    Minimal,
}

/// Transport creation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub connection_id: String,
    pub media_configuration: String,
    pub min_port: u16,
    pub max_port: u16,
    pub ice_controlling: bool,
    pub interface: Option<String>,
    pub encrypt: bool,
    pub trickle: bool,
    pub disable_rr: bool,
}

/// Media stream role on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Publisher,
    Subscriber,
}

impl StreamRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StreamRole::Publisher => "publisher",
            StreamRole::Subscriber => "subscriber",
        }
    }
}

/// Media stream creation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStreamConfig {
    pub erizo_stream_id: String,
    pub label: Option<String>,
    pub role: StreamRole,
}

/// Operations the controller needs from the native media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    fn create_transport(&self, config: &TransportConfig) -> Result<(), EngineError>;

    fn close_transport(&self, connection_id: &str);

    fn create_offer(
        &self,
        connection_id: &str,
        options: &CreateOfferOptions,
    ) -> Result<(), EngineError>;

    fn add_media_stream(
        &self,
        connection_id: &str,
        stream: &MediaStreamConfig,
    ) -> Result<(), EngineError>;

    fn remove_media_stream(
        &self,
        connection_id: &str,
        erizo_stream_id: &str,
    ) -> Result<(), EngineError>;

    fn set_remote_description(&self, connection_id: &str, sdp: &str) -> Result<(), EngineError>;

    fn local_description(&self, connection_id: &str) -> Result<String, EngineError>;

    fn add_remote_candidate(
        &self,
        connection_id: &str,
        candidate: &IceCandidate,
    ) -> Result<(), EngineError>;

    /// Picture Loss Indication towards the stream's sender.
    fn generate_pli(&self, erizo_stream_id: &str) -> Result<(), EngineError>;

    /// Full Intra Request towards the stream's sender.
    fn generate_fir(&self, erizo_stream_id: &str) -> Result<(), EngineError>;

    fn mute_stream(&self, erizo_stream_id: &str, mute: MuteState) -> Result<(), EngineError>;

    fn set_max_video_bw(&self, erizo_stream_id: &str, kbps: u64) -> Result<(), EngineError>;

    fn set_min_video_bw(&self, erizo_stream_id: &str, kbps: u64) -> Result<(), EngineError>;

    fn set_quality_layer(
        &self,
        erizo_stream_id: &str,
        layer: QualityLayer,
    ) -> Result<(), EngineError>;

    fn set_minimum_layer(
        &self,
        erizo_stream_id: &str,
        layer: QualityLayer,
    ) -> Result<(), EngineError>;

    fn set_video_constraints(
        &self,
        erizo_stream_id: &str,
        constraints: VideoConstraints,
    ) -> Result<(), EngineError>;

    fn enable_handlers(&self, erizo_stream_id: &str, handlers: &[String])
        -> Result<(), EngineError>;

    fn disable_handlers(
        &self,
        erizo_stream_id: &str,
        handlers: &[String],
    ) -> Result<(), EngineError>;

    fn set_feedback_policy(
        &self,
        erizo_stream_id: &str,
        policy: FeedbackPolicy,
    ) -> Result<(), EngineError>;

    fn set_slideshow_mode(&self, erizo_stream_id: &str, enabled: bool) -> Result<(), EngineError>;

    fn set_slideshow_below_layer(
        &self,
        erizo_stream_id: &str,
        enabled: bool,
    ) -> Result<(), EngineError>;

    /// Create the one-to-many distribution point for a published stream.
    fn create_distributor(&self, stream_id: &str) -> Result<(), EngineError>;

    fn attach_subscriber(
        &self,
        stream_id: &str,
        subscriber_stream_id: &str,
    ) -> Result<(), EngineError>;

    fn detach_subscriber(
        &self,
        stream_id: &str,
        subscriber_stream_id: &str,
    ) -> Result<(), EngineError>;

    /// Close the distribution point. Completes once the engine has released it.
    async fn close_distributor(&self, stream_id: &str) -> Result<(), EngineError>;

    /// Per-stream statistics as reported by the engine.
    async fn get_stats(&self, erizo_stream_id: &str) -> Result<serde_json::Value, EngineError>;

    /// Current outbound bandwidth estimate in bits per second.
    async fn sample_bandwidth(&self, erizo_stream_id: &str) -> Result<u64, EngineError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            ConnectionStatus::Initial,
            ConnectionStatus::Started,
            ConnectionStatus::Gathered,
            ConnectionStatus::Ready,
            ConnectionStatus::Finished,
            ConnectionStatus::Candidate,
            ConnectionStatus::Sdp,
            ConnectionStatus::SdpProcessed,
            ConnectionStatus::Failed,
        ] {
            assert_eq!(ConnectionStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(ConnectionStatus::from_code(999), None);
        assert_eq!(ConnectionStatus::Failed.code(), 500);
    }

    #[test]
    fn test_engine_error_maps_to_internal() {
        let err: crate::errors::SfuError = EngineError::Rejected("bad sdp".to_string()).into();
        assert_eq!(err.error_code(), 8);
        assert_eq!(err.client_message(), "An internal error occurred");
    }
}
