//! In-memory `MediaEngine` for tests.
//!
//! Records every call, tracks transports, streams and distribution points,
//! and returns scripted statistics and bandwidth samples.

use super::{EngineError, FeedbackPolicy, MediaEngine, MediaStreamConfig, TransportConfig};
use crate::options::CreateOfferOptions;
use crate::signaling::{IceCandidate, MuteState, QualityLayer, VideoConstraints};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Local description returned when none is scripted.
pub const DEFAULT_LOCAL_SDP: &str =
    "v=0\r\no=- 0 0 IN IP4 10.0.0.5\r\ns=-\r\nc=IN IP4 10.0.0.5\r\nm=video 9 UDP/TLS/RTP/SAVPF 100\r\n";

/// A recorded engine call.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    CreateTransport(String),
    CloseTransport(String),
    CreateOffer(String),
    AddMediaStream {
        connection_id: String,
        erizo_stream_id: String,
    },
    RemoveMediaStream {
        connection_id: String,
        erizo_stream_id: String,
    },
    SetRemoteDescription(String),
    AddRemoteCandidate(String),
    Pli(String),
    Fir(String),
    Mute(String, MuteState),
    MaxVideoBw(String, u64),
    MinVideoBw(String, u64),
    QualityLayer(String, QualityLayer),
    MinimumLayer(String, QualityLayer),
    VideoConstraints(String, VideoConstraints),
    EnableHandlers(String, Vec<String>),
    DisableHandlers(String, Vec<String>),
    Feedback(String, FeedbackPolicy),
    SlideshowMode(String, bool),
    SlideshowBelowLayer(String, bool),
    CreateDistributor(String),
    AttachSubscriber(String, String),
    DetachSubscriber(String, String),
    CloseDistributor(String),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<EngineCall>,
    transports: HashMap<String, Vec<String>>,
    transport_configs: HashMap<String, TransportConfig>,
    distributors: HashMap<String, Vec<String>>,
    local_sdp: Option<String>,
    samples: VecDeque<Result<u64, EngineError>>,
    stats: HashMap<String, serde_json::Value>,
    fail_transports: bool,
}

/// Mock media engine.
#[derive(Debug, Default)]
pub struct MockMediaEngine {
    state: Mutex<MockState>,
    stats_delay: Mutex<Option<Duration>>,
}

impl MockMediaEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: EngineCall) {
        self.lock().calls.push(call);
    }

    /// All calls made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count_calls(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Open transports.
    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.lock().transports.len()
    }

    /// Media streams on a transport.
    #[must_use]
    pub fn transport_streams(&self, connection_id: &str) -> Vec<String> {
        self.lock()
            .transports
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Configuration the transport was created with.
    #[must_use]
    pub fn transport_config(&self, connection_id: &str) -> Option<TransportConfig> {
        self.lock().transport_configs.get(connection_id).cloned()
    }

    #[must_use]
    pub fn has_distributor(&self, stream_id: &str) -> bool {
        self.lock().distributors.contains_key(stream_id)
    }

    /// Subscriber streams attached to a distribution point.
    #[must_use]
    pub fn distributor_subscribers(&self, stream_id: &str) -> Vec<String> {
        self.lock()
            .distributors
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn distributor_count(&self) -> usize {
        self.lock().distributors.len()
    }

    pub fn set_local_description(&self, sdp: impl Into<String>) {
        self.lock().local_sdp = Some(sdp.into());
    }

    /// Queue bandwidth sample results, returned in order.
    pub fn push_samples(&self, samples: impl IntoIterator<Item = Result<u64, EngineError>>) {
        self.lock().samples.extend(samples);
    }

    pub fn set_stats(&self, erizo_stream_id: impl Into<String>, stats: serde_json::Value) {
        self.lock().stats.insert(erizo_stream_id.into(), stats);
    }

    pub fn set_stats_delay(&self, delay: Duration) {
        *self
            .stats_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Make every following `create_transport` fail.
    pub fn fail_transports(&self, fail: bool) {
        self.lock().fail_transports = fail;
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    fn create_transport(&self, config: &TransportConfig) -> Result<(), EngineError> {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::CreateTransport(config.connection_id.clone()));
        if state.fail_transports {
            return Err(EngineError::Unavailable("no ports left".to_string()));
        }
        state
            .transports
            .insert(config.connection_id.clone(), Vec::new());
        state
            .transport_configs
            .insert(config.connection_id.clone(), config.clone());
        Ok(())
    }

    fn close_transport(&self, connection_id: &str) {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::CloseTransport(connection_id.to_string()));
        state.transports.remove(connection_id);
    }

    fn create_offer(
        &self,
        connection_id: &str,
        _options: &CreateOfferOptions,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::CreateOffer(connection_id.to_string()));
        Ok(())
    }

    fn add_media_stream(
        &self,
        connection_id: &str,
        stream: &MediaStreamConfig,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::AddMediaStream {
            connection_id: connection_id.to_string(),
            erizo_stream_id: stream.erizo_stream_id.clone(),
        });
        let streams = state
            .transports
            .get_mut(connection_id)
            .ok_or_else(|| EngineError::TransportNotFound(connection_id.to_string()))?;
        streams.push(stream.erizo_stream_id.clone());
        Ok(())
    }

    fn remove_media_stream(
        &self,
        connection_id: &str,
        erizo_stream_id: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::RemoveMediaStream {
            connection_id: connection_id.to_string(),
            erizo_stream_id: erizo_stream_id.to_string(),
        });
        if let Some(streams) = state.transports.get_mut(connection_id) {
            streams.retain(|s| s != erizo_stream_id);
        }
        Ok(())
    }

    fn set_remote_description(&self, connection_id: &str, _sdp: &str) -> Result<(), EngineError> {
        self.record(EngineCall::SetRemoteDescription(connection_id.to_string()));
        Ok(())
    }

    fn local_description(&self, _connection_id: &str) -> Result<String, EngineError> {
        Ok(self
            .lock()
            .local_sdp
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCAL_SDP.to_string()))
    }

    fn add_remote_candidate(
        &self,
        connection_id: &str,
        _candidate: &IceCandidate,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::AddRemoteCandidate(connection_id.to_string()));
        Ok(())
    }

    fn generate_pli(&self, erizo_stream_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Pli(erizo_stream_id.to_string()));
        Ok(())
    }

    fn generate_fir(&self, erizo_stream_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Fir(erizo_stream_id.to_string()));
        Ok(())
    }

    fn mute_stream(&self, erizo_stream_id: &str, mute: MuteState) -> Result<(), EngineError> {
        self.record(EngineCall::Mute(erizo_stream_id.to_string(), mute));
        Ok(())
    }

    fn set_max_video_bw(&self, erizo_stream_id: &str, kbps: u64) -> Result<(), EngineError> {
        self.record(EngineCall::MaxVideoBw(erizo_stream_id.to_string(), kbps));
        Ok(())
    }

    fn set_min_video_bw(&self, erizo_stream_id: &str, kbps: u64) -> Result<(), EngineError> {
        self.record(EngineCall::MinVideoBw(erizo_stream_id.to_string(), kbps));
        Ok(())
    }

    fn set_quality_layer(
        &self,
        erizo_stream_id: &str,
        layer: QualityLayer,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::QualityLayer(erizo_stream_id.to_string(), layer));
        Ok(())
    }

    fn set_minimum_layer(
        &self,
        erizo_stream_id: &str,
        layer: QualityLayer,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::MinimumLayer(erizo_stream_id.to_string(), layer));
        Ok(())
    }

    fn set_video_constraints(
        &self,
        erizo_stream_id: &str,
        constraints: VideoConstraints,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::VideoConstraints(
            erizo_stream_id.to_string(),
            constraints,
        ));
        Ok(())
    }

    fn enable_handlers(
        &self,
        erizo_stream_id: &str,
        handlers: &[String],
    ) -> Result<(), EngineError> {
        self.record(EngineCall::EnableHandlers(
            erizo_stream_id.to_string(),
            handlers.to_vec(),
        ));
        Ok(())
    }

    fn disable_handlers(
        &self,
        erizo_stream_id: &str,
        handlers: &[String],
    ) -> Result<(), EngineError> {
        self.record(EngineCall::DisableHandlers(
            erizo_stream_id.to_string(),
            handlers.to_vec(),
        ));
        Ok(())
    }

    fn set_feedback_policy(
        &self,
        erizo_stream_id: &str,
        policy: FeedbackPolicy,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::Feedback(erizo_stream_id.to_string(), policy));
        Ok(())
    }

    fn set_slideshow_mode(&self, erizo_stream_id: &str, enabled: bool) -> Result<(), EngineError> {
        self.record(EngineCall::SlideshowMode(erizo_stream_id.to_string(), enabled));
        Ok(())
    }

    fn set_slideshow_below_layer(
        &self,
        erizo_stream_id: &str,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SlideshowBelowLayer(
            erizo_stream_id.to_string(),
            enabled,
        ));
        Ok(())
    }

    fn create_distributor(&self, stream_id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::CreateDistributor(stream_id.to_string()));
        state.distributors.insert(stream_id.to_string(), Vec::new());
        Ok(())
    }

    fn attach_subscriber(
        &self,
        stream_id: &str,
        subscriber_stream_id: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::AttachSubscriber(
            stream_id.to_string(),
            subscriber_stream_id.to_string(),
        ));
        let subscribers = state
            .distributors
            .get_mut(stream_id)
            .ok_or_else(|| EngineError::StreamNotFound(stream_id.to_string()))?;
        subscribers.push(subscriber_stream_id.to_string());
        Ok(())
    }

    fn detach_subscriber(
        &self,
        stream_id: &str,
        subscriber_stream_id: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::DetachSubscriber(
            stream_id.to_string(),
            subscriber_stream_id.to_string(),
        ));
        if let Some(subscribers) = state.distributors.get_mut(stream_id) {
            subscribers.retain(|s| s != subscriber_stream_id);
        }
        Ok(())
    }

    async fn close_distributor(&self, stream_id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::CloseDistributor(stream_id.to_string()));
        state.distributors.remove(stream_id);
        Ok(())
    }

    async fn get_stats(&self, erizo_stream_id: &str) -> Result<serde_json::Value, EngineError> {
        let delay = *self
            .stats_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .lock()
            .stats
            .get(erizo_stream_id)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({})))
    }

    async fn sample_bandwidth(&self, erizo_stream_id: &str) -> Result<u64, EngineError> {
        self.lock()
            .samples
            .pop_front()
            .unwrap_or_else(|| Err(EngineError::StreamNotFound(erizo_stream_id.to_string())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn transport(id: &str) -> TransportConfig {
        TransportConfig {
            connection_id: id.to_string(),
            media_configuration: "default".to_string(),
            min_port: 30000,
            max_port: 40000,
            ice_controlling: false,
            interface: None,
            encrypt: true,
            trickle: false,
            disable_rr: false,
        }
    }

    #[test]
    fn test_mock_tracks_transports_and_streams() {
        let engine = MockMediaEngine::new();
        engine.create_transport(&transport("c1_1")).unwrap();
        engine
            .add_media_stream(
                "c1_1",
                &MediaStreamConfig {
                    erizo_stream_id: "c1_s1".to_string(),
                    label: None,
                    role: super::super::StreamRole::Publisher,
                },
            )
            .unwrap();

        assert_eq!(engine.transport_count(), 1);
        assert_eq!(engine.transport_streams("c1_1"), vec!["c1_s1".to_string()]);

        engine.close_transport("c1_1");
        assert_eq!(engine.transport_count(), 0);
        assert_eq!(engine.calls().len(), 3);
    }

    #[test]
    fn test_mock_transport_failure() {
        let engine = MockMediaEngine::new();
        engine.fail_transports(true);
        assert!(engine.create_transport(&transport("c1_1")).is_err());
        assert_eq!(engine.transport_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_distributor_lifecycle() {
        let engine = MockMediaEngine::new();
        engine.create_distributor("s1").unwrap();
        engine.attach_subscriber("s1", "c2_s1").unwrap();
        assert_eq!(engine.distributor_subscribers("s1"), vec!["c2_s1".to_string()]);

        engine.detach_subscriber("s1", "c2_s1").unwrap();
        assert!(engine.distributor_subscribers("s1").is_empty());

        engine.close_distributor("s1").await.unwrap();
        assert!(!engine.has_distributor("s1"));
        assert!(engine.attach_subscriber("s1", "c3_s1").is_err());
    }

    #[tokio::test]
    async fn test_mock_scripted_samples() {
        let engine = MockMediaEngine::new();
        engine.push_samples([Ok(500_000), Err(EngineError::Rejected("gone".to_string()))]);

        assert_eq!(engine.sample_bandwidth("x").await, Ok(500_000));
        assert!(engine.sample_bandwidth("x").await.is_err());
        // Exhausted queue reports the stream as missing
        assert!(matches!(
            engine.sample_bandwidth("x").await,
            Err(EngineError::StreamNotFound(_))
        ));
    }
}
