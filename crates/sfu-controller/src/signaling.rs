//! Signaling message and node event types.
//!
//! Inbound messages arrive from the signaling layer as JSON objects tagged by
//! `type`. Outbound lifecycle notifications are delivered per node as
//! `NodeEvent`s on the receiver returned by `add_publisher`/`add_subscriber`.

use serde::{Deserialize, Serialize};

/// Inbound signaling message addressed to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// Remote session description.
    Sdp {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<SdpConfig>,
    },

    /// Remote ICE candidate.
    Candidate { candidate: IceCandidate },

    /// Description and/or stream parameter update.
    #[serde(rename = "updatestream")]
    UpdateStream {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<StreamConfigUpdate>,
    },

    /// Named control action.
    Control { action: ControlAction },
}

impl SignalingMessage {
    /// Parse a JSON signaling message.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Bounded label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Sdp { .. } => "sdp",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::UpdateStream { .. } => "updatestream",
            SignalingMessage::Control { .. } => "control",
        }
    }
}

/// Extra parameters carried with an `sdp` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SdpConfig {
    /// Maximum video bandwidth in kbps.
    #[serde(rename = "maxVideoBW", default, skip_serializing_if = "Option::is_none")]
    pub max_video_bw: Option<u64>,
}

/// ICE candidate as exchanged with clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: u32,
    pub candidate: String,
}

/// Parameters of an `updatestream` message. Every field is optional and
/// any combination may be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfigUpdate {
    /// New minimum bandwidth target in kbps.
    #[serde(rename = "minVideoBW", default, skip_serializing_if = "Option::is_none")]
    pub min_video_bw: Option<u64>,

    /// New maximum video bandwidth in kbps.
    #[serde(rename = "maxVideoBW", default, skip_serializing_if = "Option::is_none")]
    pub max_video_bw: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute_stream: Option<MuteState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_layer: Option<QualityLayer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_layer: Option<QualityLayer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoConstraints>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_handlers: Option<Vec<String>>,

    /// Primary slideshow trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide_show_mode: Option<SlideshowSetting>,

    /// Let the engine fall back to slideshow below the lowest layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide_show_below_layer: Option<bool>,
}

/// Named control action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlAction {
    pub name: String,
    #[serde(default)]
    pub enable: Option<bool>,
    #[serde(default)]
    pub handlers: Vec<String>,
    /// Flags for the `mute` action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute_stream: Option<MuteState>,
    /// Apply to the publisher's stream instead of the subscriber's.
    #[serde(default)]
    pub publisher_side: bool,
}

/// Audio/video mute flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteState {
    #[serde(default)]
    pub video: bool,
    #[serde(default)]
    pub audio: bool,
}

/// Spatial/temporal layer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityLayer {
    pub spatial_layer: i32,
    pub temporal_layer: i32,
}

/// Video constraints requested by a subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub frame_rate: Option<u32>,
}

/// Slideshow request: a plain toggle or an explicit period in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlideshowSetting {
    Toggle(bool),
    Period(u64),
}

impl SlideshowSetting {
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        match self {
            SlideshowSetting::Toggle(enabled) => *enabled,
            SlideshowSetting::Period(_) => true,
        }
    }

    #[must_use]
    pub const fn period_ms(&self) -> Option<u64> {
        match self {
            SlideshowSetting::Toggle(_) => None,
            SlideshowSetting::Period(ms) => Some(*ms),
        }
    }
}

/// Bandwidth adaptation alert kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertMessage {
    Insufficient,
    Recovering,
    Recovered,
    AudioOnly,
}

impl AlertMessage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            AlertMessage::Insufficient => "insufficient",
            AlertMessage::Recovering => "recovering",
            AlertMessage::Recovered => "recovered",
            AlertMessage::AudioOnly => "audio-only",
        }
    }
}

/// Lifecycle notification delivered to the owner of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename = "init")]
    Init,

    #[serde(rename = "started")]
    Started,

    #[serde(rename = "offer")]
    Offer { sdp: String },

    #[serde(rename = "answer")]
    Answer { sdp: String },

    #[serde(rename = "candidate")]
    Candidate { candidate: IceCandidate },

    #[serde(rename = "ready")]
    Ready,

    #[serde(rename = "failed")]
    Failed { sdp: String },

    #[serde(rename = "bandwidthAlert")]
    BandwidthAlert { message: AlertMessage, bandwidth: u64 },

    #[serde(rename = "scheme-slideshow-change")]
    SlideshowChange { enabled: bool },

    /// The node was torn down by the controller.
    #[serde(rename = "closed")]
    Closed,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_sdp_message() {
        let msg = SignalingMessage::from_json(
            r#"{"type":"sdp","sdp":"v=0\r\n","config":{"maxVideoBW":300}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalingMessage::Sdp {
                sdp: "v=0\r\n".to_string(),
                config: Some(SdpConfig {
                    max_video_bw: Some(300)
                }),
            }
        );
        assert_eq!(msg.kind(), "sdp");
    }

    #[test]
    fn test_parse_candidate_message() {
        let msg = SignalingMessage::from_json(
            r#"{"type":"candidate","candidate":{"sdpMid":"0","sdpMLineIndex":0,"candidate":"a=candidate:1 1 udp 2122 10.0.0.1 5000 typ host"}}"#,
        )
        .unwrap();
        let SignalingMessage::Candidate { candidate } = msg else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, 0);
        assert!(candidate.candidate.contains("typ host"));
    }

    #[test]
    fn test_parse_updatestream_with_full_config() {
        let raw = json!({
            "type": "updatestream",
            "config": {
                "minVideoBW": 1000,
                "maxVideoBW": 2000,
                "muteStream": {"video": true, "audio": false},
                "qualityLayer": {"spatialLayer": 1, "temporalLayer": 2},
                "minLayer": {"spatialLayer": 0, "temporalLayer": 0},
                "video": {"width": 640, "height": 480, "frameRate": 15},
                "disableHandlers": ["bwe"],
                "slideShowMode": 4000
            }
        });
        let msg: SignalingMessage = serde_json::from_value(raw).unwrap();
        let SignalingMessage::UpdateStream { sdp, config } = msg else {
            panic!("expected updatestream");
        };
        assert!(sdp.is_none());
        let config = config.unwrap();
        assert_eq!(config.min_video_bw, Some(1000));
        assert_eq!(config.max_video_bw, Some(2000));
        assert_eq!(
            config.mute_stream,
            Some(MuteState {
                video: true,
                audio: false
            })
        );
        assert_eq!(config.quality_layer.unwrap().temporal_layer, 2);
        assert_eq!(config.video.unwrap().frame_rate, Some(15));
        assert_eq!(config.disable_handlers, Some(vec!["bwe".to_string()]));
        assert_eq!(config.slide_show_mode, Some(SlideshowSetting::Period(4000)));
    }

    #[test]
    fn test_parse_control_message() {
        let msg = SignalingMessage::from_json(
            r#"{"type":"control","action":{"name":"controlhandlers","enable":false,"handlers":["bwe","pli"],"publisherSide":true}}"#,
        )
        .unwrap();
        let SignalingMessage::Control { action } = msg else {
            panic!("expected control");
        };
        assert_eq!(action.name, "controlhandlers");
        assert_eq!(action.enable, Some(false));
        assert_eq!(action.handlers.len(), 2);
        assert!(action.publisher_side);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(SignalingMessage::from_json(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_slideshow_setting_variants() {
        let toggle: SlideshowSetting = serde_json::from_str("true").unwrap();
        assert!(toggle.is_enabled());
        assert_eq!(toggle.period_ms(), None);

        let off: SlideshowSetting = serde_json::from_str("false").unwrap();
        assert!(!off.is_enabled());

        let period: SlideshowSetting = serde_json::from_str("2500").unwrap();
        assert!(period.is_enabled());
        assert_eq!(period.period_ms(), Some(2500));
    }

    #[test]
    fn test_node_event_wire_format() {
        let alert = NodeEvent::BandwidthAlert {
            message: AlertMessage::AudioOnly,
            bandwidth: 12_000,
        };
        assert_eq!(
            serde_json::to_value(&alert).unwrap(),
            json!({"type": "bandwidthAlert", "message": "audio-only", "bandwidth": 12000})
        );

        let slideshow = NodeEvent::SlideshowChange { enabled: true };
        assert_eq!(
            serde_json::to_value(&slideshow).unwrap(),
            json!({"type": "scheme-slideshow-change", "enabled": true})
        );

        assert_eq!(
            serde_json::to_value(NodeEvent::Ready).unwrap(),
            json!({"type": "ready"})
        );
    }
}
