//! Per-call option records for connections, publishers and subscribers.
//!
//! Every field is optional on the wire; defaults come from `Config` when the
//! record is resolved against it.

use crate::config::Config;
use crate::signaling::{MuteState, VideoConstraints};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Offer generation parameters for connections created on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOfferOptions {
    #[serde(default = "default_true")]
    pub video: bool,
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub bundle: bool,
    /// Offer towards another SFU rather than an end client.
    #[serde(default)]
    pub internal: bool,
}

impl Default for CreateOfferOptions {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            bundle: true,
            internal: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Transport options shared by publishers and subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Codec configuration blob name; falls back to `Config::media_configuration`.
    #[serde(default)]
    pub media_configuration: Option<String>,

    /// Reuse one transport for every stream of the client.
    #[serde(default)]
    pub single_pc: bool,

    #[serde(default)]
    pub trickle: bool,

    /// Suppress receiver reports towards the client.
    #[serde(rename = "disableRR", default)]
    pub disable_rr: bool,

    /// Overrides `Config::encrypt`.
    #[serde(default)]
    pub encrypt: Option<bool>,

    /// ICE controlling role; overrides `Config::ice_controlling`.
    #[serde(default)]
    pub controlling: Option<bool>,

    /// Network interface name; falls back to the first configured interface.
    #[serde(default)]
    pub interface: Option<String>,

    /// Connection to another SFU: no address translation.
    #[serde(default)]
    pub internal: bool,

    /// Server-side offer. When present the connection is the offerer.
    #[serde(default)]
    pub create_offer: Option<CreateOfferOptions>,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConnectionOptions {
    #[must_use]
    pub fn media_configuration<'a>(&'a self, config: &'a Config) -> &'a str {
        self.media_configuration
            .as_deref()
            .unwrap_or(&config.media_configuration)
    }

    #[must_use]
    pub fn encrypt(&self, config: &Config) -> bool {
        self.encrypt.unwrap_or(config.encrypt)
    }

    #[must_use]
    pub fn controlling(&self, config: &Config) -> bool {
        self.controlling.unwrap_or(config.ice_controlling)
    }
}

/// Options for `add_publisher`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherOptions {
    #[serde(flatten)]
    pub connection: ConnectionOptions,

    #[serde(default)]
    pub label: Option<String>,

    /// Router/server publisher.
    #[serde(default)]
    pub is_server: bool,

    /// Periodic FIR period in milliseconds.
    #[serde(default)]
    pub fir_period: Option<u64>,

    /// Bandwidth target in kbps inherited by every subscriber.
    #[serde(rename = "minVideoBW", default)]
    pub min_video_bw: Option<u64>,

    #[serde(rename = "maxVideoBW", default)]
    pub max_video_bw: Option<u64>,

    /// Codec scheme inherited by subscribers.
    #[serde(default)]
    pub scheme: Option<String>,

    #[serde(default)]
    pub mute_stream: MuteState,
}

/// Options for `add_subscriber`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberOptions {
    #[serde(flatten)]
    pub connection: ConnectionOptions,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub mute_stream: MuteState,

    #[serde(default)]
    pub video: Option<VideoConstraints>,

    #[serde(rename = "maxVideoBW", default)]
    pub max_video_bw: Option<u64>,

    /// Start in slideshow mode.
    #[serde(default)]
    pub slide_show_mode: bool,
}
