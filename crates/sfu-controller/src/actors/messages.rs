//! Messages accepted by the `SessionControllerActor`.

use crate::errors::SfuError;
use crate::options::{PublisherOptions, SubscriberOptions};
use crate::session::NodeEvents;
use crate::signaling::SignalingMessage;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Statistics for one stream, keyed by `publisher` and by each subscriber's
/// client id. Every entry carries its connection's `metadata`.
pub type StreamStats = HashMap<String, serde_json::Value>;

/// Commands handled by the controller actor. Each carries a oneshot for the
/// reply.
#[derive(Debug)]
pub enum ControllerMessage {
    AddPublisher {
        client_id: String,
        stream_id: String,
        options: PublisherOptions,
        respond_to: oneshot::Sender<Result<NodeEvents, SfuError>>,
    },

    AddSubscriber {
        client_id: String,
        stream_id: String,
        options: SubscriberOptions,
        respond_to: oneshot::Sender<Result<NodeEvents, SfuError>>,
    },

    RemovePublisher {
        client_id: String,
        stream_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    RemoveSubscriber {
        client_id: String,
        stream_id: String,
        respond_to: oneshot::Sender<()>,
    },

    /// Remove every subscription of a client; replies with the stream ids.
    RemoveSubscriptions {
        client_id: String,
        respond_to: oneshot::Sender<Vec<String>>,
    },

    ProcessSignaling {
        client_id: String,
        stream_id: String,
        message: SignalingMessage,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Ask a stream's publisher for a keyframe.
    RequestKeyframe {
        stream_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    GetStreamStats {
        stream_id: String,
        respond_to: oneshot::Sender<Result<StreamStats, SfuError>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    ListPublishers {
        respond_to: oneshot::Sender<Vec<String>>,
    },

    /// Tear everything down, then stop the actor.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
}

impl ControllerMessage {
    /// Label for latency metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ControllerMessage::AddPublisher { .. } => "add_publisher",
            ControllerMessage::AddSubscriber { .. } => "add_subscriber",
            ControllerMessage::RemovePublisher { .. } => "remove_publisher",
            ControllerMessage::RemoveSubscriber { .. } => "remove_subscriber",
            ControllerMessage::RemoveSubscriptions { .. } => "remove_subscriptions",
            ControllerMessage::ProcessSignaling { .. } => "process_signaling",
            ControllerMessage::RequestKeyframe { .. } => "request_keyframe",
            ControllerMessage::GetStreamStats { .. } => "get_stream_stats",
            ControllerMessage::GetStatus { .. } => "get_status",
            ControllerMessage::ListPublishers { .. } => "list_publishers",
            ControllerMessage::Shutdown { .. } => "shutdown",
        }
    }
}

/// Point-in-time controller counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub publisher_count: usize,
    pub subscriber_count: usize,
    pub connection_count: usize,
    pub client_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}
