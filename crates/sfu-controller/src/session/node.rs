//! State shared by publishers and subscribers.
//!
//! A node is one client's participation in one stream. It owns the sending
//! side of the node's event channel and gates the `ready` notification on
//! both negotiation readiness (an offer/answer went out) and transport
//! readiness (the connection reported READY).

use super::connection::ConnectionNotice;
use crate::signaling::NodeEvent;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Receiver for a node's lifecycle events.
pub type NodeEvents = mpsc::UnboundedReceiver<NodeEvent>;

/// Media Engine key for a client's stream.
#[must_use]
pub fn erizo_stream_id(client_id: &str, stream_id: &str) -> String {
    format!("{client_id}_{stream_id}")
}

/// What a node did with a connection notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeOutcome {
    Forwarded,
    Dropped,
    /// Forwarded a `failed` event.
    Failed,
}

#[derive(Debug)]
pub struct NodeCore {
    client_id: String,
    stream_id: String,
    erizo_stream_id: String,
    connection_id: String,
    label: Option<String>,
    metadata: HashMap<String, serde_json::Value>,
    ready: bool,
    connection_ready: bool,
    ready_emitted: bool,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeCore {
    /// Create the node and its event channel. Emits `init`.
    pub fn new(
        client_id: &str,
        stream_id: &str,
        connection_id: &str,
        label: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> (Self, NodeEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let node = Self {
            client_id: client_id.to_string(),
            stream_id: stream_id.to_string(),
            erizo_stream_id: erizo_stream_id(client_id, stream_id),
            connection_id: connection_id.to_string(),
            label,
            metadata,
            ready: false,
            connection_ready: false,
            ready_emitted: false,
            events,
        };
        node.emit(NodeEvent::Init);
        (node, receiver)
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn erizo_stream_id(&self) -> &str {
        &self.erizo_stream_id
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Negotiation and transport both ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready && self.connection_ready
    }

    /// Deliver an event to the node's owner. A dropped receiver is not an error.
    pub fn emit(&self, event: NodeEvent) {
        if self.events.send(event).is_err() {
            debug!(
                target: "sfu.node",
                stream_id = %self.erizo_stream_id,
                "Event receiver dropped"
            );
        }
    }

    /// Transport reported READY.
    #[must_use]
    pub fn is_connection_ready(&self) -> bool {
        self.connection_ready
    }

    /// Joining a connection that already reported READY.
    pub fn mark_connection_ready(&mut self) {
        self.connection_ready = true;
    }

    /// Apply a notice from the node's connection.
    pub fn on_connection_notice(&mut self, notice: &ConnectionNotice) -> NoticeOutcome {
        if let Some(target) = &notice.stream_id {
            if *target != self.erizo_stream_id {
                return NoticeOutcome::Dropped;
            }
        }

        match &notice.event {
            NodeEvent::Offer { .. } | NodeEvent::Answer { .. } => {
                self.ready = true;
                self.maybe_emit_ready();
                self.emit(notice.event.clone());
                NoticeOutcome::Forwarded
            }
            NodeEvent::Ready => {
                self.connection_ready = true;
                if self.maybe_emit_ready() {
                    NoticeOutcome::Forwarded
                } else {
                    NoticeOutcome::Dropped
                }
            }
            NodeEvent::Failed { .. } => {
                self.emit(notice.event.clone());
                NoticeOutcome::Failed
            }
            event => {
                self.emit(event.clone());
                NoticeOutcome::Forwarded
            }
        }
    }

    fn maybe_emit_ready(&mut self) -> bool {
        if self.ready && self.connection_ready && !self.ready_emitted {
            self.ready_emitted = true;
            self.emit(NodeEvent::Ready);
            return true;
        }
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn node() -> (NodeCore, NodeEvents) {
        NodeCore::new("c1", "s1", "c1_1", None, HashMap::new())
    }

    fn drain(rx: &mut NodeEvents) -> Vec<NodeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn broadcast(event: NodeEvent) -> ConnectionNotice {
        ConnectionNotice {
            stream_id: None,
            event,
        }
    }

    fn answer() -> ConnectionNotice {
        broadcast(NodeEvent::Answer {
            sdp: "v=0".to_string(),
        })
    }

    #[test]
    fn test_init_emitted_on_creation() {
        let (node, mut rx) = node();
        assert_eq!(drain(&mut rx), vec![NodeEvent::Init]);
        assert_eq!(node.erizo_stream_id(), "c1_s1");
    }

    #[test]
    fn test_ready_after_answer_then_transport() {
        let (mut node, mut rx) = node();
        drain(&mut rx);

        assert_eq!(node.on_connection_notice(&answer()), NoticeOutcome::Forwarded);
        assert_eq!(
            node.on_connection_notice(&broadcast(NodeEvent::Ready)),
            NoticeOutcome::Forwarded
        );
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], NodeEvent::Answer { .. }));
        assert_eq!(events[1], NodeEvent::Ready);
        assert!(node.is_ready());
    }

    #[test]
    fn test_ready_after_transport_then_answer() {
        let (mut node, mut rx) = node();
        drain(&mut rx);

        // Transport ready first: recorded, not forwarded
        assert_eq!(
            node.on_connection_notice(&broadcast(NodeEvent::Ready)),
            NoticeOutcome::Dropped
        );
        assert!(drain(&mut rx).is_empty());

        node.on_connection_notice(&answer());
        let events = drain(&mut rx);
        assert_eq!(events[0], NodeEvent::Ready);
        assert!(matches!(events[1], NodeEvent::Answer { .. }));
    }

    #[test]
    fn test_ready_emitted_only_once() {
        let (mut node, mut rx) = node();
        node.on_connection_notice(&answer());
        node.on_connection_notice(&broadcast(NodeEvent::Ready));
        node.on_connection_notice(&answer());
        node.on_connection_notice(&broadcast(NodeEvent::Ready));

        let readies = drain(&mut rx)
            .into_iter()
            .filter(|e| *e == NodeEvent::Ready)
            .count();
        assert_eq!(readies, 1);
    }

    #[test]
    fn test_notice_for_other_stream_dropped() {
        let (mut node, mut rx) = node();
        drain(&mut rx);

        let notice = ConnectionNotice {
            stream_id: Some("c1_other".to_string()),
            event: NodeEvent::Ready,
        };
        assert_eq!(node.on_connection_notice(&notice), NoticeOutcome::Dropped);

        let own = ConnectionNotice {
            stream_id: Some("c1_s1".to_string()),
            event: NodeEvent::Failed {
                sdp: "x".to_string(),
            },
        };
        assert_eq!(node.on_connection_notice(&own), NoticeOutcome::Failed);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (node, rx) = node();
        drop(rx);
        node.emit(NodeEvent::Started);
    }
}
