//! `SessionController` - publishers keyed by stream id, and the client
//! registry their connections live in.
//!
//! The controller is owned by a single task (see
//! [`crate::actors::SessionControllerActor`]) and is never shared. Operations
//! that close a distribution handle are `async` and await the engine, so a
//! replacement publisher can never have its new handle closed by its
//! predecessor's teardown.
//!
//! # Teardown order
//!
//! ```text
//! publisher.drain_subscribers()   each subscriber: detach, close, release stream
//! publisher.close()               timers stopped, `closed` emitted
//! release publisher stream        connection evicted when idle
//! engine.close_distributor()
//! ```

use super::connection::ConnectionNotice;
use super::node::{erizo_stream_id, NodeEvents, NoticeOutcome};
use super::publisher::Publisher;
use super::registry::ClientRegistry;
use super::slideshow::SlideshowTrigger;
use crate::config::Config;
use crate::engine::{EngineError, EngineEvent, MediaEngine, StreamRole};
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::options::{PublisherOptions, SubscriberOptions};
use crate::signaling::SignalingMessage;
use crate::timer::{TimerEvent, TimerSender};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A bandwidth sample the owning task should take off-loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRequest {
    pub stream_id: String,
    pub client_id: String,
    pub erizo_stream_id: String,
}

/// One entry of a stream statistics report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsTarget {
    /// Report key: `publisher`, or the subscribing client id.
    pub key: String,
    pub erizo_stream_id: String,
    /// Connection metadata attached to the entry.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Node that reported a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FailedNode {
    role: StreamRole,
    client_id: String,
    stream_id: String,
}

pub struct SessionController {
    config: Arc<Config>,
    engine: Arc<dyn MediaEngine>,
    timers: TimerSender,
    registry: ClientRegistry,
    publishers: HashMap<String, Publisher>,
    accepting_new: bool,
}

/// Bind a node's media stream to its connection. Returns whether the
/// connection is already transport-ready.
fn attach_to_connection(
    registry: &mut ClientRegistry,
    connection_id: &str,
    erizo_stream_id: &str,
    label: Option<String>,
    role: StreamRole,
) -> Result<bool, SfuError> {
    let connection = registry
        .connection_mut(connection_id)
        .ok_or_else(|| SfuError::ConnectionNotFound(connection_id.to_string()))?;
    connection.init()?;
    connection.add_media_stream(erizo_stream_id, label, role)?;
    connection.create_offer()?;
    Ok(connection.is_ready())
}

/// Drop a node's media stream and evict the connection once idle.
fn release_media_stream(
    registry: &mut ClientRegistry,
    connection_id: &str,
    erizo_stream_id: &str,
) {
    if let Some(connection) = registry.connection_mut(connection_id) {
        connection.remove_media_stream(erizo_stream_id);
    }
    registry.maybe_close_connection(connection_id);
}

impl SessionController {
    #[must_use]
    pub fn new(config: Arc<Config>, engine: Arc<dyn MediaEngine>, timers: TimerSender) -> Self {
        let registry = ClientRegistry::new(Arc::clone(&config), Arc::clone(&engine));
        Self {
            config,
            engine,
            timers,
            registry,
            publishers: HashMap::new(),
            accepting_new: true,
        }
    }

    #[must_use]
    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.publishers.values().map(Publisher::subscriber_count).sum()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.registry.client_count()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting_new
    }

    #[must_use]
    pub fn publisher(&self, stream_id: &str) -> Option<&Publisher> {
        self.publishers.get(stream_id)
    }

    #[must_use]
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Stream ids of every live publisher, sorted.
    #[must_use]
    pub fn publisher_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.publishers.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn update_gauges(&self) {
        metrics::set_publishers_active(self.publisher_count());
        metrics::set_subscribers_active(self.subscriber_count());
        metrics::set_connections_active(self.registry.connection_count());
    }

    /// Publish `stream_id` for `client_id`, replacing any live publisher of
    /// the same stream.
    pub async fn add_publisher(
        &mut self,
        client_id: &str,
        stream_id: &str,
        options: PublisherOptions,
    ) -> Result<NodeEvents, SfuError> {
        if !self.accepting_new {
            return Err(SfuError::Draining);
        }

        if self.publishers.contains_key(stream_id) {
            warn!(
                target: "sfu.controller",
                client_id = %client_id,
                stream_id = %stream_id,
                "Publisher already exists, replacing"
            );
            self.teardown_publisher(stream_id).await;
        }

        let connection_id = self
            .registry
            .get_or_create_connection(client_id, &options.connection);

        let (mut publisher, events) = match Publisher::new(
            client_id,
            stream_id,
            &connection_id,
            &options,
            Arc::clone(&self.config),
            Arc::clone(&self.engine),
            self.timers.clone(),
        ) {
            Ok(created) => created,
            Err(e) => {
                self.registry.maybe_close_connection(&connection_id);
                self.close_distributor(stream_id).await;
                return Err(e);
            }
        };

        match attach_to_connection(
            &mut self.registry,
            &connection_id,
            publisher.erizo_stream_id(),
            options.label.clone(),
            StreamRole::Publisher,
        ) {
            Ok(ready) => {
                if ready {
                    publisher.node_mut().mark_connection_ready();
                    publisher.on_connection_ready();
                }
            }
            Err(e) => {
                publisher.close();
                self.registry.maybe_close_connection(&connection_id);
                self.close_distributor(stream_id).await;
                return Err(e);
            }
        }

        self.publishers.insert(stream_id.to_string(), publisher);
        self.update_gauges();

        info!(
            target: "sfu.controller",
            client_id = %client_id,
            stream_id = %stream_id,
            connection_id = %connection_id,
            publishers = self.publishers.len(),
            "Publisher added"
        );
        Ok(events)
    }

    /// Subscribe `client_id` to `stream_id`. An existing subscription of the
    /// same client is torn down first.
    pub fn add_subscriber(
        &mut self,
        client_id: &str,
        stream_id: &str,
        options: SubscriberOptions,
    ) -> Result<NodeEvents, SfuError> {
        if !self.accepting_new {
            return Err(SfuError::Draining);
        }

        let publisher = self
            .publishers
            .get(stream_id)
            .ok_or_else(|| SfuError::PublisherNotFound(stream_id.to_string()))?;
        if publisher.is_closing() {
            return Err(SfuError::NotAllowed(format!("stream {stream_id} is closing")));
        }
        if publisher.has_subscriber(client_id) {
            warn!(
                target: "sfu.controller",
                client_id = %client_id,
                stream_id = %stream_id,
                "Duplicate subscription, resubscribing"
            );
            self.remove_subscriber(client_id, stream_id);
        }

        let connection_id = self
            .registry
            .get_or_create_connection(client_id, &options.connection);

        let Some(publisher) = self.publishers.get_mut(stream_id) else {
            self.registry.maybe_close_connection(&connection_id);
            return Err(SfuError::PublisherNotFound(stream_id.to_string()));
        };

        let events = match publisher.add_subscriber(client_id, &connection_id, &options) {
            Ok(events) => events,
            Err(e) => {
                self.registry.maybe_close_connection(&connection_id);
                return Err(e);
            }
        };

        let subscriber_stream = erizo_stream_id(client_id, stream_id);
        match attach_to_connection(
            &mut self.registry,
            &connection_id,
            &subscriber_stream,
            options.label.clone(),
            StreamRole::Subscriber,
        ) {
            Ok(ready) => {
                if ready {
                    if let Some(subscriber) = publisher.subscriber_mut(client_id) {
                        subscriber.node_mut().mark_connection_ready();
                    }
                }
            }
            Err(e) => {
                publisher.remove_subscriber(client_id);
                self.registry.maybe_close_connection(&connection_id);
                return Err(e);
            }
        }

        self.update_gauges();
        info!(
            target: "sfu.controller",
            client_id = %client_id,
            stream_id = %stream_id,
            connection_id = %connection_id,
            "Subscriber added"
        );
        Ok(events)
    }

    /// Remove a publisher and all of its subscribers. Only the publishing
    /// client may remove its stream.
    pub async fn remove_publisher(
        &mut self,
        client_id: &str,
        stream_id: &str,
    ) -> Result<(), SfuError> {
        let publisher = self
            .publishers
            .get(stream_id)
            .ok_or_else(|| SfuError::PublisherNotFound(stream_id.to_string()))?;
        if publisher.client_id() != client_id {
            return Err(SfuError::NotAllowed(format!(
                "stream {stream_id} is not published by {client_id}"
            )));
        }

        self.teardown_publisher(stream_id).await;
        Ok(())
    }

    /// Remove one subscription. Unknown publishers or subscribers are logged
    /// and ignored.
    pub fn remove_subscriber(&mut self, client_id: &str, stream_id: &str) {
        let Some(publisher) = self.publishers.get_mut(stream_id) else {
            warn!(
                target: "sfu.controller",
                client_id = %client_id,
                stream_id = %stream_id,
                "Publisher does not exist"
            );
            return;
        };
        let Some(subscriber) = publisher.remove_subscriber(client_id) else {
            return;
        };

        release_media_stream(
            &mut self.registry,
            subscriber.node().connection_id(),
            subscriber.erizo_stream_id(),
        );
        self.update_gauges();
        debug!(
            target: "sfu.controller",
            client_id = %client_id,
            stream_id = %stream_id,
            "Subscriber removed"
        );
    }

    /// Remove every subscription held by `client_id`. Returns the affected
    /// stream ids, sorted.
    pub fn remove_subscriptions(&mut self, client_id: &str) -> Vec<String> {
        let mut stream_ids: Vec<String> = self
            .publishers
            .iter()
            .filter(|(_, publisher)| publisher.has_subscriber(client_id))
            .map(|(stream_id, _)| stream_id.clone())
            .collect();
        stream_ids.sort();

        for stream_id in &stream_ids {
            self.remove_subscriber(client_id, stream_id);
        }

        info!(
            target: "sfu.controller",
            client_id = %client_id,
            streams = stream_ids.len(),
            "Subscriptions removed"
        );
        stream_ids
    }

    /// Route a signaling message to the publisher or subscriber it belongs to.
    pub fn process_signaling(
        &mut self,
        client_id: &str,
        stream_id: &str,
        message: &SignalingMessage,
    ) -> Result<(), SfuError> {
        metrics::record_signaling_message(message.kind());

        let Some(publisher) = self.publishers.get_mut(stream_id) else {
            warn!(
                target: "sfu.controller",
                client_id = %client_id,
                stream_id = %stream_id,
                message_type = message.kind(),
                "Signaling for unknown stream"
            );
            return Ok(());
        };

        let connection_id = if publisher.client_id() == client_id {
            publisher.node().connection_id().to_string()
        } else if let Some(subscriber) = publisher.subscriber(client_id) {
            subscriber.node().connection_id().to_string()
        } else {
            warn!(
                target: "sfu.controller",
                client_id = %client_id,
                stream_id = %stream_id,
                message_type = message.kind(),
                "Signaling from client with no node on stream"
            );
            return Ok(());
        };

        let Some(connection) = self.registry.connection_mut(&connection_id) else {
            warn!(
                target: "sfu.controller",
                client_id = %client_id,
                connection_id = %connection_id,
                "Signaling for unregistered connection"
            );
            return Ok(());
        };

        if publisher.client_id() == client_id {
            publisher.process_signaling(connection, message)
        } else {
            publisher.process_subscriber_signaling(client_id, connection, message)
        }
    }

    /// Ask the publisher of `stream_id` for a keyframe. An unknown stream is
    /// logged and ignored.
    pub fn request_keyframe(&self, stream_id: &str) -> Result<(), SfuError> {
        let Some(publisher) = self.publishers.get(stream_id) else {
            debug!(
                target: "sfu.controller",
                stream_id = %stream_id,
                "Keyframe request for unknown stream"
            );
            return Ok(());
        };
        publisher.request_keyframe()
    }

    /// Entries of a stream's statistics report: the publisher first, then
    /// every subscriber by client id.
    pub fn stats_targets(&self, stream_id: &str) -> Result<Vec<StatsTarget>, SfuError> {
        let publisher = self
            .publishers
            .get(stream_id)
            .ok_or_else(|| SfuError::PublisherNotFound(stream_id.to_string()))?;

        let mut targets = vec![StatsTarget {
            key: "publisher".to_string(),
            erizo_stream_id: publisher.erizo_stream_id().to_string(),
            metadata: publisher.node().metadata().clone(),
        }];
        let mut subscribers: Vec<StatsTarget> = publisher
            .subscribers()
            .map(|s| StatsTarget {
                key: s.node().client_id().to_string(),
                erizo_stream_id: s.erizo_stream_id().to_string(),
                metadata: s.node().metadata().clone(),
            })
            .collect();
        subscribers.sort_by(|a, b| a.key.cmp(&b.key));
        targets.extend(subscribers);
        Ok(targets)
    }

    /// Apply an event reported by the Media Engine.
    pub async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Status {
                connection_id,
                status,
                message,
                stream_id,
            } => {
                let Some(connection) = self.registry.connection_mut(&connection_id) else {
                    debug!(
                        target: "sfu.controller",
                        connection_id = %connection_id,
                        status = status.code(),
                        "Status for unknown connection"
                    );
                    return;
                };
                let notices = connection.on_status(status, &message, stream_id.as_deref());
                self.dispatch_notices(&connection_id, &notices).await;
            }
            EngineEvent::Candidate {
                connection_id,
                candidate,
            } => {
                let Some(connection) = self.registry.connection_mut(&connection_id) else {
                    debug!(
                        target: "sfu.controller",
                        connection_id = %connection_id,
                        "Candidate for unknown connection"
                    );
                    return;
                };
                let notices = connection.on_candidate(candidate);
                self.dispatch_notices(&connection_id, &notices).await;
            }
            EngineEvent::SlideshowFallback {
                erizo_stream_id,
                active,
            } => self.on_slideshow_fallback(&erizo_stream_id, active),
        }
    }

    async fn dispatch_notices(&mut self, connection_id: &str, notices: &[ConnectionNotice]) {
        let mut failed = Vec::new();

        for notice in notices {
            for publisher in self.publishers.values_mut() {
                let stream_id = publisher.stream_id().to_string();
                if publisher.node().connection_id() == connection_id {
                    let was_ready = publisher.node().is_connection_ready();
                    if publisher.node_mut().on_connection_notice(notice) == NoticeOutcome::Failed {
                        failed.push(FailedNode {
                            role: StreamRole::Publisher,
                            client_id: publisher.client_id().to_string(),
                            stream_id: stream_id.clone(),
                        });
                    }
                    if !was_ready && publisher.node().is_connection_ready() {
                        publisher.on_connection_ready();
                    }
                }

                // A subscriber that just became ready needs a keyframe
                let mut keyframe_needed = false;
                for subscriber in publisher.subscribers_mut() {
                    if subscriber.node().connection_id() != connection_id {
                        continue;
                    }
                    let was_ready = subscriber.node().is_ready();
                    if subscriber.node_mut().on_connection_notice(notice) == NoticeOutcome::Failed {
                        failed.push(FailedNode {
                            role: StreamRole::Subscriber,
                            client_id: subscriber.node().client_id().to_string(),
                            stream_id: stream_id.clone(),
                        });
                    }
                    keyframe_needed |= !was_ready && subscriber.node().is_ready();
                }
                if keyframe_needed {
                    if let Err(e) = publisher.request_keyframe() {
                        warn!(
                            target: "sfu.controller",
                            stream_id = %stream_id,
                            error = %e,
                            "Keyframe request for ready subscriber failed"
                        );
                    }
                }
            }
        }

        for node in failed {
            self.on_node_failed(node).await;
        }
    }

    async fn on_node_failed(&mut self, node: FailedNode) {
        metrics::record_node_failure(node.role.as_str());
        warn!(
            target: "sfu.controller",
            client_id = %node.client_id,
            stream_id = %node.stream_id,
            role = node.role.as_str(),
            teardown = self.config.teardown_on_failure,
            "Node transport failed"
        );

        if !self.config.teardown_on_failure {
            return;
        }
        match node.role {
            StreamRole::Publisher => {
                let owned = self
                    .publishers
                    .get(&node.stream_id)
                    .is_some_and(|p| p.client_id() == node.client_id);
                if owned {
                    self.teardown_publisher(&node.stream_id).await;
                }
            }
            StreamRole::Subscriber => self.remove_subscriber(&node.client_id, &node.stream_id),
        }
    }

    fn on_slideshow_fallback(&mut self, subscriber_stream: &str, active: bool) {
        let target = self.publishers.iter().find_map(|(stream_id, publisher)| {
            publisher
                .subscribers()
                .find(|s| s.erizo_stream_id() == subscriber_stream)
                .map(|s| (stream_id.clone(), s.node().client_id().to_string()))
        });
        let Some((stream_id, client_id)) = target else {
            debug!(
                target: "sfu.controller",
                stream_id = %subscriber_stream,
                "Slideshow fallback for unknown subscriber"
            );
            return;
        };

        if let Some(publisher) = self.publishers.get_mut(&stream_id) {
            if let Err(e) =
                publisher.set_slideshow(&client_id, SlideshowTrigger::Fallback, active, None)
            {
                warn!(
                    target: "sfu.controller",
                    stream_id = %stream_id,
                    client_id = %client_id,
                    error = %e,
                    "Failed to apply slideshow fallback"
                );
            }
        }
    }

    /// Apply a timer tick. Returns a sample to take when the tick is an
    /// adaptation sample that still applies.
    pub fn on_timer(&mut self, event: TimerEvent) -> Option<SampleRequest> {
        match event {
            TimerEvent::SlideshowKeyframe { stream_id } => {
                if let Some(publisher) = self.publishers.get(&stream_id) {
                    publisher.on_slideshow_tick();
                }
                None
            }
            TimerEvent::PeriodicFir { stream_id } => {
                if let Some(publisher) = self.publishers.get(&stream_id) {
                    publisher.on_fir_tick();
                }
                None
            }
            TimerEvent::AdaptationSample {
                stream_id,
                client_id,
            } => {
                let publisher = self.publishers.get(&stream_id)?;
                if publisher.is_slideshow_active(&client_id) {
                    return None;
                }
                let subscriber = publisher.subscriber(&client_id)?;
                if !subscriber.monitor().is_some_and(|m| m.is_active()) {
                    return None;
                }
                Some(SampleRequest {
                    erizo_stream_id: subscriber.erizo_stream_id().to_string(),
                    stream_id,
                    client_id,
                })
            }
        }
    }

    /// Apply a completed bandwidth sample. The subscriber may have gone away
    /// while the sample was pending.
    pub fn on_bandwidth_sample(
        &mut self,
        request: &SampleRequest,
        result: Result<u64, EngineError>,
    ) {
        let Some(subscriber) = self
            .publishers
            .get_mut(&request.stream_id)
            .and_then(|p| p.subscriber_mut(&request.client_id))
            .filter(|s| s.erizo_stream_id() == request.erizo_stream_id)
        else {
            return;
        };

        match result {
            Ok(bandwidth) => subscriber.on_bandwidth_sample(bandwidth),
            Err(e) => {
                error!(
                    target: "sfu.adaptation",
                    stream_id = %request.erizo_stream_id,
                    error = %e,
                    "Bandwidth sampling failed, adaptation cancelled"
                );
                subscriber.cancel_adaptation();
            }
        }
    }

    /// Stop accepting work, tear down every publisher and close every
    /// connection.
    pub async fn shutdown_all(&mut self) {
        self.accepting_new = false;
        for stream_id in self.publisher_ids() {
            self.teardown_publisher(&stream_id).await;
        }
        self.registry.close_all();
        self.update_gauges();
    }

    async fn teardown_publisher(&mut self, stream_id: &str) {
        let Some(mut publisher) = self.publishers.remove(stream_id) else {
            return;
        };

        for subscriber in publisher.drain_subscribers() {
            release_media_stream(
                &mut self.registry,
                subscriber.node().connection_id(),
                subscriber.erizo_stream_id(),
            );
        }
        publisher.close();
        release_media_stream(
            &mut self.registry,
            publisher.node().connection_id(),
            publisher.erizo_stream_id(),
        );
        self.update_gauges();

        self.close_distributor(stream_id).await;
    }

    async fn close_distributor(&self, stream_id: &str) {
        match self.engine.close_distributor(stream_id).await {
            Ok(()) => info!(
                target: "sfu.controller",
                stream_id = %stream_id,
                remaining_publishers = self.publishers.len(),
                "Publisher closed"
            ),
            Err(e) => warn!(
                target: "sfu.controller",
                stream_id = %stream_id,
                error = %e,
                "Failed to close distributor"
            ),
        }
    }
}
