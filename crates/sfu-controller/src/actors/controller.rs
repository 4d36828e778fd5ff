//! `SessionControllerActor` - the single task that owns all session state.
//!
//! Everything that mutates publishers, subscribers or connections runs here:
//!
//! - commands from `SessionControllerHandle`
//! - Media Engine events
//! - timer ticks (slideshow pacing, periodic FIR, adaptation sampling)
//! - completed bandwidth samples
//!
//! Statistics and bandwidth samples are awaited off-loop; their results
//! re-enter through the mailbox or the sample channel and are re-checked
//! against current state.

use super::messages::{ControllerMessage, ControllerStatus, StreamStats};
use super::metrics::MailboxMonitor;
use crate::config::Config;
use crate::engine::{EngineError, EngineEvent, MediaEngine};
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::options::{PublisherOptions, SubscriberOptions};
use crate::session::{NodeEvents, SampleRequest, SessionController, StatsTarget};
use crate::signaling::SignalingMessage;
use crate::timer::TimerEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

type SampleResult = (SampleRequest, Result<u64, EngineError>);

/// Handle to the `SessionControllerActor`.
#[derive(Clone)]
pub struct SessionControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionControllerHandle {
    /// Spawn the controller actor and return a handle to it.
    ///
    /// `engine_events` is the receiving side of the channel the Media Engine
    /// reports status changes and candidates on.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        engine: Arc<dyn MediaEngine>,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(config.agent_id.clone()));

        let actor = SessionControllerActor::new(
            config,
            engine,
            receiver,
            engine_events,
            cancel_token.clone(),
            Arc::clone(&mailbox),
        );
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControllerMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;
        self.mailbox.record_enqueue();

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Publish a stream. Returns the publisher's event receiver.
    pub async fn add_publisher(
        &self,
        client_id: String,
        stream_id: String,
        options: PublisherOptions,
    ) -> Result<NodeEvents, SfuError> {
        self.request(|respond_to| ControllerMessage::AddPublisher {
            client_id,
            stream_id,
            options,
            respond_to,
        })
        .await?
    }

    /// Subscribe to a stream. Returns the subscriber's event receiver.
    pub async fn add_subscriber(
        &self,
        client_id: String,
        stream_id: String,
        options: SubscriberOptions,
    ) -> Result<NodeEvents, SfuError> {
        self.request(|respond_to| ControllerMessage::AddSubscriber {
            client_id,
            stream_id,
            options,
            respond_to,
        })
        .await?
    }

    pub async fn remove_publisher(
        &self,
        client_id: String,
        stream_id: String,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| ControllerMessage::RemovePublisher {
            client_id,
            stream_id,
            respond_to,
        })
        .await?
    }

    /// Remove one subscription. Succeeds when there is nothing to remove.
    pub async fn remove_subscriber(
        &self,
        client_id: String,
        stream_id: String,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| ControllerMessage::RemoveSubscriber {
            client_id,
            stream_id,
            respond_to,
        })
        .await
    }

    /// Remove every subscription of a client. Returns the affected stream ids.
    pub async fn remove_subscriptions(&self, client_id: String) -> Result<Vec<String>, SfuError> {
        self.request(|respond_to| ControllerMessage::RemoveSubscriptions {
            client_id,
            respond_to,
        })
        .await
    }

    pub async fn process_signaling(
        &self,
        client_id: String,
        stream_id: String,
        message: SignalingMessage,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| ControllerMessage::ProcessSignaling {
            client_id,
            stream_id,
            message,
            respond_to,
        })
        .await?
    }

    /// Decode a JSON signaling message and route it.
    pub async fn process_signaling_json(
        &self,
        client_id: String,
        stream_id: String,
        raw: &str,
    ) -> Result<(), SfuError> {
        let message = SignalingMessage::from_json(raw)?;
        self.process_signaling(client_id, stream_id, message).await
    }

    /// Request a keyframe from a stream's publisher. Unknown streams are
    /// ignored.
    pub async fn request_keyframe(&self, stream_id: String) -> Result<(), SfuError> {
        self.request(|respond_to| ControllerMessage::RequestKeyframe {
            stream_id,
            respond_to,
        })
        .await?
    }

    /// Statistics for a stream's publisher and every subscriber.
    pub async fn get_stream_stats(&self, stream_id: String) -> Result<StreamStats, SfuError> {
        self.request(|respond_to| ControllerMessage::GetStreamStats {
            stream_id,
            respond_to,
        })
        .await?
    }

    pub async fn get_status(&self) -> Result<ControllerStatus, SfuError> {
        self.request(|respond_to| ControllerMessage::GetStatus { respond_to })
            .await
    }

    /// Stream ids of every live publisher, sorted.
    pub async fn list_publishers(&self) -> Result<Vec<String>, SfuError> {
        self.request(|respond_to| ControllerMessage::ListPublishers { respond_to })
            .await
    }

    /// Tear down every publisher, then stop the actor.
    pub async fn shutdown(&self) -> Result<(), SfuError> {
        self.request(|respond_to| ControllerMessage::Shutdown { respond_to })
            .await?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token for tasks that should stop with the controller.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

pub struct SessionControllerActor {
    agent_id: String,
    config: Arc<Config>,
    engine: Arc<dyn MediaEngine>,
    controller: SessionController,
    receiver: mpsc::Receiver<ControllerMessage>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    timer_events: mpsc::UnboundedReceiver<TimerEvent>,
    sample_tx: mpsc::UnboundedSender<SampleResult>,
    sample_rx: mpsc::UnboundedReceiver<SampleResult>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionControllerActor {
    fn new(
        config: Arc<Config>,
        engine: Arc<dyn MediaEngine>,
        receiver: mpsc::Receiver<ControllerMessage>,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        cancel_token: CancellationToken,
        mailbox: Arc<MailboxMonitor>,
    ) -> Self {
        let (timers, timer_events) = mpsc::unbounded_channel();
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let controller = SessionController::new(Arc::clone(&config), Arc::clone(&engine), timers);

        Self {
            agent_id: config.agent_id.clone(),
            config,
            engine,
            controller,
            receiver,
            engine_events,
            timer_events,
            sample_tx,
            sample_rx,
            cancel_token,
            mailbox,
        }
    }

    #[instrument(skip_all, name = "sfu.actor.controller", fields(agent_id = %self.agent_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor",
            agent_id = %self.agent_id,
            "SessionControllerActor started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor",
                        agent_id = %self.agent_id,
                        "SessionControllerActor received cancellation signal"
                    );
                    self.controller.shutdown_all().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                        }
                        None => {
                            info!(
                                target: "sfu.actor",
                                agent_id = %self.agent_id,
                                "SessionControllerActor channel closed, exiting"
                            );
                            self.controller.shutdown_all().await;
                            break;
                        }
                    }
                }

                Some(event) = self.engine_events.recv() => {
                    self.controller.on_engine_event(event).await;
                }

                Some(tick) = self.timer_events.recv() => {
                    if let Some(request) = self.controller.on_timer(tick) {
                        self.spawn_sample(request);
                    }
                }

                Some((request, result)) = self.sample_rx.recv() => {
                    self.controller.on_bandwidth_sample(&request, result);
                }
            }
        }

        info!(
            target: "sfu.actor",
            agent_id = %self.agent_id,
            messages_processed = self.mailbox.messages_processed(),
            "SessionControllerActor stopped"
        );
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        let kind = message.kind();
        let started = Instant::now();

        match message {
            ControllerMessage::AddPublisher {
                client_id,
                stream_id,
                options,
                respond_to,
            } => {
                let result = self
                    .controller
                    .add_publisher(&client_id, &stream_id, options)
                    .await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::AddSubscriber {
                client_id,
                stream_id,
                options,
                respond_to,
            } => {
                let result = self
                    .controller
                    .add_subscriber(&client_id, &stream_id, options);
                let _ = respond_to.send(result);
            }

            ControllerMessage::RemovePublisher {
                client_id,
                stream_id,
                respond_to,
            } => {
                let result = self.controller.remove_publisher(&client_id, &stream_id).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::RemoveSubscriber {
                client_id,
                stream_id,
                respond_to,
            } => {
                self.controller.remove_subscriber(&client_id, &stream_id);
                let _ = respond_to.send(());
            }

            ControllerMessage::RemoveSubscriptions {
                client_id,
                respond_to,
            } => {
                let removed = self.controller.remove_subscriptions(&client_id);
                let _ = respond_to.send(removed);
            }

            ControllerMessage::ProcessSignaling {
                client_id,
                stream_id,
                message,
                respond_to,
            } => {
                let result = self
                    .controller
                    .process_signaling(&client_id, &stream_id, &message);
                if let Err(e) = &result {
                    debug!(
                        target: "sfu.actor",
                        client_id = %client_id,
                        stream_id = %stream_id,
                        error = %e,
                        "Signaling rejected"
                    );
                }
                let _ = respond_to.send(result);
            }

            ControllerMessage::RequestKeyframe {
                stream_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.controller.request_keyframe(&stream_id));
            }

            ControllerMessage::GetStreamStats {
                stream_id,
                respond_to,
            } => match self.controller.stats_targets(&stream_id) {
                Ok(targets) => self.spawn_stats(stream_id, targets, respond_to),
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                }
            },

            ControllerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }

            ControllerMessage::ListPublishers { respond_to } => {
                let _ = respond_to.send(self.controller.publisher_ids());
            }

            ControllerMessage::Shutdown { respond_to } => {
                info!(
                    target: "sfu.actor",
                    agent_id = %self.agent_id,
                    publishers = self.controller.publisher_count(),
                    "Initiating shutdown"
                );
                self.controller.shutdown_all().await;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
            }
        }

        metrics::record_message_latency(kind, started.elapsed());
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            publisher_count: self.controller.publisher_count(),
            subscriber_count: self.controller.subscriber_count(),
            connection_count: self.controller.connection_count(),
            client_count: self.controller.client_count(),
            is_draining: !self.controller.is_accepting(),
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    fn spawn_sample(&self, request: SampleRequest) {
        let engine = Arc::clone(&self.engine);
        let results = self.sample_tx.clone();
        tokio::spawn(async move {
            let result = engine.sample_bandwidth(&request.erizo_stream_id).await;
            // Receiver only drops when the actor stops.
            let _ = results.send((request, result));
        });
    }

    fn spawn_stats(
        &self,
        stream_id: String,
        targets: Vec<StatsTarget>,
        respond_to: oneshot::Sender<Result<StreamStats, SfuError>>,
    ) {
        let engine = Arc::clone(&self.engine);
        let timeout = self.config.stats_timeout;
        tokio::spawn(async move {
            let result = collect_stats(engine, targets, timeout)
                .await
                .ok_or_else(|| {
                    SfuError::NotAvailable(format!("statistics for {stream_id} timed out"))
                });
            let _ = respond_to.send(result);
        });
    }
}

/// Attach connection metadata to an engine report. Non-object reports are
/// wrapped under `stats`.
fn with_metadata(
    mut report: serde_json::Value,
    metadata: HashMap<String, serde_json::Value>,
) -> serde_json::Value {
    let metadata: serde_json::Map<String, serde_json::Value> = metadata.into_iter().collect();
    if let serde_json::Value::Object(fields) = &mut report {
        fields.insert("metadata".to_string(), serde_json::Value::Object(metadata));
        return report;
    }
    serde_json::json!({ "stats": report, "metadata": metadata })
}

/// Fetch statistics for every target. Per-stream failures are logged and
/// left out; `None` when the whole request times out.
async fn collect_stats(
    engine: Arc<dyn MediaEngine>,
    targets: Vec<StatsTarget>,
    timeout: Duration,
) -> Option<StreamStats> {
    let gather = async {
        let mut stats = StreamStats::new();
        for target in targets {
            match engine.get_stats(&target.erizo_stream_id).await {
                Ok(report) => {
                    stats.insert(target.key, with_metadata(report, target.metadata));
                }
                Err(e) => warn!(
                    target: "sfu.actor",
                    stream_id = %target.erizo_stream_id,
                    error = %e,
                    "Failed to get stream statistics"
                ),
            }
        }
        stats
    };
    tokio::time::timeout(timeout, gather).await.ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::mock::{EngineCall, MockMediaEngine};
    use crate::signaling::NodeEvent;

    fn spawn() -> (
        SessionControllerHandle,
        Arc<MockMediaEngine>,
        mpsc::UnboundedSender<EngineEvent>,
    ) {
        spawn_with(Config::default())
    }

    fn spawn_with(
        config: Config,
    ) -> (
        SessionControllerHandle,
        Arc<MockMediaEngine>,
        mpsc::UnboundedSender<EngineEvent>,
    ) {
        let engine = Arc::new(MockMediaEngine::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = SessionControllerHandle::new(
            Arc::new(config),
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            events_rx,
        );
        (handle, engine, events_tx)
    }

    #[tokio::test]
    async fn test_handle_publish_and_status() {
        let (handle, _engine, _events) = spawn();

        let mut events = handle
            .add_publisher("c1".to_string(), "s1".to_string(), PublisherOptions::default())
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some(NodeEvent::Init));

        handle
            .add_subscriber("c2".to_string(), "s1".to_string(), SubscriberOptions::default())
            .await
            .unwrap();

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.publisher_count, 1);
        assert_eq!(status.subscriber_count, 1);
        assert_eq!(status.connection_count, 2);
        assert!(!status.is_draining);

        assert_eq!(handle.list_publishers().await.unwrap(), vec!["s1".to_string()]);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_handle_errors_carry_codes() {
        let (handle, _engine, _events) = spawn();

        let err = handle
            .remove_publisher("c1".to_string(), "nope".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), 2);

        let err = handle
            .process_signaling_json("c1".to_string(), "s1".to_string(), "{\"type\":\"bogus\"}")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), 5);

        // Removing a missing subscription is not an error
        handle
            .remove_subscriber("c1".to_string(), "nope".to_string())
            .await
            .unwrap();

        handle.cancel();
    }

    #[tokio::test]
    async fn test_engine_events_routed_by_actor() {
        let (handle, _engine, engine_events) = spawn();
        let mut events = handle
            .add_publisher("c1".to_string(), "s1".to_string(), PublisherOptions::default())
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some(NodeEvent::Init));

        engine_events
            .send(EngineEvent::Status {
                connection_id: "c1_1".to_string(),
                status: crate::engine::ConnectionStatus::Started,
                message: String::new(),
                stream_id: None,
            })
            .unwrap();
        assert_eq!(events.recv().await, Some(NodeEvent::Started));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_stream_stats() {
        let (handle, engine, _events) = spawn();
        engine.set_stats("c1_s1", serde_json::json!({"bitrate": 1200}));
        engine.set_stats("c2_s1", serde_json::json!([1, 2]));

        let mut options = PublisherOptions::default();
        options
            .connection
            .metadata
            .insert("room".to_string(), serde_json::json!("lobby"));
        handle
            .add_publisher("c1".to_string(), "s1".to_string(), options)
            .await
            .unwrap();
        handle
            .add_subscriber("c2".to_string(), "s1".to_string(), SubscriberOptions::default())
            .await
            .unwrap();

        let stats = handle.get_stream_stats("s1".to_string()).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["publisher"]["bitrate"], 1200);
        assert_eq!(stats["publisher"]["metadata"]["room"], "lobby");
        assert_eq!(stats["c2"]["stats"], serde_json::json!([1, 2]));
        assert_eq!(stats["c2"]["metadata"], serde_json::json!({}));

        let err = handle
            .get_stream_stats("missing".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::PublisherNotFound(_)));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_request_keyframe_through_handle() {
        let (handle, engine, _events) = spawn();

        // Unknown stream is a no-op
        handle.request_keyframe("s1".to_string()).await.unwrap();

        handle
            .add_publisher("c1".to_string(), "s1".to_string(), PublisherOptions::default())
            .await
            .unwrap();
        handle.request_keyframe("s1".to_string()).await.unwrap();
        assert_eq!(
            engine.count_calls(|c| *c == EngineCall::Pli("c1_s1".to_string())),
            1
        );

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_stats_timeout() {
        let (handle, engine, _events) = spawn_with(Config {
            stats_timeout: Duration::from_millis(100),
            ..Config::default()
        });
        engine.set_stats_delay(Duration::from_secs(5));
        handle
            .add_publisher("c1".to_string(), "s1".to_string(), PublisherOptions::default())
            .await
            .unwrap();

        let err = handle
            .get_stream_stats("s1".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotAvailable(_)));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (handle, engine, _events) = spawn();
        let mut events = handle
            .add_publisher("c1".to_string(), "s1".to_string(), PublisherOptions::default())
            .await
            .unwrap();

        handle.shutdown().await.unwrap();
        assert!(handle.is_cancelled());
        assert_eq!(engine.transport_count(), 0);
        assert_eq!(engine.distributor_count(), 0);

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(NodeEvent::Closed));
    }

    #[tokio::test]
    async fn test_cancellation_token() {
        let (handle, _engine, _events) = spawn();
        let child = handle.child_token();
        assert!(!child.is_cancelled());

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_cancelled());
        assert!(child.is_cancelled());
    }
}
