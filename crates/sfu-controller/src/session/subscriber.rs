//! Subscriber - one consumer of a publisher's stream.
//!
//! The subscriber owns its bandwidth adaptation monitor and the sampling
//! task that drives it. Slideshow flags live on the publisher, which paces
//! keyframes for all of its subscribers.

use super::node::{NodeCore, NodeEvents};
use crate::adaptation::{AdaptationAction, AdaptationState, BandwidthAdaptationMonitor};
use crate::config::Config;
use crate::engine::MediaEngine;
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::options::SubscriberOptions;
use crate::signaling::{MuteState, NodeEvent};
use crate::timer::{ScheduledTask, TimerEvent, TimerSender};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Subscriber {
    node: NodeCore,
    /// Stream id of the publisher this subscriber consumes.
    publisher_stream_id: String,
    mute: MuteState,
    scheme: Option<String>,
    min_video_bw: Option<u64>,
    monitor: Option<BandwidthAdaptationMonitor>,
    sampler: Option<ScheduledTask>,
    config: Arc<Config>,
    engine: Arc<dyn MediaEngine>,
    timers: TimerSender,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("node", &self.node)
            .field("mute", &self.mute)
            .field("min_video_bw", &self.min_video_bw)
            .field("adaptation", &self.adaptation_state())
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    pub fn new(
        client_id: &str,
        publisher_stream_id: &str,
        connection_id: &str,
        options: &SubscriberOptions,
        config: Arc<Config>,
        engine: Arc<dyn MediaEngine>,
        timers: TimerSender,
    ) -> (Self, NodeEvents) {
        let (node, events) = NodeCore::new(
            client_id,
            publisher_stream_id,
            connection_id,
            options.label.clone(),
            options.connection.metadata.clone(),
        );

        let subscriber = Self {
            node,
            publisher_stream_id: publisher_stream_id.to_string(),
            mute: options.mute_stream,
            scheme: None,
            min_video_bw: None,
            monitor: None,
            sampler: None,
            config,
            engine,
            timers,
        };
        (subscriber, events)
    }

    #[must_use]
    pub fn node(&self) -> &NodeCore {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut NodeCore {
        &mut self.node
    }

    #[must_use]
    pub fn erizo_stream_id(&self) -> &str {
        self.node.erizo_stream_id()
    }

    #[must_use]
    pub fn publisher_stream_id(&self) -> &str {
        &self.publisher_stream_id
    }

    /// The subscriber's own mute request.
    #[must_use]
    pub fn mute(&self) -> MuteState {
        self.mute
    }

    pub fn set_mute(&mut self, mute: MuteState) {
        self.mute = mute;
    }

    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn set_scheme(&mut self, scheme: Option<String>) {
        self.scheme = scheme;
    }

    #[must_use]
    pub fn min_video_bw(&self) -> Option<u64> {
        self.min_video_bw
    }

    #[must_use]
    pub fn adaptation_state(&self) -> Option<AdaptationState> {
        self.monitor.as_ref().map(BandwidthAdaptationMonitor::state)
    }

    #[must_use]
    pub fn monitor(&self) -> Option<&BandwidthAdaptationMonitor> {
        self.monitor.as_ref()
    }

    #[must_use]
    pub fn is_sampling(&self) -> bool {
        self.sampler.is_some()
    }

    /// Push the effective mute flags to the engine.
    pub fn apply_mute(&self, effective: MuteState) -> Result<(), SfuError> {
        self.engine.mute_stream(self.erizo_stream_id(), effective)?;
        Ok(())
    }

    /// Install a bandwidth target (kbps), recomputing thresholds and starting
    /// the sampler if needed.
    pub fn set_target_kbps(&mut self, kbps: u64) {
        self.min_video_bw = Some(kbps);
        match &mut self.monitor {
            Some(monitor) => monitor.set_target_kbps(kbps),
            None => {
                self.monitor = Some(BandwidthAdaptationMonitor::new(
                    kbps,
                    self.config.adaptation_tics_per_transition,
                ));
            }
        }

        if self.sampler.is_none() {
            self.sampler = Some(ScheduledTask::spawn(
                self.config.adaptation_sample_interval,
                TimerEvent::AdaptationSample {
                    stream_id: self.publisher_stream_id.clone(),
                    client_id: self.node.client_id().to_string(),
                },
                self.timers.clone(),
            ));
        }

        debug!(
            target: "sfu.adaptation",
            stream_id = %self.erizo_stream_id(),
            target_kbps = kbps,
            thresholds = ?self.monitor.as_ref().and_then(BandwidthAdaptationMonitor::thresholds),
            "Bandwidth target set"
        );
    }

    /// Feed one sample and apply the resulting actions.
    pub fn on_bandwidth_sample(&mut self, bandwidth: u64) {
        let Some(monitor) = self.monitor.as_mut() else {
            return;
        };
        let before = monitor.state();
        let actions = monitor.on_sample(bandwidth);
        let after = monitor.state();

        if before != after {
            info!(
                target: "sfu.adaptation",
                stream_id = %self.node.erizo_stream_id(),
                from = before.as_str(),
                to = after.as_str(),
                bandwidth,
                "Adaptation state changed"
            );
        }

        for action in actions {
            self.apply_action(action);
        }
    }

    fn apply_action(&mut self, action: AdaptationAction) {
        match action {
            AdaptationAction::Feedback(policy) => {
                if let Err(e) = self
                    .engine
                    .set_feedback_policy(self.node.erizo_stream_id(), policy)
                {
                    warn!(
                        target: "sfu.adaptation",
                        stream_id = %self.node.erizo_stream_id(),
                        error = %e,
                        "Failed to change feedback policy"
                    );
                }
            }
            AdaptationAction::DisableTarget => {
                self.min_video_bw = None;
                self.sampler = None;
            }
            AdaptationAction::Alert { message, bandwidth } => {
                metrics::record_bandwidth_alert(message.as_str());
                self.node
                    .emit(NodeEvent::BandwidthAlert { message, bandwidth });
            }
        }
    }

    /// Stop adapting after a sampling failure. Not restarted automatically.
    pub fn cancel_adaptation(&mut self) {
        self.sampler = None;
        self.monitor = None;
    }

    /// Stop timers and notify the owner.
    pub fn close(&mut self) {
        self.sampler = None;
        self.node.emit(NodeEvent::Closed);
    }
}
