//! Publisher - a stream's single producer and its subscribers.
//!
//! The publisher owns its subscribers (keyed by client id) and the engine
//! distribution point that feeds them. It applies signaling for itself and
//! for each subscriber, since subscriber updates can touch shared state
//! (mute flags, slideshow pacing).

use super::connection::Connection;
use super::node::{NodeCore, NodeEvents};
use super::slideshow::{
    SlideshowController, SlideshowTrigger, SlideshowUpdate, RECOVERY_KEYFRAME_REQUESTS,
};
use super::subscriber::Subscriber;
use crate::config::Config;
use crate::engine::MediaEngine;
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::options::{PublisherOptions, SubscriberOptions};
use crate::signaling::{
    ControlAction, MuteState, NodeEvent, SignalingMessage, StreamConfigUpdate,
};
use crate::timer::{ScheduledTask, TimerEvent, TimerSender};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// FIR interval for server publishers without `fir_period`.
pub const DEFAULT_FIR_PERIOD_MS: u64 = 1000;

pub struct Publisher {
    node: NodeCore,
    subscribers: HashMap<String, Subscriber>,
    mute: MuteState,
    min_video_bw: Option<u64>,
    max_video_bw: Option<u64>,
    scheme: Option<String>,
    is_server: bool,
    is_closing: bool,
    slideshow: SlideshowController,
    slideshow_task: Option<ScheduledTask>,
    fir_interval: Duration,
    fir_task: Option<ScheduledTask>,
    config: Arc<Config>,
    engine: Arc<dyn MediaEngine>,
    timers: TimerSender,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("node", &self.node)
            .field("subscribers", &self.subscribers.len())
            .field("mute", &self.mute)
            .field("min_video_bw", &self.min_video_bw)
            .field("is_closing", &self.is_closing)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Create the publisher and its distribution point.
    pub fn new(
        client_id: &str,
        stream_id: &str,
        connection_id: &str,
        options: &PublisherOptions,
        config: Arc<Config>,
        engine: Arc<dyn MediaEngine>,
        timers: TimerSender,
    ) -> Result<(Self, NodeEvents), SfuError> {
        engine.create_distributor(stream_id)?;

        let (node, events) = NodeCore::new(
            client_id,
            stream_id,
            connection_id,
            options.label.clone(),
            options.connection.metadata.clone(),
        );

        let fir_ms = options
            .fir_period
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_FIR_PERIOD_MS);

        let publisher = Self {
            node,
            subscribers: HashMap::new(),
            mute: options.mute_stream,
            min_video_bw: options.min_video_bw,
            max_video_bw: options.max_video_bw,
            scheme: options.scheme.clone(),
            is_server: options.is_server,
            is_closing: false,
            slideshow: SlideshowController::new(),
            slideshow_task: None,
            fir_interval: Duration::from_millis(fir_ms),
            fir_task: None,
            config,
            engine,
            timers,
        };

        if publisher.mute != MuteState::default() {
            publisher
                .engine
                .mute_stream(publisher.erizo_stream_id(), publisher.mute)?;
        }
        if let Some(kbps) = publisher.max_video_bw {
            publisher
                .engine
                .set_max_video_bw(publisher.erizo_stream_id(), kbps)?;
        }

        Ok((publisher, events))
    }

    #[must_use]
    pub fn node(&self) -> &NodeCore {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut NodeCore {
        &mut self.node
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        self.node.client_id()
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        self.node.stream_id()
    }

    #[must_use]
    pub fn erizo_stream_id(&self) -> &str {
        self.node.erizo_stream_id()
    }

    #[must_use]
    pub fn mute(&self) -> MuteState {
        self.mute
    }

    #[must_use]
    pub fn min_video_bw(&self) -> Option<u64> {
        self.min_video_bw
    }

    #[must_use]
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.is_closing
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn has_subscriber(&self, client_id: &str) -> bool {
        self.subscribers.contains_key(client_id)
    }

    #[must_use]
    pub fn subscriber(&self, client_id: &str) -> Option<&Subscriber> {
        self.subscribers.get(client_id)
    }

    pub fn subscriber_mut(&mut self, client_id: &str) -> Option<&mut Subscriber> {
        self.subscribers.get_mut(client_id)
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &Subscriber> {
        self.subscribers.values()
    }

    pub fn subscribers_mut(&mut self) -> impl Iterator<Item = &mut Subscriber> {
        self.subscribers.values_mut()
    }

    /// Whether the subscriber is in slideshow through either trigger.
    #[must_use]
    pub fn is_slideshow_active(&self, client_id: &str) -> bool {
        self.slideshow.is_active(client_id)
    }

    /// Current keyframe pacing period, if pacing.
    #[must_use]
    pub fn slideshow_period(&self) -> Option<Duration> {
        self.slideshow_task.as_ref().map(ScheduledTask::period)
    }

    /// Period of the running FIR task, if any.
    #[must_use]
    pub fn fir_period(&self) -> Option<Duration> {
        self.fir_task.as_ref().map(ScheduledTask::period)
    }

    /// The publisher's transport reported READY. Server publishers start
    /// periodic FIR requests from here on.
    pub fn on_connection_ready(&mut self) {
        if !self.is_server || self.is_closing || self.fir_task.is_some() {
            return;
        }
        self.fir_task = Some(ScheduledTask::spawn(
            self.fir_interval,
            TimerEvent::PeriodicFir {
                stream_id: self.stream_id().to_string(),
            },
            self.timers.clone(),
        ));
        debug!(
            target: "sfu.publisher",
            stream_id = %self.stream_id(),
            period_ms = self.fir_interval.as_millis() as u64,
            "Periodic FIR started"
        );
    }

    /// Ask the publishing client for a fresh keyframe.
    pub fn request_keyframe(&self) -> Result<(), SfuError> {
        self.engine.generate_pli(self.erizo_stream_id())?;
        metrics::record_keyframe_request("request");
        debug!(
            target: "sfu.publisher",
            stream_id = %self.stream_id(),
            "Keyframe requested"
        );
        Ok(())
    }

    fn effective_mute(&self, own: MuteState) -> MuteState {
        MuteState {
            video: self.mute.video || own.video,
            audio: self.mute.audio || own.audio,
        }
    }

    fn subscriber_stream(&self, client_id: &str) -> Result<String, SfuError> {
        self.subscribers
            .get(client_id)
            .map(|s| s.erizo_stream_id().to_string())
            .ok_or_else(|| SfuError::SubscriberNotFound {
                client_id: client_id.to_string(),
                stream_id: self.stream_id().to_string(),
            })
    }

    /// Attach a new subscriber. The caller removes any previous subscription
    /// of the same client first.
    pub fn add_subscriber(
        &mut self,
        client_id: &str,
        connection_id: &str,
        options: &SubscriberOptions,
    ) -> Result<NodeEvents, SfuError> {
        if self.is_closing {
            return Err(SfuError::NotAllowed(format!(
                "stream {} is closing",
                self.stream_id()
            )));
        }
        if self.subscribers.contains_key(client_id) {
            return Err(SfuError::AlreadyExists(format!(
                "{client_id} on {}",
                self.stream_id()
            )));
        }

        let (mut subscriber, events) = Subscriber::new(
            client_id,
            self.stream_id(),
            connection_id,
            options,
            Arc::clone(&self.config),
            Arc::clone(&self.engine),
            self.timers.clone(),
        );

        self.engine
            .attach_subscriber(self.stream_id(), subscriber.erizo_stream_id())?;

        if let Err(e) = self.configure_subscriber(&mut subscriber, options) {
            if let Err(detach_error) = self
                .engine
                .detach_subscriber(self.stream_id(), subscriber.erizo_stream_id())
            {
                warn!(
                    target: "sfu.publisher",
                    stream_id = %self.stream_id(),
                    client_id = %client_id,
                    error = %detach_error,
                    "Failed to detach rejected subscriber"
                );
            }
            return Err(e);
        }

        self.subscribers.insert(client_id.to_string(), subscriber);

        if options.slide_show_mode {
            self.set_slideshow(client_id, SlideshowTrigger::Primary, true, None)?;
        }

        info!(
            target: "sfu.publisher",
            stream_id = %self.stream_id(),
            client_id = %client_id,
            subscribers = self.subscribers.len(),
            "Subscriber added"
        );
        Ok(events)
    }

    fn configure_subscriber(
        &self,
        subscriber: &mut Subscriber,
        options: &SubscriberOptions,
    ) -> Result<(), SfuError> {
        subscriber.set_scheme(self.scheme.clone());
        if let Some(kbps) = self.min_video_bw {
            subscriber.set_target_kbps(kbps);
        }

        let effective = self.effective_mute(subscriber.mute());
        if effective != MuteState::default() {
            subscriber.apply_mute(effective)?;
        }
        if let Some(video) = options.video {
            self.engine
                .set_video_constraints(subscriber.erizo_stream_id(), video)?;
        }
        if let Some(kbps) = options.max_video_bw {
            self.engine
                .set_max_video_bw(subscriber.erizo_stream_id(), kbps)?;
        }
        Ok(())
    }

    /// Detach and close a subscriber. Unknown ids are a logged no-op.
    pub fn remove_subscriber(&mut self, client_id: &str) -> Option<Subscriber> {
        let Some(mut subscriber) = self.subscribers.remove(client_id) else {
            warn!(
                target: "sfu.publisher",
                stream_id = %self.stream_id(),
                client_id = %client_id,
                "Subscriber does not exist"
            );
            return None;
        };

        if let Err(e) = self
            .engine
            .detach_subscriber(self.node.stream_id(), subscriber.erizo_stream_id())
        {
            warn!(
                target: "sfu.publisher",
                stream_id = %self.node.stream_id(),
                client_id = %client_id,
                error = %e,
                "Failed to detach subscriber"
            );
        }

        if !self.slideshow.remove(client_id) && self.slideshow_task.take().is_some() {
            debug!(
                target: "sfu.slideshow",
                stream_id = %self.node.stream_id(),
                "Keyframe pacing stopped"
            );
        }

        subscriber.close();
        info!(
            target: "sfu.publisher",
            stream_id = %self.node.stream_id(),
            client_id = %client_id,
            subscribers = self.subscribers.len(),
            "Subscriber removed"
        );
        Some(subscriber)
    }

    /// Mark closing and remove every subscriber.
    pub fn drain_subscribers(&mut self) -> Vec<Subscriber> {
        self.is_closing = true;
        let ids: Vec<String> = self.subscribers.keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.remove_subscriber(id))
            .collect()
    }

    /// Stop timers and notify the owner. Subscribers must be drained first.
    pub fn close(&mut self) {
        self.is_closing = true;
        self.slideshow_task = None;
        self.fir_task = None;
        self.node.emit(NodeEvent::Closed);
    }

    /// Toggle one slideshow trigger for a subscriber.
    pub fn set_slideshow(
        &mut self,
        client_id: &str,
        trigger: SlideshowTrigger,
        enabled: bool,
        period_ms: Option<u64>,
    ) -> Result<(), SfuError> {
        let subscriber_stream = self.subscriber_stream(client_id)?;

        match self
            .slideshow
            .set_mode(client_id, trigger, enabled, period_ms)
        {
            SlideshowUpdate::Enabled {
                period,
                subscriber_changed,
            } => {
                if subscriber_changed {
                    self.engine.set_slideshow_mode(&subscriber_stream, true)?;
                    self.emit_to_subscriber(client_id, NodeEvent::SlideshowChange { enabled: true });
                }
                self.slideshow_task = Some(ScheduledTask::spawn(
                    period,
                    TimerEvent::SlideshowKeyframe {
                        stream_id: self.stream_id().to_string(),
                    },
                    self.timers.clone(),
                ));
                info!(
                    target: "sfu.slideshow",
                    stream_id = %self.stream_id(),
                    client_id = %client_id,
                    trigger = trigger.as_str(),
                    period_ms = period.as_millis() as u64,
                    "Keyframe pacing started"
                );
            }
            SlideshowUpdate::Disabled {
                subscriber_changed,
                stop_timer,
            } => {
                if subscriber_changed {
                    self.engine.set_slideshow_mode(&subscriber_stream, false)?;
                    for _ in 0..RECOVERY_KEYFRAME_REQUESTS {
                        self.engine.generate_pli(self.erizo_stream_id())?;
                        metrics::record_keyframe_request("recovery");
                    }
                    self.emit_to_subscriber(client_id, NodeEvent::SlideshowChange { enabled: false });
                }
                if stop_timer && self.slideshow_task.take().is_some() {
                    info!(
                        target: "sfu.slideshow",
                        stream_id = %self.stream_id(),
                        "Keyframe pacing stopped"
                    );
                }
            }
        }
        Ok(())
    }

    fn emit_to_subscriber(&self, client_id: &str, event: NodeEvent) {
        if let Some(subscriber) = self.subscribers.get(client_id) {
            subscriber.node().emit(event);
        }
    }

    /// Slideshow pacing tick.
    pub fn on_slideshow_tick(&self) {
        if self.slideshow_task.is_none() {
            return;
        }
        match self.engine.generate_pli(self.erizo_stream_id()) {
            Ok(()) => metrics::record_keyframe_request("slideshow"),
            Err(e) => warn!(
                target: "sfu.slideshow",
                stream_id = %self.stream_id(),
                error = %e,
                "Keyframe request failed"
            ),
        }
    }

    /// Periodic FIR tick.
    pub fn on_fir_tick(&self) {
        if self.fir_task.is_none() {
            return;
        }
        match self.engine.generate_fir(self.erizo_stream_id()) {
            Ok(()) => metrics::record_keyframe_request("fir"),
            Err(e) => warn!(
                target: "sfu.publisher",
                stream_id = %self.stream_id(),
                error = %e,
                "FIR request failed"
            ),
        }
    }

    /// Mute the published stream and re-apply every subscriber's flags.
    pub fn mute_publisher(&mut self, mute: MuteState) -> Result<(), SfuError> {
        self.mute = mute;
        self.engine.mute_stream(self.erizo_stream_id(), mute)?;
        for subscriber in self.subscribers.values() {
            subscriber.apply_mute(self.effective_mute(subscriber.mute()))?;
        }
        debug!(
            target: "sfu.publisher",
            stream_id = %self.stream_id(),
            video = mute.video,
            audio = mute.audio,
            "Publisher mute updated"
        );
        Ok(())
    }

    /// Set one subscriber's own mute flags.
    pub fn mute_subscriber(&mut self, client_id: &str, mute: MuteState) -> Result<(), SfuError> {
        let effective = self.effective_mute(mute);
        let stream_id = self.stream_id().to_string();
        let subscriber =
            self.subscribers
                .get_mut(client_id)
                .ok_or_else(|| SfuError::SubscriberNotFound {
                    client_id: client_id.to_string(),
                    stream_id,
                })?;
        subscriber.set_mute(mute);
        subscriber.apply_mute(effective)
    }

    /// New bandwidth target: recompute thresholds for every subscriber.
    pub fn set_min_video_bw(&mut self, kbps: u64) -> Result<(), SfuError> {
        self.min_video_bw = Some(kbps);
        self.engine.set_min_video_bw(self.erizo_stream_id(), kbps)?;
        for subscriber in self.subscribers.values_mut() {
            subscriber.set_target_kbps(kbps);
        }
        info!(
            target: "sfu.publisher",
            stream_id = %self.stream_id(),
            min_video_bw = kbps,
            subscribers = self.subscribers.len(),
            "Bandwidth target updated"
        );
        Ok(())
    }

    /// Signaling from the publishing client.
    pub fn process_signaling(
        &mut self,
        connection: &mut Connection,
        message: &SignalingMessage,
    ) -> Result<(), SfuError> {
        match message {
            SignalingMessage::Sdp { sdp, config } => {
                connection.set_remote_description(sdp)?;
                if let Some(kbps) = config.as_ref().and_then(|c| c.max_video_bw) {
                    self.max_video_bw = Some(kbps);
                    self.engine.set_max_video_bw(self.erizo_stream_id(), kbps)?;
                }
            }
            SignalingMessage::Candidate { candidate } => {
                connection.add_remote_candidate(candidate)?;
            }
            SignalingMessage::UpdateStream { sdp, config } => {
                if let Some(sdp) = sdp {
                    connection.set_remote_description(sdp)?;
                }
                if let Some(config) = config {
                    self.update_publisher_config(config)?;
                }
            }
            SignalingMessage::Control { action } => {
                self.apply_control(None, action)?;
            }
        }
        Ok(())
    }

    fn update_publisher_config(&mut self, config: &StreamConfigUpdate) -> Result<(), SfuError> {
        if let Some(kbps) = config.min_video_bw {
            self.set_min_video_bw(kbps)?;
        }
        if let Some(mute) = config.mute_stream {
            self.mute_publisher(mute)?;
        }
        if let Some(kbps) = config.max_video_bw {
            self.max_video_bw = Some(kbps);
            self.engine.set_max_video_bw(self.erizo_stream_id(), kbps)?;
        }
        if let Some(handlers) = &config.disable_handlers {
            self.engine
                .disable_handlers(self.erizo_stream_id(), handlers)?;
        }
        Ok(())
    }

    /// Signaling from one subscribing client.
    pub fn process_subscriber_signaling(
        &mut self,
        client_id: &str,
        connection: &mut Connection,
        message: &SignalingMessage,
    ) -> Result<(), SfuError> {
        let subscriber_stream = self.subscriber_stream(client_id)?;

        match message {
            SignalingMessage::Sdp { sdp, config } => {
                connection.set_remote_description(sdp)?;
                if let Some(kbps) = config.as_ref().and_then(|c| c.max_video_bw) {
                    self.engine.set_max_video_bw(&subscriber_stream, kbps)?;
                }
            }
            SignalingMessage::Candidate { candidate } => {
                connection.add_remote_candidate(candidate)?;
            }
            SignalingMessage::UpdateStream { sdp, config } => {
                if let Some(sdp) = sdp {
                    connection.set_remote_description(sdp)?;
                }
                if let Some(config) = config {
                    self.update_subscriber_config(client_id, &subscriber_stream, config)?;
                }
            }
            SignalingMessage::Control { action } => {
                self.apply_control(Some(client_id), action)?;
            }
        }
        Ok(())
    }

    fn update_subscriber_config(
        &mut self,
        client_id: &str,
        subscriber_stream: &str,
        config: &StreamConfigUpdate,
    ) -> Result<(), SfuError> {
        if let Some(kbps) = config.min_video_bw {
            if let Some(subscriber) = self.subscribers.get_mut(client_id) {
                subscriber.set_target_kbps(kbps);
            }
        }
        if let Some(mute) = config.mute_stream {
            self.mute_subscriber(client_id, mute)?;
        }
        if let Some(kbps) = config.max_video_bw {
            self.engine.set_max_video_bw(subscriber_stream, kbps)?;
        }
        if let Some(layer) = config.quality_layer {
            self.engine.set_quality_layer(subscriber_stream, layer)?;
        }
        if let Some(layer) = config.min_layer {
            self.engine.set_minimum_layer(subscriber_stream, layer)?;
        }
        if let Some(video) = config.video {
            self.engine.set_video_constraints(subscriber_stream, video)?;
        }
        if let Some(handlers) = &config.disable_handlers {
            self.engine.disable_handlers(subscriber_stream, handlers)?;
        }
        if let Some(enabled) = config.slide_show_below_layer {
            self.engine
                .set_slideshow_below_layer(subscriber_stream, enabled)?;
            if !enabled {
                self.set_slideshow(client_id, SlideshowTrigger::Fallback, false, None)?;
            }
        }
        if let Some(setting) = config.slide_show_mode {
            self.set_slideshow(
                client_id,
                SlideshowTrigger::Primary,
                setting.is_enabled(),
                setting.period_ms(),
            )?;
        }
        Ok(())
    }

    /// Run a named control action. `client_id` is the subscribing client, or
    /// `None` when the publishing client sent it.
    fn apply_control(
        &mut self,
        client_id: Option<&str>,
        action: &ControlAction,
    ) -> Result<(), SfuError> {
        let subscriber = client_id.filter(|_| !action.publisher_side);
        let target = match subscriber {
            Some(client_id) => self.subscriber_stream(client_id)?,
            None => self.erizo_stream_id().to_string(),
        };

        match action.name.as_str() {
            "controlhandlers" | "handlers" => {
                if action.enable.unwrap_or(true) {
                    self.engine.enable_handlers(&target, &action.handlers)?;
                } else {
                    self.engine.disable_handlers(&target, &action.handlers)?;
                }
            }
            "mute" => {
                let mute = action.mute_stream.ok_or_else(|| {
                    SfuError::InvalidRequest("mute action requires muteStream".to_string())
                })?;
                match subscriber {
                    Some(client_id) => self.mute_subscriber(client_id, mute)?,
                    None => self.mute_publisher(mute)?,
                }
            }
            other => {
                return Err(SfuError::InvalidRequest(format!(
                    "unknown control action: {other}"
                )));
            }
        }

        debug!(
            target: "sfu.publisher",
            stream_id = %target,
            action = %action.name,
            "Control action applied"
        );
        Ok(())
    }
}
