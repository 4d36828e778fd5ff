//! Bandwidth adaptation state machine.
//!
//! One monitor per subscriber stream under adaptation. The controller feeds
//! it one bandwidth sample per interval and applies the returned actions to
//! the Media Engine and the subscriber's event channel.
//!
//! ```text
//!   STABLE --(avg < lower, non-increasing, > N tics)--> INSUFFICIENT
//!   INSUFFICIENT --(avg > upper)--> STABLE
//!   INSUFFICIENT --(retry delay)--> RECOVERING
//!   INSUFFICIENT --(retries exhausted)--> WONT_RECOVER
//!   RECOVERING --(avg > upper)--> STABLE
//!   RECOVERING --(no improvement for a window)--> INSUFFICIENT (retries += 1)
//! ```
//!
//! INSUFFICIENT schedules its next recovery attempt on the first sample
//! after entry; the attempt starts `RETRY_DELAY_TICS` samples later.

use crate::engine::FeedbackPolicy;
use crate::signaling::AlertMessage;
use std::collections::VecDeque;

/// Samples in the rolling average.
pub const SAMPLE_WINDOW: usize = 5;

/// Ceiling for the reduced feedback rate, bits per second.
pub const RECOVERY_BITRATE_BPS: u64 = 50_000;

/// Recovery attempts before giving up.
pub const MAX_RECOVERY_RETRIES: u32 = 3;

/// Samples between scheduling a recovery attempt and starting it.
pub const RETRY_DELAY_TICS: u32 = 20;

/// Samples a recovery attempt may run without improving.
pub const RECOVERY_WINDOW_TICS: u32 = 10;

/// Adaptation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationState {
    Stable,
    Insufficient,
    Recovering,
    WontRecover,
}

impl AdaptationState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            AdaptationState::Stable => "stable",
            AdaptationState::Insufficient => "insufficient",
            AdaptationState::Recovering => "recovering",
            AdaptationState::WontRecover => "wont_recover",
        }
    }
}

/// Hysteresis thresholds in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub lower: u64,
    pub upper: u64,
}

impl Thresholds {
    /// Thresholds for a target given in kbps: `floor(T * 0.8)` and `ceil(T * 1.1)`.
    #[must_use]
    pub fn from_target_kbps(kbps: u64) -> Self {
        let target_bps = kbps.saturating_mul(1000);
        Self {
            lower: target_bps.saturating_mul(8) / 10,
            upper: target_bps.saturating_mul(11).saturating_add(9) / 10,
        }
    }
}

/// Side effect requested by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationAction {
    /// Change the stream's feedback reporting.
    Feedback(FeedbackPolicy),
    /// Drop the stream's bandwidth target.
    DisableTarget,
    /// Notify the subscriber.
    Alert { message: AlertMessage, bandwidth: u64 },
}

/// Per-stream bandwidth monitor.
#[derive(Debug, Clone)]
pub struct BandwidthAdaptationMonitor {
    state: AdaptationState,
    samples: VecDeque<u64>,
    last_average: Option<u64>,
    tics: u32,
    retries: u32,
    retry_scheduled: bool,
    tics_per_transition: u32,
    thresholds: Option<Thresholds>,
}

impl BandwidthAdaptationMonitor {
    #[must_use]
    pub fn new(target_kbps: u64, tics_per_transition: u32) -> Self {
        Self {
            state: AdaptationState::Stable,
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            last_average: None,
            tics: 0,
            retries: 0,
            retry_scheduled: false,
            tics_per_transition,
            thresholds: Some(Thresholds::from_target_kbps(target_kbps)),
        }
    }

    #[must_use]
    pub fn state(&self) -> AdaptationState {
        self.state
    }

    #[must_use]
    pub fn thresholds(&self) -> Option<Thresholds> {
        self.thresholds
    }

    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether samples are still evaluated. False once the target was dropped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.thresholds.is_some()
    }

    /// Install a new bandwidth target. Leaves a running cycle alone unless it
    /// had given up, in which case the monitor starts over from STABLE.
    pub fn set_target_kbps(&mut self, kbps: u64) {
        self.thresholds = Some(Thresholds::from_target_kbps(kbps));
        if self.state == AdaptationState::WontRecover {
            self.reset();
            self.state = AdaptationState::Stable;
        }
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.last_average = None;
        self.tics = 0;
        self.retries = 0;
        self.retry_scheduled = false;
    }

    fn average(&self) -> u64 {
        let count = self.samples.len() as u64;
        if count == 0 {
            return 0;
        }
        let sum: u64 = self.samples.iter().sum();
        sum.div_ceil(count)
    }

    /// Feed one bandwidth sample (bits per second).
    pub fn on_sample(&mut self, bandwidth: u64) -> Vec<AdaptationAction> {
        let Some(thresholds) = self.thresholds else {
            return Vec::new();
        };

        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(bandwidth);
        let average = self.average();

        let mut actions = Vec::new();
        match self.state {
            AdaptationState::Stable => {
                let not_increasing = self.last_average.map_or(true, |last| average <= last);
                if not_increasing && average < thresholds.lower {
                    self.tics += 1;
                    if self.tics > self.tics_per_transition {
                        self.enter_insufficient(average, &mut actions);
                    }
                } else {
                    self.tics = 0;
                }
            }
            AdaptationState::Insufficient => {
                if average > thresholds.upper {
                    self.enter_stable(average, &mut actions);
                } else if self.retries >= MAX_RECOVERY_RETRIES {
                    self.enter_wont_recover(average, &mut actions);
                    return actions;
                } else if !self.retry_scheduled {
                    self.retry_scheduled = true;
                } else {
                    self.tics += 1;
                    if self.tics >= RETRY_DELAY_TICS {
                        self.state = AdaptationState::Recovering;
                        self.tics = 0;
                        actions.push(AdaptationAction::Feedback(FeedbackPolicy::Limited {
                            rate_bps: average,
                        }));
                        actions.push(AdaptationAction::Alert {
                            message: AlertMessage::Recovering,
                            bandwidth: average,
                        });
                    }
                }
            }
            AdaptationState::Recovering => {
                if average > thresholds.upper {
                    self.enter_stable(average, &mut actions);
                } else if self.last_average.is_some_and(|last| average > last) {
                    self.tics = 0;
                    actions.push(AdaptationAction::Feedback(FeedbackPolicy::Limited {
                        rate_bps: average.saturating_mul(13) / 10,
                    }));
                } else {
                    self.tics += 1;
                    if self.tics >= RECOVERY_WINDOW_TICS {
                        self.retries += 1;
                        self.enter_insufficient(average, &mut actions);
                    }
                }
            }
            AdaptationState::WontRecover => {}
        }

        self.last_average = Some(average);
        actions
    }

    fn enter_insufficient(&mut self, average: u64, actions: &mut Vec<AdaptationAction>) {
        let from = self.state;
        self.state = AdaptationState::Insufficient;
        self.tics = 0;
        self.retry_scheduled = false;
        let rate = (average / 4).min(RECOVERY_BITRATE_BPS);
        actions.push(AdaptationAction::Feedback(FeedbackPolicy::Limited {
            rate_bps: rate,
        }));
        if from == AdaptationState::Stable {
            actions.push(AdaptationAction::Alert {
                message: AlertMessage::Insufficient,
                bandwidth: average,
            });
        }
    }

    fn enter_stable(&mut self, average: u64, actions: &mut Vec<AdaptationAction>) {
        self.state = AdaptationState::Stable;
        self.tics = 0;
        self.retries = 0;
        self.retry_scheduled = false;
        actions.push(AdaptationAction::Feedback(FeedbackPolicy::Normal));
        actions.push(AdaptationAction::Alert {
            message: AlertMessage::Recovered,
            bandwidth: average,
        });
    }

    fn enter_wont_recover(&mut self, average: u64, actions: &mut Vec<AdaptationAction>) {
        self.state = AdaptationState::WontRecover;
        self.reset();
        self.thresholds = None;
        actions.push(AdaptationAction::DisableTarget);
        actions.push(AdaptationAction::Feedback(FeedbackPolicy::Minimal));
        actions.push(AdaptationAction::Alert {
            message: AlertMessage::AudioOnly,
            bandwidth: average,
        });
    }
}
