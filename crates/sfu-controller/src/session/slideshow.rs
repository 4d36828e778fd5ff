//! Slideshow keyframe pacing state for one publisher.
//!
//! Each subscriber may be in slideshow through a primary trigger (requested
//! by the client) or a fallback trigger (reported by the engine when the
//! subscriber drops below the lowest layer). The publisher paces keyframe
//! requests on a single shared timer while any subscriber is in either mode.

use std::collections::HashMap;
use std::time::Duration;

pub const MIN_SLIDESHOW_PERIOD_MS: u64 = 2000;
pub const MAX_SLIDESHOW_PERIOD_MS: u64 = 10_000;
pub const DEFAULT_PRIMARY_PERIOD_MS: u64 = 2000;
pub const DEFAULT_FALLBACK_PERIOD_MS: u64 = 3000;

/// Keyframe requests sent when a subscriber leaves slideshow.
pub const RECOVERY_KEYFRAME_REQUESTS: usize = 3;

/// Which trigger is being toggled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideshowTrigger {
    Primary,
    Fallback,
}

impl SlideshowTrigger {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SlideshowTrigger::Primary => "primary",
            SlideshowTrigger::Fallback => "fallback",
        }
    }

    const fn default_period_ms(&self) -> u64 {
        match self {
            SlideshowTrigger::Primary => DEFAULT_PRIMARY_PERIOD_MS,
            SlideshowTrigger::Fallback => DEFAULT_FALLBACK_PERIOD_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Modes {
    primary: bool,
    fallback: bool,
}

impl Modes {
    fn any(self) -> bool {
        self.primary || self.fallback
    }
}

/// Outcome of a mode change, applied by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideshowUpdate {
    /// (Re)start pacing at `period`. `subscriber_changed` is set when the
    /// subscriber was not in slideshow before.
    Enabled {
        period: Duration,
        subscriber_changed: bool,
    },
    /// `subscriber_changed` is set when the subscriber just left slideshow;
    /// `stop_timer` when no subscriber remains in either mode.
    Disabled {
        subscriber_changed: bool,
        stop_timer: bool,
    },
}

/// Per-subscriber slideshow flags of one publisher.
#[derive(Debug, Default)]
pub struct SlideshowController {
    modes: HashMap<String, Modes>,
}

impl SlideshowController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp a requested period into `[MIN, MAX]`, defaulting per trigger.
    #[must_use]
    pub fn clamp_period(requested_ms: Option<u64>, trigger: SlideshowTrigger) -> Duration {
        let ms = requested_ms
            .unwrap_or_else(|| trigger.default_period_ms())
            .clamp(MIN_SLIDESHOW_PERIOD_MS, MAX_SLIDESHOW_PERIOD_MS);
        Duration::from_millis(ms)
    }

    /// Whether the subscriber is in slideshow through either trigger.
    #[must_use]
    pub fn is_active(&self, client_id: &str) -> bool {
        self.modes.get(client_id).is_some_and(|m| m.any())
    }

    #[must_use]
    pub fn any_active(&self) -> bool {
        self.modes.values().any(|m| m.any())
    }

    pub fn set_mode(
        &mut self,
        client_id: &str,
        trigger: SlideshowTrigger,
        enabled: bool,
        period_ms: Option<u64>,
    ) -> SlideshowUpdate {
        let before = self.modes.get(client_id).copied().unwrap_or_default();

        let mut after = before;
        match trigger {
            SlideshowTrigger::Primary => after.primary = enabled,
            SlideshowTrigger::Fallback => after.fallback = enabled,
        }

        if after.any() {
            self.modes.insert(client_id.to_string(), after);
        } else {
            self.modes.remove(client_id);
        }

        if enabled {
            SlideshowUpdate::Enabled {
                period: Self::clamp_period(period_ms, trigger),
                subscriber_changed: !before.any(),
            }
        } else {
            SlideshowUpdate::Disabled {
                subscriber_changed: before.any() && !after.any(),
                stop_timer: !self.any_active(),
            }
        }
    }

    /// Forget a subscriber. Returns whether pacing is still needed.
    pub fn remove(&mut self, client_id: &str) -> bool {
        self.modes.remove(client_id);
        self.any_active()
    }
}
