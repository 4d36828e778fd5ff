//! Scheduled tasks owned by publishers and subscribers.
//!
//! A `ScheduledTask` runs an interval loop on the tokio runtime and posts a
//! `TimerEvent` into the controller's timer mailbox on every tick. The loop
//! never touches controller state itself; the controller looks up the target
//! node when the event is dequeued and ignores it if the node is gone.
//!
//! The task is cancelled by `cancel()` or when the owner drops it, so a
//! torn-down node cannot leave a timer behind.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Recurring work delivered to the controller loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Slideshow keyframe pacing for a publisher.
    SlideshowKeyframe { stream_id: String },
    /// Periodic FIR for a server publisher.
    PeriodicFir { stream_id: String },
    /// Bandwidth sample due for one subscriber.
    AdaptationSample { stream_id: String, client_id: String },
}

impl TimerEvent {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            TimerEvent::SlideshowKeyframe { .. } => "slideshow",
            TimerEvent::PeriodicFir { .. } => "fir",
            TimerEvent::AdaptationSample { .. } => "adaptation",
        }
    }
}

/// Sender side of the controller's timer mailbox.
pub type TimerSender = mpsc::UnboundedSender<TimerEvent>;

/// Handle to a running interval task.
#[derive(Debug)]
pub struct ScheduledTask {
    period: Duration,
    cancel_token: CancellationToken,
}

impl ScheduledTask {
    /// Spawn an interval loop. The first event fires one `period` from now.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(period: Duration, event: TimerEvent, sender: TimerSender) -> Self {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    () = token.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        if sender.send(event.clone()).is_err() {
                            // Controller loop is gone
                            break;
                        }
                    }
                }
            }

            debug!(
                target: "sfu.timer",
                kind = event.kind(),
                "Scheduled task stopped"
            );
        });

        Self {
            period,
            cancel_token,
        }
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TimerEvent>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_fires_at_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = ScheduledTask::spawn(
            Duration::from_secs(2),
            TimerEvent::SlideshowKeyframe {
                stream_id: "s1".to_string(),
            },
            tx,
        );
        assert_eq!(task.period(), Duration::from_secs(2));

        // No immediate tick
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            rx.try_recv().unwrap(),
            TimerEvent::SlideshowKeyframe {
                stream_id: "s1".to_string()
            }
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = ScheduledTask::spawn(
            Duration::from_secs(1),
            TimerEvent::PeriodicFir {
                stream_id: "s1".to_string(),
            },
            tx,
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), 1);

        task.cancel();
        assert!(task.is_cancelled());
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = ScheduledTask::spawn(
            Duration::from_secs(1),
            TimerEvent::AdaptationSample {
                stream_id: "s1".to_string(),
                client_id: "c2".to_string(),
            },
            tx,
        );
        drop(task);
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), 0);
    }
}
