//! Timer-driven behavior: bandwidth adaptation sampling, slideshow keyframe
//! pacing and periodic FIR.
//!
//! Uses tokio's paused clock. Sleeping in the test lets the runtime advance
//! time only once every other task is idle, so each timer tick has been
//! fully handled by the controller before the test wakes up.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use sfu_controller::engine::mock::{EngineCall, MockMediaEngine};
use sfu_controller::engine::{ConnectionStatus, EngineEvent, FeedbackPolicy};
use sfu_controller::signaling::AlertMessage;
use sfu_controller::{
    Config, MediaEngine, NodeEvent, NodeEvents, PublisherOptions, SessionControllerHandle,
    SubscriberOptions,
};
use tokio::sync::mpsc;

// ============================================================================
// Helpers
// ============================================================================

fn spawn() -> (SessionControllerHandle, Arc<MockMediaEngine>) {
    // Sender dropped: no engine events
    let (handle, engine, _) = spawn_with_events();
    (handle, engine)
}

fn spawn_with_events() -> (
    SessionControllerHandle,
    Arc<MockMediaEngine>,
    mpsc::UnboundedSender<EngineEvent>,
) {
    let engine = Arc::new(MockMediaEngine::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let handle = SessionControllerHandle::new(
        Arc::new(Config::default()),
        Arc::clone(&engine) as Arc<dyn MediaEngine>,
        events_rx,
    );
    (handle, engine, events_tx)
}

async fn next_alert(events: &mut NodeEvents) -> (AlertMessage, u64) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let NodeEvent::BandwidthAlert { message, bandwidth } = event {
                return (message, bandwidth);
            }
        }
        panic!("subscriber closed before an alert");
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .expect("no bandwidth alert")
}

fn pli_count(engine: &MockMediaEngine, erizo_stream_id: &str) -> usize {
    engine.count_calls(|c| matches!(c, EngineCall::Pli(id) if id == erizo_stream_id))
}

fn fir_count(engine: &MockMediaEngine, erizo_stream_id: &str) -> usize {
    engine.count_calls(|c| matches!(c, EngineCall::Fir(id) if id == erizo_stream_id))
}

// ============================================================================
// Bandwidth adaptation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_low_bandwidth_then_recovery() {
    let (handle, engine) = spawn();

    // 11 low samples cross the STABLE tic limit, then three high ones lift the
    // rolling average above the upper threshold.
    engine.push_samples(std::iter::repeat_n(Ok(500_000), 11));
    engine.push_samples(std::iter::repeat_n(Ok(2_000_000), 3));

    handle
        .add_publisher(
            "alice".to_string(),
            "s1".to_string(),
            PublisherOptions {
                min_video_bw: Some(1000),
                ..PublisherOptions::default()
            },
        )
        .await
        .unwrap();
    let mut bob = handle
        .add_subscriber("bob".to_string(), "s1".to_string(), SubscriberOptions::default())
        .await
        .unwrap();

    assert_eq!(
        next_alert(&mut bob).await,
        (AlertMessage::Insufficient, 500_000)
    );
    assert!(engine.calls().contains(&EngineCall::Feedback(
        "bob_s1".to_string(),
        FeedbackPolicy::Limited { rate_bps: 50_000 }
    )));

    assert_eq!(
        next_alert(&mut bob).await,
        (AlertMessage::Recovered, 1_400_000)
    );
    assert!(engine.calls().contains(&EngineCall::Feedback(
        "bob_s1".to_string(),
        FeedbackPolicy::Normal
    )));

    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_no_sampling_without_target() {
    let (handle, engine) = spawn();
    engine.push_samples(std::iter::repeat_n(Ok(100_000), 20));

    handle
        .add_publisher("alice".to_string(), "s1".to_string(), PublisherOptions::default())
        .await
        .unwrap();
    let mut bob = handle
        .add_subscriber("bob".to_string(), "s1".to_string(), SubscriberOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(bob.recv().await, Some(NodeEvent::Init));
    assert!(bob.try_recv().is_err());
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::Feedback(_, _))),
        0
    );

    handle.cancel();
}

// ============================================================================
// Slideshow pacing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slideshow_period_clamped_and_recovery_keyframes() {
    let (handle, engine) = spawn();
    handle
        .add_publisher("alice".to_string(), "s1".to_string(), PublisherOptions::default())
        .await
        .unwrap();
    let mut bob = handle
        .add_subscriber("bob".to_string(), "s1".to_string(), SubscriberOptions::default())
        .await
        .unwrap();
    assert_eq!(bob.recv().await, Some(NodeEvent::Init));

    // 500 ms is below the floor and runs at 2 s
    handle
        .process_signaling_json(
            "bob".to_string(),
            "s1".to_string(),
            r#"{"type":"updatestream","config":{"slideShowMode":500}}"#,
        )
        .await
        .unwrap();
    assert_eq!(
        bob.recv().await,
        Some(NodeEvent::SlideshowChange { enabled: true })
    );
    assert!(engine
        .calls()
        .contains(&EngineCall::SlideshowMode("bob_s1".to_string(), true)));

    tokio::time::sleep(Duration::from_millis(1900)).await;
    assert_eq!(pli_count(&engine, "alice_s1"), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pli_count(&engine, "alice_s1"), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(pli_count(&engine, "alice_s1"), 2);

    handle
        .process_signaling_json(
            "bob".to_string(),
            "s1".to_string(),
            r#"{"type":"updatestream","config":{"slideShowMode":false}}"#,
        )
        .await
        .unwrap();
    assert_eq!(
        bob.recv().await,
        Some(NodeEvent::SlideshowChange { enabled: false })
    );
    // Three recovery keyframes, then pacing stops
    assert_eq!(pli_count(&engine, "alice_s1"), 5);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(pli_count(&engine, "alice_s1"), 5);

    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_fir_for_server_publisher() {
    let (handle, engine, engine_events) = spawn_with_events();
    handle
        .add_publisher(
            "router".to_string(),
            "s1".to_string(),
            PublisherOptions {
                is_server: true,
                fir_period: Some(3000),
                ..PublisherOptions::default()
            },
        )
        .await
        .unwrap();

    // Nothing until the transport is ready
    tokio::time::sleep(Duration::from_millis(9500)).await;
    assert_eq!(fir_count(&engine, "router_s1"), 0);

    engine_events
        .send(EngineEvent::Status {
            connection_id: "router_1".to_string(),
            status: ConnectionStatus::Ready,
            message: String::new(),
            stream_id: None,
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(9500)).await;
    assert_eq!(fir_count(&engine, "router_s1"), 3);

    handle
        .remove_publisher("router".to_string(), "s1".to_string())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fir_count(&engine, "router_s1"), 3);

    handle.cancel();
}
