//! SFU Controller Library
//!
//! The control plane of a Selective Forwarding Unit. It tracks which clients
//! publish and subscribe to which media streams, routes their signaling to
//! the Media Engine, and runs two control loops on top of the engine:
//!
//! - bandwidth adaptation, which throttles and recovers feedback reporting
//!   per subscriber
//! - slideshow pacing, which requests periodic keyframes when a subscriber
//!   cannot sustain motion video
//!
//! Packet forwarding, ICE and DTLS belong to the Media Engine, driven through
//! the [`engine::MediaEngine`] trait.
//!
//! # Architecture
//!
//! ```text
//! SessionControllerHandle (cloneable)
//! └── SessionControllerActor (single task)
//!     └── SessionController
//!         ├── ClientRegistry ── Client ── Connection
//!         └── Publisher (per stream)
//!             ├── SlideshowController
//!             └── Subscriber (per client) ── BandwidthAdaptationMonitor
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Controller actor and its handle
//! - [`adaptation`] - Bandwidth adaptation state machine
//! - [`config`] - Configuration from environment
//! - [`engine`] - Media Engine contract (recording mock behind `test-utils`)
//! - [`errors`] - Error taxonomy with numeric codes
//! - [`observability`] - Metrics and tracing setup
//! - [`options`] - Per-call publisher/subscriber options
//! - [`registration`] - Agent registration with retry
//! - [`session`] - Connections, publishers, subscribers
//! - [`signaling`] - Signaling messages and node events
//! - [`timer`] - Scheduled tasks

pub mod actors;
pub mod adaptation;
pub mod config;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod options;
pub mod registration;
pub mod session;
pub mod signaling;
pub mod timer;

pub use actors::{ControllerStatus, SessionControllerHandle, StreamStats};
pub use config::Config;
pub use engine::{EngineEvent, MediaEngine};
pub use errors::SfuError;
pub use options::{PublisherOptions, SubscriberOptions};
pub use session::NodeEvents;
pub use signaling::{NodeEvent, SignalingMessage};
