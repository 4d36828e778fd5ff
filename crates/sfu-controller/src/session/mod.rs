//! Session orchestration: connections, publishers, subscribers and the
//! controller that owns them.
//!
//! ```text
//! SessionController
//! ├── ClientRegistry ── Client ── Connection (one engine transport)
//! └── Publisher (per stream id)
//!     ├── SlideshowController
//!     └── Subscriber (per client id) ── BandwidthAdaptationMonitor
//! ```

pub mod connection;
pub mod controller;
pub mod node;
pub mod publisher;
pub mod registry;
pub mod slideshow;
pub mod subscriber;

pub use connection::{Connection, ConnectionNotice, ConnectionState};
pub use controller::{SampleRequest, SessionController, StatsTarget};
pub use node::{erizo_stream_id, NodeCore, NodeEvents};
pub use publisher::Publisher;
pub use registry::{Client, ClientRegistry};
pub use slideshow::{SlideshowController, SlideshowTrigger};
pub use subscriber::Subscriber;
