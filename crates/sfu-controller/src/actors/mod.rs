//! Actor layer: the controller task and its handle.
//!
//! ```text
//! SessionControllerHandle ──mpsc──▶ SessionControllerActor
//!                                   ├── owns SessionController
//!                                   ├── engine events (mpsc)
//!                                   ├── timer ticks (mpsc)
//!                                   └── bandwidth samples (mpsc)
//! ```

pub mod controller;
pub mod messages;
pub mod metrics;

pub use controller::{SessionControllerActor, SessionControllerHandle};
pub use messages::{ControllerMessage, ControllerStatus, StreamStats};
pub use metrics::{MailboxLevel, MailboxMonitor};
