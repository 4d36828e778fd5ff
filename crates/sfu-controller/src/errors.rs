//! SFU controller error types.
//!
//! Error types map to the control-plane error taxonomy returned to the
//! signaling caller. Internal details are logged server-side but not exposed
//! to clients.

use thiserror::Error;

/// Control-plane error kinds surfaced to the signaling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotAvailable,
    NotExist,
    AlreadyExist,
    NotReady,
    InvalidRequest,
    NotAllowed,
    TokenInvalid,
    InternalError,
}

impl ErrorKind {
    /// Numeric code sent on the wire.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            ErrorKind::NotAvailable => 1,
            ErrorKind::NotExist => 2,
            ErrorKind::AlreadyExist => 3,
            ErrorKind::NotReady => 4,
            ErrorKind::InvalidRequest => 5,
            ErrorKind::NotAllowed => 6,
            ErrorKind::TokenInvalid => 7,
            ErrorKind::InternalError => 8,
        }
    }

    /// Upper-case wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotAvailable => "NOT_AVAILABLE",
            ErrorKind::NotExist => "NOT_EXIST",
            ErrorKind::AlreadyExist => "ALREADY_EXIST",
            ErrorKind::NotReady => "NOT_READY",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::NotAllowed => "NOT_ALLOWED",
            ErrorKind::TokenInvalid => "TOKEN_INVALID",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// SFU controller error type.
///
/// Maps to `ErrorKind` values:
/// - `NotAvailable`, `Draining`: `NOT_AVAILABLE` (1)
/// - `PublisherNotFound`, `SubscriberNotFound`, `ConnectionNotFound`: `NOT_EXIST` (2)
/// - `AlreadyExists`: `ALREADY_EXIST` (3)
/// - `NotReady`: `NOT_READY` (4)
/// - `InvalidRequest`, `Signaling`: `INVALID_REQUEST` (5)
/// - `NotAllowed`: `NOT_ALLOWED` (6)
/// - `TokenInvalid`: `TOKEN_INVALID` (7)
/// - `Engine`, `Config`, `Internal`: `INTERNAL_ERROR` (8)
#[derive(Debug, Error)]
pub enum SfuError {
    /// Requested resource or capacity is not available.
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// Controller is shutting down and rejects new work.
    #[error("Controller is draining")]
    Draining,

    /// No publisher for the given stream id.
    #[error("Publisher not found: {0}")]
    PublisherNotFound(String),

    /// No subscriber for the given client on the stream.
    #[error("Subscriber not found: {client_id} on {stream_id}")]
    SubscriberNotFound { client_id: String, stream_id: String },

    /// Connection id not registered with any client.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Node has not completed negotiation.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Malformed or unsupported request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Signaling message could not be decoded.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Operation not permitted in the current state.
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// Caller token rejected.
    #[error("Token invalid")]
    TokenInvalid,

    /// Media Engine call failed.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the taxonomy kind for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SfuError::NotAvailable(_) | SfuError::Draining => ErrorKind::NotAvailable,
            SfuError::PublisherNotFound(_)
            | SfuError::SubscriberNotFound { .. }
            | SfuError::ConnectionNotFound(_) => ErrorKind::NotExist,
            SfuError::AlreadyExists(_) => ErrorKind::AlreadyExist,
            SfuError::NotReady(_) => ErrorKind::NotReady,
            SfuError::InvalidRequest(_) | SfuError::Signaling(_) => ErrorKind::InvalidRequest,
            SfuError::NotAllowed(_) => ErrorKind::NotAllowed,
            SfuError::TokenInvalid => ErrorKind::TokenInvalid,
            SfuError::Engine(_) | SfuError::Config(_) | SfuError::Internal(_) => {
                ErrorKind::InternalError
            }
        }
    }

    /// Returns the numeric error code for this error.
    #[must_use]
    pub fn error_code(&self) -> u32 {
        self.kind().code()
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Engine(_) | SfuError::Config(_) | SfuError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            SfuError::Draining => "Server is shutting down".to_string(),
            SfuError::PublisherNotFound(_) => "Stream not found".to_string(),
            SfuError::SubscriberNotFound { .. } => "Subscription not found".to_string(),
            SfuError::ConnectionNotFound(_) => "Connection not found".to_string(),
            SfuError::TokenInvalid => "Invalid token".to_string(),
            SfuError::NotAvailable(msg)
            | SfuError::AlreadyExists(msg)
            | SfuError::NotReady(msg)
            | SfuError::InvalidRequest(msg)
            | SfuError::Signaling(msg)
            | SfuError::NotAllowed(msg) => msg.clone(),
        }
    }
}

impl From<serde_json::Error> for SfuError {
    fn from(err: serde_json::Error) -> Self {
        SfuError::Signaling(err.to_string())
    }
}
