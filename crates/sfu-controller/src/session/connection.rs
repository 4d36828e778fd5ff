//! Connection - one Media Engine transport session.
//!
//! A connection owns the media streams multiplexed over its transport and
//! turns engine status reports into `ConnectionNotice`s for the nodes bound
//! to it. State machine:
//!
//! ```text
//! INITIAL -> STARTED -> GATHERED -> READY
//!     \________\___________\_________\___> FAILED
//! any -> FINISHED (engine closed) | CLOSED (close())
//! ```
//!
//! `SDP_PROCESSED` and `CANDIDATE` are notifications, not transitions.

use crate::config::{AddressTranslation, Config};
use crate::engine::{
    ConnectionStatus, MediaEngine, MediaStreamConfig, StreamRole, TransportConfig,
};
use crate::errors::SfuError;
use crate::options::ConnectionOptions;
use crate::signaling::{IceCandidate, NodeEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Started,
    Gathered,
    Ready,
    Failed,
    Finished,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Failed | ConnectionState::Finished | ConnectionState::Closed
        )
    }
}

/// Event produced by a connection for the nodes on it.
///
/// `stream_id` carries the erizo stream id when the notice concerns a single
/// stream; `None` means every node on the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionNotice {
    pub stream_id: Option<String>,
    pub event: NodeEvent,
}

impl ConnectionNotice {
    fn broadcast(event: NodeEvent) -> Self {
        Self {
            stream_id: None,
            event,
        }
    }
}

const HOST_CANDIDATE_PRIORITY: &str = "2013266431";
const TRANSLATED_CANDIDATE_PRIORITY: &str = "2013266430";

/// Rewrite the session version (third field of the `o=` line).
#[must_use]
pub fn stamp_sdp_version(sdp: &str, version: u32) -> String {
    sdp.split('\n')
        .map(|line| {
            let (body, cr) = match line.strip_suffix('\r') {
                Some(body) => (body, "\r"),
                None => (line, ""),
            };
            match body.strip_prefix("o=") {
                Some(origin) => {
                    let fields: Vec<String> = origin
                        .split(' ')
                        .enumerate()
                        .map(|(i, field)| {
                            if i == 2 {
                                version.to_string()
                            } else {
                                field.to_string()
                            }
                        })
                        .collect();
                    format!("o={}{cr}", fields.join(" "))
                }
                None => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One transport session and its media streams.
pub struct Connection {
    id: String,
    client_id: String,
    state: ConnectionState,
    ready: bool,
    initialized: bool,
    sdp_version: u32,
    options: ConnectionOptions,
    translation: Option<AddressTranslation>,
    media_streams: HashMap<String, StreamRole>,
    first_stream_id: Option<String>,
    config: Arc<Config>,
    engine: Arc<dyn MediaEngine>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("ready", &self.ready)
            .field("sdp_version", &self.sdp_version)
            .field("media_streams", &self.media_streams.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub fn new(
        id: String,
        client_id: String,
        options: ConnectionOptions,
        config: Arc<Config>,
        engine: Arc<dyn MediaEngine>,
    ) -> Self {
        let translation = config
            .interface(options.interface.as_deref())
            .and_then(|iface| iface.translation.clone());

        Self {
            id,
            client_id,
            state: ConnectionState::Initial,
            ready: false,
            initialized: false,
            sdp_version: 0,
            options,
            translation,
            media_streams: HashMap::new(),
            first_stream_id: None,
            config,
            engine,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Transport-level readiness.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    #[must_use]
    pub fn sdp_version(&self) -> u32 {
        self.sdp_version
    }

    #[must_use]
    pub fn media_stream_count(&self) -> usize {
        self.media_streams.len()
    }

    #[must_use]
    pub fn has_media_stream(&self, erizo_stream_id: &str) -> bool {
        self.media_streams.contains_key(erizo_stream_id)
    }

    /// Server-side offer connections emit `offer`, all others `answer`.
    #[must_use]
    pub fn is_offerer(&self) -> bool {
        self.options.create_offer.is_some()
    }

    fn active_translation(&self) -> Option<&AddressTranslation> {
        if self.options.internal {
            None
        } else {
            self.translation.as_ref()
        }
    }

    /// Create the engine transport. Idempotent.
    pub fn init(&mut self) -> Result<(), SfuError> {
        if self.initialized {
            return Ok(());
        }

        let transport = TransportConfig {
            connection_id: self.id.clone(),
            media_configuration: self.options.media_configuration(&self.config).to_string(),
            min_port: self.config.min_port,
            max_port: self.config.max_port,
            ice_controlling: self.options.controlling(&self.config),
            interface: self
                .config
                .interface(self.options.interface.as_deref())
                .map(|iface| iface.name.clone()),
            encrypt: self.options.encrypt(&self.config),
            trickle: self.options.trickle,
            disable_rr: self.options.disable_rr,
        };
        self.engine.create_transport(&transport)?;
        self.initialized = true;

        info!(
            target: "sfu.connection",
            connection_id = %self.id,
            client_id = %self.client_id,
            offerer = self.is_offerer(),
            "Transport created"
        );
        Ok(())
    }

    /// Ask the engine for a server-side offer, if this connection makes one.
    pub fn create_offer(&self) -> Result<(), SfuError> {
        if let Some(options) = &self.options.create_offer {
            self.engine.create_offer(&self.id, options)?;
        }
        Ok(())
    }

    pub fn add_media_stream(
        &mut self,
        erizo_stream_id: &str,
        label: Option<String>,
        role: StreamRole,
    ) -> Result<(), SfuError> {
        if self.media_streams.contains_key(erizo_stream_id) {
            return Err(SfuError::AlreadyExists(erizo_stream_id.to_string()));
        }

        self.engine.add_media_stream(
            &self.id,
            &MediaStreamConfig {
                erizo_stream_id: erizo_stream_id.to_string(),
                label,
                role,
            },
        )?;
        self.media_streams.insert(erizo_stream_id.to_string(), role);
        if self.first_stream_id.is_none() {
            self.first_stream_id = Some(erizo_stream_id.to_string());
        }

        debug!(
            target: "sfu.connection",
            connection_id = %self.id,
            stream_id = %erizo_stream_id,
            role = role.as_str(),
            streams = self.media_streams.len(),
            "Media stream added"
        );
        Ok(())
    }

    /// Remove a media stream. Returns the number of streams left.
    pub fn remove_media_stream(&mut self, erizo_stream_id: &str) -> usize {
        if self.media_streams.remove(erizo_stream_id).is_none() {
            warn!(
                target: "sfu.connection",
                connection_id = %self.id,
                stream_id = %erizo_stream_id,
                "Removing unknown media stream"
            );
            return self.media_streams.len();
        }

        if let Err(e) = self.engine.remove_media_stream(&self.id, erizo_stream_id) {
            warn!(
                target: "sfu.connection",
                connection_id = %self.id,
                stream_id = %erizo_stream_id,
                error = %e,
                "Engine failed to remove media stream"
            );
        }
        self.media_streams.len()
    }

    pub fn set_remote_description(&mut self, sdp: &str) -> Result<(), SfuError> {
        if matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Finished
        ) {
            return Err(SfuError::NotAllowed(format!(
                "connection {} is closed",
                self.id
            )));
        }
        self.engine.set_remote_description(&self.id, sdp)?;
        Ok(())
    }

    pub fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), SfuError> {
        if self.state == ConnectionState::Closed {
            return Err(SfuError::NotAllowed(format!(
                "connection {} is closed",
                self.id
            )));
        }
        self.engine.add_remote_candidate(&self.id, candidate)?;
        Ok(())
    }

    /// Apply an engine status report.
    pub fn on_status(
        &mut self,
        status: ConnectionStatus,
        message: &str,
        stream_id: Option<&str>,
    ) -> Vec<ConnectionNotice> {
        if self.state == ConnectionState::Closed {
            debug!(
                target: "sfu.connection",
                connection_id = %self.id,
                status = status.code(),
                "Status after close ignored"
            );
            return Vec::new();
        }

        match status {
            ConnectionStatus::Initial => {
                self.state = ConnectionState::Initial;
                Vec::new()
            }
            ConnectionStatus::Started => {
                self.state = ConnectionState::Started;
                vec![ConnectionNotice::broadcast(NodeEvent::Started)]
            }
            ConnectionStatus::Gathered => {
                if !self.state.is_terminal() && self.state != ConnectionState::Ready {
                    self.state = ConnectionState::Gathered;
                }
                // Gathering answers for the stream that opened the transport
                let first = self.first_stream_id.clone();
                self.local_description_notice(first)
                    .into_iter()
                    .collect()
            }
            ConnectionStatus::Sdp | ConnectionStatus::SdpProcessed => self
                .local_description_notice(stream_id.map(str::to_string))
                .into_iter()
                .collect(),
            ConnectionStatus::Candidate => self.on_candidate(IceCandidate {
                sdp_mid: None,
                sdp_m_line_index: 0,
                candidate: message.to_string(),
            }),
            ConnectionStatus::Ready => match stream_id {
                Some(stream_id) => vec![ConnectionNotice {
                    stream_id: Some(stream_id.to_string()),
                    event: NodeEvent::Ready,
                }],
                None if !self.ready => {
                    self.ready = true;
                    self.state = ConnectionState::Ready;
                    info!(
                        target: "sfu.connection",
                        connection_id = %self.id,
                        "Connection ready"
                    );
                    vec![ConnectionNotice::broadcast(NodeEvent::Ready)]
                }
                None => Vec::new(),
            },
            ConnectionStatus::Failed => {
                if self.state == ConnectionState::Failed {
                    return Vec::new();
                }
                self.state = ConnectionState::Failed;
                warn!(
                    target: "sfu.connection",
                    connection_id = %self.id,
                    client_id = %self.client_id,
                    "Connection failed"
                );
                vec![ConnectionNotice {
                    stream_id: stream_id.map(str::to_string),
                    event: NodeEvent::Failed {
                        sdp: message.to_string(),
                    },
                }]
            }
            ConnectionStatus::Finished => {
                self.state = ConnectionState::Finished;
                debug!(
                    target: "sfu.connection",
                    connection_id = %self.id,
                    "Connection finished"
                );
                Vec::new()
            }
        }
    }

    /// Locally gathered candidate. With address translation the candidate is
    /// emitted twice: untouched, then rewritten with its priority lowered by
    /// one so the two pairs stay distinct.
    pub fn on_candidate(&mut self, candidate: IceCandidate) -> Vec<ConnectionNotice> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }

        let translated = self.active_translation().map(|t| IceCandidate {
            candidate: t.apply(
                &candidate
                    .candidate
                    .replace(HOST_CANDIDATE_PRIORITY, TRANSLATED_CANDIDATE_PRIORITY),
            ),
            ..candidate.clone()
        });

        let mut notices = vec![ConnectionNotice::broadcast(NodeEvent::Candidate {
            candidate,
        })];
        if let Some(candidate) = translated {
            notices.push(ConnectionNotice::broadcast(NodeEvent::Candidate {
                candidate,
            }));
        }
        notices
    }

    /// Build the offer/answer notice, addressed to `stream_id` when known.
    fn local_description_notice(&mut self, stream_id: Option<String>) -> Option<ConnectionNotice> {
        let sdp = match self.engine.local_description(&self.id) {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(
                    target: "sfu.connection",
                    connection_id = %self.id,
                    error = %e,
                    "Failed to get local description"
                );
                return None;
            }
        };

        self.sdp_version += 1;
        let mut sdp = stamp_sdp_version(&sdp, self.sdp_version);
        if let Some(translation) = self.active_translation() {
            sdp = translation.apply(&sdp);
        }

        let event = if self.is_offerer() {
            NodeEvent::Offer { sdp }
        } else {
            NodeEvent::Answer { sdp }
        };
        debug!(
            target: "sfu.connection",
            connection_id = %self.id,
            stream_id = stream_id.as_deref().unwrap_or("*"),
            version = self.sdp_version,
            "Local description ready"
        );
        Some(ConnectionNotice { stream_id, event })
    }

    /// Close the transport. Idempotent.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.media_streams.clear();
        if self.initialized {
            self.engine.close_transport(&self.id);
        }
        info!(
            target: "sfu.connection",
            connection_id = %self.id,
            client_id = %self.client_id,
            "Connection closed"
        );
    }
}
