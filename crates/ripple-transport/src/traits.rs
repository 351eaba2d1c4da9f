//! Transport abstraction for the Ripple client.
//!
//! A transport is one byte-stream carrier to one host. Two interchangeable
//! implementations share this contract: a persistent full-duplex WebSocket
//! and an HTTP long-poll fallback. A transport owns its I/O tasks and reports
//! everything that happens on the carrier as a stream of [`TransportEvent`]s;
//! the connection manager consumes that stream and never touches the socket.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use ripple_protocol::{ConnectionDetails, ErrorInfo, ProtocolError, ProtocolMessage, WireFormat};

/// Grace added to the server-advertised max idle interval before a transport
/// declares the connection idle.
pub const IDLE_GRACE: Duration = Duration::from_secs(5);

/// Idle budget applied before CONNECTED advertises the real interval.
pub const DEFAULT_IDLE_BUDGET: Duration = Duration::from_secs(30);

/// Error code: transport closed or ended without a protocol-level reason.
pub const CODE_CONNECTION_CLOSED: u32 = 80_000;
/// Error code: idle budget exhausted; distinct from a clean close.
pub const CODE_IDLE_TIMEOUT: u32 = 80_003;
/// Error code: transport attempt timed out.
pub const CODE_CONNECT_TIMEOUT: u32 = 80_014;

/// Kind of carrier behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Persistent full-duplex WebSocket.
    WebSocket,
    /// HTTP long-poll fallback.
    Comet,
}

impl TransportKind {
    /// Stable name used for the persisted transport preference.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Comet => "comet",
        }
    }

    /// Parse a persisted preference name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "websocket" => Some(TransportKind::WebSocket),
            "comet" => Some(TransportKind::Comet),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Continuity requested when establishing a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// No continuity: fresh connection identity.
    Clean,
    /// Reuse a live connection key held by the manager.
    Resume { connection_key: String },
    /// Present a prior connection key and serial from a recovery token.
    Recover { connection_key: String, msg_serial: i64 },
}

/// Everything a transport needs to dial one host.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Target host name.
    pub host: String,
    /// Whether to use TLS (wss/https).
    pub tls: bool,
    /// Wire format for envelopes.
    pub format: WireFormat,
    /// Requested continuity.
    pub mode: ConnectMode,
    /// Auth material as query parameters.
    pub auth_params: Vec<(String, String)>,
    /// Client identity to assert, if any.
    pub client_id: Option<String>,
}

impl ConnectParams {
    /// Collect the full query-parameter set for a connect request.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self.auth_params.clone();
        pairs.push(("format".into(), self.format.as_str().into()));
        if let Some(client_id) = &self.client_id {
            pairs.push(("clientId".into(), client_id.clone()));
        }
        match &self.mode {
            ConnectMode::Clean => {}
            ConnectMode::Resume { connection_key } => {
                pairs.push(("resume".into(), connection_key.clone()));
            }
            ConnectMode::Recover {
                connection_key,
                msg_serial,
            } => {
                pairs.push(("recover".into(), connection_key.clone()));
                pairs.push(("recoverSerial".into(), msg_serial.to_string()));
            }
        }
        pairs
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is not connected.
    #[error("Transport not connected")]
    NotConnected,

    /// The transport has been disposed.
    #[error("Transport disposed")]
    Disposed,

    /// Failed to hand an envelope to the carrier.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Carrier handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle and inbound-message events emitted by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// Carrier is viable but the protocol handshake is not yet confirmed.
    Preconnect,
    /// Protocol handshake confirmed. `error` carries a non-fatal resume
    /// failure reported alongside the fresh connection.
    Connected {
        connection_id: String,
        details: ConnectionDetails,
        error: Option<ErrorInfo>,
    },
    /// Carrier dropped; retryable.
    Disconnected { error: ErrorInfo },
    /// Carrier rejected; not retryable on this transport.
    Failed { error: ErrorInfo },
    /// Peer heartbeat observed.
    Heartbeat,
    /// Raw inbound protocol message for the connection manager to route.
    Message { message: ProtocolMessage },
}

/// An established (or establishing) byte-transport to one host.
pub trait Transport: Send + Sync {
    /// Carrier kind.
    fn kind(&self) -> TransportKind;

    /// Target host.
    fn host(&self) -> &str;

    /// Negotiated wire format.
    fn format(&self) -> WireFormat;

    /// Whether the protocol handshake has completed and the carrier is up.
    fn is_connected(&self) -> bool;

    /// Write one envelope.
    ///
    /// Envelopes are queued to the carrier's writer; completion is tracked
    /// by the protocol layer via ACKs, not by this call.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is no longer usable.
    fn send(&self, message: ProtocolMessage) -> Result<(), TransportError>;

    /// Graceful teardown: sends CLOSE and releases the carrier.
    fn close(&self);

    /// Immediate teardown without a CLOSE round-trip.
    fn disconnect(&self);

    /// Release all resources. The event stream ends after this.
    fn dispose(&self);
}

/// Creates transports of one kind.
///
/// The factory spawns the carrier's I/O tasks immediately; connection
/// progress arrives on the returned event stream.
pub trait TransportFactory: Send + Sync {
    /// Kind of transport this factory creates.
    fn kind(&self) -> TransportKind;

    /// Start connecting to the host in `params`.
    fn spawn(
        &self,
        params: ConnectParams,
    ) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>);
}
