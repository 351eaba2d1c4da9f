//! Single transport attempt with timeout classification.
//!
//! An attempt starts a factory connect, arms a timeout, and resolves to
//! either a viable (handshake-confirmed) transport or a classified failure:
//! retryable (`Disconnected`) or fatal (`Failed`).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use ripple_protocol::{ConnectionDetails, ErrorInfo};

use crate::traits::{
    ConnectParams, Transport, TransportEvent, TransportFactory, CODE_CONNECTION_CLOSED,
    CODE_CONNECT_TIMEOUT,
};

/// A transport whose protocol handshake has completed.
pub struct ActiveTransport {
    /// The viable transport.
    pub transport: Arc<dyn Transport>,
    /// Remaining event stream; the CONNECTED event has been consumed.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Connection identity assigned by the server.
    pub connection_id: String,
    /// Negotiated connection properties.
    pub details: ConnectionDetails,
    /// Non-fatal resume failure reported alongside the fresh connection.
    pub resume_error: Option<ErrorInfo>,
}

impl std::fmt::Debug for ActiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTransport")
            .field("kind", &self.transport.kind())
            .field("host", &self.transport.host())
            .field("connection_id", &self.connection_id)
            .field("resume_error", &self.resume_error)
            .finish_non_exhaustive()
    }
}

/// A classified attempt failure.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// Retryable: the host may work on a later attempt.
    #[error("Transport attempt failed (retryable): {0}")]
    Disconnected(ErrorInfo),
    /// Fatal: this route was rejected outright.
    #[error("Transport attempt failed (fatal): {0}")]
    Failed(ErrorInfo),
}

impl AttemptError {
    /// The underlying error.
    #[must_use]
    pub fn error(&self) -> &ErrorInfo {
        match self {
            AttemptError::Disconnected(error) | AttemptError::Failed(error) => error,
        }
    }

    /// Whether retrying this route is pointless.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, AttemptError::Failed(_))
    }
}

/// Run one connect attempt against one host.
///
/// # Errors
///
/// Returns a classified [`AttemptError`]; the transport is disposed on
/// failure.
pub async fn connect(
    factory: &dyn TransportFactory,
    params: ConnectParams,
    timeout: Duration,
) -> Result<ActiveTransport, AttemptError> {
    let host = params.host.clone();
    debug!(kind = %factory.kind(), host = %host, "Starting transport attempt");

    let (transport, mut events) = factory.spawn(params);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                transport.dispose();
                return Err(AttemptError::Disconnected(ErrorInfo::new(
                    CODE_CONNECT_TIMEOUT,
                    408,
                    format!("Connect to {} timed out after {:?}", host, timeout),
                )));
            }
            event = events.recv() => match event {
                Some(TransportEvent::Connected { connection_id, details, error }) => {
                    return Ok(ActiveTransport {
                        transport,
                        events,
                        connection_id,
                        details,
                        resume_error: error,
                    });
                }
                Some(TransportEvent::Disconnected { error }) => {
                    transport.dispose();
                    return Err(AttemptError::Disconnected(error));
                }
                Some(TransportEvent::Failed { error }) => {
                    transport.dispose();
                    return Err(AttemptError::Failed(error));
                }
                // Nothing meaningful can arrive before CONNECTED.
                Some(TransportEvent::Preconnect)
                | Some(TransportEvent::Heartbeat)
                | Some(TransportEvent::Message { .. }) => {}
                None => {
                    transport.dispose();
                    return Err(AttemptError::Disconnected(ErrorInfo::new(
                        CODE_CONNECTION_CLOSED,
                        0,
                        "Transport ended before handshake",
                    )));
                }
            }
        }
    }
}
