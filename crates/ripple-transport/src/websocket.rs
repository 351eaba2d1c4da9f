//! WebSocket transport implementation.
//!
//! The preferred carrier: one persistent full-duplex socket per connection
//! attempt, driven by a single I/O task. Outbound envelopes are queued to the
//! task; inbound envelopes and carrier lifecycle changes are reported on the
//! event stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, trace, warn};

use ripple_protocol::{codec, ErrorInfo, ProtocolMessage, WireFormat};

use crate::traits::{
    ConnectParams, Transport, TransportError, TransportEvent, TransportFactory, TransportKind,
    CODE_CONNECTION_CLOSED, CODE_IDLE_TIMEOUT, DEFAULT_IDLE_BUDGET,
};

enum Outbound {
    Envelope(ProtocolMessage),
    Close,
    Shutdown,
}

/// Factory for WebSocket transports.
#[derive(Debug, Default)]
pub struct WebSocketFactory;

impl WebSocketFactory {
    /// Create a new factory.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for WebSocketFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn spawn(
        &self,
        params: ConnectParams,
    ) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(WebSocketTransport {
            host: params.host.clone(),
            format: params.format,
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            outbound: outbound_tx,
        });

        tokio::spawn(run(Arc::clone(&transport), params, outbound_rx, events_tx));

        (transport, events_rx)
    }
}

/// A WebSocket carrier to one host.
pub struct WebSocketTransport {
    host: String,
    format: WireFormat,
    connected: AtomicBool,
    disposed: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn format(&self) -> WireFormat {
        self.format
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, message: ProtocolMessage) -> Result<(), TransportError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        self.outbound
            .send(Outbound::Envelope(message))
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Shutdown);
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Shutdown);
    }
}

/// Build the connect URL for a host and parameter set.
fn build_url(params: &ConnectParams) -> Result<reqwest::Url, TransportError> {
    let scheme = if params.tls { "wss" } else { "ws" };
    let mut url = reqwest::Url::parse(&format!("{}://{}/connect", scheme, params.host))
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in params.query_pairs() {
            query.append_pair(&key, &value);
        }
    }
    Ok(url)
}

/// Classify a handshake error as retryable (`Disconnected`) or fatal.
fn classify_handshake(error: &WsError) -> TransportEvent {
    match error {
        // An HTTP rejection means the host answered and refused us.
        WsError::Http(response) => TransportEvent::Failed {
            error: ErrorInfo::new(
                CODE_CONNECTION_CLOSED,
                response.status().as_u16(),
                format!("WebSocket handshake rejected: {}", response.status()),
            ),
        },
        WsError::Url(e) => TransportEvent::Failed {
            error: ErrorInfo::new(CODE_CONNECTION_CLOSED, 400, e.to_string()),
        },
        other => TransportEvent::Disconnected {
            error: ErrorInfo::new(CODE_CONNECTION_CLOSED, 0, other.to_string()),
        },
    }
}

async fn run(
    transport: Arc<WebSocketTransport>,
    params: ConnectParams,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let url = match build_url(&params) {
        Ok(url) => url,
        Err(e) => {
            let _ = events.send(TransportEvent::Failed {
                error: ErrorInfo::new(CODE_CONNECTION_CLOSED, 400, e.to_string()),
            });
            return;
        }
    };

    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            debug!(host = %params.host, "WebSocket handshake failed: {}", e);
            let _ = events.send(classify_handshake(&e));
            return;
        }
    };

    debug!(host = %params.host, "WebSocket carrier established");
    let _ = events.send(TransportEvent::Preconnect);

    let (mut sink, mut source) = stream.split();
    // Rearmed from CONNECTED's max-idle-interval.
    let mut idle_budget = DEFAULT_IDLE_BUDGET;

    loop {
        tokio::select! {
            cmd = outbound_rx.recv() => match cmd {
                Some(Outbound::Envelope(message)) => {
                    if write_envelope(&mut sink, &message, params.format).await.is_err() {
                        transport.connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Disconnected {
                            error: ErrorInfo::new(CODE_CONNECTION_CLOSED, 0, "Send failed"),
                        });
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    let close = ProtocolMessage::close();
                    if write_envelope(&mut sink, &close, params.format).await.is_err() {
                        break;
                    }
                    // Keep reading: the peer confirms with CLOSED.
                }
                Some(Outbound::Shutdown) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = tokio::time::timeout(idle_budget, source.next()) => match incoming {
                Err(_) => {
                    transport.connected.store(false, Ordering::SeqCst);
                    let _ = events.send(TransportEvent::Disconnected {
                        error: ErrorInfo::new(
                            CODE_IDLE_TIMEOUT,
                            408,
                            format!("No activity within {:?}", idle_budget),
                        ),
                    });
                    break;
                }
                Ok(None) => {
                    transport.connected.store(false, Ordering::SeqCst);
                    let _ = events.send(TransportEvent::Disconnected {
                        error: ErrorInfo::new(CODE_CONNECTION_CLOSED, 0, "Stream ended"),
                    });
                    break;
                }
                Ok(Some(Err(e))) => {
                    transport.connected.store(false, Ordering::SeqCst);
                    let _ = events.send(TransportEvent::Disconnected {
                        error: ErrorInfo::new(CODE_CONNECTION_CLOSED, 0, e.to_string()),
                    });
                    break;
                }
                Ok(Some(Ok(ws_message))) => {
                    match ws_message {
                        WsMessage::Binary(data) => {
                            if dispatch(&transport, &events, &data, params.format, &mut idle_budget)
                                .is_break()
                            {
                                break;
                            }
                        }
                        WsMessage::Text(text) => {
                            if dispatch(
                                &transport,
                                &events,
                                text.as_bytes(),
                                WireFormat::Json,
                                &mut idle_budget,
                            )
                            .is_break()
                            {
                                break;
                            }
                        }
                        WsMessage::Ping(payload) => {
                            if let Err(e) = sink.send(WsMessage::Pong(payload)).await {
                                warn!("Failed to send pong: {}", e);
                            }
                        }
                        WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                        WsMessage::Close(_) => {
                            transport.connected.store(false, Ordering::SeqCst);
                            let _ = events.send(TransportEvent::Disconnected {
                                error: ErrorInfo::new(
                                    CODE_CONNECTION_CLOSED,
                                    0,
                                    "Peer closed the carrier",
                                ),
                            });
                            break;
                        }
                    }
                }
            }
        }
    }

    transport.connected.store(false, Ordering::SeqCst);
}

async fn write_envelope(
    sink: &mut (impl futures_util::Sink<WsMessage, Error = WsError> + Unpin),
    message: &ProtocolMessage,
    format: WireFormat,
) -> Result<(), TransportError> {
    let encoded = codec::encode(message, format)?;
    trace!(action = ?message.action, bytes = encoded.len(), "Writing envelope");
    let ws_message = match format {
        WireFormat::MsgPack => WsMessage::Binary(encoded.to_vec()),
        WireFormat::Json => WsMessage::Text(String::from_utf8_lossy(&encoded).into_owned()),
    };
    sink.send(ws_message)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

/// Decode one inbound envelope and route it to the event stream.
///
/// Returns `Break` when the envelope terminates this transport.
fn dispatch(
    transport: &Arc<WebSocketTransport>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    data: &[u8],
    format: WireFormat,
    idle_budget: &mut Duration,
) -> std::ops::ControlFlow<()> {
    let message = match codec::decode(data, format) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping undecodable envelope: {}", e);
            return std::ops::ControlFlow::Continue(());
        }
    };

    crate::inbound::route_inbound(message, events, idle_budget, |connected| {
        transport.connected.store(connected, Ordering::SeqCst)
    })
}
