//! HTTP long-poll ("comet") transport implementation.
//!
//! The fallback carrier for environments where a persistent socket cannot be
//! established. A connect request returns the CONNECTED envelope; inbound
//! envelopes then arrive in batches on a long-poll recv loop and outbound
//! envelopes are posted to a send endpoint. Always uses the JSON wire format.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use ripple_protocol::{codec, ErrorInfo, ProtocolMessage, WireFormat};

use crate::traits::{
    ConnectParams, Transport, TransportError, TransportEvent, TransportFactory, TransportKind,
    CODE_CONNECTION_CLOSED, CODE_IDLE_TIMEOUT, DEFAULT_IDLE_BUDGET,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

enum Outbound {
    Envelope(ProtocolMessage),
    Close,
    Shutdown,
}

/// Factory for long-poll transports.
#[derive(Debug, Default)]
pub struct CometFactory;

impl CometFactory {
    /// Create a new factory.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for CometFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Comet
    }

    fn spawn(
        &self,
        params: ConnectParams,
    ) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(CometTransport {
            host: params.host.clone(),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            outbound: outbound_tx,
        });

        tokio::spawn(run(Arc::clone(&transport), params, outbound_rx, events_tx));

        (transport, events_rx)
    }
}

/// A long-poll carrier to one host.
pub struct CometTransport {
    host: String,
    connected: AtomicBool,
    disposed: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Transport for CometTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Comet
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn format(&self) -> WireFormat {
        WireFormat::Json
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

fn base_url(params: &ConnectParams) -> String {
    let scheme = if params.tls { "https" } else { "http" };
    format!("{}://{}/comet", scheme, params.host)
}

fn connect_url(params: &ConnectParams) -> Result<reqwest::Url, ErrorInfo> {
    let mut url = reqwest::Url::parse(&format!("{}/connect", base_url(params)))
        .map_err(|e| ErrorInfo::new(CODE_CONNECTION_CLOSED, 400, e.to_string()))?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in params.query_pairs() {
            query.append_pair(&key, &value);
        }
    }
    Ok(url)
}

fn transport_error(e: &reqwest::Error) -> ErrorInfo {
    ErrorInfo::new(CODE_CONNECTION_CLOSED, 0, e.to_string())
}

async fn poll_once(
    client: reqwest::Client,
    url: reqwest::Url,
    idle_budget: Duration,
) -> Result<Vec<ProtocolMessage>, TransportEvent> {
    let response = match tokio::time::timeout(idle_budget, client.get(url).send()).await {
        Err(_) => {
            return Err(TransportEvent::Disconnected {
                error: ErrorInfo::new(
                    CODE_IDLE_TIMEOUT,
                    408,
                    format!("No activity within {:?}", idle_budget),
                ),
            });
        }
        Ok(Err(e)) => {
            return Err(TransportEvent::Disconnected {
                error: transport_error(&e),
            });
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if !status.is_success() {
        let error = ErrorInfo::new(CODE_CONNECTION_CLOSED, status.as_u16(), "Long-poll failed");
        return Err(if status.is_server_error() {
            TransportEvent::Disconnected { error }
        } else {
            TransportEvent::Failed { error }
        });
    }

    let body = response.bytes().await.map_err(|e| TransportEvent::Disconnected {
        error: transport_error(&e),
    })?;
    if body.is_empty() {
        return Ok(Vec::new());
    }
    codec::decode_batch(&body).map_err(|e| TransportEvent::Disconnected {
        error: ErrorInfo::new(CODE_CONNECTION_CLOSED, 0, e.to_string()),
    })
}

async fn post_envelopes(
    client: &reqwest::Client,
    url: &str,
    envelopes: &[ProtocolMessage],
) -> Result<(), ErrorInfo> {
    let body = serde_json::to_vec(envelopes)
        .map_err(|e| ErrorInfo::new(CODE_CONNECTION_CLOSED, 0, e.to_string()))?;
    let response = client
        .post(url)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .map_err(|e| transport_error(&e))?;

    if !response.status().is_success() {
        return Err(ErrorInfo::new(
            CODE_CONNECTION_CLOSED,
            response.status().as_u16(),
            "Send failed",
        ));
    }
    Ok(())
}

async fn run(
    transport: Arc<CometTransport>,
    params: ConnectParams,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let client = match reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            let _ = events.send(TransportEvent::Failed {
                error: ErrorInfo::new(CODE_CONNECTION_CLOSED, 500, e.to_string()),
            });
            return;
        }
    };

    let url = match connect_url(&params) {
        Ok(url) => url,
        Err(error) => {
            let _ = events.send(TransportEvent::Failed { error });
            return;
        }
    };

    // Connect request: the response body is the first envelope batch,
    // normally starting with CONNECTED.
    let response = match client.post(url).send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = events.send(TransportEvent::Disconnected {
                error: transport_error(&e),
            });
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let error = ErrorInfo::new(CODE_CONNECTION_CLOSED, status.as_u16(), "Connect rejected");
        let _ = events.send(if status.is_server_error() {
            TransportEvent::Disconnected { error }
        } else {
            TransportEvent::Failed { error }
        });
        return;
    }

    let _ = events.send(TransportEvent::Preconnect);

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            let _ = events.send(TransportEvent::Disconnected {
                error: transport_error(&e),
            });
            return;
        }
    };

    let envelopes = match codec::decode_batch(&body) {
        Ok(envelopes) => envelopes,
        Err(e) => {
            let _ = events.send(TransportEvent::Disconnected {
                error: ErrorInfo::new(CODE_CONNECTION_CLOSED, 0, e.to_string()),
            });
            return;
        }
    };

    let mut idle_budget = DEFAULT_IDLE_BUDGET;
    let mut connection_key = None;

    for envelope in envelopes {
        if connection_key.is_none() {
            if let Some(details) = &envelope.connection_details {
                connection_key = details.connection_key.clone();
            }
        }
        let flow = crate::inbound::route_inbound(envelope, &events, &mut idle_budget, |c| {
            transport.connected.store(c, Ordering::SeqCst)
        });
        if flow.is_break() {
            return;
        }
    }

    let Some(connection_key) = connection_key else {
        let _ = events.send(TransportEvent::Disconnected {
            error: ErrorInfo::new(
                CODE_CONNECTION_CLOSED,
                0,
                "Connect response carried no connection key",
            ),
        });
        return;
    };

    debug!(host = %params.host, "Comet carrier established");

    let base = base_url(&params);
    let send_url = format!("{}/{}/send", base, connection_key);
    let recv_url = match reqwest::Url::parse(&format!("{}/{}/recv", base, connection_key)) {
        Ok(url) => url,
        Err(e) => {
            let _ = events.send(TransportEvent::Failed {
                error: ErrorInfo::new(CODE_CONNECTION_CLOSED, 400, e.to_string()),
            });
            return;
        }
    };

    let mut poll = Box::pin(poll_once(client.clone(), recv_url.clone(), idle_budget));

    'run: loop {
        tokio::select! {
            cmd = outbound_rx.recv() => match cmd {
                Some(Outbound::Envelope(message)) => {
                    trace!(action = ?message.action, "Posting envelope");
                    if let Err(error) = post_envelopes(&client, &send_url, &[message]).await {
                        warn!("Comet send failed: {}", error);
                        transport.connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Disconnected { error });
                        break 'run;
                    }
                }
                Some(Outbound::Close) => {
                    // CLOSED comes back on the recv loop.
                    let close = ProtocolMessage::close();
                    if post_envelopes(&client, &send_url, &[close]).await.is_err() {
                        break 'run;
                    }
                }
                Some(Outbound::Shutdown) | None => break 'run,
            },
            batch = &mut poll => {
                match batch {
                    Ok(envelopes) => {
                        for envelope in envelopes {
                            let flow = crate::inbound::route_inbound(
                                envelope,
                                &events,
                                &mut idle_budget,
                                |c| transport.connected.store(c, Ordering::SeqCst),
                            );
                            if flow.is_break() {
                                break 'run;
                            }
                        }
                        poll = Box::pin(poll_once(client.clone(), recv_url.clone(), idle_budget));
                    }
                    Err(event) => {
                        transport.connected.store(false, Ordering::SeqCst);
                        let _ = events.send(event);
                        break 'run;
                    }
                }
            }
        }
    }

    transport.connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::traits::ConnectMode;

    #[test]
    fn test_connect_url() {
        let params = ConnectParams {
            host: "realtime.example.com".into(),
            tls: true,
            format: WireFormat::Json,
            mode: ConnectMode::Clean,
            auth_params: vec![("accessToken".into(), "tok".into())],
            client_id: None,
        };

        let url = connect_url(&params).unwrap();
        assert_eq!(url.scheme(), "https");
        assert!(url.path().ends_with("/comet/connect"));
        assert!(url.query().unwrap().contains("accessToken=tok"));
    }
}
