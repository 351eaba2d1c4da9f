//! Connectivity probes.
//!
//! Two cheap checks used by the connection manager's retry policy: a plain
//! HTTP probe (is the network up at all?) and a WebSocket probe (can a
//! persistent socket be established, or should the client fall back to
//! long-poll?). The manager consumes them through [`ConnectivityChecker`]
//! so tests can substitute deterministic verdicts.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Default probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(6);

/// Probe endpoint for a host.
#[must_use]
pub fn connectivity_url(host: &str, tls: bool) -> String {
    let scheme = if tls { "https" } else { "http" };
    format!("{}://{}/health", scheme, host)
}

/// Connectivity verdicts for a host.
#[async_trait]
pub trait ConnectivityChecker: Send + Sync {
    /// Plain HTTP connectivity: a 2xx within the probe timeout.
    async fn check_http(&self, host: &str, tls: bool) -> bool;

    /// WebSocket connectivity: a completed handshake within the probe
    /// timeout.
    async fn check_websocket(&self, host: &str, tls: bool) -> bool;
}

/// Real probes over the network.
pub struct HttpConnectivity {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpConnectivity {
    /// Create a checker with the default probe timeout.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: PROBE_TIMEOUT,
        }
    }

    /// Create a checker with a specific probe timeout.
    #[must_use]
    pub fn with_timeout(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ConnectivityChecker for HttpConnectivity {
    async fn check_http(&self, host: &str, tls: bool) -> bool {
        let url = connectivity_url(host, tls);
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                debug!(url = %url, status = %response.status(), "HTTP connectivity probe");
                ok
            }
            Err(e) => {
                debug!(url = %url, "HTTP connectivity probe failed: {}", e);
                false
            }
        }
    }

    #[cfg(feature = "websocket")]
    async fn check_websocket(&self, host: &str, tls: bool) -> bool {
        let scheme = if tls { "wss" } else { "ws" };
        let url = format!("{}://{}/connect?probe=true", scheme, host);

        match tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(&url)).await {
            Ok(Ok((mut stream, _response))) => {
                let _ = stream.close(None).await;
                debug!(host = %host, "WebSocket connectivity probe succeeded");
                true
            }
            Ok(Err(e)) => {
                debug!(host = %host, "WebSocket connectivity probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!(host = %host, "WebSocket connectivity probe timed out");
                false
            }
        }
    }

    #[cfg(not(feature = "websocket"))]
    async fn check_websocket(&self, _host: &str, _tls: bool) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_url() {
        assert_eq!(
            connectivity_url("realtime.example.com", true),
            "https://realtime.example.com/health"
        );
        assert_eq!(
            connectivity_url("localhost:8080", false),
            "http://localhost:8080/health"
        );
    }

    #[tokio::test]
    async fn test_check_http_unreachable() {
        let checker = HttpConnectivity::with_timeout(
            reqwest::Client::new(),
            Duration::from_millis(200),
        );
        // Reserved TEST-NET address: nothing listens there.
        assert!(!checker.check_http("192.0.2.1", false).await);
    }
}
