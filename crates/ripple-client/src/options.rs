//! Client configuration.

use std::time::Duration;

use ripple_protocol::WireFormat;

/// Options for a [`Realtime`](crate::Realtime) client.
///
/// Every field has a production default; construct with struct update
/// syntax over [`ClientOptions::default()`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Primary endpoint host (name or `name:port`).
    pub primary_host: String,
    /// Fallback hosts tried when the primary is unreachable.
    pub fallback_hosts: Vec<String>,
    /// Upper bound on fallback hosts tried in one connect walk.
    pub max_fallbacks: usize,
    /// How long a working fallback host stays preferred over the primary.
    pub fallback_retry_ttl: Duration,
    /// Use TLS for all carriers.
    pub tls: bool,
    /// Wire format for the WebSocket carrier (long-poll is always JSON).
    pub format: WireFormat,
    /// Claimed client identity, sent with every connect.
    pub client_id: Option<String>,
    /// Recovery key from a previous process, for cross-process recovery.
    pub recover: Option<String>,
    /// Connect to the endpoint as soon as the client is created.
    pub auto_connect: bool,
    /// Deadline for a single transport attempt and for graceful close.
    pub realtime_request_timeout: Duration,
    /// Base retry delay while disconnected.
    pub disconnected_retry_timeout: Duration,
    /// Base retry delay while suspended.
    pub suspended_retry_timeout: Duration,
    /// Base retry delay for a suspended channel.
    pub channel_retry_timeout: Duration,
    /// How long server-side connection state survives a disconnection.
    /// Overridden by the value the server advertises on connect.
    pub connection_state_ttl: Duration,
    /// Largest envelope payload the client will bundle up to. Overridden by
    /// the value the server advertises on connect.
    pub max_message_size: usize,
    /// How long a WebSocket attempt may stall before the slow-connect
    /// policy probes for a fallback path.
    pub slow_connect_threshold: Duration,
    /// Minimum spacing between retries in the immediate-retry class.
    pub immediate_retry_spacing: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            primary_host: "realtime.ripple.dev".into(),
            fallback_hosts: Vec::new(),
            max_fallbacks: 3,
            fallback_retry_ttl: Duration::from_secs(600),
            tls: true,
            format: WireFormat::MsgPack,
            client_id: None,
            recover: None,
            auto_connect: true,
            realtime_request_timeout: Duration::from_secs(10),
            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            channel_retry_timeout: Duration::from_secs(15),
            connection_state_ttl: Duration::from_secs(120),
            max_message_size: 64 * 1024,
            slow_connect_threshold: Duration::from_secs(4),
            immediate_retry_spacing: Duration::from_secs(1),
        }
    }
}

impl ClientOptions {
    /// Options pointing at a specific host.
    #[must_use]
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            primary_host: host.into(),
            ..Self::default()
        }
    }
}
