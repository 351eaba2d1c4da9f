//! The realtime client facade.
//!
//! [`Realtime`] spawns one [`ConnectionManager`] actor and hands out cheap
//! clonable handles to it: the client itself for connection-level operations
//! and [`ChannelHandle`]s for channel-level ones. Every operation is a
//! command sent to the actor; results come back over oneshot channels and
//! subscriptions over broadcast receivers.
//!
//! [`ConnectionManager`]: crate::connection::ConnectionManager

use std::sync::Arc;

use ripple_protocol::{ChannelMode, Data, ErrorInfo, Message, PresenceAction, PresenceMessage};
use ripple_transport::{
    CometFactory, ConnectivityChecker, HttpConnectivity, MemoryPreferenceStore, PreferenceStore,
    TransportFactory, WebSocketFactory,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::auth::AuthProvider;
use crate::channel::ChannelStateChange;
use crate::connection::{Command, ConnectionManager, ConnectionState, ConnectionStatus};
use crate::error;
use crate::options::ClientOptions;

fn client_gone() -> ErrorInfo {
    ErrorInfo::new(error::CODE_CONNECTION_FAILED, 500, "Client has shut down")
}

/// A realtime connection to the Ripple service.
#[derive(Clone)]
pub struct Realtime {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl Realtime {
    /// Create a client with the production transports.
    ///
    /// The connection manager starts immediately; with `auto_connect` set it
    /// begins connecting right away.
    #[must_use]
    pub fn new(options: ClientOptions, auth: Arc<dyn AuthProvider>) -> Self {
        let factories: Vec<Arc<dyn TransportFactory>> = vec![
            Arc::new(WebSocketFactory::new()),
            Arc::new(CometFactory::new()),
        ];
        Self::with_parts(
            options,
            auth,
            factories,
            Arc::new(MemoryPreferenceStore::new()),
            Arc::new(HttpConnectivity::new(reqwest::Client::new())),
        )
    }

    /// Create a client from explicit parts. The seam tests and embedders
    /// inject transports, preference storage and connectivity probes through.
    #[must_use]
    pub fn with_parts(
        options: ClientOptions,
        auth: Arc<dyn AuthProvider>,
        factories: Vec<Arc<dyn TransportFactory>>,
        preference: Arc<dyn PreferenceStore>,
        connectivity: Arc<dyn ConnectivityChecker>,
    ) -> Self {
        let (manager, commands, status) =
            ConnectionManager::new(options, auth, factories, preference, connectivity);
        tokio::spawn(manager.run());
        Self { commands, status }
    }

    /// Start connecting. A no-op while a connection is live.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Close the connection gracefully.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Current connection status, including the last transition's reason.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// A watch stream of connection status changes.
    #[must_use]
    pub fn status_stream(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// The current recovery key, or `None` when there is no live connection
    /// state worth recovering.
    pub async fn recovery_key(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::RecoveryKey { reply: tx }).ok()?;
        rx.await.ok()?
    }

    /// A handle to a named channel, creating it on first use.
    #[must_use]
    pub fn channel(&self, name: impl Into<String>) -> ChannelHandle {
        self.channel_with_modes(name, &[])
    }

    /// A handle to a named channel attaching with explicit modes.
    ///
    /// Modes apply when the channel is first created; a handle to an
    /// existing channel keeps the channel's original modes.
    #[must_use]
    pub fn channel_with_modes(
        &self,
        name: impl Into<String>,
        modes: &[ChannelMode],
    ) -> ChannelHandle {
        ChannelHandle {
            name: name.into(),
            modes: modes.to_vec(),
            commands: self.commands.clone(),
        }
    }

    /// Release a channel, dropping its state. Refused while the channel has
    /// server-side interest; detach it first.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is attached or mid-operation.
    pub async fn release(&self, name: &str) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Release {
                channel: name.to_string(),
                reply: tx,
            })
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())?
    }
}

/// A handle to one named channel.
#[derive(Clone)]
pub struct ChannelHandle {
    name: String,
    modes: Vec<ChannelMode>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach to the channel, resolving when the server confirms.
    ///
    /// # Errors
    ///
    /// Returns an error if the attach is refused, times out, or the
    /// connection cannot support it.
    pub async fn attach(&self) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Attach {
                channel: self.name.clone(),
                modes: self.modes.clone(),
                completer: tx,
            })
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())?
    }

    /// Detach from the channel, resolving when the server confirms.
    ///
    /// # Errors
    ///
    /// Returns an error if the detach fails or times out.
    pub async fn detach(&self) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Detach {
                channel: self.name.clone(),
                completer: tx,
            })
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())?
    }

    /// Publish one named message, resolving on the server's ACK.
    ///
    /// # Errors
    ///
    /// Returns an error if the server NACKs the message or the connection
    /// gives up on it.
    pub async fn publish(&self, name: impl Into<String>, data: Data) -> Result<(), ErrorInfo> {
        self.publish_batch(vec![Message::new(name, data)]).await
    }

    /// Publish a batch of messages in one envelope, resolving on the ACK.
    ///
    /// # Errors
    ///
    /// Returns an error if the server NACKs the envelope or the connection
    /// gives up on it.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                channel: self.name.clone(),
                messages,
                completer: tx,
            })
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())?
    }

    /// Enter the channel's presence set.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence operation is refused.
    pub async fn enter(&self, client_id: impl Into<String>, data: Option<Data>) -> Result<(), ErrorInfo> {
        self.presence_update(PresenceAction::Enter, client_id, data)
            .await
    }

    /// Update this client's presence data.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence operation is refused.
    pub async fn update(&self, client_id: impl Into<String>, data: Option<Data>) -> Result<(), ErrorInfo> {
        self.presence_update(PresenceAction::Update, client_id, data)
            .await
    }

    /// Leave the channel's presence set.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence operation is refused.
    pub async fn leave(&self, client_id: impl Into<String>) -> Result<(), ErrorInfo> {
        self.presence_update(PresenceAction::Leave, client_id, None)
            .await
    }

    async fn presence_update(
        &self,
        action: PresenceAction,
        client_id: impl Into<String>,
        data: Option<Data>,
    ) -> Result<(), ErrorInfo> {
        let mut message = PresenceMessage::new(action, client_id);
        message.data = data;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Presence {
                channel: self.name.clone(),
                message,
                completer: tx,
            })
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())?
    }

    /// The channel's current presence members.
    pub async fn presence_members(&self) -> Vec<PresenceMessage> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::PresenceMembers {
                channel: self.name.clone(),
                reply: tx,
            })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Subscribe to the channel's messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has shut down.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<Message>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SubscribeMessages {
                channel: self.name.clone(),
                reply: tx,
            })
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())
    }

    /// Subscribe to the channel's presence events.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has shut down.
    pub async fn subscribe_presence(
        &self,
    ) -> Result<broadcast::Receiver<PresenceMessage>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SubscribePresence {
                channel: self.name.clone(),
                reply: tx,
            })
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())
    }

    /// Subscribe to the channel's state changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has shut down.
    pub async fn state_changes(
        &self,
    ) -> Result<broadcast::Receiver<ChannelStateChange>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SubscribeState {
                channel: self.name.clone(),
                reply: tx,
            })
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use crate::auth::TokenAuth;

    struct NoConnectivity;

    #[async_trait]
    impl ConnectivityChecker for NoConnectivity {
        async fn check_http(&self, _host: &str, _tls: bool) -> bool {
            false
        }
        async fn check_websocket(&self, _host: &str, _tls: bool) -> bool {
            false
        }
    }

    fn client() -> Realtime {
        let options = ClientOptions {
            auto_connect: false,
            ..ClientOptions::for_host("localhost:9999")
        };
        Realtime::with_parts(
            options,
            Arc::new(TokenAuth::new("tok")),
            Vec::new(),
            Arc::new(MemoryPreferenceStore::new()),
            Arc::new(NoConnectivity),
        )
    }

    #[tokio::test]
    async fn test_starts_initialized() {
        let client = client();
        assert_eq!(client.state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn test_close_without_connecting() {
        let client = client();
        client.close();
        let mut status = client.status_stream();
        status
            .wait_for(|s| s.state == ConnectionState::Closed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_creates_channel() {
        let client = client();
        let channel = client.channel("orders");
        assert_eq!(channel.name(), "orders");
        let mut receiver = channel.subscribe().await.unwrap();
        // Nothing published; the subscription is live but empty.
        assert!(matches!(
            receiver.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_recovery_key_absent_before_connect() {
        let client = client();
        assert!(client.recovery_key().await.is_none());
        // Quiesce: nothing else should be in flight.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
