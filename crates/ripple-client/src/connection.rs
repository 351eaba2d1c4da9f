//! Connection state machine.
//!
//! The [`ConnectionManager`] is an actor that owns everything mutable about
//! one logical connection: the active transport and its event stream, the
//! send pipeline with its two queues, the channel registry, and every retry
//! timer. It is driven by three inputs multiplexed in [`run`]: commands from
//! client handles, transport events, and timer deadlines.
//!
//! [`run`]: ConnectionManager::run

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ripple_protocol::{
    Action, ChannelMode, ConnectionDetails, ErrorInfo, Message, PresenceMessage, ProtocolMessage,
    RecoveryContext,
};
use ripple_transport::{
    attempt, ActiveTransport, AttemptError, ConnectMode, ConnectParams, ConnectivityChecker,
    Hosts, PreferenceStore, Transport, TransportEvent, TransportFactory, TransportKind,
    TransportPreference,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::auth::AuthProvider;
use crate::backoff;
use crate::channel::{ChannelState, ChannelStateChange, Channels};
use crate::error;
use crate::msgqueue::{bundle_into, Completer, MessageQueue, PendingMessage};
use crate::options::ClientOptions;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    /// Transport lost; retrying while server-side state survives.
    Disconnected,
    /// Server-side state has lapsed; retrying towards a clean connection.
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Whether publishes in this state wait in the connection queue.
    #[must_use]
    pub fn queues_events(self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized
                | ConnectionState::Connecting
                | ConnectionState::Disconnected
        )
    }

    /// Whether publishes in this state go straight to the transport.
    #[must_use]
    pub fn sends_events(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether the connection is finished until an explicit reconnect.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Observable connection state plus the reason for the last transition.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub error: Option<ErrorInfo>,
}

/// Commands from client handles to the manager actor.
pub(crate) enum Command {
    Connect,
    Close,
    Publish {
        channel: String,
        messages: Vec<Message>,
        completer: Completer,
    },
    Presence {
        channel: String,
        message: PresenceMessage,
        completer: Completer,
    },
    Attach {
        channel: String,
        modes: Vec<ChannelMode>,
        completer: Completer,
    },
    Detach {
        channel: String,
        completer: Completer,
    },
    SubscribeMessages {
        channel: String,
        reply: oneshot::Sender<broadcast::Receiver<Message>>,
    },
    SubscribePresence {
        channel: String,
        reply: oneshot::Sender<broadcast::Receiver<PresenceMessage>>,
    },
    SubscribeState {
        channel: String,
        reply: oneshot::Sender<broadcast::Receiver<ChannelStateChange>>,
    },
    PresenceMembers {
        channel: String,
        reply: oneshot::Sender<Vec<PresenceMessage>>,
    },
    RecoveryKey {
        reply: oneshot::Sender<Option<String>>,
    },
    Release {
        channel: String,
        reply: oneshot::Sender<Result<(), ErrorInfo>>,
    },
    /// Internal: an automatic presence re-enter was refused by the server.
    ReenterFailed {
        channel: String,
        error: ErrorInfo,
    },
}

enum Wake {
    Command(Option<Command>),
    Internal(Option<Command>),
    Event(Option<TransportEvent>),
    Timer,
}

async fn recv_opt(events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// The connection actor.
pub struct ConnectionManager {
    options: ClientOptions,
    auth: Arc<dyn AuthProvider>,
    factories: Vec<Arc<dyn TransportFactory>>,
    preference: Arc<dyn PreferenceStore>,
    connectivity: Arc<dyn ConnectivityChecker>,
    hosts: Hosts,

    state: ConnectionState,
    status_tx: watch::Sender<ConnectionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Commands the manager sends itself from detached completion tasks.
    internal_tx: mpsc::UnboundedSender<Command>,
    internal_rx: mpsc::UnboundedReceiver<Command>,
    command_buffer: VecDeque<Command>,
    close_requested: bool,

    transport: Option<Arc<dyn Transport>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,

    connection_id: Option<String>,
    connection_key: Option<String>,
    msg_serial: i64,
    recover_token: Option<String>,

    /// Server-advertised overrides of the configured defaults.
    state_ttl: Duration,
    max_message_size: usize,

    pending: MessageQueue,
    queued: Vec<PendingMessage>,
    channels: Channels,

    error_reason: Option<ErrorInfo>,
    retry_count: u32,
    retry_at: Option<Instant>,
    suspend_at: Option<Instant>,
    /// Set once the suspend deadline lapses; failed attempts return to
    /// suspended instead of disconnected until a connection succeeds.
    suspended_mode: bool,
    close_deadline: Option<Instant>,
    last_immediate_retry: Option<Instant>,
}

impl ConnectionManager {
    /// Build a manager and the handles used to drive and observe it.
    pub fn new(
        options: ClientOptions,
        auth: Arc<dyn AuthProvider>,
        factories: Vec<Arc<dyn TransportFactory>>,
        preference: Arc<dyn PreferenceStore>,
        connectivity: Arc<dyn ConnectivityChecker>,
    ) -> (
        Self,
        mpsc::UnboundedSender<Command>,
        watch::Receiver<ConnectionStatus>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Initialized,
            error: None,
        });
        let hosts = Hosts::new(
            options.primary_host.clone(),
            options.fallback_hosts.clone(),
            options.max_fallbacks,
            options.fallback_retry_ttl,
        );
        let recover_token = options.recover.clone();
        let state_ttl = options.connection_state_ttl;
        let max_message_size = options.max_message_size;

        let manager = Self {
            options,
            auth,
            factories,
            preference,
            connectivity,
            hosts,
            state: ConnectionState::Initialized,
            status_tx,
            commands: command_rx,
            internal_tx,
            internal_rx,
            command_buffer: VecDeque::new(),
            close_requested: false,
            transport: None,
            events: None,
            connection_id: None,
            connection_key: None,
            msg_serial: 0,
            recover_token,
            state_ttl,
            max_message_size,
            pending: MessageQueue::new(),
            queued: Vec::new(),
            channels: Channels::new(),
            error_reason: None,
            retry_count: 0,
            retry_at: None,
            suspend_at: None,
            suspended_mode: false,
            close_deadline: None,
            last_immediate_retry: None,
        };
        (manager, command_tx, status_rx)
    }

    /// Drive the connection until every client handle is dropped.
    pub async fn run(mut self) {
        if self.options.auto_connect {
            self.command_buffer.push_back(Command::Connect);
        }
        loop {
            if let Some(command) = self.command_buffer.pop_front() {
                self.handle_command(command).await;
                continue;
            }
            let deadline = self.next_deadline();
            let wake = {
                let commands = &mut self.commands;
                let internal = &mut self.internal_rx;
                let events = &mut self.events;
                tokio::select! {
                    command = commands.recv() => Wake::Command(command),
                    command = internal.recv() => Wake::Internal(command),
                    event = recv_opt(events) => Wake::Event(event),
                    () = sleep_opt(deadline) => Wake::Timer,
                }
            };
            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(command)) | Wake::Internal(Some(command)) => {
                    self.handle_command(command).await;
                }
                // The manager holds its own internal sender; the internal
                // stream never ends first.
                Wake::Internal(None) => {}
                Wake::Event(Some(event)) => self.handle_transport_event(event).await,
                Wake::Event(None) => {
                    self.events = None;
                    if self.transport.is_some() {
                        self.drop_transport();
                        self.handle_disconnection(ErrorInfo::new(
                            ripple_transport::traits::CODE_CONNECTION_CLOSED,
                            0,
                            "Transport event stream ended",
                        ))
                        .await;
                    }
                }
                Wake::Timer => self.handle_timers().await,
            }
        }
        self.drop_transport();
    }

    fn set_state(&mut self, next: ConnectionState, error: Option<ErrorInfo>) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Connection state change");
        }
        self.state = next;
        if error.is_some() {
            self.error_reason = error.clone();
        }
        let _ = self.status_tx.send(ConnectionStatus { state: next, error });
    }

    fn factory(&self, kind: TransportKind) -> Option<&Arc<dyn TransportFactory>> {
        self.factories.iter().find(|f| f.kind() == kind)
    }

    fn drop_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.dispose();
        }
        self.events = None;
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.retry_at,
            self.suspend_at,
            self.close_deadline,
            self.channels.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // Command handling.

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect_if_needed().await,
            Command::Close => self.close(),
            Command::Publish {
                channel,
                messages,
                completer,
            } => self.publish(&channel, messages, completer),
            Command::Presence {
                channel,
                message,
                completer,
            } => self.presence_op(&channel, message, completer),
            Command::Attach {
                channel,
                modes,
                completer,
            } => self.attach(&channel, &modes, completer),
            Command::Detach { channel, completer } => self.detach(&channel, completer),
            Command::SubscribeMessages { channel, reply } => {
                let receiver = self.channels.get_or_create(&channel, &[]).subscribe_messages();
                let _ = reply.send(receiver);
            }
            Command::SubscribePresence { channel, reply } => {
                let receiver = self.channels.get_or_create(&channel, &[]).subscribe_presence();
                let _ = reply.send(receiver);
            }
            Command::SubscribeState { channel, reply } => {
                let receiver = self.channels.get_or_create(&channel, &[]).subscribe_state();
                let _ = reply.send(receiver);
            }
            Command::PresenceMembers { channel, reply } => {
                let members = self
                    .channels
                    .get_mut(&channel)
                    .map(|c| c.presence().members().into_iter().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(members);
            }
            Command::RecoveryKey { reply } => {
                let _ = reply.send(self.recovery_key());
            }
            Command::Release { channel, reply } => {
                let _ = reply.send(self.channels.release(&channel));
            }
            Command::ReenterFailed { channel, error } => {
                if let Some(channel) = self.channels.get_mut(&channel) {
                    channel.reenter_failed(error);
                }
            }
        }
    }

    async fn connect_if_needed(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Initialized
                | ConnectionState::Disconnected
                | ConnectionState::Suspended
                | ConnectionState::Closed
                | ConnectionState::Failed
        ) {
            self.connect_walk().await;
        }
    }

    /// Current recovery key: everything a future process needs to recover
    /// this connection's continuity.
    fn recovery_key(&self) -> Option<String> {
        let key = self.connection_key.clone()?;
        let mut context = RecoveryContext::new(key, self.msg_serial);
        context.channel_serials = self.channels.serials();
        context.encode().ok()
    }

    fn connect_mode(&mut self) -> ConnectMode {
        if let Some(key) = &self.connection_key {
            return ConnectMode::Resume {
                connection_key: key.clone(),
            };
        }
        if let Some(token) = self.recover_token.take() {
            match RecoveryContext::decode(&token) {
                Ok(context) => {
                    // Continue the serial sequence the lost process left off.
                    self.msg_serial = context.msg_serial;
                    return ConnectMode::Recover {
                        connection_key: context.connection_key,
                        msg_serial: context.msg_serial,
                    };
                }
                Err(e) => warn!("Ignoring malformed recovery key: {}", e),
            }
        }
        ConnectMode::Clean
    }

    // Connect walk.

    async fn connect_walk(&mut self) {
        self.close_requested = false;
        self.retry_at = None;
        self.set_state(ConnectionState::Connecting, None);

        let auth_params = match self.auth.connect_params().await {
            Ok(params) => params,
            Err(e) => {
                if error::is_fatal_auth(&e) {
                    self.fail_connection(e);
                } else {
                    self.handle_disconnection(e).await;
                }
                return;
            }
        };

        let mode = self.connect_mode();
        let candidates = self.hosts.candidates();
        let mut last_error = error::connection_failed("No endpoint host reachable");

        for (index, host) in candidates.into_iter().enumerate() {
            if self.buffer_commands_check_close() {
                self.finalize_close();
                return;
            }
            if index > 0 && !self.connectivity.check_http(&host, self.options.tls).await {
                debug!(host = %host, "Skipping unreachable fallback host");
                continue;
            }

            let params = ConnectParams {
                host: host.clone(),
                tls: self.options.tls,
                format: self.options.format,
                mode: mode.clone(),
                auth_params: auth_params.clone(),
                client_id: self.options.client_id.clone(),
            };

            match self.attempt_host(params).await {
                Ok(active) => {
                    self.install(active, &host);
                    if self.close_requested {
                        self.close_requested = false;
                        self.close();
                    }
                    return;
                }
                Err(err) => {
                    last_error = err.error().clone();
                    warn!(host = %host, error = %last_error, "Transport attempt failed");
                    if err.is_fatal() {
                        if error::is_token_error(&last_error) {
                            match self.auth.authorize().await {
                                Ok(()) => {
                                    // Fresh credential; back off briefly and
                                    // rerun the walk.
                                    self.set_state(
                                        ConnectionState::Disconnected,
                                        Some(last_error),
                                    );
                                    self.retry_at = Some(
                                        Instant::now() + self.options.immediate_retry_spacing,
                                    );
                                    return;
                                }
                                Err(e) => {
                                    self.fail_connection(e);
                                    return;
                                }
                            }
                        }
                        self.fail_connection(last_error);
                        return;
                    }
                }
            }
        }

        self.handle_disconnection(last_error).await;
    }

    /// One host attempt, applying the transport preference and the
    /// slow-connect fallback policy.
    async fn attempt_host(&self, params: ConnectParams) -> Result<ActiveTransport, AttemptError> {
        let timeout = self.options.realtime_request_timeout;
        let websocket = self.factory(TransportKind::WebSocket);
        let comet = self.factory(TransportKind::Comet);

        let mut prefer_comet = self
            .preference
            .get()
            .is_some_and(|p| p.kind == TransportKind::Comet);
        if prefer_comet
            && websocket.is_some()
            && self.connectivity.check_websocket(&params.host, params.tls).await
        {
            // The socket path works again; the cached verdict is stale.
            info!(host = %params.host, "WebSocket connectivity reverified; dropping long-poll preference");
            self.preference.clear();
            prefer_comet = false;
        }
        if prefer_comet || websocket.is_none() {
            if let Some(comet) = comet {
                return attempt::connect(comet.as_ref(), params, timeout).await;
            }
        }
        let Some(websocket) = websocket else {
            return Err(AttemptError::Failed(error::connection_failed(
                "No transport available",
            )));
        };

        let attempt_fut = attempt::connect(websocket.as_ref(), params.clone(), timeout);
        tokio::pin!(attempt_fut);
        tokio::select! {
            result = &mut attempt_fut => result,
            () = tokio::time::sleep(self.options.slow_connect_threshold) => {
                debug!(host = %params.host, "WebSocket attempt is slow; probing alternatives");
                if !self.connectivity.check_http(&params.host, params.tls).await {
                    return Err(AttemptError::Disconnected(ErrorInfo::new(
                        ripple_transport::traits::CODE_CONNECT_TIMEOUT,
                        408,
                        "Host unreachable over HTTP",
                    )));
                }
                if self.connectivity.check_websocket(&params.host, params.tls).await {
                    // The socket path works; let the attempt finish.
                    attempt_fut.await
                } else if let Some(comet) = comet {
                    info!(host = %params.host, "Falling back to long-poll transport");
                    self.preference
                        .set(TransportPreference::new(TransportKind::Comet));
                    attempt::connect(comet.as_ref(), params, timeout).await
                } else {
                    attempt_fut.await
                }
            }
        }
    }

    fn install(&mut self, active: ActiveTransport, host: &str) {
        self.hosts.pin(host);
        if active.transport.kind() == TransportKind::WebSocket {
            // A working socket invalidates any cached long-poll preference.
            self.preference.clear();
        }
        let ActiveTransport {
            transport,
            events,
            connection_id,
            details,
            resume_error,
        } = active;
        self.transport = Some(transport);
        self.events = Some(events);
        self.process_connected(connection_id, details, resume_error);
    }

    fn process_connected(
        &mut self,
        connection_id: String,
        details: ConnectionDetails,
        resume_error: Option<ErrorInfo>,
    ) {
        let had_identity = self.connection_id.is_some();
        let identity_changed =
            had_identity && self.connection_id.as_deref() != Some(connection_id.as_str());
        let resumed = had_identity && !identity_changed;
        // A serial restored from a recovery key survives only when the
        // server honored the recovery.
        let serial_reset = identity_changed || (!had_identity && resume_error.is_some());

        if serial_reset {
            // The serial sequence restarts from zero.
            self.msg_serial = 0;
            for message in &mut self.queued {
                message.reset_serial();
            }
        }
        if let Some(error) = &resume_error {
            info!(error = %error, "Continuity not preserved by the server");
        }

        info!(connection = %connection_id, resumed, "Connection established");
        self.connection_id = Some(connection_id.clone());
        if details.connection_key.is_some() {
            self.connection_key = details.connection_key.clone();
        }
        if let Some(ttl) = details.connection_state_ttl {
            self.state_ttl = Duration::from_millis(ttl);
        }
        if let Some(size) = details.max_message_size {
            self.max_message_size = size;
        }
        self.retry_count = 0;
        self.suspend_at = None;
        self.suspended_mode = false;
        self.last_immediate_retry = None;
        self.set_state(ConnectionState::Connected, resume_error);

        let identity = Some(connection_id);
        for channel in self.channels.iter_mut() {
            channel.set_connection_id(identity.clone());
        }

        self.reattach_channels(resumed);

        // Retransmit in-flight envelopes first, then the backlog.
        let mut backlog = self.pending.drain_for_retry();
        if serial_reset {
            for message in &mut backlog {
                message.reset_serial();
            }
        }
        backlog.append(&mut self.queued);
        for message in backlog {
            self.transmit(message);
        }
    }

    fn reattach_channels(&mut self, resumed: bool) {
        let now = Instant::now();
        let timeout = self.options.realtime_request_timeout;
        let mut envelopes = Vec::new();
        for channel in self.channels.iter_mut() {
            let needs = match channel.state() {
                ChannelState::Attaching | ChannelState::Suspended => true,
                ChannelState::Attached => !resumed,
                _ => false,
            };
            if needs {
                channel.begin_attach(None);
                envelopes.push(channel.attach_envelope(now, timeout));
            }
        }
        for envelope in envelopes {
            self.send_raw(envelope);
        }
    }

    // Send pipeline.

    fn send_raw(&mut self, envelope: ProtocolMessage) {
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.send(envelope) {
                warn!("Transport refused envelope: {}", e);
            }
        }
    }

    fn transmit(&mut self, mut message: PendingMessage) {
        if !message.ack_required {
            self.send_raw(message.message.clone());
            message.complete(&Ok(()));
            return;
        }
        if message.message.msg_serial.is_none() {
            message.message.msg_serial = Some(self.msg_serial);
            self.msg_serial += 1;
        }
        message.send_attempted = true;
        let sent = self
            .transport
            .as_ref()
            .is_some_and(|t| t.send(message.message.clone()).is_ok());
        if sent {
            self.pending.push(message);
        } else {
            message.reset_for_retry();
            self.queued.push(message);
        }
    }

    fn send_or_queue(&mut self, mut message: PendingMessage) {
        if self.state.sends_events() {
            self.transmit(message);
        } else if self.state.queues_events() {
            if let Some(last) = self.queued.last_mut() {
                match bundle_into(last, message, self.max_message_size) {
                    Ok(()) => {
                        trace!("Bundled publish into queued envelope");
                        return;
                    }
                    Err(back) => message = back,
                }
            }
            self.queued.push(message);
        } else {
            let reason = self
                .error_reason
                .clone()
                .unwrap_or_else(error::connection_closed);
            message.complete(&Err(reason));
        }
    }

    fn publish(&mut self, channel: &str, messages: Vec<Message>, completer: Completer) {
        if !self.state.sends_events() && !self.state.queues_events() {
            let reason = self
                .error_reason
                .clone()
                .unwrap_or_else(error::connection_closed);
            let _ = completer.send(Err(reason));
            return;
        }
        let sends = self.state.sends_events();
        let now = Instant::now();
        let timeout = self.options.realtime_request_timeout;

        let envelope = ProtocolMessage::message(channel, messages);
        let pending = PendingMessage::new(envelope, Some(completer));

        let target = self.channels.get_or_create(channel, &[]);
        match target.state() {
            ChannelState::Failed | ChannelState::Suspended | ChannelState::Detaching => {
                let reason = target.error_reason().cloned().unwrap_or_else(|| {
                    ErrorInfo::new(
                        error::CODE_CHANNEL_OPERATION_FAILED,
                        400,
                        &format!("Cannot publish in channel state {}", target.state()),
                    )
                });
                let mut pending = pending;
                pending.complete(&Err(reason));
            }
            ChannelState::Attaching => target.buffer_publish(pending),
            ChannelState::Initialized => {
                // Publish implies attach.
                target.begin_attach(None);
                target.buffer_publish(pending);
                if sends {
                    let envelope = target.attach_envelope(now, timeout);
                    self.send_raw(envelope);
                }
            }
            ChannelState::Attached | ChannelState::Detached => self.send_or_queue(pending),
        }
    }

    fn presence_op(&mut self, channel: &str, message: PresenceMessage, completer: Completer) {
        if !self.state.sends_events() && !self.state.queues_events() {
            let reason = self
                .error_reason
                .clone()
                .unwrap_or_else(error::connection_closed);
            let _ = completer.send(Err(reason));
            return;
        }
        let sends = self.state.sends_events();
        let now = Instant::now();
        let timeout = self.options.realtime_request_timeout;

        let envelope = ProtocolMessage::presence(channel, vec![message]);
        let pending = PendingMessage::new(envelope, Some(completer));

        let target = self.channels.get_or_create(channel, &[]);
        match target.state() {
            ChannelState::Attached => self.send_or_queue(pending),
            ChannelState::Attaching => target.buffer_publish(pending),
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Suspended => {
                // Presence implies attach.
                target.begin_attach(None);
                target.buffer_publish(pending);
                if sends {
                    let envelope = target.attach_envelope(now, timeout);
                    self.send_raw(envelope);
                }
            }
            ChannelState::Failed | ChannelState::Detaching => {
                let reason = target.error_reason().cloned().unwrap_or_else(|| {
                    ErrorInfo::new(
                        error::CODE_CHANNEL_OPERATION_FAILED,
                        400,
                        &format!("Cannot update presence in channel state {}", target.state()),
                    )
                });
                let mut pending = pending;
                pending.complete(&Err(reason));
            }
        }
    }

    fn attach(&mut self, channel: &str, modes: &[ChannelMode], completer: Completer) {
        if matches!(
            self.state,
            ConnectionState::Closing
                | ConnectionState::Closed
                | ConnectionState::Failed
                | ConnectionState::Suspended
        ) {
            let _ = completer.send(Err(self.error_reason.clone().unwrap_or_else(|| {
                error::connection_failed("Cannot attach while the connection is down")
            })));
            return;
        }
        let sends = self.state.sends_events();
        let now = Instant::now();
        let timeout = self.options.realtime_request_timeout;

        let target = self.channels.get_or_create(channel, modes);
        if target.begin_attach(Some(completer)) && sends {
            let envelope = target.attach_envelope(now, timeout);
            self.send_raw(envelope);
        }
    }

    fn detach(&mut self, channel: &str, completer: Completer) {
        let sends = self.state.sends_events();
        let now = Instant::now();
        let timeout = self.options.realtime_request_timeout;
        let retry = self.options.channel_retry_timeout;

        let Some(target) = self.channels.get_mut(channel) else {
            let _ = completer.send(Ok(()));
            return;
        };
        if let Some(envelope) = target.begin_detach(Some(completer), now, timeout) {
            if sends {
                self.send_raw(envelope);
            } else {
                // No server interest can survive without a transport.
                target.handle_detached(None, now, retry);
            }
        }
    }

    fn close(&mut self) {
        match self.state {
            ConnectionState::Closed | ConnectionState::Failed | ConnectionState::Closing => {}
            ConnectionState::Connected => {
                self.set_state(ConnectionState::Closing, None);
                if let Some(transport) = &self.transport {
                    transport.close();
                }
                self.close_deadline =
                    Some(Instant::now() + self.options.realtime_request_timeout);
            }
            _ => self.finalize_close(),
        }
    }

    fn finalize_close(&mut self) {
        self.drop_transport();
        self.retry_at = None;
        self.suspend_at = None;
        self.suspended_mode = false;
        self.close_deadline = None;
        let closed = error::connection_closed();
        for mut message in self.queued.drain(..) {
            message.complete(&Err(closed.clone()));
        }
        self.pending.fail_all(&closed);
        for channel in self.channels.iter_mut() {
            channel.on_connection_closed();
        }
        self.connection_id = None;
        self.connection_key = None;
        self.msg_serial = 0;
        self.set_state(ConnectionState::Closed, None);
    }

    /// Pull any buffered commands, setting the close flag aside. Used inside
    /// the connect walk so a close can abort outstanding attempts.
    fn buffer_commands_check_close(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            if matches!(command, Command::Close) {
                self.close_requested = true;
            } else {
                self.command_buffer.push_back(command);
            }
        }
        self.close_requested
    }

    // Transport events.

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                connection_id,
                details,
                error,
            } => {
                if self.state == ConnectionState::Connected {
                    // In-place update of a live connection.
                    if details.connection_key.is_some() {
                        self.connection_key = details.connection_key;
                    }
                    self.set_state(ConnectionState::Connected, error);
                } else {
                    self.process_connected(connection_id, details, error);
                }
            }
            TransportEvent::Disconnected { error } => {
                self.drop_transport();
                self.handle_disconnection(error).await;
            }
            TransportEvent::Failed { error } => {
                self.drop_transport();
                self.handle_failure(error).await;
            }
            TransportEvent::Heartbeat => trace!("Heartbeat"),
            TransportEvent::Preconnect => {}
            TransportEvent::Message { message } => self.handle_inbound(message).await,
        }
    }

    async fn handle_failure(&mut self, error: ErrorInfo) {
        if error::is_token_error(&error) {
            match self.auth.authorize().await {
                Ok(()) => {
                    // Credential refreshed; retry shortly.
                    self.set_state(ConnectionState::Disconnected, Some(error));
                    self.retry_at = Some(Instant::now() + self.options.immediate_retry_spacing);
                    return;
                }
                Err(e) => {
                    self.fail_connection(e);
                    return;
                }
            }
        }
        if error::is_retryable(&error) {
            self.handle_disconnection(error).await;
        } else {
            self.fail_connection(error);
        }
    }

    async fn handle_disconnection(&mut self, error: ErrorInfo) {
        if self.state == ConnectionState::Closing {
            self.finalize_close();
            return;
        }
        if !error::is_retryable(&error) {
            self.fail_connection(error);
            return;
        }

        // Everything unacknowledged goes back to the front of the backlog.
        let mut backlog = self.pending.drain_for_retry();
        backlog.append(&mut self.queued);
        self.queued = backlog;

        let now = Instant::now();
        if self.suspended_mode {
            self.enter_suspended(error);
            return;
        }
        if self.suspend_at.is_none() {
            self.suspend_at = Some(now + self.state_ttl);
        }
        if self.suspend_at.is_some_and(|at| now >= at) {
            self.enter_suspended(error);
            return;
        }

        if error::is_token_error(&error) {
            match self.auth.authorize().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Disconnected, Some(error));
                    self.retry_at = Some(now + self.options.immediate_retry_spacing);
                    return;
                }
                Err(e) => {
                    self.fail_connection(e);
                    return;
                }
            }
        }

        let immediate = error::is_immediate_retry(&error)
            && self
                .last_immediate_retry
                .map_or(true, |at| {
                    now.duration_since(at) >= self.options.immediate_retry_spacing
                });
        let delay = if immediate {
            self.last_immediate_retry = Some(now);
            Duration::ZERO
        } else {
            let delay =
                backoff::retry_delay(self.options.disconnected_retry_timeout, self.retry_count);
            self.retry_count += 1;
            delay
        };

        self.set_state(ConnectionState::Disconnected, Some(error.clone()));
        for channel in self.channels.iter_mut() {
            channel.on_connection_lost(Some(error.clone()));
        }
        self.retry_at = Some(now + delay);
        debug!(delay = ?delay, "Retry scheduled");
    }

    fn enter_suspended(&mut self, error: ErrorInfo) {
        warn!(error = %error, "Connection suspended");
        // Server-side state is gone; only a clean connection remains.
        self.connection_id = None;
        self.connection_key = None;
        self.msg_serial = 0;
        self.suspend_at = None;
        if !self.suspended_mode {
            // The backoff ramp restarts on the transition into suspended.
            self.retry_count = 0;
        }
        self.suspended_mode = true;

        let reason = error::connection_suspended();
        for mut message in self.queued.drain(..) {
            message.complete(&Err(reason.clone()));
        }
        self.pending.fail_all(&reason);

        self.set_state(ConnectionState::Suspended, Some(error));
        for channel in self.channels.iter_mut() {
            channel.on_connection_lost(Some(reason.clone()));
        }
        let delay = backoff::retry_delay(self.options.suspended_retry_timeout, self.retry_count);
        self.retry_count += 1;
        self.retry_at = Some(Instant::now() + delay);
    }

    fn fail_connection(&mut self, error: ErrorInfo) {
        warn!(error = %error, "Connection failed");
        self.drop_transport();
        self.retry_at = None;
        self.suspend_at = None;
        self.suspended_mode = false;
        self.close_deadline = None;
        for mut message in self.queued.drain(..) {
            message.complete(&Err(error.clone()));
        }
        self.pending.fail_all(&error);
        for channel in self.channels.iter_mut() {
            channel.on_connection_failed(error.clone());
        }
        self.connection_id = None;
        self.connection_key = None;
        self.set_state(ConnectionState::Failed, Some(error));
    }

    // Inbound routing.

    async fn handle_inbound(&mut self, envelope: ProtocolMessage) {
        trace!(action = ?envelope.action, channel = ?envelope.channel, "Inbound envelope");
        match envelope.action {
            Action::Ack => {
                if let (Some(serial), Some(count)) = (envelope.msg_serial, envelope.count) {
                    if let Err(e) = self.pending.ack(serial, count) {
                        warn!(error = %e, "ACK accounting violation");
                    }
                }
            }
            Action::Nack => {
                if let (Some(serial), Some(count)) = (envelope.msg_serial, envelope.count) {
                    if let Err(e) = self.pending.nack(serial, count, envelope.error) {
                        warn!(error = %e, "NACK accounting violation");
                    }
                }
            }
            Action::Closed => {
                if self.state == ConnectionState::Closing {
                    self.finalize_close();
                } else {
                    self.drop_transport();
                    self.handle_disconnection(
                        envelope.error.unwrap_or_else(error::connection_closed),
                    )
                    .await;
                }
            }
            Action::Disconnect | Action::Disconnected => {
                self.drop_transport();
                self.handle_disconnection(envelope.error.unwrap_or_else(|| {
                    ErrorInfo::new(
                        ripple_transport::traits::CODE_CONNECTION_CLOSED,
                        0,
                        "Server requested disconnect",
                    )
                }))
                .await;
            }
            Action::Error => {
                if let Some(name) = envelope.channel.clone() {
                    let error = envelope
                        .error
                        .unwrap_or_else(|| error::connection_failed("channel error"));
                    let now = Instant::now();
                    let retry = self.options.channel_retry_timeout;
                    if let Some(channel) = self.channels.get_mut(&name) {
                        channel.handle_channel_error(error, now, retry);
                    }
                } else {
                    self.drop_transport();
                    self.handle_failure(
                        envelope
                            .error
                            .unwrap_or_else(|| error::connection_failed("server error")),
                    )
                    .await;
                }
            }
            Action::Auth => {
                // Server requests a credential refresh before it forces one.
                if let Err(e) = self.auth.authorize().await {
                    warn!(error = %e, "Reauthorization request failed");
                }
            }
            Action::Attached => {
                let Some(name) = envelope.channel.clone() else {
                    return;
                };
                let outcome = match self.channels.get_mut(&name) {
                    Some(channel) => channel.handle_attached(&envelope),
                    None => return,
                };
                if !outcome.reenter.is_empty() {
                    debug!(channel = %name, members = outcome.reenter.len(), "Re-entering presence members");
                    // A refused re-enter must surface on the channel, not
                    // vanish with the envelope.
                    let (completer, completion) = oneshot::channel();
                    let internal = self.internal_tx.clone();
                    let reenter_channel = name.clone();
                    tokio::spawn(async move {
                        if let Ok(Err(error)) = completion.await {
                            let _ = internal.send(Command::ReenterFailed {
                                channel: reenter_channel,
                                error,
                            });
                        }
                    });
                    let pending = PendingMessage::new(
                        ProtocolMessage::presence(name.clone(), outcome.reenter),
                        Some(completer),
                    );
                    self.send_or_queue(pending);
                }
                for pending in outcome.flush {
                    self.send_or_queue(pending);
                }
            }
            Action::Detached => {
                let Some(name) = envelope.channel.as_deref() else {
                    return;
                };
                let now = Instant::now();
                let retry = self.options.channel_retry_timeout;
                if let Some(channel) = self.channels.get_mut(name) {
                    channel.handle_detached(envelope.error.clone(), now, retry);
                }
            }
            Action::Message => {
                let Some(name) = envelope.channel.as_deref() else {
                    return;
                };
                let now = Instant::now();
                let timeout = self.options.realtime_request_timeout;
                let recovery = self
                    .channels
                    .get_mut(name)
                    .and_then(|channel| channel.handle_message(&envelope, now, timeout));
                if let Some(attach) = recovery {
                    self.send_raw(attach);
                }
            }
            Action::Presence => {
                if let Some(channel) = envelope
                    .channel
                    .as_deref()
                    .and_then(|name| self.channels.get_mut(name))
                {
                    channel.handle_presence(&envelope);
                }
            }
            Action::Sync => {
                if let Some(channel) = envelope
                    .channel
                    .as_deref()
                    .and_then(|name| self.channels.get_mut(name))
                {
                    channel.handle_sync(&envelope);
                }
            }
            other => debug!(action = ?other, "Unhandled inbound action"),
        }
    }

    // Timers.

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if self.close_deadline.is_some_and(|at| now >= at) {
            warn!("Graceful close timed out; forcing closed");
            self.finalize_close();
            return;
        }
        if self.suspend_at.is_some_and(|at| now >= at)
            && self.state == ConnectionState::Disconnected
        {
            let reason = self
                .error_reason
                .clone()
                .unwrap_or_else(error::connection_suspended);
            self.enter_suspended(reason);
        }
        if self.retry_at.is_some_and(|at| now >= at)
            && matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Suspended
            )
        {
            self.retry_at = None;
            self.connect_walk().await;
            return;
        }

        let retry_base = self.options.channel_retry_timeout;
        let timeout = self.options.realtime_request_timeout;
        let sends = self.state.sends_events();
        let mut attaches = Vec::new();
        for channel in self.channels.iter_mut() {
            if channel.on_timer(now, retry_base) && sends {
                attaches.push(channel.attach_envelope(now, timeout));
            }
        }
        for envelope in attaches {
            self.send_raw(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ripple_protocol::{Data, PresenceAction};

    // Scripted transport plumbing.

    enum Plan {
        Connect {
            connection_id: &'static str,
            connection_key: &'static str,
            resume_error: Option<ErrorInfo>,
        },
        RefuseRetryable(ErrorInfo),
        RefuseFatal(ErrorInfo),
        Hang,
    }

    struct MockShared {
        sent: Mutex<Vec<ProtocolMessage>>,
        params: Mutex<Vec<ConnectParams>>,
        live: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
        closes: AtomicUsize,
    }

    impl MockShared {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                params: Mutex::new(Vec::new()),
                live: Mutex::new(None),
                closes: AtomicUsize::new(0),
            })
        }

        fn sent(&self) -> Vec<ProtocolMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn inject(&self, event: TransportEvent) {
            let live = self.live.lock().unwrap();
            live.as_ref().unwrap().send(event).unwrap();
        }
    }

    struct MockTransport {
        kind: TransportKind,
        shared: Arc<MockShared>,
    }

    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }
        fn host(&self) -> &str {
            "mock.example.com"
        }
        fn format(&self) -> ripple_protocol::WireFormat {
            ripple_protocol::WireFormat::MsgPack
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn send(&self, message: ProtocolMessage) -> Result<(), ripple_transport::TransportError> {
            self.shared.sent.lock().unwrap().push(message);
            Ok(())
        }
        fn close(&self) {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
        fn disconnect(&self) {}
        fn dispose(&self) {}
    }

    struct MockFactory {
        kind: TransportKind,
        plans: Mutex<VecDeque<Plan>>,
        shared: Arc<MockShared>,
    }

    impl MockFactory {
        fn new(kind: TransportKind, plans: Vec<Plan>, shared: Arc<MockShared>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                plans: Mutex::new(plans.into()),
                shared,
            })
        }
    }

    impl TransportFactory for MockFactory {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn spawn(
            &self,
            params: ConnectParams,
        ) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>) {
            self.shared.params.lock().unwrap().push(params);
            let (tx, rx) = mpsc::unbounded_channel();
            let plan = self
                .plans
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Plan::Hang);
            match plan {
                Plan::Connect {
                    connection_id,
                    connection_key,
                    resume_error,
                } => {
                    let details = ConnectionDetails {
                        connection_key: Some(connection_key.into()),
                        ..ConnectionDetails::default()
                    };
                    tx.send(TransportEvent::Connected {
                        connection_id: connection_id.into(),
                        details,
                        error: resume_error,
                    })
                    .unwrap();
                    *self.shared.live.lock().unwrap() = Some(tx);
                }
                Plan::RefuseRetryable(error) => {
                    let _ = tx.send(TransportEvent::Disconnected { error });
                }
                Plan::RefuseFatal(error) => {
                    let _ = tx.send(TransportEvent::Failed { error });
                }
                Plan::Hang => {
                    *self.shared.live.lock().unwrap() = Some(tx);
                }
            }
            (
                Arc::new(MockTransport {
                    kind: self.kind,
                    shared: self.shared.clone(),
                }),
                rx,
            )
        }
    }

    struct StaticConnectivity {
        http: bool,
        websocket: bool,
    }

    #[async_trait]
    impl ConnectivityChecker for StaticConnectivity {
        async fn check_http(&self, _host: &str, _tls: bool) -> bool {
            self.http
        }
        async fn check_websocket(&self, _host: &str, _tls: bool) -> bool {
            self.websocket
        }
    }

    struct CountingAuth {
        authorizations: AtomicUsize,
        renewable: bool,
    }

    #[async_trait]
    impl AuthProvider for CountingAuth {
        async fn connect_params(&self) -> Result<Vec<(String, String)>, ErrorInfo> {
            Ok(vec![("accessToken".into(), "tok".into())])
        }
        async fn authorize(&self) -> Result<(), ErrorInfo> {
            self.authorizations.fetch_add(1, Ordering::SeqCst);
            if self.renewable {
                Ok(())
            } else {
                Err(ErrorInfo::new(40_171, 403, "cannot renew"))
            }
        }
    }

    struct Harness {
        commands: mpsc::UnboundedSender<Command>,
        status: watch::Receiver<ConnectionStatus>,
        shared: Arc<MockShared>,
        auth: Arc<CountingAuth>,
        preference: Arc<ripple_transport::MemoryPreferenceStore>,
    }

    fn options() -> ClientOptions {
        ClientOptions {
            primary_host: "mock.example.com".into(),
            auto_connect: false,
            ..ClientOptions::default()
        }
    }

    fn spawn_manager(options: ClientOptions, ws_plans: Vec<Plan>, comet_plans: Vec<Plan>) -> Harness {
        spawn_manager_with_connectivity(
            options,
            ws_plans,
            comet_plans,
            StaticConnectivity {
                http: true,
                websocket: false,
            },
        )
    }

    fn spawn_manager_with_connectivity(
        options: ClientOptions,
        ws_plans: Vec<Plan>,
        comet_plans: Vec<Plan>,
        connectivity: StaticConnectivity,
    ) -> Harness {
        let shared = MockShared::new();
        let auth = Arc::new(CountingAuth {
            authorizations: AtomicUsize::new(0),
            renewable: true,
        });
        let preference = Arc::new(ripple_transport::MemoryPreferenceStore::new());
        let factories: Vec<Arc<dyn TransportFactory>> = vec![
            MockFactory::new(TransportKind::WebSocket, ws_plans, shared.clone()),
            MockFactory::new(TransportKind::Comet, comet_plans, shared.clone()),
        ];
        let (manager, commands, status) = ConnectionManager::new(
            options,
            auth.clone(),
            factories,
            preference.clone(),
            Arc::new(connectivity),
        );
        tokio::spawn(manager.run());
        Harness {
            commands,
            status,
            shared,
            auth,
            preference,
        }
    }

    async fn wait_state(harness: &mut Harness, state: ConnectionState) {
        harness
            .status
            .wait_for(|s| s.state == state)
            .await
            .expect("manager gone");
    }

    async fn wait_sent(harness: &Harness, pred: impl Fn(&ProtocolMessage) -> bool) -> ProtocolMessage {
        loop {
            if let Some(found) = harness.shared.sent().into_iter().find(|m| pred(m)) {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn connect_plan() -> Plan {
        Plan::Connect {
            connection_id: "conn-1",
            connection_key: "key-1",
            resume_error: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_publish_ack() {
        let mut harness = spawn_manager(options(), vec![connect_plan()], vec![]);
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        let (tx, rx) = oneshot::channel();
        harness
            .commands
            .send(Command::Publish {
                channel: "orders".into(),
                messages: vec![Message::new("update", Data::json(serde_json::json!(1)))],
                completer: tx,
            })
            .unwrap();

        // Publish to an initialized channel attaches first, then flushes on
        // ATTACHED.
        let attach = wait_sent(&harness, |m| m.action == Action::Attach).await;
        assert_eq!(attach.channel.as_deref(), Some("orders"));
        harness.shared.inject(TransportEvent::Message {
            message: ProtocolMessage::new(Action::Attached).with_channel("orders"),
        });

        let sent = wait_sent(&harness, |m| m.action == Action::Message).await;
        assert_eq!(sent.msg_serial, Some(0));

        let mut ack = ProtocolMessage::new(Action::Ack);
        ack.msg_serial = Some(0);
        ack.count = Some(1);
        harness.shared.inject(TransportEvent::Message { message: ack });

        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_publish_flushes_on_connect() {
        let mut harness = spawn_manager(options(), vec![connect_plan()], vec![]);

        let (tx, _rx) = oneshot::channel();
        harness
            .commands
            .send(Command::Publish {
                channel: "orders".into(),
                messages: vec![Message::new("update", Data::json(serde_json::json!(1)))],
                completer: tx,
            })
            .unwrap();
        // Nothing sent yet: still initialized.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.shared.sent().is_empty());

        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;
        harness.shared.inject(TransportEvent::Message {
            message: ProtocolMessage::new(Action::Attached).with_channel("orders"),
        });

        let sent = wait_sent(&harness, |m| m.action == Action::Message).await;
        assert_eq!(sent.msg_serial, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_failover_walks_fallbacks() {
        let opts = ClientOptions {
            fallback_hosts: vec!["fb.example.com".into()],
            ..options()
        };
        let mut harness = spawn_manager(
            opts,
            vec![
                Plan::RefuseRetryable(ErrorInfo::new(0, 0, "connection refused")),
                connect_plan(),
            ],
            vec![],
        );
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        let params = harness.shared.params.lock().unwrap().clone();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].host, "mock.example.com");
        assert_eq!(params[1].host, "fb.example.com");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_rejection_fails_connection() {
        let mut harness = spawn_manager(
            options(),
            vec![Plan::RefuseFatal(ErrorInfo::new(40_000, 400, "bad request"))],
            vec![],
        );
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Failed).await;

        // Publishes now fail immediately.
        let (tx, rx) = oneshot::channel();
        harness
            .commands
            .send(Command::Publish {
                channel: "orders".into(),
                messages: vec![Message::new("update", Data::json(serde_json::json!(1)))],
                completer: tx,
            })
            .unwrap();
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_transport_drop() {
        let mut harness = spawn_manager(
            options(),
            vec![
                connect_plan(),
                Plan::Connect {
                    connection_id: "conn-1",
                    connection_key: "key-1",
                    resume_error: None,
                },
            ],
            vec![],
        );
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        // An unacknowledged publish in flight when the transport drops.
        let (tx, rx) = oneshot::channel();
        harness
            .commands
            .send(Command::Attach {
                channel: "orders".into(),
                modes: vec![],
                completer: tx,
            })
            .unwrap();
        wait_sent(&harness, |m| m.action == Action::Attach).await;
        harness.shared.inject(TransportEvent::Message {
            message: ProtocolMessage::new(Action::Attached).with_channel("orders"),
        });
        rx.await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        harness
            .commands
            .send(Command::Publish {
                channel: "orders".into(),
                messages: vec![Message::new("update", Data::json(serde_json::json!(1)))],
                completer: tx,
            })
            .unwrap();
        wait_sent(&harness, |m| m.action == Action::Message).await;

        harness.shared.inject(TransportEvent::Disconnected {
            error: ErrorInfo::new(0, 0, "socket reset"),
        });
        wait_state(&mut harness, ConnectionState::Disconnected).await;

        // The retry timer fires under the paused clock and the second plan
        // connects with the same identity.
        wait_state(&mut harness, ConnectionState::Connected).await;
        let params = harness.shared.params.lock().unwrap().clone();
        assert!(matches!(
            params.last().unwrap().mode,
            ConnectMode::Resume { ref connection_key } if connection_key == "key-1"
        ));

        // The publish is retransmitted under its original serial and the ACK
        // resolves it.
        let resent = harness
            .shared
            .sent()
            .into_iter()
            .filter(|m| m.action == Action::Message)
            .collect::<Vec<_>>();
        assert!(resent.len() >= 2);
        assert!(resent.iter().all(|m| m.msg_serial == Some(0)));

        let mut ack = ProtocolMessage::new(Action::Ack);
        ack.msg_serial = Some(0);
        ack.count = Some(1);
        harness.shared.inject(TransportEvent::Message { message: ack });
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_mode_presented_on_first_connect() {
        let opts = ClientOptions {
            recover: Some(
                RecoveryContext::new("key-old", 7).encode().unwrap(),
            ),
            ..options()
        };
        let mut harness = spawn_manager(opts, vec![connect_plan()], vec![]);
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        let params = harness.shared.params.lock().unwrap().clone();
        assert!(matches!(
            params[0].mode,
            ConnectMode::Recover { ref connection_key, msg_serial }
                if connection_key == "key-old" && msg_serial == 7
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_error_reauthorizes_and_retries() {
        let mut harness = spawn_manager(options(), vec![connect_plan(), connect_plan()], vec![]);
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        harness.shared.inject(TransportEvent::Disconnected {
            error: ErrorInfo::new(40_142, 401, "token expired"),
        });
        wait_state(&mut harness, ConnectionState::Disconnected).await;
        wait_state(&mut harness, ConnectionState::Connected).await;

        assert_eq!(harness.auth.authorizations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close() {
        let mut harness = spawn_manager(options(), vec![connect_plan()], vec![]);
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        harness.commands.send(Command::Close).unwrap();
        wait_state(&mut harness, ConnectionState::Closing).await;
        assert_eq!(harness.shared.closes.load(Ordering::SeqCst), 1);

        harness.shared.inject(TransportEvent::Message {
            message: ProtocolMessage::new(Action::Closed),
        });
        wait_state(&mut harness, ConnectionState::Closed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspension_discards_resumption_state() {
        let opts = ClientOptions {
            // State TTL shorter than the retry delay: one drop suspends.
            connection_state_ttl: Duration::from_secs(1),
            disconnected_retry_timeout: Duration::from_secs(30),
            ..options()
        };
        let mut harness = spawn_manager(
            opts,
            vec![
                connect_plan(),
                Plan::RefuseRetryable(ErrorInfo::new(0, 0, "still down")),
                Plan::Connect {
                    connection_id: "conn-2",
                    connection_key: "key-2",
                    resume_error: None,
                },
            ],
            vec![],
        );
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        harness.shared.inject(TransportEvent::Disconnected {
            error: ErrorInfo::new(0, 0, "socket reset"),
        });
        wait_state(&mut harness, ConnectionState::Suspended).await;

        // Publishing while suspended fails immediately.
        let (tx, rx) = oneshot::channel();
        harness
            .commands
            .send(Command::Publish {
                channel: "orders".into(),
                messages: vec![Message::new("update", Data::json(serde_json::json!(1)))],
                completer: tx,
            })
            .unwrap();
        assert!(rx.await.unwrap().is_err());

        // Eventually reconnects clean: no resume key survives suspension.
        wait_state(&mut harness, ConnectionState::Connected).await;
        let params = harness.shared.params.lock().unwrap().clone();
        assert!(matches!(params.last().unwrap().mode, ConnectMode::Clean));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_websocket_falls_back_to_comet() {
        let mut harness = spawn_manager(options(), vec![Plan::Hang], vec![connect_plan()]);
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        let params = harness.shared.params.lock().unwrap().clone();
        assert_eq!(params.len(), 2);
        // The long-poll verdict is cached for the next connect.
        assert_eq!(
            harness.preference.get().unwrap().kind,
            TransportKind::Comet
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_continues_serial_sequence() {
        let opts = ClientOptions {
            recover: Some(RecoveryContext::new("key-old", 7).encode().unwrap()),
            ..options()
        };
        let mut harness = spawn_manager(opts, vec![connect_plan()], vec![]);
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        let (tx, _rx) = oneshot::channel();
        harness
            .commands
            .send(Command::Publish {
                channel: "orders".into(),
                messages: vec![Message::new("update", Data::json(serde_json::json!(1)))],
                completer: tx,
            })
            .unwrap();
        wait_sent(&harness, |m| m.action == Action::Attach).await;
        harness.shared.inject(TransportEvent::Message {
            message: ProtocolMessage::new(Action::Attached).with_channel("orders"),
        });

        // The server honored the recovery: the serial sequence continues
        // where the lost process left off.
        let sent = wait_sent(&harness, |m| m.action == Action::Message).await;
        assert_eq!(sent.msg_serial, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspension_restarts_backoff_ramp() {
        let opts = ClientOptions {
            disconnected_retry_timeout: Duration::from_secs(1),
            connection_state_ttl: Duration::from_millis(500),
            suspended_retry_timeout: Duration::from_secs(60),
            ..options()
        };
        let mut harness = spawn_manager(
            opts,
            vec![
                Plan::RefuseRetryable(ErrorInfo::new(0, 0, "down")),
                connect_plan(),
            ],
            vec![],
        );
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Suspended).await;

        // The first suspended retry runs on a fresh ramp: one base delay
        // with jitter, at most 40s here, not the accumulated attempt count.
        let suspended_at = Instant::now();
        wait_state(&mut harness, ConnectionState::Connected).await;
        assert!(suspended_at.elapsed() < Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_reenter_surfaces_channel_update() {
        let mut harness = spawn_manager(options(), vec![connect_plan()], vec![]);

        let (tx, attach_rx) = oneshot::channel();
        harness
            .commands
            .send(Command::Attach {
                channel: "orders".into(),
                modes: vec![],
                completer: tx,
            })
            .unwrap();
        let (tx, rx) = oneshot::channel();
        harness
            .commands
            .send(Command::SubscribeState {
                channel: "orders".into(),
                reply: tx,
            })
            .unwrap();
        let mut states = rx.await.unwrap();

        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;
        wait_sent(&harness, |m| m.action == Action::Attach).await;
        harness.shared.inject(TransportEvent::Message {
            message: ProtocolMessage::new(Action::Attached).with_channel("orders"),
        });
        attach_rx.await.unwrap().unwrap();

        // Our own member lands on the map.
        let mut own = PresenceMessage::new(PresenceAction::Enter, "alice");
        own.connection_id = Some("conn-1".into());
        own.id = Some("conn-1:0:0".into());
        own.timestamp = Some(1_000);
        let mut envelope = ProtocolMessage::new(Action::Presence).with_channel("orders");
        envelope.presence = Some(vec![own]);
        harness.shared.inject(TransportEvent::Message { message: envelope });

        // A second ATTACHED without continuity triggers an automatic
        // re-enter of our member.
        harness.shared.inject(TransportEvent::Message {
            message: ProtocolMessage::new(Action::Attached).with_channel("orders"),
        });
        let reenter = wait_sent(&harness, |m| m.action == Action::Presence).await;

        let mut nack = ProtocolMessage::new(Action::Nack);
        nack.msg_serial = reenter.msg_serial;
        nack.count = Some(1);
        nack.error = Some(ErrorInfo::new(40_160, 401, "presence denied"));
        harness.shared.inject(TransportEvent::Message { message: nack });

        // The refusal surfaces as a non-fatal update on the still-attached
        // channel.
        loop {
            let change = states.recv().await.unwrap();
            if change.reason.as_ref().map_or(false, |r| r.code == 40_160) {
                assert_eq!(change.current, ChannelState::Attached);
                assert_eq!(change.previous, ChannelState::Attached);
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_long_poll_preference_cleared_by_reverified_socket() {
        let mut harness = spawn_manager_with_connectivity(
            options(),
            vec![connect_plan()],
            vec![],
            StaticConnectivity {
                http: true,
                websocket: true,
            },
        );
        // A long-poll verdict cached by an earlier session.
        harness
            .preference
            .set(TransportPreference::new(TransportKind::Comet));

        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        // The socket probe passed, so the attempt went straight to the
        // WebSocket factory and the cached verdict is gone.
        assert!(harness.preference.get().is_none());
        let params = harness.shared.params.lock().unwrap().clone();
        assert_eq!(params.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_key_reflects_connection() {
        let mut harness = spawn_manager(options(), vec![connect_plan()], vec![]);
        harness.commands.send(Command::Connect).unwrap();
        wait_state(&mut harness, ConnectionState::Connected).await;

        let (tx, rx) = oneshot::channel();
        harness.commands.send(Command::RecoveryKey { reply: tx }).unwrap();
        let key = rx.await.unwrap().expect("connected: key available");
        let context = RecoveryContext::decode(&key).unwrap();
        assert_eq!(context.connection_key, "key-1");
        assert_eq!(context.msg_serial, 0);
    }
}
