//! Channel state machine.
//!
//! A channel is an attachment to one named stream. Its lifecycle is driven
//! from both ends: explicit attach/detach requests from the application and
//! ATTACHED/DETACHED/ERROR envelopes from the server, plus connection state
//! transitions relayed by the connection manager. The channel itself never
//! touches a transport; handlers return the envelopes the manager should
//! send.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use ripple_protocol::{
    Action, ChannelMode, ErrorInfo, Flags, Message, PresenceMessage, ProtocolMessage,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backoff;
use crate::error;
use crate::msgqueue::{Completer, PendingMessage};
use crate::presence::PresenceMap;

/// Delta format this client understands.
const SUPPORTED_DELTA_FORMAT: &str = "vcdiff";

/// Payload encodings this client understands.
const SUPPORTED_ENCODINGS: &[&str] = &["json", "utf-8", "base64", SUPPORTED_DELTA_FORMAT];

const EVENT_CAPACITY: usize = 256;

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    /// Attachment lost; the client will re-attach automatically.
    Suspended,
    /// Terminal until an explicit re-attach.
    Failed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A channel state transition, or an in-place update of an attached channel.
#[derive(Debug, Clone)]
pub struct ChannelStateChange {
    pub current: ChannelState,
    pub previous: ChannelState,
    pub reason: Option<ErrorInfo>,
    /// Whether channel continuity was preserved across the transition.
    pub resumed: bool,
}

/// What an ATTACHED envelope asked the manager to do.
#[derive(Debug, Default)]
pub struct AttachOutcome {
    /// Own members to re-enter after a non-continuous attach.
    pub reenter: Vec<PresenceMessage>,
    /// Publishes buffered while the attach was in flight.
    pub flush: Vec<PendingMessage>,
}

/// One named channel.
pub struct Channel {
    name: String,
    state: ChannelState,
    error_reason: Option<ErrorInfo>,
    requested_modes: Flags,
    modes: Vec<ChannelMode>,
    channel_serial: Option<String>,
    ever_attached: bool,
    last_message_id: Option<String>,
    /// Single-flight guard for the decode-failure re-attach.
    decode_recovery: bool,
    attach_waiters: Vec<Completer>,
    detach_waiters: Vec<Completer>,
    pending_publish: Vec<PendingMessage>,
    state_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    retry_count: u32,
    presence: PresenceMap,
    state_tx: broadcast::Sender<ChannelStateChange>,
    message_tx: broadcast::Sender<Message>,
    presence_tx: broadcast::Sender<PresenceMessage>,
}

impl Channel {
    #[must_use]
    pub fn new(name: impl Into<String>, modes: &[ChannelMode]) -> Self {
        Self {
            name: name.into(),
            state: ChannelState::Initialized,
            error_reason: None,
            requested_modes: ChannelMode::to_flags(modes),
            modes: Vec::new(),
            channel_serial: None,
            ever_attached: false,
            last_message_id: None,
            decode_recovery: false,
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            pending_publish: Vec::new(),
            state_deadline: None,
            retry_at: None,
            retry_count: 0,
            presence: PresenceMap::new(),
            state_tx: broadcast::channel(EVENT_CAPACITY).0,
            message_tx: broadcast::channel(EVENT_CAPACITY).0,
            presence_tx: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[must_use]
    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    /// Modes negotiated by the last ATTACHED.
    #[must_use]
    pub fn modes(&self) -> &[ChannelMode] {
        &self.modes
    }

    /// Continuity cursor for the recovery key.
    #[must_use]
    pub fn serial(&self) -> Option<&str> {
        self.channel_serial.as_deref()
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceMap {
        &self.presence
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.message_tx.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceMessage> {
        self.presence_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.state_tx.subscribe()
    }

    /// Record the connection identity presence tracking keys off.
    pub fn set_connection_id(&mut self, connection_id: Option<String>) {
        self.presence.set_self(connection_id);
    }

    fn set_state(&mut self, next: ChannelState, reason: Option<ErrorInfo>, resumed: bool) {
        if self.state != next {
            debug!(channel = %self.name, from = %self.state, to = %next, "Channel state change");
        }
        let change = ChannelStateChange {
            current: next,
            previous: self.state,
            reason: reason.clone(),
            resumed,
        };
        self.state = next;
        self.error_reason = reason;
        let _ = self.state_tx.send(change);
    }

    /// Emit an update event without leaving the attached state.
    fn emit_update(&mut self, reason: Option<ErrorInfo>, resumed: bool) {
        let change = ChannelStateChange {
            current: self.state,
            previous: self.state,
            reason,
            resumed,
        };
        let _ = self.state_tx.send(change);
    }

    /// Start an attach requested by the application. Returns false when the
    /// channel is already attached and the waiter was resolved in place.
    pub fn begin_attach(&mut self, waiter: Option<Completer>) -> bool {
        if self.state == ChannelState::Attached {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Ok(()));
            }
            return false;
        }
        if let Some(waiter) = waiter {
            self.attach_waiters.push(waiter);
        }
        if self.state != ChannelState::Attaching {
            self.set_state(ChannelState::Attaching, None, false);
        }
        true
    }

    /// The ATTACH envelope for the current attach, arming its deadline.
    /// Call only when the connection can send.
    pub fn attach_envelope(&mut self, now: Instant, timeout: Duration) -> ProtocolMessage {
        self.state_deadline = Some(now + timeout);
        self.retry_at = None;
        let mut flags = self.requested_modes;
        if self.ever_attached {
            flags.set(Flags::ATTACH_RESUME);
        }
        let mut envelope = ProtocolMessage::attach(self.name.clone(), flags);
        envelope.channel_serial = self.channel_serial.clone();
        envelope
    }

    /// Start a detach requested by the application. Returns the DETACH
    /// envelope when one should be sent.
    pub fn begin_detach(
        &mut self,
        waiter: Option<Completer>,
        now: Instant,
        timeout: Duration,
    ) -> Option<ProtocolMessage> {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                self.state = ChannelState::Detached;
                None
            }
            ChannelState::Failed => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(self
                        .error_reason
                        .clone()
                        .unwrap_or_else(|| error::connection_failed("channel failed"))));
                }
                None
            }
            _ => {
                if let Some(waiter) = waiter {
                    self.detach_waiters.push(waiter);
                }
                self.set_state(ChannelState::Detaching, None, false);
                self.state_deadline = Some(now + timeout);
                Some(ProtocolMessage::detach(self.name.clone()))
            }
        }
    }

    /// Buffer a publish while an attach is in flight.
    pub fn buffer_publish(&mut self, message: PendingMessage) {
        self.pending_publish.push(message);
    }

    /// Handle ATTACHED from the server.
    pub fn handle_attached(&mut self, envelope: &ProtocolMessage) -> AttachOutcome {
        if self.state == ChannelState::Detaching {
            // A DETACH is in flight; the server will answer it.
            return AttachOutcome::default();
        }

        let flags = envelope.flag_set();
        let resumed = flags.contains(Flags::RESUMED);
        self.modes = ChannelMode::from_flags(flags);
        if envelope.channel_serial.is_some() {
            self.channel_serial = envelope.channel_serial.clone();
        }
        self.decode_recovery = false;
        self.retry_count = 0;
        self.state_deadline = None;
        self.retry_at = None;

        let was_attached = self.state == ChannelState::Attached;
        let first_attach = !self.ever_attached;
        self.ever_attached = true;

        let mut outcome = AttachOutcome::default();

        if !resumed && !first_attach {
            // Continuity lost: the message sequence restarts here.
            self.last_message_id = None;
            if flags.contains(Flags::HAS_PRESENCE) {
                // A full SYNC follows; reconcile against it.
                self.presence.start_sync();
            } else {
                for leave in self.presence.clear() {
                    let _ = self.presence_tx.send(leave);
                }
            }
            outcome.reenter = self.presence.members_to_reenter();
        } else if flags.contains(Flags::HAS_PRESENCE) && !was_attached {
            self.presence.start_sync();
        }

        if was_attached {
            self.emit_update(envelope.error.clone(), resumed);
        } else {
            self.set_state(ChannelState::Attached, envelope.error.clone(), resumed);
            for waiter in self.attach_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }

        outcome.flush = std::mem::take(&mut self.pending_publish);
        outcome
    }

    /// Handle DETACHED from the server.
    pub fn handle_detached(&mut self, error: Option<ErrorInfo>, now: Instant, retry_base: Duration) {
        match self.state {
            ChannelState::Detaching => {
                self.state_deadline = None;
                self.set_state(ChannelState::Detached, error, false);
                for waiter in self.detach_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ChannelState::Attaching | ChannelState::Attached => {
                // Attach refused, or a server-initiated detach. Either way
                // the client re-attaches after a backoff.
                self.state_deadline = None;
                let reason = error.clone();
                for waiter in self.attach_waiters.drain(..) {
                    let _ = waiter.send(Err(reason
                        .clone()
                        .unwrap_or_else(|| error::connection_failed("attach refused"))));
                }
                self.set_state(ChannelState::Suspended, error, false);
                self.schedule_retry(now, retry_base);
            }
            _ => {}
        }
    }

    /// Handle a channel-scoped ERROR. Transient server conditions suspend
    /// the channel for a retried attach; anything else fails it.
    pub fn handle_channel_error(&mut self, error: ErrorInfo, now: Instant, retry_base: Duration) {
        if error::is_transient_channel(&error)
            && matches!(
                self.state,
                ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended
            )
        {
            warn!(channel = %self.name, error = %error, "Transient channel error; re-attach scheduled");
            self.state_deadline = None;
            for waiter in self.attach_waiters.drain(..) {
                let _ = waiter.send(Err(error.clone()));
            }
            self.set_state(ChannelState::Suspended, Some(error), false);
            self.schedule_retry(now, retry_base);
            return;
        }
        self.fail(error);
    }

    /// Surface a refused automatic presence re-enter. The channel stays
    /// attached; subscribers see a non-fatal update carrying the error.
    pub(crate) fn reenter_failed(&mut self, error: ErrorInfo) {
        warn!(channel = %self.name, error = %error, "Automatic presence re-enter refused");
        self.emit_update(Some(error), true);
    }

    fn fail(&mut self, error: ErrorInfo) {
        warn!(channel = %self.name, error = %error, "Channel failed");
        self.state_deadline = None;
        self.retry_at = None;
        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for mut pending in self.pending_publish.drain(..) {
            pending.complete(&Err(error.clone()));
        }
        for leave in self.presence.clear() {
            let _ = self.presence_tx.send(leave);
        }
        self.set_state(ChannelState::Failed, Some(error), false);
    }

    /// Handle a MESSAGE envelope. Returns a re-attach envelope when a decode
    /// failure forces the channel to resynchronize from the server.
    pub fn handle_message(
        &mut self,
        envelope: &ProtocolMessage,
        now: Instant,
        timeout: Duration,
    ) -> Option<ProtocolMessage> {
        let messages = envelope.messages.as_deref().unwrap_or_default();
        for message in messages {
            match self.check_decodable(message) {
                Decode::Ok => {
                    if let Some(id) = &message.id {
                        self.last_message_id = Some(id.clone());
                    }
                    let _ = self.message_tx.send(message.clone());
                }
                Decode::ContinuityBroken => {
                    if self.decode_recovery {
                        return None;
                    }
                    warn!(
                        channel = %self.name,
                        "Delta continuity broken; re-attaching to resynchronize"
                    );
                    self.decode_recovery = true;
                    self.set_state(ChannelState::Attaching, None, false);
                    return Some(self.attach_envelope(now, timeout));
                }
                Decode::Unsupported(error) => {
                    self.fail(error);
                    return None;
                }
            }
        }
        if envelope.channel_serial.is_some() {
            self.channel_serial = envelope.channel_serial.clone();
        }
        None
    }

    fn check_decodable(&self, message: &Message) -> Decode {
        if let Some(delta) = message.extras.as_ref().and_then(|e| e.delta.as_ref()) {
            if delta.format.as_deref().unwrap_or(SUPPORTED_DELTA_FORMAT) != SUPPORTED_DELTA_FORMAT {
                return Decode::Unsupported(ErrorInfo::new(
                    error::CODE_UNSUPPORTED_CAPABILITY,
                    400,
                    "Unsupported delta format",
                ));
            }
            if self.last_message_id.as_deref() != Some(delta.from.as_str()) {
                return Decode::ContinuityBroken;
            }
        }
        if let Some(encoding) = &message.encoding {
            for part in encoding.split('/') {
                let scheme = part.split('+').next().unwrap_or(part);
                if !SUPPORTED_ENCODINGS.contains(&scheme) {
                    return Decode::Unsupported(ErrorInfo::new(
                        error::CODE_UNSUPPORTED_CAPABILITY,
                        400,
                        &format!("Unsupported encoding: {}", scheme),
                    ));
                }
            }
        }
        Decode::Ok
    }

    /// Handle a live PRESENCE envelope.
    pub fn handle_presence(&mut self, envelope: &ProtocolMessage) {
        let updates = envelope.presence.as_deref().unwrap_or_default();
        for update in updates {
            if let Some(surfaced) = self.presence.apply(update.clone()) {
                let _ = self.presence_tx.send(surfaced);
            }
        }
        if envelope.channel_serial.is_some() {
            self.channel_serial = envelope.channel_serial.clone();
        }
    }

    /// Handle a SYNC page. The cursor rides in `channelSerial` as
    /// `<sequence>:<cursor>`; an empty cursor marks the final page.
    pub fn handle_sync(&mut self, envelope: &ProtocolMessage) {
        if !self.presence.sync_in_progress() {
            self.presence.start_sync();
        }
        let updates = envelope.presence.as_deref().unwrap_or_default();
        for update in updates {
            if let Some(surfaced) = self.presence.apply(update.clone()) {
                let _ = self.presence_tx.send(surfaced);
            }
        }

        let final_page = envelope
            .channel_serial
            .as_deref()
            .map_or(true, |serial| serial.split_once(':').map_or(true, |(_, c)| c.is_empty()));
        if final_page {
            for leave in self.presence.end_sync() {
                let _ = self.presence_tx.send(leave);
            }
        }
    }

    /// Connection lost its transport: attached channels wait it out in
    /// suspended and re-attach on reconnect.
    pub fn on_connection_lost(&mut self, error: Option<ErrorInfo>) {
        if matches!(self.state, ChannelState::Attaching | ChannelState::Attached) {
            self.state_deadline = None;
            self.set_state(ChannelState::Suspended, error, false);
        }
    }

    /// Connection failed terminally: so does every live channel.
    pub fn on_connection_failed(&mut self, error: ErrorInfo) {
        if !matches!(self.state, ChannelState::Detached | ChannelState::Failed) {
            self.fail(error);
        }
    }

    /// Connection closed by request: live channels detach.
    pub fn on_connection_closed(&mut self) {
        if !matches!(
            self.state,
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
        ) {
            self.state_deadline = None;
            self.retry_at = None;
            for waiter in self.detach_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
            let closed = error::connection_closed();
            for waiter in self.attach_waiters.drain(..) {
                let _ = waiter.send(Err(closed.clone()));
            }
            for mut pending in self.pending_publish.drain(..) {
                pending.complete(&Err(closed.clone()));
            }
            self.set_state(ChannelState::Detached, None, false);
        }
    }

    /// Whether the channel wants an ATTACH sent when the connection is (or
    /// becomes) able to send.
    #[must_use]
    pub fn wants_attach(&self) -> bool {
        matches!(
            self.state,
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended
        )
    }

    fn schedule_retry(&mut self, now: Instant, retry_base: Duration) {
        let delay = backoff::retry_delay(retry_base, self.retry_count);
        self.retry_count += 1;
        self.retry_at = Some(now + delay);
    }

    /// Earliest instant at which this channel needs a timer tick.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.state_deadline, self.retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Process timers. Returns true when the channel wants a fresh ATTACH
    /// sent now.
    pub fn on_timer(&mut self, now: Instant, retry_base: Duration) -> bool {
        if let Some(deadline) = self.state_deadline {
            if now >= deadline {
                self.state_deadline = None;
                match self.state {
                    ChannelState::Attaching => {
                        let timeout = error::channel_timeout("attach");
                        for waiter in self.attach_waiters.drain(..) {
                            let _ = waiter.send(Err(timeout.clone()));
                        }
                        self.set_state(ChannelState::Suspended, Some(timeout), false);
                        self.schedule_retry(now, retry_base);
                    }
                    ChannelState::Detaching => {
                        let timeout = error::channel_timeout("detach");
                        for waiter in self.detach_waiters.drain(..) {
                            let _ = waiter.send(Err(timeout.clone()));
                        }
                        // The attachment is still live as far as we know.
                        self.set_state(ChannelState::Attached, Some(timeout), true);
                    }
                    _ => {}
                }
            }
        }
        if let Some(retry) = self.retry_at {
            if now >= retry && self.state == ChannelState::Suspended {
                self.retry_at = None;
                self.set_state(ChannelState::Attaching, None, false);
                return true;
            }
        }
        false
    }
}

enum Decode {
    Ok,
    ContinuityBroken,
    Unsupported(ErrorInfo),
}

/// The channel registry for one connection.
#[derive(Default)]
pub struct Channels {
    map: HashMap<String, Channel>,
}

impl Channels {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, name: &str, modes: &[ChannelMode]) -> &mut Channel {
        self.map
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(name, modes))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.map.get_mut(name)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.map.values_mut()
    }

    /// Release a channel. Refused while the channel is in a state with
    /// server-side interest.
    pub fn release(&mut self, name: &str) -> Result<(), ErrorInfo> {
        let Some(channel) = self.map.get(name) else {
            return Ok(());
        };
        match channel.state() {
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed => {
                self.map.remove(name);
                Ok(())
            }
            state => Err(ErrorInfo::new(
                error::CODE_CHANNEL_OPERATION_FAILED,
                400,
                &format!("Cannot release channel in state {}", state),
            )),
        }
    }

    /// Serials of channels that should participate in a recovery key.
    #[must_use]
    pub fn serials(&self) -> HashMap<String, String> {
        self.map
            .values()
            .filter_map(|c| Some((c.name().to_string(), c.serial()?.to_string())))
            .collect()
    }

    /// Earliest timer deadline across all channels.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.map.values().filter_map(Channel::next_deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_protocol::{Data, PresenceAction};

    const TIMEOUT: Duration = Duration::from_secs(10);
    const RETRY: Duration = Duration::from_secs(15);

    fn attached_envelope(channel: &str, flags: Flags) -> ProtocolMessage {
        ProtocolMessage::new(Action::Attached)
            .with_channel(channel)
            .with_flags(flags)
    }

    fn attach(channel: &mut Channel) {
        let name = channel.name().to_string();
        channel.begin_attach(None);
        let _ = channel.attach_envelope(Instant::now(), TIMEOUT);
        channel.handle_attached(&attached_envelope(&name, Flags::empty()));
    }

    #[test]
    fn test_attach_lifecycle() {
        let mut channel = Channel::new("orders", &[]);
        assert_eq!(channel.state(), ChannelState::Initialized);

        assert!(channel.begin_attach(None));
        assert_eq!(channel.state(), ChannelState::Attaching);

        let envelope = channel.attach_envelope(Instant::now(), TIMEOUT);
        assert_eq!(envelope.action, Action::Attach);
        // First attach never asserts prior attachment.
        assert!(!envelope.flag_set().contains(Flags::ATTACH_RESUME));

        channel.handle_attached(&attached_envelope("orders", Flags::empty()));
        assert_eq!(channel.state(), ChannelState::Attached);
    }

    #[test]
    fn test_reattach_asserts_resume() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);
        channel.on_connection_lost(None);
        assert_eq!(channel.state(), ChannelState::Suspended);

        channel.begin_attach(None);
        let envelope = channel.attach_envelope(Instant::now(), TIMEOUT);
        assert!(envelope.flag_set().contains(Flags::ATTACH_RESUME));
    }

    #[test]
    fn test_attach_carries_requested_modes() {
        let mut channel = Channel::new("orders", &[ChannelMode::Subscribe, ChannelMode::Presence]);
        channel.begin_attach(None);
        let envelope = channel.attach_envelope(Instant::now(), TIMEOUT);
        assert!(envelope.flag_set().contains(Flags::SUBSCRIBE));
        assert!(envelope.flag_set().contains(Flags::PRESENCE));
    }

    #[test]
    fn test_attached_while_attached_without_resume_emits_update() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);
        let mut states = channel.subscribe_state();

        channel.handle_attached(&attached_envelope("orders", Flags::empty()));
        let change = states.try_recv().unwrap();
        assert_eq!(change.current, ChannelState::Attached);
        assert_eq!(change.previous, ChannelState::Attached);
        assert!(!change.resumed);
    }

    #[test]
    fn test_detached_while_attaching_suspends_and_schedules_retry() {
        let mut channel = Channel::new("orders", &[]);
        channel.begin_attach(None);
        let _ = channel.attach_envelope(Instant::now(), TIMEOUT);

        channel.handle_detached(
            Some(ErrorInfo::new(50_000, 500, "attach refused")),
            Instant::now(),
            RETRY,
        );
        assert_eq!(channel.state(), ChannelState::Suspended);
        assert!(channel.next_deadline().is_some());
    }

    #[test]
    fn test_suspended_retry_timer_reattaches() {
        let mut channel = Channel::new("orders", &[]);
        channel.begin_attach(None);
        let _ = channel.attach_envelope(Instant::now(), TIMEOUT);
        channel.handle_detached(None, Instant::now(), RETRY);

        let retry_at = channel.next_deadline().unwrap();
        assert!(channel.on_timer(retry_at, RETRY));
        assert_eq!(channel.state(), ChannelState::Attaching);
    }

    #[test]
    fn test_attach_timeout_suspends() {
        let mut channel = Channel::new("orders", &[]);
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        channel.begin_attach(Some(tx));
        let now = Instant::now();
        let _ = channel.attach_envelope(now, TIMEOUT);

        channel.on_timer(now + TIMEOUT, RETRY);
        assert_eq!(channel.state(), ChannelState::Suspended);
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.code, error::CODE_CHANNEL_OPERATION_TIMEOUT);
    }

    #[test]
    fn test_server_detach_of_attached_channel_suspends() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);

        channel.handle_detached(None, Instant::now(), RETRY);
        assert_eq!(channel.state(), ChannelState::Suspended);
    }

    #[test]
    fn test_explicit_detach() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);

        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let envelope = channel.begin_detach(Some(tx), Instant::now(), TIMEOUT);
        assert_eq!(envelope.unwrap().action, Action::Detach);
        assert_eq!(channel.state(), ChannelState::Detaching);

        channel.handle_detached(None, Instant::now(), RETRY);
        assert_eq!(channel.state(), ChannelState::Detached);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_channel_error_fails_channel() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);

        channel.handle_channel_error(
            ErrorInfo::new(40_160, 401, "capability denied"),
            Instant::now(),
            RETRY,
        );
        assert_eq!(channel.state(), ChannelState::Failed);
        assert_eq!(channel.error_reason().unwrap().code, 40_160);
    }

    #[test]
    fn test_transient_channel_error_suspends_for_retry() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);

        channel.handle_channel_error(
            ErrorInfo::new(50_000, 503, "server unavailable"),
            Instant::now(),
            RETRY,
        );
        assert_eq!(channel.state(), ChannelState::Suspended);

        // The retry timer re-attaches instead of leaving the channel dead.
        let retry_at = channel.next_deadline().unwrap();
        assert!(channel.on_timer(retry_at, RETRY));
        assert_eq!(channel.state(), ChannelState::Attaching);
    }

    #[test]
    fn test_reenter_failure_is_a_non_fatal_update() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);
        let mut states = channel.subscribe_state();

        channel.reenter_failed(ErrorInfo::new(40_160, 401, "presence denied"));
        assert_eq!(channel.state(), ChannelState::Attached);
        let change = states.try_recv().unwrap();
        assert_eq!(change.current, ChannelState::Attached);
        assert_eq!(change.previous, ChannelState::Attached);
        assert_eq!(change.reason.unwrap().code, 40_160);
    }

    #[test]
    fn test_message_delivery_and_serial_tracking() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);
        let mut messages = channel.subscribe_messages();

        let mut envelope = ProtocolMessage::message(
            "orders",
            vec![Message::new("update", Data::json(serde_json::json!(1)))],
        );
        envelope.channel_serial = Some("serial-5".into());
        assert!(channel
            .handle_message(&envelope, Instant::now(), TIMEOUT)
            .is_none());

        assert_eq!(messages.try_recv().unwrap().name.as_deref(), Some("update"));
        assert_eq!(channel.serial(), Some("serial-5"));
    }

    #[test]
    fn test_broken_delta_continuity_reattaches_once() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);

        let mut delta = Message::new("update", Data::json(serde_json::json!(2)));
        delta.extras = Some(ripple_protocol::MessageExtras {
            delta: Some(ripple_protocol::DeltaExtras {
                from: "msg-unknown".into(),
                format: Some("vcdiff".into()),
            }),
        });
        let envelope = ProtocolMessage::message("orders", vec![delta]);

        let recovery = channel.handle_message(&envelope, Instant::now(), TIMEOUT);
        assert_eq!(recovery.unwrap().action, Action::Attach);
        assert_eq!(channel.state(), ChannelState::Attaching);

        // A second broken delta while recovering does not re-attach again.
        assert!(channel
            .handle_message(&envelope, Instant::now(), TIMEOUT)
            .is_none());

        // ATTACHED clears the guard.
        channel.handle_attached(&attached_envelope("orders", Flags::empty()));
        assert_eq!(channel.state(), ChannelState::Attached);
    }

    #[test]
    fn test_unsupported_encoding_fails_channel() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);

        let mut message = Message::new("update", Data::json(serde_json::json!(1)));
        message.encoding = Some("zstd".into());
        let envelope = ProtocolMessage::message("orders", vec![message]);

        channel.handle_message(&envelope, Instant::now(), TIMEOUT);
        assert_eq!(channel.state(), ChannelState::Failed);
        assert_eq!(
            channel.error_reason().unwrap().code,
            error::CODE_UNSUPPORTED_CAPABILITY
        );
    }

    #[test]
    fn test_sync_pages_and_final_cursor() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);

        let mut member = PresenceMessage::new(PresenceAction::Present, "alice");
        member.connection_id = Some("c1".into());
        member.id = Some("c1:0:0".into());
        member.timestamp = Some(1_000);

        let mut page = ProtocolMessage::new(Action::Sync).with_channel("orders");
        page.presence = Some(vec![member]);
        page.channel_serial = Some("v1:cursor-1".into());
        channel.handle_sync(&page);
        assert!(channel.presence().sync_in_progress());

        let mut last = ProtocolMessage::new(Action::Sync).with_channel("orders");
        last.presence = Some(vec![]);
        last.channel_serial = Some("v1:".into());
        channel.handle_sync(&last);
        assert!(!channel.presence().sync_in_progress());
        assert_eq!(channel.presence().members().len(), 1);
    }

    #[test]
    fn test_non_resumed_reattach_reenters_own_members() {
        let mut channel = Channel::new("orders", &[]);
        channel.set_connection_id(Some("c1".into()));
        attach(&mut channel);

        let mut own = PresenceMessage::new(PresenceAction::Enter, "alice");
        own.connection_id = Some("c1".into());
        own.id = Some("c1:0:0".into());
        own.timestamp = Some(1_000);
        let mut envelope = ProtocolMessage::new(Action::Presence).with_channel("orders");
        envelope.presence = Some(vec![own]);
        channel.handle_presence(&envelope);

        // Second ATTACHED without the resumed flag: continuity lost.
        let outcome = channel.handle_attached(&attached_envelope("orders", Flags::empty()));
        assert_eq!(outcome.reenter.len(), 1);
        assert_eq!(outcome.reenter[0].action, PresenceAction::Enter);
    }

    #[test]
    fn test_connection_loss_suspends_attached_channel() {
        let mut channel = Channel::new("orders", &[]);
        attach(&mut channel);

        channel.on_connection_lost(Some(ErrorInfo::new(80_003, 408, "idle")));
        assert_eq!(channel.state(), ChannelState::Suspended);
        assert!(channel.wants_attach());
    }

    #[test]
    fn test_release_rules() {
        let mut channels = Channels::new();
        channels.get_or_create("orders", &[]);
        assert!(channels.release("orders").is_ok());

        let channel = channels.get_or_create("orders", &[]);
        attach(channel);
        assert!(channels.release("orders").is_err());
    }

    #[test]
    fn test_serials_for_recovery() {
        let mut channels = Channels::new();
        let channel = channels.get_or_create("orders", &[]);
        attach(channel);
        let mut envelope = ProtocolMessage::message(
            "orders",
            vec![Message::new("update", Data::json(serde_json::json!(1)))],
        );
        envelope.channel_serial = Some("serial-9".into());
        channel.handle_message(&envelope, Instant::now(), TIMEOUT);

        channels.get_or_create("empty", &[]);
        let serials = channels.serials();
        assert_eq!(serials.len(), 1);
        assert_eq!(serials["orders"], "serial-9");
    }
}
