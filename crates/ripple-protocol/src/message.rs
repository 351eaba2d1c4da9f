//! Envelope and payload types for the Ripple protocol.
//!
//! A [`ProtocolMessage`] is one wire-level unit: an action plus zero or more
//! payload sub-messages (data messages, presence updates or annotations).
//! Field names are camelCase on the wire in both the JSON and MessagePack
//! renditions.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::action::{Action, PresenceAction};
use crate::flags::Flags;

/// A structured protocol error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Application error code.
    #[serde(default)]
    pub code: u32,
    /// HTTP-equivalent status code.
    #[serde(default)]
    pub status_code: u16,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Create a new error.
    #[must_use]
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (code: {}, status: {})",
            self.message, self.code, self.status_code
        )
    }
}

impl std::error::Error for ErrorInfo {}

/// Connection properties advertised by the server in CONNECTED.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    /// Resumption key for this connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Client identity confirmed by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Maximum interval between inbound activity, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
    /// Maximum encoded envelope size, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
    /// How long the server retains connection state after a drop, in ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
}

/// A message payload: raw bytes or structured JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Data {
    /// Binary payload.
    Binary(ByteBuf),
    /// JSON payload.
    Json(serde_json::Value),
}

impl Data {
    /// Binary payload from raw bytes.
    #[must_use]
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Data::Binary(ByteBuf::from(bytes.into()))
    }

    /// JSON payload.
    #[must_use]
    pub fn json(value: serde_json::Value) -> Self {
        Data::Json(value)
    }

    /// Approximate encoded size, used for bundling decisions.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Data::Binary(bytes) => bytes.len(),
            Data::Json(value) => value.to_string().len(),
        }
    }
}

/// Delta-encoding descriptor attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaExtras {
    /// Id of the message this delta was computed against.
    pub from: String,
    /// Delta format identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Extensible message extras.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageExtras {
    /// Present when the payload is delta-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<DeltaExtras>,
}

/// A data message carried in a MESSAGE envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message id, assigned by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Publishing client identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Publishing connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
    /// Payload encoding chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// Server timestamp in epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Message extras (delta descriptor etc).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<MessageExtras>,
}

impl Message {
    /// Create a named message with a payload.
    #[must_use]
    pub fn new(name: impl Into<String>, data: Data) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Approximate encoded size, used for bundling decisions.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.as_ref().map_or(0, Data::size)
            + self.name.as_ref().map_or(0, String::len)
            + self.client_id.as_ref().map_or(0, String::len)
    }
}

/// A membership update carried in a PRESENCE or SYNC envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    /// Membership action.
    pub action: PresenceAction,
    /// Compound id `{connectionId}:{msgSerial}:{index}`, assigned by the
    /// server. Absent on synthesized members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Member client identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Owning connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Presence payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
    /// Timestamp in epoch milliseconds; ordering fallback for synthesized
    /// members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl PresenceMessage {
    /// Create a presence update for a client.
    #[must_use]
    pub fn new(action: PresenceAction, client_id: impl Into<String>) -> Self {
        Self {
            action,
            id: None,
            client_id: Some(client_id.into()),
            connection_id: None,
            data: None,
            timestamp: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Data) -> Self {
        self.data = Some(data);
        self
    }

    /// Approximate encoded size, used for bundling decisions.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.as_ref().map_or(0, Data::size) + self.client_id.as_ref().map_or(0, String::len)
    }
}

/// A message annotation carried in an ANNOTATION envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    /// Annotation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Serial of the annotated message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_serial: Option<String>,
    /// Annotation type.
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub kind: Option<String>,
    /// Annotating client identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Annotation payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
}

/// The wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    /// Envelope action.
    pub action: Action,
    /// Target channel name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Channel-continuity cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    /// Connection identity (CONNECTED).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Connection properties (CONNECTED).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    /// Outbound serial (data-bearing envelopes) or ACK/NACK range start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    /// ACK/NACK range width.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Data messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    /// Presence updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
    /// Annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<Annotation>>,
    /// Capability/mode and attach-state bits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<Flags>,
    /// Structured error (ERROR, DISCONNECTED, NACK...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Server timestamp in epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl ProtocolMessage {
    /// Create an envelope with the given action and no other fields.
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            channel: None,
            channel_serial: None,
            connection_id: None,
            connection_details: None,
            msg_serial: None,
            count: None,
            messages: None,
            presence: None,
            annotations: None,
            flags: None,
            error: None,
            timestamp: None,
        }
    }

    /// Target a channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Set the flag bitfield.
    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Create an ATTACH envelope.
    #[must_use]
    pub fn attach(channel: impl Into<String>, flags: Flags) -> Self {
        let mut msg = Self::new(Action::Attach).with_channel(channel);
        if !flags.is_empty() {
            msg.flags = Some(flags);
        }
        msg
    }

    /// Create a DETACH envelope.
    #[must_use]
    pub fn detach(channel: impl Into<String>) -> Self {
        Self::new(Action::Detach).with_channel(channel)
    }

    /// Create a MESSAGE envelope.
    #[must_use]
    pub fn message(channel: impl Into<String>, messages: Vec<Message>) -> Self {
        let mut msg = Self::new(Action::Message).with_channel(channel);
        msg.messages = Some(messages);
        msg
    }

    /// Create a PRESENCE envelope.
    #[must_use]
    pub fn presence(channel: impl Into<String>, presence: Vec<PresenceMessage>) -> Self {
        let mut msg = Self::new(Action::Presence).with_channel(channel);
        msg.presence = Some(presence);
        msg
    }

    /// Create a CLOSE envelope.
    #[must_use]
    pub fn close() -> Self {
        Self::new(Action::Close)
    }

    /// The flag bitfield, empty when absent.
    #[must_use]
    pub fn flag_set(&self) -> Flags {
        self.flags.unwrap_or_default()
    }

    /// Total payload sub-message count across all payload arrays.
    #[must_use]
    pub fn payload_count(&self) -> usize {
        self.messages.as_ref().map_or(0, Vec::len)
            + self.presence.as_ref().map_or(0, Vec::len)
            + self.annotations.as_ref().map_or(0, Vec::len)
    }

    /// Approximate encoded payload size, used for bundling decisions.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        let messages: usize = self
            .messages
            .iter()
            .flatten()
            .map(Message::size)
            .sum();
        let presence: usize = self
            .presence
            .iter()
            .flatten()
            .map(PresenceMessage::size)
            .sum();
        messages + presence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_constructors() {
        let attach = ProtocolMessage::attach("news", Flags::SUBSCRIBE);
        assert_eq!(attach.action, Action::Attach);
        assert_eq!(attach.channel.as_deref(), Some("news"));
        assert!(attach.flag_set().contains(Flags::SUBSCRIBE));

        let bare = ProtocolMessage::new(Action::Heartbeat);
        assert!(bare.flags.is_none());
        assert!(bare.flag_set().is_empty());
    }

    #[test]
    fn test_payload_count() {
        let mut msg = ProtocolMessage::message(
            "news",
            vec![Message::new("a", Data::json(serde_json::json!(1)))],
        );
        msg.presence = Some(vec![PresenceMessage::new(PresenceAction::Enter, "alice")]);
        assert_eq!(msg.payload_count(), 2);
    }

    #[test]
    fn test_error_info_display() {
        let err = ErrorInfo::new(40142, 401, "token expired");
        assert!(err.to_string().contains("40142"));
        assert!(err.to_string().contains("token expired"));
    }
}
