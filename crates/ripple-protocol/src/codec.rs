//! Codec for encoding and decoding protocol envelopes.
//!
//! Two wire formats share one envelope model: MessagePack for binary-capable
//! carriers and JSON for text-only ones (long-poll responses, debugging).
//! One encoded blob is exactly one envelope; the carrier provides framing.

use bytes::Bytes;
use thiserror::Error;

use crate::message::ProtocolMessage;

/// Maximum encoded envelope size (16 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Wire format negotiated for a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WireFormat {
    /// MessagePack binary encoding.
    #[default]
    MsgPack,
    /// JSON text encoding.
    Json,
}

impl WireFormat {
    /// Format name as used in connect query parameters.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::MsgPack => "msgpack",
            WireFormat::Json => "json",
        }
    }
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    EnvelopeTooLarge(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid envelope data.
    #[error("Invalid envelope: {0}")]
    Invalid(String),
}

/// Encode one envelope in the given wire format.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode(message: &ProtocolMessage, format: WireFormat) -> Result<Bytes, ProtocolError> {
    let payload = match format {
        WireFormat::MsgPack => rmp_serde::to_vec_named(message)?,
        WireFormat::Json => serde_json::to_vec(message)?,
    };

    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode one envelope from bytes in the given wire format.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid envelope.
pub fn decode(data: &[u8], format: WireFormat) -> Result<ProtocolMessage, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(data.len()));
    }

    let message = match format {
        WireFormat::MsgPack => rmp_serde::from_slice(data)?,
        WireFormat::Json => serde_json::from_slice(data)?,
    };
    Ok(message)
}

/// Decode a batch of envelopes from a single JSON array body.
///
/// Long-poll responses deliver envelopes in batches.
///
/// # Errors
///
/// Returns an error if the body is not a JSON array of envelopes.
pub fn decode_batch(data: &[u8]) -> Result<Vec<ProtocolMessage>, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(data.len()));
    }
    let messages = serde_json::from_slice(data)?;
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, PresenceAction};
    use crate::flags::Flags;
    use crate::message::{Data, Message, PresenceMessage};

    fn sample_envelopes() -> Vec<ProtocolMessage> {
        let mut connected = ProtocolMessage::new(Action::Connected);
        connected.connection_id = Some("conn-1".into());

        let mut ack = ProtocolMessage::new(Action::Ack);
        ack.msg_serial = Some(3);
        ack.count = Some(2);

        vec![
            connected,
            ack,
            ProtocolMessage::attach("chat:lobby", Flags::SUBSCRIBE.union(Flags::PUBLISH)),
            ProtocolMessage::message(
                "chat:lobby",
                vec![Message::new("greet", Data::binary(b"hello".to_vec()))],
            ),
            ProtocolMessage::presence(
                "chat:lobby",
                vec![PresenceMessage::new(PresenceAction::Enter, "alice")],
            ),
        ]
    }

    #[test]
    fn test_roundtrip_both_formats() {
        for format in [WireFormat::MsgPack, WireFormat::Json] {
            for message in sample_envelopes() {
                let encoded = encode(&message, format).unwrap();
                let decoded = decode(&encoded, format).unwrap();
                assert_eq!(message, decoded, "format {:?}", format);
            }
        }
    }

    #[test]
    fn test_envelope_too_large() {
        let message = ProtocolMessage::message(
            "big",
            vec![Message::new(
                "blob",
                Data::binary(vec![0u8; MAX_ENVELOPE_SIZE + 1]),
            )],
        );

        match encode(&message, WireFormat::MsgPack) {
            Err(ProtocolError::EnvelopeTooLarge(_)) => {}
            other => panic!("Expected EnvelopeTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_batch() {
        let body = serde_json::to_vec(&sample_envelopes()).unwrap();
        let decoded = decode_batch(&body).unwrap();
        assert_eq!(decoded.len(), 5);
        assert_eq!(decoded[0].action, Action::Connected);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode(b"not an envelope", WireFormat::Json).is_err());
    }
}
