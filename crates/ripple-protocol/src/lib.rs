//! # ripple-protocol
//!
//! Wire protocol definitions for the Ripple realtime client.
//!
//! This crate defines the envelope exchanged between client and service,
//! the action and flag vocabulary, the structured error type, the
//! binary/text codec, and the recovery-token format.
//!
//! ## Envelope
//!
//! A [`ProtocolMessage`] carries one action plus zero or more payload
//! sub-messages (data messages, presence updates, annotations).
//!
//! ## Example
//!
//! ```rust
//! use ripple_protocol::{codec, Flags, ProtocolMessage, WireFormat};
//!
//! let attach = ProtocolMessage::attach("chat:lobby", Flags::SUBSCRIBE);
//! let encoded = codec::encode(&attach, WireFormat::MsgPack).unwrap();
//! let decoded = codec::decode(&encoded, WireFormat::MsgPack).unwrap();
//! assert_eq!(attach, decoded);
//! ```

pub mod action;
pub mod codec;
pub mod flags;
pub mod message;
pub mod recovery;

pub use action::{Action, PresenceAction};
pub use codec::{decode, encode, ProtocolError, WireFormat, MAX_ENVELOPE_SIZE};
pub use flags::{ChannelMode, Flags};
pub use message::{
    Annotation, ConnectionDetails, Data, DeltaExtras, ErrorInfo, Message, MessageExtras,
    PresenceMessage, ProtocolMessage,
};
pub use recovery::RecoveryContext;
