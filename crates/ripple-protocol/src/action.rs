//! Protocol action identifiers.
//!
//! Every envelope on the wire carries exactly one action. The numeric values
//! are part of the wire contract and must not be reordered.

use serde::{Deserialize, Serialize};

/// Envelope action identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Action {
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
    Auth = 17,
    Activate = 18,
    State = 19,
    StateSync = 20,
    Annotation = 21,
}

impl Action {
    /// Whether an outbound envelope with this action requires an ACK.
    ///
    /// Only data-bearing actions are serialled and acknowledged.
    #[must_use]
    pub fn ack_required(self) -> bool {
        matches!(
            self,
            Action::Message | Action::Presence | Action::Annotation | Action::State
        )
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0 => Ok(Action::Heartbeat),
            1 => Ok(Action::Ack),
            2 => Ok(Action::Nack),
            3 => Ok(Action::Connect),
            4 => Ok(Action::Connected),
            5 => Ok(Action::Disconnect),
            6 => Ok(Action::Disconnected),
            7 => Ok(Action::Close),
            8 => Ok(Action::Closed),
            9 => Ok(Action::Error),
            10 => Ok(Action::Attach),
            11 => Ok(Action::Attached),
            12 => Ok(Action::Detach),
            13 => Ok(Action::Detached),
            14 => Ok(Action::Presence),
            15 => Ok(Action::Message),
            16 => Ok(Action::Sync),
            17 => Ok(Action::Auth),
            18 => Ok(Action::Activate),
            19 => Ok(Action::State),
            20 => Ok(Action::StateSync),
            21 => Ok(Action::Annotation),
            _ => Err("Invalid action"),
        }
    }
}

/// Presence event identifiers carried inside PRESENCE and SYNC envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PresenceAction {
    /// Tombstone recorded while a sync is in progress.
    Absent = 0,
    /// Member was already in the set when the sync started.
    Present = 1,
    /// Member entered the channel.
    Enter = 2,
    /// Member left the channel.
    Leave = 3,
    /// Member updated its presence data.
    Update = 4,
}

impl From<PresenceAction> for u8 {
    fn from(action: PresenceAction) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Absent),
            1 => Ok(PresenceAction::Present),
            2 => Ok(PresenceAction::Enter),
            3 => Ok(PresenceAction::Leave),
            4 => Ok(PresenceAction::Update),
            _ => Err("Invalid presence action"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_roundtrip() {
        for raw in 0..=21u8 {
            let action = Action::try_from(raw).unwrap();
            assert_eq!(u8::from(action), raw);
        }
        assert!(Action::try_from(22).is_err());
    }

    #[test]
    fn test_ack_required() {
        assert!(Action::Message.ack_required());
        assert!(Action::Presence.ack_required());
        assert!(Action::Annotation.ack_required());
        assert!(!Action::Attach.ack_required());
        assert!(!Action::Heartbeat.ack_required());
    }

    #[test]
    fn test_presence_action_conversion() {
        assert_eq!(PresenceAction::try_from(2), Ok(PresenceAction::Enter));
        assert_eq!(PresenceAction::try_from(3), Ok(PresenceAction::Leave));
        assert!(PresenceAction::try_from(5).is_err());
    }
}
