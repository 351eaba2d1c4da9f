//! Envelope flag bitfield.
//!
//! ATTACH envelopes carry requested channel modes; ATTACHED echoes the
//! negotiated modes plus attach-state bits (presence, backlog, resumed).

use serde::{Deserialize, Serialize};

/// Bitfield carried in the `flags` field of an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(pub u32);

impl Flags {
    /// Channel has existing presence members (an attach will start a sync).
    pub const HAS_PRESENCE: Flags = Flags(1);
    /// Channel has a message backlog preserved across the attach.
    pub const HAS_BACKLOG: Flags = Flags(1 << 1);
    /// Connection or channel continuity was preserved by the server.
    pub const RESUMED: Flags = Flags(1 << 2);
    /// Client asserts it had previously been attached to this channel.
    pub const ATTACH_RESUME: Flags = Flags(1 << 5);

    // Channel mode bits.
    pub const PRESENCE: Flags = Flags(1 << 16);
    pub const PUBLISH: Flags = Flags(1 << 17);
    pub const SUBSCRIBE: Flags = Flags(1 << 18);
    pub const PRESENCE_SUBSCRIBE: Flags = Flags(1 << 19);
    pub const ANNOTATION_PUBLISH: Flags = Flags(1 << 21);
    pub const ANNOTATION_SUBSCRIBE: Flags = Flags(1 << 22);

    /// All mode bits.
    pub const MODE_MASK: Flags = Flags(
        Self::PRESENCE.0
            | Self::PUBLISH.0
            | Self::SUBSCRIBE.0
            | Self::PRESENCE_SUBSCRIBE.0
            | Self::ANNOTATION_PUBLISH.0
            | Self::ANNOTATION_SUBSCRIBE.0,
    );

    /// Empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Check whether all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    /// Set the bits of `other` in place.
    pub fn set(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    /// The mode bits only.
    #[must_use]
    pub const fn modes(self) -> Flags {
        Flags(self.0 & Self::MODE_MASK.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// A channel mode requested at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    Presence,
    Publish,
    Subscribe,
    PresenceSubscribe,
    AnnotationPublish,
    AnnotationSubscribe,
}

impl ChannelMode {
    /// The flag bit corresponding to this mode.
    #[must_use]
    pub const fn flag(self) -> Flags {
        match self {
            ChannelMode::Presence => Flags::PRESENCE,
            ChannelMode::Publish => Flags::PUBLISH,
            ChannelMode::Subscribe => Flags::SUBSCRIBE,
            ChannelMode::PresenceSubscribe => Flags::PRESENCE_SUBSCRIBE,
            ChannelMode::AnnotationPublish => Flags::ANNOTATION_PUBLISH,
            ChannelMode::AnnotationSubscribe => Flags::ANNOTATION_SUBSCRIBE,
        }
    }

    /// Fold a set of modes into a flag bitfield.
    #[must_use]
    pub fn to_flags(modes: &[ChannelMode]) -> Flags {
        modes
            .iter()
            .fold(Flags::empty(), |acc, mode| acc.union(mode.flag()))
    }

    /// Extract the modes present in a flag bitfield.
    #[must_use]
    pub fn from_flags(flags: Flags) -> Vec<ChannelMode> {
        [
            ChannelMode::Presence,
            ChannelMode::Publish,
            ChannelMode::Subscribe,
            ChannelMode::PresenceSubscribe,
            ChannelMode::AnnotationPublish,
            ChannelMode::AnnotationSubscribe,
        ]
        .into_iter()
        .filter(|mode| flags.contains(mode.flag()))
        .collect()
    }
}
