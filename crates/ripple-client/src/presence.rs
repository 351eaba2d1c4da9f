//! Channel presence membership.
//!
//! A [`PresenceMap`] reconciles the stream of presence updates (live and
//! sync pages) into the channel's current member set. Conflicts between
//! updates for the same member resolve by message order: the compound id
//! `{connectionId}:{msgSerial}:{index}` gives a total order for messages
//! that originate from a single connection, and timestamps order everything
//! else (server-synthesized leaves in particular).

use std::collections::{HashMap, HashSet};

use ripple_protocol::{PresenceAction, PresenceMessage};
use tracing::{debug, trace};

fn member_key(member: &PresenceMessage) -> String {
    format!(
        "{}:{}",
        member.client_id.as_deref().unwrap_or(""),
        member.connection_id.as_deref().unwrap_or("")
    )
}

/// Whether a presence message was synthesized by the server rather than
/// published by the member's own connection.
///
/// Synthesized messages (for example a leave generated when a connection's
/// state TTL lapses) either carry no id or an id minted under a different
/// connection than the member's own.
#[must_use]
pub fn is_synthesized(member: &PresenceMessage) -> bool {
    let Some(id) = member.id.as_deref() else {
        return true;
    };
    let Some(connection_id) = member.connection_id.as_deref() else {
        return true;
    };
    !id.starts_with(&format!("{}:", connection_id))
}

fn parse_id(member: &PresenceMessage) -> Option<(i64, i64)> {
    let id = member.id.as_deref()?;
    let mut parts = id.rsplitn(3, ':');
    let index = parts.next()?.parse().ok()?;
    let serial = parts.next()?.parse().ok()?;
    parts.next()?;
    Some((serial, index))
}

/// Whether `candidate` supersedes `incumbent` for the same member.
///
/// Messages from the member's own connection compare by `(msgSerial, index)`
/// from the compound id; if either side is synthesized (or its id does not
/// parse), timestamps decide.
#[must_use]
pub fn newer_than(candidate: &PresenceMessage, incumbent: &PresenceMessage) -> bool {
    if !is_synthesized(candidate) && !is_synthesized(incumbent) {
        if let (Some(a), Some(b)) = (parse_id(candidate), parse_id(incumbent)) {
            return a > b;
        }
    }
    candidate.timestamp.unwrap_or(0) > incumbent.timestamp.unwrap_or(0)
}

/// The member set of one channel.
#[derive(Debug, Default)]
pub struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    /// Members entered through this client's own connection, keyed by client
    /// id. Used to re-enter after a non-continuous attach.
    my_members: HashMap<String, PresenceMessage>,
    self_connection_id: Option<String>,
    sync_in_progress: bool,
    /// Keys present before the sync started and not yet reconfirmed by it.
    residual: HashSet<String>,
}

impl PresenceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the connection identity that owns "my" members.
    pub fn set_self(&mut self, connection_id: Option<String>) {
        self.self_connection_id = connection_id;
    }

    #[must_use]
    pub fn sync_in_progress(&self) -> bool {
        self.sync_in_progress
    }

    /// Current members, excluding tombstones.
    #[must_use]
    pub fn members(&self) -> Vec<&PresenceMessage> {
        self.members
            .values()
            .filter(|m| m.action != PresenceAction::Absent)
            .collect()
    }

    /// A present member for a client id, if any connection has it entered.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<&PresenceMessage> {
        self.members
            .values()
            .find(|m| m.action != PresenceAction::Absent && m.client_id.as_deref() == Some(client_id))
    }

    /// Members entered through this client's own connection.
    #[must_use]
    pub fn my_members(&self) -> Vec<&PresenceMessage> {
        self.my_members.values().collect()
    }

    /// Begin (or restart) a sync pass. Existing members stay visible until
    /// the sync ends; any not reconfirmed by it are swept then.
    pub fn start_sync(&mut self) {
        debug!(members = self.members.len(), "Presence sync started");
        self.sync_in_progress = true;
        self.residual = self.members.keys().cloned().collect();
    }

    /// Apply one presence update. Returns the update when it changed the
    /// visible member set and should be surfaced to subscribers.
    pub fn apply(&mut self, incoming: PresenceMessage) -> Option<PresenceMessage> {
        let key = member_key(&incoming);
        self.residual.remove(&key);

        if let Some(current) = self.members.get(&key) {
            if !newer_than(&incoming, current) {
                trace!(member = %key, "Stale presence update ignored");
                return None;
            }
        }

        self.track_own(&incoming);

        match incoming.action {
            PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                // Enter and update both render as a present member.
                let mut stored = incoming.clone();
                stored.action = PresenceAction::Present;
                let was_absent = self
                    .members
                    .get(&key)
                    .map_or(true, |m| m.action == PresenceAction::Absent);
                self.members.insert(key, stored);
                let surface = was_absent || incoming.action == PresenceAction::Update;
                surface.then_some(incoming)
            }
            PresenceAction::Leave => {
                let was_present = if self.sync_in_progress {
                    // Tombstone so older enters arriving later in the sync
                    // cannot resurrect the member.
                    let mut tombstone = incoming.clone();
                    tombstone.action = PresenceAction::Absent;
                    self.members
                        .insert(key, tombstone)
                        .is_some_and(|m| m.action != PresenceAction::Absent)
                } else {
                    self.members
                        .remove(&key)
                        .is_some_and(|m| m.action != PresenceAction::Absent)
                };
                was_present.then_some(incoming)
            }
            PresenceAction::Absent => None,
        }
    }

    fn track_own(&mut self, incoming: &PresenceMessage) {
        let Some(self_id) = self.self_connection_id.as_deref() else {
            return;
        };
        if incoming.connection_id.as_deref() != Some(self_id) {
            return;
        }
        let Some(client_id) = incoming.client_id.clone() else {
            return;
        };
        match incoming.action {
            PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                self.my_members.insert(client_id, incoming.clone());
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                self.my_members.remove(&client_id);
            }
        }
    }

    /// Finish a sync pass.
    ///
    /// Members that existed before the sync and were not reconfirmed are
    /// removed, and a synthesized leave is returned for each so subscribers
    /// observe their departure. Tombstones accumulated during the sync are
    /// dropped.
    pub fn end_sync(&mut self) -> Vec<PresenceMessage> {
        let mut leaves = Vec::new();
        for key in std::mem::take(&mut self.residual) {
            if let Some(member) = self.members.remove(&key) {
                if member.action != PresenceAction::Absent {
                    leaves.push(synthesized_leave(member));
                }
            }
        }
        self.members
            .retain(|_, member| member.action != PresenceAction::Absent);
        self.sync_in_progress = false;
        debug!(
            members = self.members.len(),
            swept = leaves.len(),
            "Presence sync complete"
        );
        leaves
    }

    /// Drop every member, returning a synthesized leave for each. Used when
    /// the member set can no longer be trusted at all.
    pub fn clear(&mut self) -> Vec<PresenceMessage> {
        self.sync_in_progress = false;
        self.residual.clear();
        self.members
            .drain()
            .filter(|(_, m)| m.action != PresenceAction::Absent)
            .map(|(_, m)| synthesized_leave(m))
            .collect()
    }

    /// Our own entered members, prepared for automatic re-entry after a
    /// non-continuous attach.
    #[must_use]
    pub fn members_to_reenter(&self) -> Vec<PresenceMessage> {
        self.my_members
            .values()
            .map(|member| {
                let mut enter = member.clone();
                enter.action = PresenceAction::Enter;
                enter.id = None;
                enter.connection_id = None;
                enter
            })
            .collect()
    }
}

fn synthesized_leave(member: PresenceMessage) -> PresenceMessage {
    let mut leave = member;
    leave.action = PresenceAction::Leave;
    leave.id = None;
    leave
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enter(client: &str, conn: &str, serial: i64, index: i64) -> PresenceMessage {
        let mut m = PresenceMessage::new(PresenceAction::Enter, client);
        m.connection_id = Some(conn.into());
        m.id = Some(format!("{}:{}:{}", conn, serial, index));
        m.timestamp = Some(1_000 + serial as u64);
        m
    }

    fn leave(client: &str, conn: &str, serial: i64, index: i64) -> PresenceMessage {
        let mut m = enter(client, conn, serial, index);
        m.action = PresenceAction::Leave;
        m
    }

    #[test]
    fn test_enter_then_leave() {
        let mut map = PresenceMap::new();
        assert!(map.apply(enter("alice", "c1", 0, 0)).is_some());
        assert_eq!(map.members().len(), 1);

        assert!(map.apply(leave("alice", "c1", 1, 0)).is_some());
        assert!(map.members().is_empty());
    }

    #[test]
    fn test_same_client_two_connections_are_distinct_members() {
        let mut map = PresenceMap::new();
        map.apply(enter("alice", "c1", 0, 0));
        map.apply(enter("alice", "c2", 0, 0));
        assert_eq!(map.members().len(), 2);

        map.apply(leave("alice", "c1", 1, 0));
        assert_eq!(map.members().len(), 1);
        assert!(map.get("alice").is_some());
    }

    #[test]
    fn test_stale_update_is_ignored() {
        let mut map = PresenceMap::new();
        map.apply(enter("alice", "c1", 5, 0));
        // An older message for the same member arrives late.
        assert!(map.apply(leave("alice", "c1", 3, 0)).is_none());
        assert_eq!(map.members().len(), 1);
    }

    #[test]
    fn test_index_breaks_serial_ties() {
        let mut map = PresenceMap::new();
        map.apply(enter("alice", "c1", 2, 1));
        assert!(map.apply(leave("alice", "c1", 2, 0)).is_none());
        assert!(map.apply(leave("alice", "c1", 2, 2)).is_some());
        assert!(map.members().is_empty());
    }

    #[test]
    fn test_synthesized_messages_order_by_timestamp() {
        let mut map = PresenceMap::new();
        let mut entered = enter("alice", "c1", 0, 0);
        entered.timestamp = Some(2_000);
        map.apply(entered);

        // Server-synthesized leave: no id, ordered by timestamp.
        let mut synth = PresenceMessage::new(PresenceAction::Leave, "alice");
        synth.connection_id = Some("c1".into());
        synth.timestamp = Some(1_500);
        assert!(map.apply(synth.clone()).is_none());

        synth.timestamp = Some(2_500);
        assert!(map.apply(synth).is_some());
        assert!(map.members().is_empty());
    }

    #[test]
    fn test_sync_sweeps_unconfirmed_members() {
        let mut map = PresenceMap::new();
        map.apply(enter("alice", "c1", 0, 0));
        map.apply(enter("bob", "c2", 0, 0));

        map.start_sync();
        map.apply(enter("alice", "c1", 0, 0));
        let leaves = map.end_sync();

        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].client_id.as_deref(), Some("bob"));
        assert_eq!(leaves[0].action, PresenceAction::Leave);
        assert!(is_synthesized(&leaves[0]));
        assert_eq!(map.members().len(), 1);
    }

    #[test]
    fn test_sync_replay_is_idempotent() {
        let mut map = PresenceMap::new();
        map.start_sync();
        map.apply(enter("alice", "c1", 0, 0));
        map.apply(enter("bob", "c2", 0, 0));
        // The same page delivered again after a transport hiccup.
        map.apply(enter("alice", "c1", 0, 0));
        map.apply(enter("bob", "c2", 0, 0));
        let leaves = map.end_sync();

        assert!(leaves.is_empty());
        assert_eq!(map.members().len(), 2);
    }

    #[test]
    fn test_leave_during_sync_tombstones() {
        let mut map = PresenceMap::new();
        map.start_sync();
        map.apply(leave("alice", "c1", 5, 0));
        // An older enter later in the sync cannot resurrect the member.
        assert!(map.apply(enter("alice", "c1", 3, 0)).is_none());
        map.end_sync();
        assert!(map.members().is_empty());
    }

    #[test]
    fn test_own_members_tracked_for_reentry() {
        let mut map = PresenceMap::new();
        map.set_self(Some("c1".into()));
        map.apply(enter("alice", "c1", 0, 0));
        map.apply(enter("bob", "c2", 0, 0));

        let reenter = map.members_to_reenter();
        assert_eq!(reenter.len(), 1);
        assert_eq!(reenter[0].client_id.as_deref(), Some("alice"));
        assert_eq!(reenter[0].action, PresenceAction::Enter);
        assert!(reenter[0].id.is_none());
    }

    #[test]
    fn test_clear_synthesizes_leaves_for_all() {
        let mut map = PresenceMap::new();
        map.apply(enter("alice", "c1", 0, 0));
        map.apply(enter("bob", "c2", 0, 0));

        let leaves = map.clear();
        assert_eq!(leaves.len(), 2);
        assert!(map.members().is_empty());
    }
}
