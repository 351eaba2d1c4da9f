//! Outbound message accounting.
//!
//! Two queues cooperate on the send path. The connection-level queue holds
//! envelopes built while no transport is sending, and is where compatible
//! payloads are bundled. The per-transport [`MessageQueue`] holds envelopes
//! that have been written to the active transport and await ACK or NACK;
//! its serial accounting is strictly head-anchored, mirroring the server's
//! in-order acknowledgement guarantee.

use std::collections::VecDeque;

use ripple_protocol::{Action, ErrorInfo, ProtocolMessage};
use tokio::sync::oneshot;
use tracing::warn;

use crate::error;

/// Completion side of a publish or presence operation.
pub type Completer = oneshot::Sender<Result<(), ErrorInfo>>;

/// An envelope owned by the send pipeline.
#[derive(Debug)]
pub struct PendingMessage {
    /// The envelope itself. Its serial is assigned at most once, at first
    /// transmission.
    pub message: ProtocolMessage,
    /// Whether the envelope participates in ACK accounting.
    pub ack_required: bool,
    /// Whether the envelope has been written to any transport.
    pub send_attempted: bool,
    completers: Vec<Completer>,
}

impl PendingMessage {
    /// Wrap an envelope for the send pipeline.
    #[must_use]
    pub fn new(message: ProtocolMessage, completer: Option<Completer>) -> Self {
        let ack_required = message.action.ack_required();
        Self {
            message,
            ack_required,
            send_attempted: false,
            completers: completer.into_iter().collect(),
        }
    }

    /// Resolve every caller waiting on this envelope.
    pub fn complete(&mut self, result: &Result<(), ErrorInfo>) {
        for completer in self.completers.drain(..) {
            let _ = completer.send(result.clone());
        }
    }

    /// Forget transmission state so the envelope can be retried on a new
    /// transport. The serial, if one was assigned, is kept.
    pub fn reset_for_retry(&mut self) {
        self.send_attempted = false;
    }

    /// Forget the assigned serial as well; used when the connection identity
    /// changes and the serial sequence restarts.
    pub fn reset_serial(&mut self) {
        self.send_attempted = false;
        self.message.msg_serial = None;
    }
}

/// Try to merge `next` into `last`, the newest queued envelope.
///
/// Succeeds only when both are unsent payload envelopes of the same action
/// on the same channel, no payload has a preassigned id, the client
/// identities agree, and the merged payload stays under `max_size`. On
/// failure `next` is handed back untouched.
pub fn bundle_into(
    last: &mut PendingMessage,
    next: PendingMessage,
    max_size: usize,
) -> Result<(), PendingMessage> {
    if !can_bundle(last, &next, max_size) {
        return Err(next);
    }
    let PendingMessage {
        message, completers, ..
    } = next;
    if let Some(mut incoming) = message.messages {
        last.message
            .messages
            .get_or_insert_with(Vec::new)
            .append(&mut incoming);
    }
    if let Some(mut incoming) = message.presence {
        last.message
            .presence
            .get_or_insert_with(Vec::new)
            .append(&mut incoming);
    }
    last.completers.extend(completers);
    Ok(())
}

fn can_bundle(last: &PendingMessage, next: &PendingMessage, max_size: usize) -> bool {
    if last.send_attempted || last.message.msg_serial.is_some() {
        return false;
    }
    if last.message.action != next.message.action {
        return false;
    }
    if !matches!(last.message.action, Action::Message | Action::Presence) {
        return false;
    }
    if last.message.channel != next.message.channel {
        return false;
    }
    if last.message.payload_size() + next.message.payload_size() > max_size {
        return false;
    }
    // Preassigned ids pin a payload to its own envelope.
    let has_ids = |m: &ProtocolMessage| m.messages.iter().flatten().any(|msg| msg.id.is_some());
    if has_ids(&last.message) || has_ids(&next.message) {
        return false;
    }
    client_identity(&last.message) == client_identity(&next.message)
}

/// The single client identity of an envelope's payloads, if they agree.
fn client_identity(message: &ProtocolMessage) -> Option<Option<&str>> {
    let mut ids = message
        .messages
        .iter()
        .flatten()
        .map(|m| m.client_id.as_deref())
        .chain(
            message
                .presence
                .iter()
                .flatten()
                .map(|p| p.client_id.as_deref()),
        );
    let first = ids.next()?;
    for id in ids {
        if id != first {
            return None;
        }
    }
    Some(first)
}

/// Envelopes written to the active transport, awaiting ACK or NACK.
#[derive(Debug, Default)]
pub struct MessageQueue {
    pending: VecDeque<PendingMessage>,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Record an envelope written to the transport.
    pub fn push(&mut self, message: PendingMessage) {
        debug_assert!(message.ack_required);
        debug_assert!(message.message.msg_serial.is_some());
        self.pending.push_back(message);
    }

    /// Acknowledge `count` envelopes starting at `serial`, resolving their
    /// callers successfully.
    ///
    /// The range must start exactly at the queue head; anything else means
    /// the two sides disagree about the serial sequence.
    pub fn ack(&mut self, serial: i64, count: u32) -> Result<(), ErrorInfo> {
        self.complete_range(serial, count, &Ok(()))
    }

    /// Reject `count` envelopes starting at `serial`, resolving their
    /// callers with `error`.
    pub fn nack(
        &mut self,
        serial: i64,
        count: u32,
        error: Option<ErrorInfo>,
    ) -> Result<(), ErrorInfo> {
        let error = error.unwrap_or_else(|| {
            ErrorInfo::new(50_001, 500, "Message delivery refused by the server")
        });
        self.complete_range(serial, count, &Err(error))
    }

    fn complete_range(
        &mut self,
        serial: i64,
        count: u32,
        result: &Result<(), ErrorInfo>,
    ) -> Result<(), ErrorInfo> {
        let Some(head) = self.pending.front() else {
            return Err(error::protocol_violation(
                "ACK received with no messages pending",
            ));
        };
        let head_serial = head.message.msg_serial.unwrap_or_default();
        if serial != head_serial {
            warn!(
                serial,
                head_serial, "ACK range does not start at the queue head"
            );
            return Err(error::protocol_violation(
                "ACK range does not start at the queue head",
            ));
        }
        let take = (count as usize).min(self.pending.len());
        for mut message in self.pending.drain(..take) {
            message.complete(result);
        }
        Ok(())
    }

    /// Remove every pending envelope, clearing transmission state so the
    /// caller can requeue them on a replacement transport.
    pub fn drain_for_retry(&mut self) -> Vec<PendingMessage> {
        self.pending
            .drain(..)
            .map(|mut m| {
                m.reset_for_retry();
                m
            })
            .collect()
    }

    /// Fail every pending envelope with `error`.
    pub fn fail_all(&mut self, error: &ErrorInfo) {
        for mut message in self.pending.drain(..) {
            message.complete(&Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_protocol::{Data, Message};

    fn envelope(serial: i64) -> PendingMessage {
        let mut pm = PendingMessage::new(
            ProtocolMessage::message(
                "orders",
                vec![Message::new("update", Data::json(serde_json::json!({"n": serial})))],
            ),
            None,
        );
        pm.message.msg_serial = Some(serial);
        pm.send_attempted = true;
        pm
    }

    fn tracked_envelope(serial: i64) -> (PendingMessage, oneshot::Receiver<Result<(), ErrorInfo>>) {
        let (tx, rx) = oneshot::channel();
        let mut pm = PendingMessage::new(
            ProtocolMessage::message(
                "orders",
                vec![Message::new("update", Data::json(serde_json::json!({"n": serial})))],
            ),
            Some(tx),
        );
        pm.message.msg_serial = Some(serial);
        pm.send_attempted = true;
        (pm, rx)
    }

    #[test]
    fn test_ack_resolves_in_order() {
        let mut queue = MessageQueue::new();
        let (m0, rx0) = tracked_envelope(0);
        let (m1, rx1) = tracked_envelope(1);
        let (m2, rx2) = tracked_envelope(2);
        queue.push(m0);
        queue.push(m1);
        queue.push(m2);

        queue.ack(0, 2).unwrap();
        assert!(rx0.blocking_recv().unwrap().is_ok());
        assert!(rx1.blocking_recv().unwrap().is_ok());
        assert_eq!(queue.len(), 1);

        queue.ack(2, 1).unwrap();
        assert!(rx2.blocking_recv().unwrap().is_ok());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_nack_carries_error_to_callers() {
        let mut queue = MessageQueue::new();
        let (m5, rx5) = tracked_envelope(5);
        let (m6, rx6) = tracked_envelope(6);
        queue.push(m5);
        queue.push(m6);

        let reason = ErrorInfo::new(40_160, 401, "operation not permitted");
        queue.nack(5, 2, Some(reason.clone())).unwrap();

        assert_eq!(rx5.blocking_recv().unwrap().unwrap_err().code, 40_160);
        assert_eq!(rx6.blocking_recv().unwrap().unwrap_err().code, 40_160);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_gapped_ack_is_a_protocol_violation() {
        let mut queue = MessageQueue::new();
        queue.push(envelope(0));
        queue.push(envelope(1));

        let err = queue.ack(1, 1).unwrap_err();
        assert_eq!(err.code, error::CODE_PROTOCOL_VIOLATION);
        // Nothing was completed.
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_ack_with_empty_queue_is_a_protocol_violation() {
        let mut queue = MessageQueue::new();
        assert!(queue.ack(0, 1).is_err());
    }

    #[test]
    fn test_drain_for_retry_clears_send_state() {
        let mut queue = MessageQueue::new();
        queue.push(envelope(0));
        queue.push(envelope(1));

        let drained = queue.drain_for_retry();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|m| !m.send_attempted));
        // Serials survive: a resume retransmits under the same serials.
        assert_eq!(drained[0].message.msg_serial, Some(0));
    }

    #[test]
    fn test_bundling_merges_compatible_payloads() {
        let mut last = PendingMessage::new(
            ProtocolMessage::message(
                "orders",
                vec![Message::new("a", Data::json(serde_json::json!(1)))],
            ),
            None,
        );
        let next = PendingMessage::new(
            ProtocolMessage::message(
                "orders",
                vec![Message::new("b", Data::json(serde_json::json!(2)))],
            ),
            None,
        );
        bundle_into(&mut last, next, 64 * 1024).unwrap();
        assert_eq!(last.message.messages.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_bundling_is_all_or_nothing_on_size() {
        let big = "x".repeat(100);
        let mut last = PendingMessage::new(
            ProtocolMessage::message(
                "orders",
                vec![Message::new("a", Data::json(serde_json::json!(big.clone())))],
            ),
            None,
        );
        let next = PendingMessage::new(
            ProtocolMessage::message(
                "orders",
                vec![Message::new("b", Data::json(serde_json::json!(big)))],
            ),
            None,
        );
        let refused = bundle_into(&mut last, next, 150).unwrap_err();
        assert_eq!(last.message.messages.as_ref().unwrap().len(), 1);
        assert_eq!(refused.message.messages.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_bundling_refuses_across_channels_and_identities() {
        let mut last = PendingMessage::new(
            ProtocolMessage::message(
                "orders",
                vec![Message::new("a", Data::json(serde_json::json!(1)))],
            ),
            None,
        );
        let other_channel = PendingMessage::new(
            ProtocolMessage::message(
                "invoices",
                vec![Message::new("b", Data::json(serde_json::json!(2)))],
            ),
            None,
        );
        assert!(bundle_into(&mut last, other_channel, 64 * 1024).is_err());

        let mut named = Message::new("c", Data::json(serde_json::json!(3)));
        named.client_id = Some("alice".into());
        let other_identity =
            PendingMessage::new(ProtocolMessage::message("orders", vec![named]), None);
        assert!(bundle_into(&mut last, other_identity, 64 * 1024).is_err());
    }

    #[test]
    fn test_bundling_refuses_sent_envelopes() {
        let mut last = envelope(0);
        let next = PendingMessage::new(
            ProtocolMessage::message(
                "orders",
                vec![Message::new("b", Data::json(serde_json::json!(2)))],
            ),
            None,
        );
        assert!(bundle_into(&mut last, next, 64 * 1024).is_err());
    }
}
