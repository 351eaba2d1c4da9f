//! Inbound envelope routing shared by all carriers.
//!
//! Lifecycle envelopes (CONNECTED, DISCONNECTED, connection-scoped ERROR,
//! HEARTBEAT) become transport lifecycle events; everything else is forwarded
//! raw for the connection manager to route.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::mpsc;

use ripple_protocol::{Action, ErrorInfo, ProtocolMessage};

use crate::traits::{TransportEvent, CODE_CONNECTION_CLOSED, IDLE_GRACE};

/// Route one decoded inbound envelope.
///
/// Returns `Break` when the envelope terminates this transport.
pub(crate) fn route_inbound(
    message: ProtocolMessage,
    events: &mpsc::UnboundedSender<TransportEvent>,
    idle_budget: &mut Duration,
    set_connected: impl FnOnce(bool),
) -> ControlFlow<()> {
    match message.action {
        Action::Connected => {
            let details = message.connection_details.clone().unwrap_or_default();
            if let Some(max_idle) = details.max_idle_interval {
                *idle_budget = Duration::from_millis(max_idle) + IDLE_GRACE;
            }
            set_connected(true);
            let _ = events.send(TransportEvent::Connected {
                connection_id: message.connection_id.clone().unwrap_or_default(),
                details,
                error: message.error,
            });
            ControlFlow::Continue(())
        }
        Action::Disconnected => {
            set_connected(false);
            let _ = events.send(TransportEvent::Disconnected {
                error: message
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(CODE_CONNECTION_CLOSED, 0, "Disconnected")),
            });
            ControlFlow::Break(())
        }
        Action::Error if message.channel.is_none() => {
            set_connected(false);
            let _ = events.send(TransportEvent::Failed {
                error: message
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(CODE_CONNECTION_CLOSED, 500, "Error")),
            });
            ControlFlow::Break(())
        }
        Action::Heartbeat => {
            let _ = events.send(TransportEvent::Heartbeat);
            ControlFlow::Continue(())
        }
        _ => {
            let _ = events.send(TransportEvent::Message { message });
            ControlFlow::Continue(())
        }
    }
}
