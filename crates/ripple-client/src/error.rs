//! Error classification.
//!
//! The connection manager's retry policy is driven entirely by the shape of
//! the [`ErrorInfo`] attached to a disconnection: whether it is retryable,
//! whether it is a token problem the client can fix by reauthorizing, and
//! whether it is terminal.

use ripple_protocol::ErrorInfo;

/// Connection failed and cannot proceed.
pub const CODE_CONNECTION_FAILED: u32 = 80_000;
/// Connection entered the suspended state.
pub const CODE_CONNECTION_SUSPENDED: u32 = 80_002;
/// Connection was closed by request.
pub const CODE_CONNECTION_CLOSED: u32 = 80_017;
/// Server-side state for the connection could not be recovered.
pub const CODE_UNABLE_TO_RECOVER: u32 = 80_008;
/// Channel operation failed.
pub const CODE_CHANNEL_OPERATION_FAILED: u32 = 90_001;
/// Channel operation timed out awaiting the server's response.
pub const CODE_CHANNEL_OPERATION_TIMEOUT: u32 = 90_007;
/// The server sent content the client cannot decode.
pub const CODE_UNSUPPORTED_CAPABILITY: u32 = 40_019;
/// Internal accounting violation in the ACK protocol.
pub const CODE_PROTOCOL_VIOLATION: u32 = 80_013;

/// Transient connection errors: disconnections that are expected to heal on
/// retry without operator intervention.
const TRANSIENT_CONNECTION_CODES: &[u32] = &[
    ripple_transport::traits::CODE_CONNECTION_CLOSED,
    ripple_transport::traits::CODE_IDLE_TIMEOUT,
    ripple_transport::traits::CODE_CONNECT_TIMEOUT,
];

/// Whether a disconnection with this error should be retried.
///
/// An error with neither a code nor a status carries no evidence of a
/// permanent condition and is treated as retryable.
#[must_use]
pub fn is_retryable(error: &ErrorInfo) -> bool {
    if error.code == 0 && error.status_code == 0 {
        return true;
    }
    if is_token_error(error) {
        return true;
    }
    error.status_code >= 500 || TRANSIENT_CONNECTION_CODES.contains(&error.code)
}

/// Whether this error signals an expired or rejected token that a
/// reauthorization may fix.
#[must_use]
pub fn is_token_error(error: &ErrorInfo) -> bool {
    (40_140..40_150).contains(&error.code)
}

/// Whether this error ends the connection for good even though it is
/// auth-shaped: the server refused the credential outright.
#[must_use]
pub fn is_fatal_auth(error: &ErrorInfo) -> bool {
    error.status_code == 403
}

/// Errors that warrant an immediate retry on a fresh transport rather than
/// a backed-off one: the previous transport was working moments ago.
#[must_use]
pub fn is_immediate_retry(error: &ErrorInfo) -> bool {
    error.code == ripple_transport::traits::CODE_IDLE_TIMEOUT || error.status_code >= 500
}

/// Channel-scoped errors that do not condemn the attachment: the channel
/// drops to suspended and re-attaches after a backoff.
#[must_use]
pub fn is_transient_channel(error: &ErrorInfo) -> bool {
    error.status_code >= 500 || TRANSIENT_CONNECTION_CODES.contains(&error.code)
}

pub(crate) fn connection_closed() -> ErrorInfo {
    ErrorInfo::new(CODE_CONNECTION_CLOSED, 400, "Connection closed")
}

pub(crate) fn connection_failed(message: &str) -> ErrorInfo {
    ErrorInfo::new(CODE_CONNECTION_FAILED, 400, message)
}

pub(crate) fn connection_suspended() -> ErrorInfo {
    ErrorInfo::new(
        CODE_CONNECTION_SUSPENDED,
        400,
        "Connection suspended: retries exhausted the connection state TTL",
    )
}

pub(crate) fn channel_timeout(operation: &str) -> ErrorInfo {
    ErrorInfo::new(
        CODE_CHANNEL_OPERATION_TIMEOUT,
        408,
        &format!("Channel {} timed out", operation),
    )
}

pub(crate) fn protocol_violation(message: &str) -> ErrorInfo {
    ErrorInfo::new(CODE_PROTOCOL_VIOLATION, 500, message)
}
