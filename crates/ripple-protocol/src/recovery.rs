//! Connection recovery token.
//!
//! A recovery token is a serialized record of everything needed to ask the
//! server to restore continuity after total connection loss: the prior
//! connection key, the last outbound serial, and per-channel continuity
//! cursors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Serialized format version.
const RECOVERY_VERSION: u8 = 1;

/// Everything needed to attempt a `recover`-mode connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContext {
    /// Format version; parse rejects unknown versions.
    #[serde(default = "default_version")]
    pub version: u8,
    /// Connection key of the lost connection.
    pub connection_key: String,
    /// Last outbound serial assigned on the lost connection.
    pub msg_serial: i64,
    /// Channel-continuity cursor per attached channel.
    #[serde(default)]
    pub channel_serials: HashMap<String, String>,
}

fn default_version() -> u8 {
    RECOVERY_VERSION
}

impl RecoveryContext {
    /// Create a recovery context for a connection key and serial.
    #[must_use]
    pub fn new(connection_key: impl Into<String>, msg_serial: i64) -> Self {
        Self {
            version: RECOVERY_VERSION,
            connection_key: connection_key.into(),
            msg_serial,
            channel_serials: HashMap::new(),
        }
    }

    /// Serialize to the string form handed to callers.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a serialized recovery token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed or from an unknown version.
    pub fn decode(token: &str) -> Result<Self, ProtocolError> {
        let context: RecoveryContext = serde_json::from_str(token)?;
        if context.version != RECOVERY_VERSION {
            return Err(ProtocolError::Invalid(format!(
                "Unsupported recovery token version {}",
                context.version
            )));
        }
        Ok(context)
    }
}
