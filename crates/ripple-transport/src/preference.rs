//! Persisted transport preference.
//!
//! When the slow-connect policy has verified that only the long-poll
//! transport works, that verdict is cached so subsequent connects skip
//! straight to the working transport. The cache is invalidated once
//! WebSocket connectivity is independently reverified.

use std::sync::Mutex;
use std::time::Instant;

use crate::traits::TransportKind;

/// A verified transport verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportPreference {
    /// The transport kind that was verified to work.
    pub kind: TransportKind,
    /// When the verdict was recorded.
    pub recorded_at: Instant,
}

impl TransportPreference {
    /// Record a verdict now.
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            recorded_at: Instant::now(),
        }
    }
}

/// Storage for the transport preference.
///
/// Reads and writes must be atomic relative to a single connect attempt;
/// implementations back this with whatever persistence the host offers.
pub trait PreferenceStore: Send + Sync {
    /// The current preference, if any.
    fn get(&self) -> Option<TransportPreference>;

    /// Replace the preference.
    fn set(&self, preference: TransportPreference);

    /// Drop the preference.
    fn clear(&self);
}

/// In-memory preference store; the default when the host offers no
/// persistence.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    slot: Mutex<Option<TransportPreference>>,
}

impl MemoryPreferenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self) -> Option<TransportPreference> {
        *self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set(&self, preference: TransportPreference) {
        *self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(preference);
    }

    fn clear(&self) {
        *self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}
