//! Host candidate selection and fallback pinning.
//!
//! A connect walk tries the preferred host first, then a bounded random
//! sample of fallback hosts. A fallback host that produced a working
//! connection is pinned and reused for subsequent attempts until its
//! validity TTL lapses, avoiding a re-probe of the primary on every connect.

use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone)]
struct Pinned {
    host: String,
    pinned_at: Instant,
}

/// The host list for one connection.
#[derive(Debug, Clone)]
pub struct Hosts {
    primary: String,
    fallbacks: Vec<String>,
    max_fallbacks: usize,
    fallback_ttl: Duration,
    pinned: Option<Pinned>,
}

impl Hosts {
    /// Create a host list.
    #[must_use]
    pub fn new(
        primary: impl Into<String>,
        fallbacks: Vec<String>,
        max_fallbacks: usize,
        fallback_ttl: Duration,
    ) -> Self {
        Self {
            primary: primary.into(),
            fallbacks,
            max_fallbacks,
            fallback_ttl,
            pinned: None,
        }
    }

    /// The configured primary host.
    #[must_use]
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// The host a new attempt should try first: a still-valid pinned
    /// fallback, otherwise the primary. Prunes an expired pin.
    pub fn preferred(&mut self) -> String {
        if let Some(pinned) = &self.pinned {
            if pinned.pinned_at.elapsed() < self.fallback_ttl {
                return pinned.host.clone();
            }
            debug!(host = %pinned.host, "Pinned fallback host expired");
            self.pinned = None;
        }
        self.primary.clone()
    }

    /// Candidate hosts for one connect walk: preferred first, then a random
    /// sample of the remaining fallbacks bounded by the fallback count.
    pub fn candidates(&mut self) -> Vec<String> {
        let preferred = self.preferred();
        let mut rest: Vec<String> = self
            .fallbacks
            .iter()
            .filter(|host| **host != preferred)
            .cloned()
            .collect();
        fastrand::shuffle(&mut rest);
        rest.truncate(self.max_fallbacks);

        let mut candidates = Vec::with_capacity(1 + rest.len());
        candidates.push(preferred);
        candidates.extend(rest);
        candidates
    }

    /// Record that a host produced a working connection. Pinning the primary
    /// clears any fallback pin.
    pub fn pin(&mut self, host: &str) {
        if host == self.primary {
            self.pinned = None;
        } else if self.fallbacks.iter().any(|h| h == host) {
            debug!(host = %host, "Pinning fallback host");
            self.pinned = Some(Pinned {
                host: host.to_string(),
                pinned_at: Instant::now(),
            });
        }
    }

    /// Drop any fallback pin.
    pub fn clear_pin(&mut self) {
        self.pinned = None;
    }
}
