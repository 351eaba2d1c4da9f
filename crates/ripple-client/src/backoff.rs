//! Retry backoff with jitter.

use std::time::Duration;

/// Delay before retry number `attempt` (zero-based).
///
/// The base delay ramps up over the first few attempts and caps at twice the
/// base; a random downward jitter of up to 20% decorrelates clients that
/// disconnected together.
#[must_use]
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let ramp = ((f64::from(attempt) + 2.0) / 3.0).min(2.0);
    let jitter = 1.0 - fastrand::f64() * 0.2;
    base.mul_f64(ramp * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_bounds() {
        let base = Duration::from_secs(15);
        for _ in 0..100 {
            let delay = retry_delay(base, 0);
            // Ramp 2/3, jitter in (0.8, 1.0].
            assert!(delay > base.mul_f64(2.0 / 3.0 * 0.8));
            assert!(delay <= base.mul_f64(2.0 / 3.0));
        }
    }

    #[test]
    fn test_ramp_caps_at_twice_base() {
        let base = Duration::from_secs(15);
        for attempt in 4..20 {
            let delay = retry_delay(base, attempt);
            assert!(delay <= base * 2);
            assert!(delay > base.mul_f64(2.0 * 0.8));
        }
    }

    #[test]
    fn test_ramp_is_monotonic_in_expectation() {
        // Compare upper bounds, which are jitter-free.
        let base = Duration::from_secs(9);
        let upper = |attempt: u32| base.mul_f64(((f64::from(attempt) + 2.0) / 3.0).min(2.0));
        assert!(upper(0) < upper(1));
        assert!(upper(1) < upper(2));
        assert_eq!(upper(4), upper(10));
    }
}
