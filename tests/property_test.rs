//! Property-based tests for the functions with clean acceptance rules:
//! backoff bounds and filename sanitization.

use proptest::prelude::*;
use snag::client::backoff_delay;
use snag::output::sanitize_filename;
use std::time::Duration;

proptest! {
    /// For every attempt i, the jittered delay lies within +/-25% of
    /// min(2^i * initial, 30s), unless Retry-After exceeds it.
    #[test]
    fn backoff_within_bounds(attempt in 0u32..12, initial_ms in 1u64..5_000) {
        let initial = Duration::from_millis(initial_ms);
        let base = initial
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(Duration::from_secs(30));
        let delay = backoff_delay(attempt, initial, None);
        prop_assert!(delay >= base.mul_f64(0.75));
        prop_assert!(delay <= base.mul_f64(1.25));
    }

    /// A large Retry-After always wins over the computed backoff.
    #[test]
    fn retry_after_dominates(attempt in 0u32..6, ra_secs in 31u64..120) {
        let retry_after = Duration::from_secs(ra_secs);
        let delay = backoff_delay(attempt, Duration::from_millis(100), Some(retry_after));
        prop_assert_eq!(delay, retry_after);
    }

    /// Sanitized filenames never contain separators and never collapse to
    /// `.` or `..`.
    #[test]
    fn sanitized_names_are_safe(candidate in ".{0,64}") {
        match sanitize_filename(&candidate) {
            Ok(name) => {
                prop_assert!(!name.contains('/'));
                prop_assert!(!name.is_empty());
                prop_assert!(name != "." && name != "..");
            }
            Err(_) => {} // rejection is always acceptable
        }
    }
}
