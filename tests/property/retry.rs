//! Retry-delay bound properties.

use proptest::prelude::*;
use reliapi_retry::{Backoff, RetryPolicy};
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Computed delays never exceed the policy's maximum, for any shape
    /// and any attempt number.
    #[test]
    fn delays_are_capped(
        attempt in 1u32..20,
        base_ms in 1u64..2000,
        max_ms in 1u64..5000,
        shape in prop_oneof![
            Just(Backoff::ExpJitter),
            Just(Backoff::Exp),
            Just(Backoff::Linear),
        ],
    ) {
        let policy = RetryPolicy {
            attempts: 10,
            backoff: shape,
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
        };
        let delay = policy.delay(attempt, None);
        prop_assert!(delay <= Duration::from_millis(max_ms));
    }

    /// A Retry-After hint always wins over the configured backoff, but
    /// still respects the cap.
    #[test]
    fn retry_after_wins_up_to_the_cap(
        hint_s in 0u64..200,
        max_s in 1u64..120,
    ) {
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Backoff::Exp,
            base: Duration::from_secs(1),
            max: Duration::from_secs(max_s),
        };
        let delay = policy.delay(1, Some(Duration::from_secs(hint_s)));
        prop_assert_eq!(
            delay,
            Duration::from_secs(hint_s.min(max_s))
        );
    }

    /// Exponential delays are non-decreasing in the attempt number.
    #[test]
    fn exponential_delays_are_monotonic(base_ms in 1u64..500) {
        let policy = RetryPolicy {
            attempts: 10,
            backoff: Backoff::Exp,
            base: Duration::from_millis(base_ms),
            max: Duration::from_secs(3600),
        };
        let mut last = Duration::ZERO;
        for attempt in 1..10 {
            let delay = policy.delay(attempt, None);
            prop_assert!(delay >= last);
            last = delay;
        }
    }
}
