//! Token-bucket conservation properties.

use proptest::prelude::*;
use reliapi_scheduler::TokenBucket;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A fast burst through a bucket never admits more than the bucket's
    /// capacity plus the refill earned during the burst (bounded here by
    /// one extra token).
    #[test]
    fn burst_admissions_are_bounded_by_capacity(
        qps in 1.0f64..50.0,
        attempts in 1usize..200,
    ) {
        let mut bucket = TokenBucket::new(qps, (qps * 2.0) as u32, 5);
        let mut admitted = 0usize;
        for _ in 0..attempts {
            if bucket.consume(1.0) {
                admitted += 1;
            }
        }
        let cap = qps.ceil() as usize + 1;
        prop_assert!(
            admitted <= cap,
            "admitted {} from a bucket of {} qps",
            admitted,
            qps
        );
    }

    /// An empty bucket's retry estimate is positive and no longer than
    /// the time to refill one full token.
    #[test]
    fn retry_after_is_within_one_token_time(qps in 0.5f64..100.0) {
        let mut bucket = TokenBucket::new(qps, (qps * 2.0) as u32, 5);
        while bucket.consume(1.0) {}
        let wait = bucket.retry_after();
        prop_assert!(wait.as_secs_f64() > 0.0);
        prop_assert!(wait.as_secs_f64() <= 1.0 / qps + 1e-6);
    }

    /// Consuming never drives the token count negative.
    #[test]
    fn tokens_never_go_negative(
        qps in 1.0f64..20.0,
        demands in proptest::collection::vec(0.5f64..3.0, 1..50),
    ) {
        let mut bucket = TokenBucket::new(qps, (qps * 2.0) as u32, 5);
        for demand in demands {
            let _ = bucket.consume(demand);
            prop_assert!(bucket.tokens >= 0.0);
            prop_assert!(bucket.tokens <= qps + 1e-9);
        }
    }
}
