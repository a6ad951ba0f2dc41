//! Properties of the cache fingerprint and the idempotency request hash.

use proptest::prelude::*;
use reliapi_cache::{fingerprint, RequestParts};
use reliapi_idempotency::request_hash;
use std::collections::HashMap;

fn header_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Accept".to_string()),
        Just("Accept-Language".to_string()),
        Just("Content-Type".to_string()),
        Just("Authorization".to_string()),
        Just("X-Trace-Id".to_string()),
        Just("User-Agent".to_string()),
    ]
}

fn headers() -> impl Strategy<Value = HashMap<String, String>> {
    proptest::collection::hash_map(header_name(), "[a-z0-9/;=. -]{0,24}", 0..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The fingerprint never depends on header insertion order.
    #[test]
    fn fingerprint_is_order_invariant(headers in headers(), url in "https://api\\.example\\.com/[a-z]{1,12}") {
        let fp = fingerprint(RequestParts {
            method: "GET",
            url: &url,
            headers: Some(&headers),
            ..Default::default()
        });
        // Rebuild the map in a different iteration order.
        let mut pairs: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.reverse();
        let reversed: HashMap<String, String> = pairs.into_iter().collect();
        let fp2 = fingerprint(RequestParts {
            method: "GET",
            url: &url,
            headers: Some(&reversed),
            ..Default::default()
        });
        prop_assert_eq!(fp, fp2);
    }

    /// Removing headers outside the significant set never changes the
    /// fingerprint.
    #[test]
    fn fingerprint_ignores_insignificant_headers(
        mut headers in headers(),
        url in "https://api\\.example\\.com/[a-z]{1,12}",
    ) {
        let with_noise = fingerprint(RequestParts {
            method: "GET",
            url: &url,
            headers: Some(&headers),
            ..Default::default()
        });
        headers.retain(|k, _| {
            matches!(k.as_str(), "Accept" | "Accept-Language" | "Content-Type")
        });
        let without_noise = fingerprint(RequestParts {
            method: "GET",
            url: &url,
            headers: Some(&headers),
            ..Default::default()
        });
        prop_assert_eq!(with_noise, without_noise);
    }

    /// Distinct bodies produce distinct fingerprints for POST.
    #[test]
    fn fingerprint_distinguishes_post_bodies(a in "[a-z]{1,32}", b in "[a-z]{1,32}") {
        prop_assume!(a != b);
        let fp_a = fingerprint(RequestParts {
            method: "POST",
            url: "https://api.example.com/x",
            body: Some(a.as_bytes()),
            ..Default::default()
        });
        let fp_b = fingerprint(RequestParts {
            method: "POST",
            url: "https://api.example.com/x",
            body: Some(b.as_bytes()),
            ..Default::default()
        });
        prop_assert_ne!(fp_a, fp_b);
    }

    /// The request hash is a pure function of its inputs.
    #[test]
    fn request_hash_is_stable(
        headers in headers(),
        body in proptest::collection::vec(any::<u8>(), 0..128),
        url in "https://api\\.example\\.com/[a-z]{1,12}",
    ) {
        let h1 = request_hash("POST", &url, Some(&headers), Some(&body));
        let h2 = request_hash("POST", &url, Some(&headers), Some(&body));
        prop_assert_eq!(&h1, &h2);
        // Method casing does not matter.
        let h3 = request_hash("post", &url, Some(&headers), Some(&body));
        prop_assert_eq!(&h1, &h3);
    }
}
