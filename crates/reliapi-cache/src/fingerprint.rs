//! Canonical request fingerprinting.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Request headers that participate in the cache fingerprint. Everything
/// else, including authentication, is excluded.
const SIGNIFICANT_HEADERS: [&str; 3] = ["Accept", "Accept-Language", "Content-Type"];

/// The parts of a request that identify a cacheable response.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestParts<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: Option<&'a HashMap<String, String>>,
    pub body: Option<&'a [u8]>,
    pub query: Option<&'a Value>,
}

/// Computes the fingerprint of a request.
///
/// The fingerprint is the SHA-256 of a canonical JSON document of
/// `{method, url, query, headers, body_hash}` where only significant
/// headers are kept and the body hash is included for POST/PUT/PATCH.
/// `serde_json` objects are key-ordered, so serialisation is canonical and
/// the result is invariant under header and query reordering.
pub fn fingerprint(parts: RequestParts<'_>) -> String {
    let method = parts.method.to_ascii_uppercase();

    let mut significant: HashMap<&str, &str> = HashMap::new();
    if let Some(headers) = parts.headers {
        for name in SIGNIFICANT_HEADERS {
            if let Some((_, value)) = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
            {
                significant.insert(name, value);
            }
        }
    }

    let mut key_data = json!({
        "method": method,
        "url": parts.url,
        "query": parts.query.cloned().unwrap_or_else(|| json!({})),
        "headers": significant,
    });

    if let Some(body) = parts.body {
        if !body.is_empty() && matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
            let body_hash = hex_digest(body);
            key_data["body_hash"] = Value::String(body_hash[..16].to_string());
        }
    }

    // Serialisation of a Value cannot fail.
    let canonical = serde_json::to_string(&key_data).unwrap_or_default();
    hex_digest(canonical.as_bytes())
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn invariant_under_header_reordering() {
        let a = headers(&[("Accept", "application/json"), ("Content-Type", "text/plain")]);
        let b = headers(&[("Content-Type", "text/plain"), ("Accept", "application/json")]);
        let fp_a = fingerprint(RequestParts {
            method: "GET",
            url: "https://api.example.com/v1/items",
            headers: Some(&a),
            ..Default::default()
        });
        let fp_b = fingerprint(RequestParts {
            method: "GET",
            url: "https://api.example.com/v1/items",
            headers: Some(&b),
            ..Default::default()
        });
        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn insignificant_headers_do_not_change_the_fingerprint() {
        let bare = headers(&[("Accept", "application/json")]);
        let with_auth = headers(&[
            ("Accept", "application/json"),
            ("Authorization", "Bearer secret"),
            ("X-Trace-Id", "abc123"),
        ]);
        let fp_bare = fingerprint(RequestParts {
            method: "GET",
            url: "https://api.example.com/v1/items",
            headers: Some(&bare),
            ..Default::default()
        });
        let fp_auth = fingerprint(RequestParts {
            method: "GET",
            url: "https://api.example.com/v1/items",
            headers: Some(&with_auth),
            ..Default::default()
        });
        assert_eq!(fp_bare, fp_auth);
    }

    #[test]
    fn query_order_does_not_matter() {
        let q1: Value = serde_json::from_str(r#"{"page": 1, "limit": 10}"#).unwrap();
        let q2: Value = serde_json::from_str(r#"{"limit": 10, "page": 1}"#).unwrap();
        let fp1 = fingerprint(RequestParts {
            method: "GET",
            url: "https://api.example.com/v1/items",
            query: Some(&q1),
            ..Default::default()
        });
        let fp2 = fingerprint(RequestParts {
            method: "GET",
            url: "https://api.example.com/v1/items",
            query: Some(&q2),
            ..Default::default()
        });
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn body_distinguishes_post_requests() {
        let fp1 = fingerprint(RequestParts {
            method: "POST",
            url: "https://api.example.com/v1/items",
            body: Some(b"{\"a\":1}"),
            ..Default::default()
        });
        let fp2 = fingerprint(RequestParts {
            method: "POST",
            url: "https://api.example.com/v1/items",
            body: Some(b"{\"a\":2}"),
            ..Default::default()
        });
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn body_is_ignored_for_get() {
        let fp1 = fingerprint(RequestParts {
            method: "GET",
            url: "https://api.example.com/v1/items",
            body: Some(b"ignored"),
            ..Default::default()
        });
        let fp2 = fingerprint(RequestParts {
            method: "GET",
            url: "https://api.example.com/v1/items",
            ..Default::default()
        });
        assert_eq!(fp1, fp2);
    }
}
