//! Header normalization at the proxy boundary
//!
//! Requests going to the local backend lose anything that would make the
//! backend compress its reply or second-guess the forwarding chain.
//! Responses coming back lose encoding and framing headers that no longer
//! describe the relayed body.

use homeport_shared::protocol::Headers;

/// Hop-by-hop and framing headers the HTTP client recomputes itself
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "upgrade",
    "transfer-encoding",
    "te",
    "trailer",
    "proxy-connection",
    "content-length",
];

/// Forwarding headers this proxy never sets
const FORWARDING: &[&str] = &["x-real-ip", "forwarded", "via"];

/// Dropped from backend responses
const RESPONSE_STRIP: &[&str] = &[
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "trailer",
];

/// Rewrite request headers before forwarding to the local backend
pub fn normalize_request(headers: &[(String, String)]) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !is_stripped_request_header(name))
        .cloned()
        .collect()
}

/// Rewrite response headers before sending back through the tunnel
pub fn normalize_response(headers: &[(String, String)]) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !matches_any(name, RESPONSE_STRIP))
        .cloned()
        .collect()
}

fn is_stripped_request_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("accept-encoding")
        || is_forwarding_header(name)
        || matches_any(name, HOP_BY_HOP)
}

fn is_forwarding_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("x-forwarded-") || FORWARDING.contains(&lower.as_str())
}

fn matches_any(name: &str, list: &[&str]) -> bool {
    list.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Case-insensitive header lookup
pub fn get<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}
