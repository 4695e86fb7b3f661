//! Hop-by-hop header stripping and forwarding header synthesis, applied to
//! both legs of a proxied request.

use hyper::header::{HeaderMap, HeaderName, HeaderValue};

/// RFC 7230 §6.1 hop-by-hop headers, plus `Proxy-Connection` which some
/// clients still send.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

pub fn sanitize_hop_by_hop_request_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
}

pub fn sanitize_hop_by_hop_response_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Sets `Host` to the upstream authority and records the original,
/// client-facing host under `X-Forwarded-Host`.
pub fn proxy_forwarded_host(headers: &mut HeaderMap, original_host: &str, upstream_authority: &str) {
    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
    if let Ok(value) = HeaderValue::from_str(upstream_authority) {
        headers.insert(hyper::header::HOST, value);
    }
}

/// Synthesizes `X-Forwarded-For`, preserving any client-supplied value
/// under the alias `Roxxy-X-Forwarded-For` for upstream visibility.
pub fn synthesize_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    if let Some(existing) = headers.remove(hyper::header::FORWARDED.as_str()) {
        headers.insert(HeaderName::from_static("roxxy-x-forwarded-for"), existing);
    }
    if let Some(existing) = headers.get("x-forwarded-for").cloned() {
        headers.insert(HeaderName::from_static("roxxy-x-forwarded-for"), existing);
    }
    if let Ok(value) = HeaderValue::from_str(client_ip) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
}

/// Appends `client_ip` to an existing `X-Forwarded-For` chain, used on the
/// WebSocket passthrough path in addition to ordinary header synthesis.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    let combined = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        sanitize_hop_by_hop_request_headers(&mut headers);
        assert!(!headers.contains_key(hyper::header::CONNECTION));
        assert!(headers.contains_key(hyper::header::CONTENT_TYPE));
    }

    #[test]
    fn appends_to_existing_forwarded_for_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.1"));
        append_forwarded_for(&mut headers, "203.0.113.2");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.1, 203.0.113.2");
    }
}
