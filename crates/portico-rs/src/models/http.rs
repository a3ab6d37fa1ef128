//! Internal request/response representation used by the dispatch core.
//!
//! The ingress layer converts the server's native types into these structs
//! once, at the edge; every stage and the dispatcher operate on them. This
//! keeps the core free of framework types and lets the pipeline run in tests
//! without a listening socket.

use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use actix_web::http::{Method, StatusCode};
use bytes::Bytes;
use std::net::IpAddr;

/// One inbound HTTP request as seen by the matcher and the stage pipeline.
///
/// The body is fully buffered up to the ingress body cap, which makes it
/// replayable for retries, hedging and body-predicate matching. Requests
/// whose body exceeds the cap are rejected before the pipeline runs.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    /// URI scheme as reported by the connection (`http` or `https`).
    pub scheme: String,
    /// Host header value, possibly including a port.
    pub host: String,
    /// Decoded request path, always starting with `/`.
    pub path: String,
    /// Raw query string without the leading `?`. Empty when absent.
    pub raw_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Peer address of the transport connection, before any trusted-proxy
    /// unwrapping.
    pub peer_addr: Option<IpAddr>,
    /// Whether the connection arrived over TLS.
    pub tls: bool,
}

impl GatewayRequest {
    /// First value of a header, lossily decoded. `None` when absent or not
    /// valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Host with any `:port` suffix stripped, lowercased for comparison.
    pub fn host_without_port(&self) -> String {
        strip_port(&self.host).to_ascii_lowercase()
    }

    /// Parses the query string into (key, value) pairs in order of
    /// appearance. Values are percent-decoded only for `%xx` triplets and
    /// `+`; keys are taken verbatim.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        parse_query(&self.raw_query)
    }

    /// Looks up the first query parameter with the given name.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Parses the `Cookie` header into (name, value) pairs.
    pub fn cookies(&self) -> Vec<(String, String)> {
        let Some(raw) = self.header("cookie") else {
            return Vec::new();
        };
        raw.split(';')
            .filter_map(|part| {
                let (k, v) = part.split_once('=')?;
                Some((k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }

    /// Looks up a cookie value by name.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }
}

/// One outbound HTTP response, either synthesized by a stage or produced by
/// an upstream attempt.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Builds a JSON response with `content-type` set.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut resp = Self::with_body(status, value.to_string());
        resp.set_header("content-type", "application/json");
        resp
    }

    /// Inserts a header, replacing any existing value. Invalid names or
    /// values are silently dropped; callers pass compile-time constants in
    /// practice.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Strips a trailing `:port` from a host value, leaving IPv6 brackets alone.
pub fn strip_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        // [::1]:8080 -> [::1]
        return &host[..=end.min(host.len() - 1)];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Parses a raw query string into ordered (key, value) pairs.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), percent_decode(v)),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Canonical form of a query string: pairs sorted by key then value, joined
/// with `&`. Used by the cache fingerprint so parameter order does not split
/// cache entries.
pub fn canonical_query(raw: &str) -> String {
    let mut pairs = parse_query(raw);
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_port_from_host() {
        assert_eq!(strip_port("api.example.com:8443"), "api.example.com");
        assert_eq!(strip_port("api.example.com"), "api.example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
    }

    #[test]
    fn canonical_query_sorts_pairs() {
        assert_eq!(canonical_query("b=2&a=1"), "a=1&b=2");
        assert_eq!(canonical_query("a=2&a=1"), "a=1&a=2");
        assert_eq!(canonical_query(""), "");
    }

    #[test]
    fn percent_decoding_handles_plus_and_hex() {
        let pairs = parse_query("q=hello+world&x=%41%42");
        assert_eq!(pairs[0], ("q".to_string(), "hello world".to_string()));
        assert_eq!(pairs[1], ("x".to_string(), "AB".to_string()));
    }

    #[test]
    fn cookie_parsing() {
        let mut req = test_request();
        req.headers.insert(
            actix_web::http::header::COOKIE,
            "session=abc; theme=dark".parse().unwrap(),
        );
        assert_eq!(req.cookie("session").as_deref(), Some("abc"));
        assert_eq!(req.cookie("theme").as_deref(), Some("dark"));
        assert_eq!(req.cookie("missing"), None);
    }

    fn test_request() -> GatewayRequest {
        GatewayRequest {
            method: Method::GET,
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            path: "/".to_string(),
            raw_query: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer_addr: None,
            tls: false,
        }
    }
}
