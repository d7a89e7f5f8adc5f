//! Inbound connection routing.
//!
//! Every connection starts as plain TCP. The first HTTP request's head is
//! peeked (not consumed) and classified, in order:
//!
//! 1. WebSocket upgrade — control, tunnel, and observer sockets.
//! 2. `Host: <runId>.localhost[:port]` — proxy through that run's tunnel.
//! 3. Plain `GET /` — health check.
//! 4. Anything else — 404.

// Rust guideline compliant 2026-02

use anyhow::{bail, Context, Result};

use crate::wire::{find_header_end, Headers};

/// What a classified connection should be handled as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestClass {
    /// WebSocket upgrade; the first protocol message decides the role.
    WebSocket,
    /// HTTP request addressed to a run's proxy subdomain.
    Tunnel {
        /// Run id extracted from the Host header.
        run_id: String,
    },
    /// Health-check probe.
    Health,
    /// Unroutable request.
    NotFound,
}

/// Parsed head of the first request on a connection.
#[derive(Debug)]
pub struct RequestHead {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: Headers,
}

/// Parse the head of an HTTP request from peeked bytes.
///
/// # Errors
///
/// Returns an error when the head terminator has not arrived yet or the
/// request line is malformed.
pub fn parse_head(bytes: &[u8]) -> Result<RequestHead> {
    let boundary = find_header_end(bytes).context("Request head incomplete")?;
    let head =
        std::str::from_utf8(&bytes[..boundary]).context("Request head is not valid UTF-8")?;

    let mut lines = head.split("\r\n");
    let start_line = lines.next().unwrap_or_default();
    let mut parts = start_line.split(' ');
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        bail!("Invalid HTTP request line: {start_line}");
    };

    let mut headers = Headers::new();
    for line in lines {
        if let Some(colon) = line.find(':') {
            headers.set(line[..colon].trim(), line[colon + 1..].trim());
        }
    }

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        headers,
    })
}

/// Classify a parsed request head.
#[must_use]
pub fn classify(head: &RequestHead) -> RequestClass {
    let upgrade = head
        .headers
        .get("Upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if upgrade {
        return RequestClass::WebSocket;
    }

    if let Some(host) = head.headers.get("Host") {
        if let Some(run_id) = extract_subdomain_id(host) {
            return RequestClass::Tunnel { run_id };
        }
    }

    if head.method == "GET" && head.path == "/" {
        return RequestClass::Health;
    }

    RequestClass::NotFound
}

/// Extract the run id from a `<runId>.localhost[:port]` host.
///
/// Strips any `:port`, splits on `.`, and requires exactly two labels with
/// the second being `localhost`.
#[must_use]
pub fn extract_subdomain_id(host: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let mut labels = host.split('.');
    let (Some(run_id), Some(domain), None) = (labels.next(), labels.next(), labels.next()) else {
        return None;
    };
    if domain != "localhost" || run_id.is_empty() {
        return None;
    }
    Some(run_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> RequestHead {
        parse_head(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_extract_subdomain_id_cases() {
        assert_eq!(
            extract_subdomain_id("abc123def456.localhost:4444"),
            Some("abc123def456".to_string())
        );
        assert_eq!(
            extract_subdomain_id("abc123def456.localhost"),
            Some("abc123def456".to_string())
        );
        assert_eq!(extract_subdomain_id("localhost:4444"), None);
        assert_eq!(extract_subdomain_id("localhost"), None);
        assert_eq!(extract_subdomain_id("a.b.localhost"), None);
        assert_eq!(extract_subdomain_id(".localhost"), None);
        assert_eq!(extract_subdomain_id("abc123.example.com"), None);
        assert_eq!(extract_subdomain_id("example.com"), None);
    }

    #[test]
    fn test_classify_websocket_upgrade() {
        let head = head(
            "GET / HTTP/1.1\r\nHost: localhost:4444\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        );
        assert_eq!(classify(&head), RequestClass::WebSocket);
    }

    #[test]
    fn test_classify_tunnel_host() {
        let head = head("GET /page HTTP/1.1\r\nHost: r1a2b3c4d5e6.localhost:4444\r\n\r\n");
        assert_eq!(
            classify(&head),
            RequestClass::Tunnel {
                run_id: "r1a2b3c4d5e6".to_string()
            }
        );
    }

    #[test]
    fn test_classify_health_check() {
        let head = head("GET / HTTP/1.1\r\nHost: localhost:4444\r\n\r\n");
        assert_eq!(classify(&head), RequestClass::Health);
    }

    #[test]
    fn test_classify_not_found() {
        let unknown_path = head("GET /nope HTTP/1.1\r\nHost: localhost:4444\r\n\r\n");
        assert_eq!(classify(&unknown_path), RequestClass::NotFound);
        let wrong_method = head("POST / HTTP/1.1\r\nHost: localhost:4444\r\n\r\n");
        assert_eq!(classify(&wrong_method), RequestClass::NotFound);
    }

    #[test]
    fn test_parse_head_incomplete_rejected() {
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: x").is_err());
    }
}
