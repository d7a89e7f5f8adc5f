//! HTTP/1.1 wire codec for tunneled requests and responses.
//!
//! Pure byte-level serialization — no I/O. A forwarded request or response
//! is held as a [`WireRequest`] / [`WireResponse`] and converted to/from the
//! raw HTTP/1.1 framing used on the proxy path:
//!
//! ```text
//! METHOD path HTTP/1.1\r\n          HTTP/1.1 status reason\r\n
//! Name: value\r\n                   Name: value\r\n
//! ...\r\n                           ...\r\n
//! \r\n                              \r\n
//! <body bytes>                      <body bytes>
//! ```
//!
//! Because the socket envelope is JSON text frames, bodies that travel
//! inside a JSON message are base64-wrapped via [`request_to_base64`] /
//! [`response_to_base64`] and friends.

// Rust guideline compliant 2026-02

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Insertion-ordered HTTP header map.
///
/// Names compare case-insensitively. [`Headers::set`] overwrites an existing
/// entry in place (last write wins), preserving its original position so
/// encoding enumerates headers in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a header value, case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set a header, overwriting any existing entry with the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            slot.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Iterate headers in enumeration (insertion) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (n, v) in iter {
            headers.set(n, v);
        }
        headers
    }
}

/// Message body in its decoded representation.
///
/// Text-like content types (`text/*`, `application/json`, form-encoded)
/// decode to `Text`; everything else stays `Binary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// No body present.
    Empty,
    /// UTF-8 text body.
    Text(String),
    /// Raw binary body.
    Binary(Vec<u8>),
}

impl Body {
    /// Body bytes, empty slice for `Empty`.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Text(text) => text.as_bytes(),
            Body::Binary(bytes) => bytes,
        }
    }

    /// Whether there is no body content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// An HTTP request in decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    /// HTTP method (GET, POST, ...).
    pub method: String,
    /// Path plus query string.
    pub path: String,
    /// Target host, used for the `Host` header when none is set.
    pub host: String,
    /// Request headers in enumeration order.
    pub headers: Headers,
    /// Request body.
    pub body: Body,
}

/// An HTTP response in decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    /// HTTP status code.
    pub status: u16,
    /// Status reason phrase.
    pub reason: String,
    /// Response headers in enumeration order.
    pub headers: Headers,
    /// Response body.
    pub body: Body,
}

/// Serialize a request to HTTP/1.1 wire format.
#[must_use]
pub fn encode_request(request: &WireRequest) -> Vec<u8> {
    let start_line = format!("{} {} HTTP/1.1", request.method, request.path);
    let host_line = if request.headers.contains("Host") {
        None
    } else {
        Some(("Host".to_string(), request.host.clone()))
    };
    encode_message(&start_line, &request.headers, host_line, &request.body)
}

/// Serialize a response to HTTP/1.1 wire format.
#[must_use]
pub fn encode_response(response: &WireResponse) -> Vec<u8> {
    let start_line = format!("HTTP/1.1 {} {}", response.status, response.reason);
    encode_message(&start_line, &response.headers, None, &response.body)
}

/// Common encoding: start line, headers (plus synthesized ones), body.
fn encode_message(
    start_line: &str,
    headers: &Headers,
    extra: Option<(String, String)>,
    body: &Body,
) -> Vec<u8> {
    let mut head = String::new();
    head.push_str(start_line);
    head.push_str("\r\n");

    if let Some((name, value)) = extra {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    for (name, value) in headers.iter() {
        head.push_str(&format!("{name}: {value}\r\n"));
    }

    let body_bytes = body.as_bytes();
    if !body_bytes.is_empty() {
        // Frame the body unless the caller already did.
        if !headers.contains("Content-Length") && !headers.contains("Transfer-Encoding") {
            head.push_str(&format!("Content-Length: {}\r\n", body_bytes.len()));
        }
        if !headers.contains("Content-Type") {
            head.push_str("Content-Type: application/octet-stream\r\n");
        }
    }

    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body_bytes);
    bytes
}

/// Parse a request from HTTP/1.1 wire format.
///
/// # Errors
///
/// Returns an error on missing header terminator, malformed request line,
/// or a body shorter than its declared `Content-Length`.
pub fn decode_request(bytes: &[u8]) -> Result<WireRequest> {
    let (start_line, headers, body) = decode_message(bytes)?;

    let mut parts = start_line.split(' ');
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        bail!("Invalid HTTP request line: {start_line}");
    };
    if parts.next().is_none() {
        bail!("Invalid HTTP request line: {start_line}");
    }

    let host = headers.get("Host").unwrap_or_default().to_string();

    Ok(WireRequest {
        method: method.to_string(),
        path: path.to_string(),
        host,
        headers,
        body,
    })
}

/// Parse a response from HTTP/1.1 wire format.
///
/// # Errors
///
/// Returns an error on missing header terminator, malformed status line,
/// or a body shorter than its declared `Content-Length`.
pub fn decode_response(bytes: &[u8]) -> Result<WireResponse> {
    let (start_line, headers, body) = decode_message(bytes)?;

    let mut parts = start_line.splitn(3, ' ');
    let (Some(_version), Some(status)) = (parts.next(), parts.next()) else {
        bail!("Invalid HTTP status line: {start_line}");
    };
    let status: u16 = status
        .parse()
        .with_context(|| format!("Invalid status code in: {start_line}"))?;
    let reason = parts.next().unwrap_or_default().to_string();

    Ok(WireResponse {
        status,
        reason,
        headers,
        body,
    })
}

/// Shared parse: split at the first `\r\n\r\n`, read start line and headers,
/// slice the body per `Content-Length` (or take the remainder).
fn decode_message(bytes: &[u8]) -> Result<(String, Headers, Body)> {
    let boundary = find_header_end(bytes).context("Invalid HTTP message: missing \\r\\n\\r\\n")?;

    let head = std::str::from_utf8(&bytes[..boundary])
        .context("HTTP message head is not valid UTF-8")?;
    let mut lines = head.split("\r\n");
    let start_line = lines.next().unwrap_or_default().to_string();

    let mut headers = Headers::new();
    for line in lines {
        // Lines without a colon are skipped, duplicates overwrite (last wins).
        if let Some(colon) = line.find(':') {
            let name = line[..colon].trim();
            let value = line[colon + 1..].trim();
            headers.set(name, value);
        }
    }

    let body_start = boundary + 4;
    let remainder = bytes.get(body_start..).unwrap_or_default();

    let body_bytes = if let Some(declared) = headers.get("Content-Length") {
        let length: usize = declared
            .parse()
            .with_context(|| format!("Invalid Content-Length: {declared}"))?;
        if remainder.len() < length {
            bail!(
                "Body shorter than Content-Length: {} < {length}",
                remainder.len()
            );
        }
        &remainder[..length]
    } else {
        remainder
    };

    let body = if body_bytes.is_empty() {
        Body::Empty
    } else if is_text_content_type(headers.get("Content-Type").unwrap_or_default()) {
        match std::str::from_utf8(body_bytes) {
            Ok(text) => Body::Text(text.to_string()),
            Err(_) => Body::Binary(body_bytes.to_vec()),
        }
    } else {
        Body::Binary(body_bytes.to_vec())
    };

    Ok((start_line, headers, body))
}

/// Locate the byte offset of the first `\r\n\r\n`.
pub(crate) fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Whether a content type carries text that can ride in a JSON string.
fn is_text_content_type(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.contains("application/json")
        || content_type.contains("application/x-www-form-urlencoded")
}

/// Encode a request as base64 for transport inside a JSON envelope.
#[must_use]
pub fn request_to_base64(request: &WireRequest) -> String {
    BASE64.encode(encode_request(request))
}

/// Decode a request from its base64 wire form.
pub fn request_from_base64(encoded: &str) -> Result<WireRequest> {
    let bytes = BASE64
        .decode(encoded)
        .context("Invalid base64 in request envelope")?;
    decode_request(&bytes)
}

/// Encode a response as base64 for transport inside a JSON envelope.
#[must_use]
pub fn response_to_base64(response: &WireResponse) -> String {
    BASE64.encode(encode_response(response))
}

/// Decode a response from its base64 wire form.
pub fn response_from_base64(encoded: &str) -> Result<WireResponse> {
    let bytes = BASE64
        .decode(encoded)
        .context("Invalid base64 in response envelope")?;
    decode_response(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, path: &str, body: Body) -> WireRequest {
        WireRequest {
            method: method.to_string(),
            path: path.to_string(),
            host: "app.localhost:4444".to_string(),
            headers: Headers::new(),
            body,
        }
    }

    #[test]
    fn test_encode_request_inserts_host() {
        let req = request("GET", "/index.html", Body::Empty);
        let bytes = encode_request(&req);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(text.contains("Host: app.localhost:4444\r\n"));
    }

    #[test]
    fn test_encode_request_keeps_explicit_host() {
        let mut req = request("GET", "/", Body::Empty);
        req.headers.set("Host", "example.com");
        let text = String::from_utf8(encode_request(&req)).unwrap();
        assert!(text.contains("Host: example.com\r\n"));
        assert!(!text.contains("app.localhost"));
    }

    #[test]
    fn test_encode_body_gets_length_and_default_type() {
        let req = request("POST", "/upload", Body::Binary(vec![1, 2, 3, 4, 5]));
        let bytes = encode_request(&req);
        let head_end = find_header_end(&bytes).unwrap();
        let head = std::str::from_utf8(&bytes[..head_end]).unwrap();
        assert!(head.contains("Content-Length: 5"));
        assert!(head.contains("Content-Type: application/octet-stream"));
        assert_eq!(&bytes[head_end + 4..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_encode_respects_existing_framing_headers() {
        let mut req = request("POST", "/chunked", Body::Text("ignored".to_string()));
        req.headers.set("Transfer-Encoding", "chunked");
        req.headers.set("Content-Type", "text/plain");
        let text = String::from_utf8(encode_request(&req)).unwrap();
        assert!(!text.contains("Content-Length"));
        assert!(text.contains("Transfer-Encoding: chunked"));
    }

    #[test]
    fn test_request_round_trip_binary_body() {
        let mut req = request("POST", "/data?x=1", Body::Binary(vec![0, 159, 146, 150]));
        req.headers.set("X-Custom", "abc");
        let decoded = decode_request(&encode_request(&req)).unwrap();
        assert_eq!(decoded.method, "POST");
        assert_eq!(decoded.path, "/data?x=1");
        assert_eq!(decoded.headers.get("X-Custom"), Some("abc"));
        assert_eq!(decoded.body.as_bytes(), &[0, 159, 146, 150]);
    }

    #[test]
    fn test_response_round_trip_text_body() {
        let mut resp = WireResponse {
            status: 200,
            reason: "OK".to_string(),
            headers: Headers::new(),
            body: Body::Text(r#"{"status":"ok"}"#.to_string()),
        };
        resp.headers.set("Content-Type", "application/json");
        let decoded = decode_response(&encode_response(&resp)).unwrap();
        assert_eq!(decoded.status, 200);
        assert_eq!(decoded.reason, "OK");
        assert_eq!(decoded.body, Body::Text(r#"{"status":"ok"}"#.to_string()));
    }

    #[test]
    fn test_decode_text_family_content_types() {
        for content_type in [
            "text/html; charset=utf-8",
            "application/json",
            "application/x-www-form-urlencoded",
        ] {
            let raw = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: 2\r\n\r\nhi"
            );
            let decoded = decode_response(raw.as_bytes()).unwrap();
            assert_eq!(
                decoded.body,
                Body::Text("hi".to_string()),
                "content type {content_type} should decode as text"
            );
        }
    }

    #[test]
    fn test_decode_binary_content_type() {
        let mut raw =
            b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 3\r\n\r\n".to_vec();
        raw.extend_from_slice(&[1, 2, 3]);
        let decoded = decode_response(&raw).unwrap();
        assert_eq!(decoded.body, Body::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn test_decode_without_content_length_takes_remainder() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\neverything left";
        let decoded = decode_response(raw).unwrap();
        assert_eq!(decoded.body, Body::Text("everything left".to_string()));
    }

    #[test]
    fn test_decode_duplicate_headers_last_wins() {
        let raw = b"GET / HTTP/1.1\r\nX-Dup: first\r\nX-Dup: second\r\n\r\n";
        let decoded = decode_request(raw).unwrap();
        assert_eq!(decoded.headers.get("X-Dup"), Some("second"));
        assert_eq!(decoded.headers.len(), 1);
    }

    #[test]
    fn test_decode_missing_terminator_rejected() {
        assert!(decode_request(b"GET / HTTP/1.1\r\nHost: x").is_err());
    }

    #[test]
    fn test_decode_malformed_request_line_rejected() {
        assert!(decode_request(b"GARBAGE\r\n\r\n").is_err());
    }

    #[test]
    fn test_decode_truncated_body_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        assert!(decode_response(raw).is_err());
    }

    #[test]
    fn test_header_enumeration_order_preserved() {
        let mut headers = Headers::new();
        headers.set("B-Second", "2");
        headers.set("A-First", "1");
        headers.set("b-second", "updated");
        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["B-Second", "A-First"]);
        assert_eq!(headers.get("B-SECOND"), Some("updated"));
    }

    #[test]
    fn test_base64_round_trip() {
        let mut req = request("PUT", "/blob", Body::Binary(vec![0xff, 0x00, 0x7f]));
        req.headers.set("Content-Type", "application/octet-stream");
        let encoded = request_to_base64(&req);
        let decoded = request_from_base64(&encoded).unwrap();
        assert_eq!(decoded.method, "PUT");
        assert_eq!(decoded.body.as_bytes(), &[0xff, 0x00, 0x7f]);

        let resp = WireResponse {
            status: 404,
            reason: "Not Found".to_string(),
            headers: Headers::new(),
            body: Body::Empty,
        };
        let decoded = response_from_base64(&response_to_base64(&resp)).unwrap();
        assert_eq!(decoded.status, 404);
        assert_eq!(decoded.reason, "Not Found");
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_base64_invalid_input_rejected() {
        assert!(request_from_base64("not!!base64##").is_err());
    }
}
