//! Caller-side tunnel socket worker.
//!
//! Each worker owns one tunnel socket. After the `init:tunnel` handshake the
//! socket runs a strict ping-pong: read one `tunnel:http_request`, execute it
//! against the caller's local origin, send back exactly one
//! `tunnel:http_response`, then read the next. The server enforces the same
//! discipline on its side, so per-socket ordering needs no extra machinery.
//!
//! A failure on one socket is isolated: the worker logs and exits, sibling
//! sockets and the run itself continue.

// Rust guideline compliant 2026-02

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use std::collections::HashMap;

use crate::constants::{HANDSHAKE_TIMEOUT, TUNNEL_REQUEST_TIMEOUT};
use crate::protocol::{TunnelHttpRequest, TunnelHttpResponse, TunnelMessage};
use crate::ws::{self, WsMessage, WsReader, WsWriter, CLOSE_NORMAL};

/// Run one tunnel socket until the server closes it or it fails.
///
/// Connects to `server_url`, attaches to `run_id`, then serves forwarded
/// requests against `local_origin` (e.g. `http://localhost:3000`).
///
/// # Errors
///
/// Returns an error when the handshake is refused or times out, or when the
/// socket fails mid-stream. Callers treat this as the loss of one socket,
/// not of the run.
pub async fn run_tunnel_socket(server_url: &str, run_id: &str, local_origin: &str) -> Result<()> {
    let url = ws::http_to_ws_scheme(server_url);
    let (mut writer, mut reader) = ws::connect(&url, &[])
        .await
        .with_context(|| format!("Failed to open tunnel socket to {server_url}"))?;

    let init = TunnelMessage::InitTunnel {
        run_id: run_id.to_string(),
    };
    writer
        .send_text(&serde_json::to_string(&init)?)
        .await
        .context("Failed to send tunnel handshake")?;

    tokio::time::timeout(HANDSHAKE_TIMEOUT, await_accept(&mut writer, &mut reader))
        .await
        .map_err(|_| anyhow!("Tunnel handshake timed out"))??;

    debug!("[Tunnel] Socket attached to run {run_id}");

    let client = reqwest::Client::builder()
        // Redirects belong to the hosted browser, not to us.
        .redirect(reqwest::redirect::Policy::none())
        .timeout(TUNNEL_REQUEST_TIMEOUT)
        .build()
        .context("Failed to build tunnel HTTP client")?;

    loop {
        let message = match reader.recv().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(e.context("Tunnel socket failed")),
            None => return Ok(()),
        };

        match message {
            WsMessage::Text(text) => {
                let frame: TunnelMessage = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("[Tunnel] Unrecognized frame, skipping: {e}");
                        continue;
                    }
                };
                match frame {
                    TunnelMessage::HttpRequest(request) => {
                        let response = forward(&client, local_origin, &request).await;
                        let reply = TunnelMessage::HttpResponse(response);
                        writer
                            .send_text(&serde_json::to_string(&reply)?)
                            .await
                            .context("Failed to send tunnel response")?;
                    }
                    TunnelMessage::Error { message } => {
                        bail!("Server reported tunnel error: {message}");
                    }
                    TunnelMessage::InitTunnel { .. }
                    | TunnelMessage::AcceptTunnel {}
                    | TunnelMessage::HttpResponse(_) => {
                        warn!("[Tunnel] Out-of-phase frame on active socket, ignoring");
                    }
                }
            }
            WsMessage::Ping(data) => writer.send_pong(data).await?,
            WsMessage::Close { code, reason } => {
                if code == CLOSE_NORMAL {
                    debug!("[Tunnel] Socket closed normally");
                    return Ok(());
                }
                bail!("Tunnel socket closed ({code}: {reason})");
            }
            WsMessage::Binary(_) | WsMessage::Pong(_) => {}
        }
    }
}

async fn await_accept(writer: &mut WsWriter, reader: &mut WsReader) -> Result<()> {
    loop {
        let message = match reader.recv().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(e.context("Tunnel socket failed during handshake")),
            None => bail!("Tunnel socket closed during handshake"),
        };

        match message {
            WsMessage::Text(text) => {
                let frame: TunnelMessage = serde_json::from_str(&text)
                    .context("Unrecognized frame during tunnel handshake")?;
                match frame {
                    TunnelMessage::AcceptTunnel {} => return Ok(()),
                    TunnelMessage::Error { message } => bail!("Tunnel refused: {message}"),
                    other => bail!("Unexpected handshake frame: {other:?}"),
                }
            }
            WsMessage::Ping(data) => writer.send_pong(data).await?,
            WsMessage::Close { code, reason } => {
                bail!("Tunnel socket closed during handshake ({code}: {reason})")
            }
            WsMessage::Binary(_) | WsMessage::Pong(_) => {}
        }
    }
}

/// Execute one forwarded request against the local origin.
///
/// Errors become synthetic 502 responses so the server always gets exactly
/// one reply per request.
async fn forward(
    client: &reqwest::Client,
    local_origin: &str,
    request: &TunnelHttpRequest,
) -> TunnelHttpResponse {
    match try_forward(client, local_origin, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("[Tunnel] Forward to local origin failed: {e:#}");
            bad_gateway(&format!("{e:#}"))
        }
    }
}

async fn try_forward(
    client: &reqwest::Client,
    local_origin: &str,
    request: &TunnelHttpRequest,
) -> Result<TunnelHttpResponse> {
    let method: reqwest::Method = request
        .method
        .parse()
        .with_context(|| format!("Unsupported HTTP method: {}", request.method))?;

    let url = format!("{}{}", local_origin.trim_end_matches('/'), request.path);
    let mut builder = client.request(method, &url);

    for (name, value) in &request.headers {
        // Hop-by-hop headers and Host are the transport's business.
        if !is_hop_by_hop_header(name) && !name.eq_ignore_ascii_case("host") {
            builder = builder.header(name, value);
        }
    }

    if let Some(body_b64) = &request.body {
        let body = BASE64
            .decode(body_b64)
            .context("Invalid base64 body in forwarded request")?;
        builder = builder.body(body);
    }

    let response = builder
        .send()
        .await
        .with_context(|| format!("Request to {url} failed"))?;

    let status = response.status().as_u16();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            if !is_hop_by_hop_header(name.as_str()) {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
    }

    let body = response
        .bytes()
        .await
        .context("Failed to read local origin response body")?;
    let body = if body.is_empty() {
        None
    } else {
        Some(BASE64.encode(&body))
    };

    Ok(TunnelHttpResponse {
        status,
        headers,
        body,
    })
}

fn bad_gateway(detail: &str) -> TunnelHttpResponse {
    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "text/plain".to_string());
    TunnelHttpResponse {
        status: 502,
        headers,
        body: Some(BASE64.encode(format!("Bad Gateway: {detail}"))),
    }
}

/// Check if a header is hop-by-hop (should not be forwarded).
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_is_hop_by_hop_header() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(is_hop_by_hop_header("KEEP-ALIVE"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("Content-Length"));
    }

    fn test_client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_forward_hits_local_origin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("X-Custom", "yes"))
            .and(body_bytes(b"payload".to_vec()))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .mount(&server)
            .await;

        let request = TunnelHttpRequest {
            method: "POST".to_string(),
            path: "/submit".to_string(),
            headers: HashMap::from([
                ("X-Custom".to_string(), "yes".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
            ]),
            body: Some(BASE64.encode(b"payload")),
        };

        let response = forward(&test_client(), &server.uri(), &request).await;
        assert_eq!(response.status, 201);
        assert_eq!(
            response.body.as_deref().map(|b| BASE64.decode(b).unwrap()),
            Some(b"created".to_vec())
        );
    }

    #[tokio::test]
    async fn test_forward_does_not_follow_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
            .mount(&server)
            .await;

        let request = TunnelHttpRequest {
            method: "GET".to_string(),
            path: "/old".to_string(),
            headers: HashMap::new(),
            body: None,
        };

        let response = forward(&test_client(), &server.uri(), &request).await;
        assert_eq!(response.status, 302);
        assert_eq!(response.headers.get("location").map(String::as_str), Some("/new"));
    }

    #[tokio::test]
    async fn test_forward_unreachable_origin_becomes_502() {
        let request = TunnelHttpRequest {
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: HashMap::new(),
            body: None,
        };
        let response = forward(&test_client(), "http://127.0.0.1:1", &request).await;
        assert_eq!(response.status, 502);
    }
}
