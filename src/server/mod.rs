//! Run server.
//!
//! A single TCP port carries everything:
//!
//! ```text
//!                    ┌─► WebSocket upgrade ─► control / tunnel sockets
//! TcpListener ─peek─►┼─► Host <runId>.localhost ─► tunnel pool proxy
//!                    ├─► GET / ─► health check
//!                    └─► anything else ─► 404
//! ```
//!
//! The first request's head is peeked without consuming so the WebSocket
//! handshake still sees the complete byte stream.

// Rust guideline compliant 2026-02

pub mod control;
pub mod registry;
pub mod router;
pub mod tunnel;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::agent::RunAgent;
use crate::config::Config;
use crate::constants::{HANDSHAKE_TIMEOUT, HEAD_POLL_INTERVAL};
use crate::protocol::{canonical_reason, TunnelHttpRequest};
use crate::wire::{self, Body, Headers, WireResponse};
use crate::ws;

use registry::RunRegistry;
use router::RequestClass;

/// Largest request head we will peek for classification.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Largest proxied request we will buffer.
const MAX_PROXY_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared server-side state.
pub struct ServerState {
    /// Server configuration.
    pub config: Config,
    /// Live runs.
    pub registry: RunRegistry,
    /// Agent executing confirmed runs.
    pub agent: Arc<dyn RunAgent>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// The run server.
#[derive(Debug)]
pub struct RunServer {
    state: Arc<ServerState>,
}

impl RunServer {
    /// Create a server with the given configuration and agent.
    #[must_use]
    pub fn new(config: Config, agent: Arc<dyn RunAgent>) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                registry: RunRegistry::new(),
                agent,
            }),
        }
    }

    /// Bind the configured port and serve until the process ends.
    ///
    /// # Errors
    ///
    /// Returns an error when the port cannot be bound.
    pub async fn serve(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.state.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!("[Server] Listening on {addr}");
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener. Used by tests to grab an
    /// ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error when accepting fails irrecoverably.
    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .context("Failed to accept connection")?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream).await {
                    debug!("[Server] Connection from {peer} ended with error: {e:#}");
                }
            });
        }
    }
}

/// Classify and dispatch one inbound TCP connection.
async fn handle_connection(state: Arc<ServerState>, mut stream: TcpStream) -> Result<()> {
    let head_bytes = peek_head(&stream).await?;
    let head = router::parse_head(&head_bytes)?;

    match router::classify(&head) {
        RequestClass::WebSocket => {
            let (writer, reader) = ws::accept(stream).await?;
            control::handle_socket(state, writer, reader).await;
            Ok(())
        }
        RequestClass::Tunnel { run_id } => proxy_through_tunnel(&state, &mut stream, &run_id).await,
        RequestClass::Health => {
            respond_plain(&mut stream, 200, "runbridge is up\n").await
        }
        RequestClass::NotFound => respond_plain(&mut stream, 404, "Not Found\n").await,
    }
}

/// Peek until the request head terminator arrives, without consuming.
///
/// Bounded by the handshake timeout: a connection that never completes
/// its head is dropped, and a stalled one is re-peeked at the poll
/// interval rather than spun on (the partial bytes stay in the kernel
/// buffer, so `peek` itself never blocks once data has arrived).
async fn peek_head(stream: &TcpStream) -> Result<Vec<u8>> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, peek_head_inner(stream))
        .await
        .map_err(|_| anyhow::anyhow!("Timed out waiting for request head"))?
}

async fn peek_head_inner(stream: &TcpStream) -> Result<Vec<u8>> {
    let mut buffer = vec![0_u8; 1024];
    let mut last_peeked = 0;
    loop {
        let peeked = stream
            .peek(&mut buffer)
            .await
            .context("Failed to peek request head")?;
        if peeked == 0 {
            bail!("Connection closed before request head");
        }
        if wire::find_header_end(&buffer[..peeked]).is_some() {
            buffer.truncate(peeked);
            return Ok(buffer);
        }
        if peeked == buffer.len() {
            if buffer.len() >= MAX_HEAD_BYTES {
                bail!("Request head exceeds {MAX_HEAD_BYTES} bytes");
            }
            buffer.resize(buffer.len() * 2, 0);
        } else if peeked == last_peeked {
            // No new bytes since the last peek; wait for the rest of the
            // head instead of re-peeking the same data.
            tokio::time::sleep(HEAD_POLL_INTERVAL).await;
        }
        last_peeked = peeked;
    }
}

/// Serve one proxied HTTP request through the run's tunnel pool.
async fn proxy_through_tunnel(
    state: &ServerState,
    stream: &mut TcpStream,
    run_id: &str,
) -> Result<()> {
    let Some(handle) = state.registry.get(run_id) else {
        warn!("[Router] Proxy request for unknown run {run_id}");
        return respond_plain(stream, 404, "Unknown run\n").await;
    };
    let Some(pool) = handle.pool else {
        return respond_plain(stream, 502, "Run has no tunnel\n").await;
    };

    let raw = read_full_request(stream).await?;
    let request = match wire::decode_request(&raw) {
        Ok(request) => request,
        Err(e) => {
            debug!("[Router] Undecodable proxied request: {e:#}");
            return respond_plain(stream, 400, "Bad Request\n").await;
        }
    };
    debug!("[Router] {} {} -> run {run_id}", request.method, request.path);

    let tunnel_request = TunnelHttpRequest::from_wire(&request);
    let response = match pool.forward(tunnel_request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("[Router] Tunnel forward failed for run {run_id}: {e:#}");
            return respond_plain(stream, 504, "Tunnel timeout\n").await;
        }
    };

    let wire_response = match response.to_wire() {
        Ok(wire_response) => wire_response,
        Err(e) => {
            warn!("[Router] Undecodable tunnel response for run {run_id}: {e:#}");
            return respond_plain(stream, 502, "Bad Gateway\n").await;
        }
    };

    stream
        .write_all(&wire::encode_response(&wire_response))
        .await
        .context("Failed to write proxied response")?;
    stream.shutdown().await.ok();
    Ok(())
}

/// Read one full HTTP request (head plus Content-Length body) off a stream.
async fn read_full_request(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 4096];

    let body_start = loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("Failed to read request")?;
        if read == 0 {
            bail!("Connection closed mid-request");
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(boundary) = wire::find_header_end(&buffer) {
            break boundary + 4;
        }
        if buffer.len() > MAX_HEAD_BYTES {
            bail!("Request head exceeds {MAX_HEAD_BYTES} bytes");
        }
    };

    let head = router::parse_head(&buffer)?;
    let content_length: usize = match head.headers.get("Content-Length") {
        Some(value) => value
            .parse()
            .with_context(|| format!("Invalid Content-Length: {value}"))?,
        None => 0,
    };
    if content_length > MAX_PROXY_BODY_BYTES {
        bail!("Request body exceeds {MAX_PROXY_BODY_BYTES} bytes");
    }

    while buffer.len() < body_start + content_length {
        let read = stream
            .read(&mut chunk)
            .await
            .context("Failed to read request body")?;
        if read == 0 {
            bail!("Connection closed mid-body");
        }
        buffer.extend_from_slice(&chunk[..read]);
    }

    buffer.truncate(body_start + content_length);
    Ok(buffer)
}

/// Write a small plain-text HTTP response and close the connection.
async fn respond_plain(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    let mut headers = Headers::new();
    headers.set("Content-Type", "text/plain");
    headers.set("Connection", "close");
    let response = WireResponse {
        status,
        reason: canonical_reason(status).to_string(),
        headers,
        body: Body::Text(body.to_string()),
    };
    stream
        .write_all(&wire::encode_response(&response))
        .await
        .context("Failed to write response")?;
    stream.shutdown().await.ok();
    Ok(())
}
