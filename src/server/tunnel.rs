//! Server-side tunnel pool.
//!
//! One pool per run. Registered tunnel sockets each get a worker task; the
//! workers pull forwarding jobs from a shared queue, so whichever socket is
//! idle picks up the next request. Each socket stays a strict ping-pong:
//! a worker sends one `tunnel:http_request` and reads frames until the
//! matching `tunnel:http_response` before taking another job.
//!
//! ```text
//!              forward()                 shared queue
//! proxy path ────────────► [job, job] ──┬─► worker 0 ◄─ socket 0
//!              oneshot                  ├─► worker 1 ◄─ socket 1
//!                                       └─► ...
//! ```
//!
//! A worker that fails answers its pending job with 502 and exits; the
//! queue and sibling workers are unaffected.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::constants::TUNNEL_REQUEST_TIMEOUT;
use crate::protocol::{TunnelHttpRequest, TunnelHttpResponse, TunnelMessage};
use crate::ws::{WsMessage, WsReader, WsWriter, CLOSE_NORMAL};

struct Job {
    request: TunnelHttpRequest,
    respond: oneshot::Sender<TunnelHttpResponse>,
}

/// Pool of tunnel sockets for one run.
#[derive(Debug)]
pub struct TunnelPool {
    expected_sockets: usize,
    jobs: mpsc::Sender<Job>,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    registered: watch::Sender<usize>,
    shutdown: watch::Sender<bool>,
}

impl TunnelPool {
    /// Create a pool expecting `expected_sockets` registrations.
    #[must_use]
    pub fn new(expected_sockets: usize) -> Self {
        let (jobs, queue) = mpsc::channel(64);
        let (registered, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        Self {
            expected_sockets,
            jobs,
            queue: Arc::new(Mutex::new(queue)),
            registered,
            shutdown,
        }
    }

    /// Hand an accepted tunnel socket to the pool.
    ///
    /// Spawns the socket's worker task and bumps the readiness count.
    pub fn register(&self, writer: WsWriter, reader: WsReader) {
        let queue = Arc::clone(&self.queue);
        let mut shutdown = self.shutdown.subscribe();
        self.registered.send_modify(|count| *count += 1);

        tokio::spawn(async move {
            if let Err(e) = worker_loop(queue, &mut shutdown, writer, reader).await {
                warn!("[TunnelPool] Worker exited: {e:#}");
            }
        });
    }

    /// Wait until the expected number of sockets has registered.
    ///
    /// # Errors
    ///
    /// Returns an error when the pool shuts down first.
    pub async fn ready(&self) -> Result<()> {
        let mut registered = self.registered.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *registered.borrow() >= self.expected_sockets {
                return Ok(());
            }
            tokio::select! {
                changed = registered.changed() => {
                    changed.map_err(|_| anyhow!("Tunnel pool dropped"))?;
                }
                _ = shutdown.changed() => {
                    return Err(anyhow!("Tunnel pool shut down while waiting for sockets"));
                }
            }
        }
    }

    /// Forward one HTTP request through any idle socket.
    ///
    /// # Errors
    ///
    /// Returns an error when the pool is shut down or the round trip
    /// exceeds the forward timeout.
    pub async fn forward(&self, request: TunnelHttpRequest) -> Result<TunnelHttpResponse> {
        let (respond, response) = oneshot::channel();
        self.jobs
            .send(Job { request, respond })
            .await
            .map_err(|_| anyhow!("Tunnel pool is shut down"))?;

        let response = tokio::time::timeout(TUNNEL_REQUEST_TIMEOUT, response)
            .await
            .map_err(|_| anyhow!("Tunnel request timed out"))?
            .map_err(|_| anyhow!("Tunnel socket dropped while forwarding"))?;
        Ok(response)
    }

    /// Cascade-close: all workers close their sockets with 1000.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn worker_loop(
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    shutdown: &mut watch::Receiver<bool>,
    mut writer: WsWriter,
    mut reader: WsReader,
) -> Result<()> {
    loop {
        // Hold the queue lock only while waiting for a job.
        let job = {
            let mut queue = queue.lock().await;
            tokio::select! {
                job = queue.recv() => job,
                _ = shutdown.changed() => None,
            }
        };
        let Some(job) = job else {
            debug!("[TunnelPool] Worker closing socket");
            writer.close_with_code(CLOSE_NORMAL, "run ended").await.ok();
            return Ok(());
        };

        match exchange(&mut writer, &mut reader, job.request).await {
            Ok(response) => {
                // Receiver may have timed out; that is its problem.
                let _ = job.respond.send(response);
            }
            Err(e) => {
                let _ = job.respond.send(socket_failure_response());
                return Err(e);
            }
        }
    }
}

/// One strict request/response exchange on a socket.
async fn exchange(
    writer: &mut WsWriter,
    reader: &mut WsReader,
    request: TunnelHttpRequest,
) -> Result<TunnelHttpResponse> {
    let frame = TunnelMessage::HttpRequest(request);
    writer
        .send_text(&serde_json::to_string(&frame)?)
        .await
        .context("Failed to send request over tunnel socket")?;

    loop {
        let message = match reader.recv().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(e.context("Tunnel socket failed")),
            None => anyhow::bail!("Tunnel socket closed mid-exchange"),
        };

        match message {
            WsMessage::Text(text) => {
                let frame: TunnelMessage = serde_json::from_str(&text)
                    .context("Unrecognized frame on tunnel socket")?;
                match frame {
                    TunnelMessage::HttpResponse(response) => return Ok(response),
                    TunnelMessage::Error { message } => {
                        anyhow::bail!("Caller reported tunnel error: {message}")
                    }
                    other => {
                        warn!("[TunnelPool] Out-of-phase frame {other:?}, ignoring");
                    }
                }
            }
            WsMessage::Ping(data) => writer.send_pong(data).await?,
            WsMessage::Close { code, reason } => {
                anyhow::bail!("Tunnel socket closed mid-exchange ({code}: {reason})")
            }
            WsMessage::Binary(_) | WsMessage::Pong(_) => {}
        }
    }
}

fn socket_failure_response() -> TunnelHttpResponse {
    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "text/plain".to_string());
    TunnelHttpResponse {
        status: 502,
        headers,
        body: None,
    }
}
