//! Caller-side control channel.
//!
//! [`RunClient::run`] drives one remote run end to end:
//!
//! ```text
//! connect ──► init:run ──► accept:run ──► event:* ... ──► event:done
//!                              │
//!                              └─► spawn approved tunnel workers
//!                                  (when a local origin is configured)
//! ```
//!
//! Lifecycle events fan out to registered [`RunListener`]s without blocking
//! the read loop. The call resolves exactly once: with the outcome on
//! `event:done` (socket closed 1000), or with an error on a server `error`
//! frame (closed 1011) or on transport failure.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde_json::Value;

use crate::agent::RunOutcome;
use crate::protocol::{ControlMessage, RequestStartRun};
use crate::tunnel;
use crate::ws::{self, WsMessage, CLOSE_NORMAL, CLOSE_SERVER_ERROR};

/// Observer of run lifecycle events on the caller side.
///
/// All methods have no-op defaults; implement only what you need. Methods
/// are called on the control socket's read task and must not block.
pub trait RunListener: Send + Sync {
    /// The run has started executing.
    fn on_start(&self, _run_metadata: &Value) {}
    /// The agent performed a browser action.
    fn on_action_taken(&self, _action: &Value) {}
    /// A test step finished.
    fn on_step_completed(&self) {}
    /// A test check finished.
    fn on_check_completed(&self) {}
    /// The run failed mid-execution. `event:done` still follows.
    fn on_fail(&self, _failure: &Value) {}
    /// The run finished.
    fn on_done(&self, _result: &RunOutcome) {}
}

/// Client for executing remote runs.
#[derive(Default)]
pub struct RunClient {
    server_url: String,
    local_origin: Option<String>,
    api_key: Option<String>,
    listeners: Vec<Arc<dyn RunListener>>,
}

impl std::fmt::Debug for RunClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunClient")
            .field("server_url", &self.server_url)
            .field("local_origin", &self.local_origin)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl RunClient {
    /// Create a client targeting `server_url` (http/https or ws/wss).
    #[must_use]
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            local_origin: None,
            api_key: None,
            listeners: Vec::new(),
        }
    }

    /// Request a reverse tunnel to this local origin
    /// (e.g. `http://localhost:3000`).
    #[must_use]
    pub fn with_local_origin(mut self, origin: impl Into<String>) -> Self {
        self.local_origin = Some(origin.into());
        self
    }

    /// API key forwarded to the server for authorization.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Register a lifecycle listener. Zero or more may be attached.
    pub fn add_listener(&mut self, listener: Arc<dyn RunListener>) {
        self.listeners.push(listener);
    }

    /// Execute a run and wait for its outcome.
    ///
    /// # Errors
    ///
    /// Returns the server's `error` message when the run is refused or
    /// fails, or a connection-failure error when the transport drops before
    /// `event:done`.
    pub async fn run(
        &self,
        test_case: Value,
        test_case_id: Option<String>,
    ) -> Result<RunOutcome> {
        let url = ws::http_to_ws_scheme(&self.server_url);
        let (mut writer, mut reader) = ws::connect(&url, &[])
            .await
            .with_context(|| format!("Failed to connect to {}", self.server_url))?;

        let init = ControlMessage::RequestStartRun(RequestStartRun {
            test_case,
            test_case_id,
            api_key: self.api_key.clone(),
            need_tunnel: self.local_origin.is_some(),
        });
        writer
            .send_text(&serde_json::to_string(&init)?)
            .await
            .context("Failed to send run request")?;

        let mut run_id: Option<String> = None;
        let mut tunnel_workers = Vec::new();

        let outcome = loop {
            let message = match reader.recv().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    break Err(e.context("Connection to run server failed"));
                }
                None => break Err(anyhow!("Connection to run server failed")),
            };

            match message {
                WsMessage::Text(text) => {
                    let frame: ControlMessage = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("[Control] Unrecognized frame, skipping: {e}");
                            continue;
                        }
                    };
                    match self.handle_frame(frame, &mut run_id, &mut tunnel_workers) {
                        FrameOutcome::Continue => {}
                        FrameOutcome::Done(result) => {
                            writer.close_with_code(CLOSE_NORMAL, "run complete").await.ok();
                            break Ok(result);
                        }
                        FrameOutcome::Failed(message) => {
                            writer.close_with_code(CLOSE_SERVER_ERROR, &message).await.ok();
                            break Err(anyhow!("{message}"));
                        }
                    }
                }
                WsMessage::Ping(data) => {
                    writer.send_pong(data).await.ok();
                }
                WsMessage::Close { code, reason } => {
                    break Err(anyhow!(
                        "Connection to run server failed (closed {code}: {reason})"
                    ));
                }
                WsMessage::Binary(_) | WsMessage::Pong(_) => {}
            }
        };

        // Tunnel workers die with the run either way; reap them quietly.
        for worker in tunnel_workers {
            worker.abort();
        }

        outcome
    }

    fn handle_frame(
        &self,
        frame: ControlMessage,
        run_id: &mut Option<String>,
        tunnel_workers: &mut Vec<tokio::task::JoinHandle<()>>,
    ) -> FrameOutcome {
        match frame {
            ControlMessage::ConfirmStartRun(confirm) => {
                info!("[Control] Run {} confirmed", confirm.run_id);
                if let Some(origin) = &self.local_origin {
                    for index in 0..confirm.approved_tunnel_sockets {
                        let server_url = self.server_url.clone();
                        let rid = confirm.run_id.clone();
                        let origin = origin.clone();
                        tunnel_workers.push(tokio::spawn(async move {
                            if let Err(e) =
                                tunnel::run_tunnel_socket(&server_url, &rid, &origin).await
                            {
                                warn!("[Tunnel] Socket {index} for run {rid} ended: {e:#}");
                            }
                        }));
                    }
                }
                *run_id = Some(confirm.run_id);
                FrameOutcome::Continue
            }
            ControlMessage::EventStart { run_metadata } => {
                self.each_listener(|l| l.on_start(&run_metadata));
                FrameOutcome::Continue
            }
            ControlMessage::EventActionTaken { action } => {
                self.each_listener(|l| l.on_action_taken(&action));
                FrameOutcome::Continue
            }
            ControlMessage::EventStepCompleted {} => {
                self.each_listener(|l| l.on_step_completed());
                FrameOutcome::Continue
            }
            ControlMessage::EventCheckCompleted {} => {
                self.each_listener(|l| l.on_check_completed());
                FrameOutcome::Continue
            }
            ControlMessage::EventFail { failure } => {
                self.each_listener(|l| l.on_fail(&failure));
                FrameOutcome::Continue
            }
            ControlMessage::EventDone { result } => {
                self.each_listener(|l| l.on_done(&result));
                FrameOutcome::Done(result)
            }
            ControlMessage::Error { message } => FrameOutcome::Failed(message),
            ControlMessage::RequestStartRun(_) => {
                // Server never sends init:run. Phase violation, not fatal.
                warn!("[Control] Out-of-phase init:run from server, ignoring");
                FrameOutcome::Continue
            }
        }
    }

    fn each_listener(&self, f: impl Fn(&dyn RunListener)) {
        for listener in &self.listeners {
            f(listener.as_ref());
        }
    }
}

enum FrameOutcome {
    Continue,
    Done(RunOutcome),
    Failed(String),
}
