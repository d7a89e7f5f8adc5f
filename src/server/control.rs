//! Per-socket protocol state machine.
//!
//! Every accepted WebSocket starts role-less. Its first message decides
//! what it is:
//!
//! - `init:run` — a control socket. The run is authorized (when an observer
//!   is configured), registered, confirmed with `accept:run`, and executed
//!   by the configured agent; agent events stream back as `event:*` frames.
//! - `init:tunnel` — a tunnel socket. The run id is validated against the
//!   registry, quota permitting the socket joins the run's pool.
//!
//! Per-message decode or handling errors are caught and logged; the loop
//! never crashes the server. Fatal application errors send `error` and
//! close 1011.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::AgentEvent;
use crate::constants::HANDSHAKE_TIMEOUT;
use crate::observer::{self, ObserverConn};
use crate::protocol::{
    AuthorizationGrant, ConfirmStartRun, ControlMessage, RequestStartRun, TunnelMessage,
};
use crate::server::registry::RunHandle;
use crate::server::tunnel::TunnelPool;
use crate::server::ServerState;
use crate::ws::{WsMessage, WsReader, WsWriter, CLOSE_NORMAL, CLOSE_SERVER_ERROR};

/// Drive one accepted WebSocket from first message to close.
pub async fn handle_socket(state: Arc<ServerState>, mut writer: WsWriter, mut reader: WsReader) {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_text(&mut writer, &mut reader)).await;
    let text = match first {
        Ok(Ok(Some(text))) => text,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!("[Control] Socket failed before first message: {e:#}");
            return;
        }
        Err(_) => {
            warn!("[Control] No handshake within timeout, dropping socket");
            writer.close().await.ok();
            return;
        }
    };

    let result = match role_of(&text) {
        Some(Role::Run) => match serde_json::from_str::<ControlMessage>(&text) {
            Ok(ControlMessage::RequestStartRun(request)) => {
                run_control(&state, &mut writer, &mut reader, request).await
            }
            Ok(_) | Err(_) => fatal(&mut writer, "Malformed run request").await,
        },
        Some(Role::Tunnel) => match serde_json::from_str::<TunnelMessage>(&text) {
            Ok(TunnelMessage::InitTunnel { run_id }) => {
                // On success the socket now belongs to the pool.
                attach_tunnel(&state, writer, reader, &run_id).await;
                return;
            }
            Ok(_) | Err(_) => fatal(&mut writer, "Malformed tunnel request").await,
        },
        None => fatal(&mut writer, "Expected init:run or init:tunnel").await,
    };

    if let Err(e) = result {
        warn!("[Control] Socket ended with error: {e:#}");
    }
}

enum Role {
    Run,
    Tunnel,
}

fn role_of(text: &str) -> Option<Role> {
    let value: Value = serde_json::from_str(text).ok()?;
    match value.get("kind").and_then(Value::as_str) {
        Some("init:run") => Some(Role::Run),
        Some("init:tunnel") => Some(Role::Tunnel),
        _ => None,
    }
}

/// Validate and hand a tunnel socket to its run's pool.
async fn attach_tunnel(state: &ServerState, mut writer: WsWriter, reader: WsReader, run_id: &str) {
    if state.registry.get(run_id).is_none() {
        let _ = fatal(&mut writer, &format!("Unknown or terminated run: {run_id}")).await;
        return;
    }
    let Some(pool) = state.registry.claim_tunnel_slot(run_id) else {
        let _ = fatal(&mut writer, &format!("Tunnel socket quota exceeded for run {run_id}")).await;
        return;
    };

    let accept = TunnelMessage::AcceptTunnel {};
    match serde_json::to_string(&accept) {
        Ok(text) => {
            if let Err(e) = writer.send_text(&text).await {
                warn!("[Tunnel] Failed to confirm tunnel socket: {e:#}");
                return;
            }
        }
        Err(e) => {
            warn!("[Tunnel] Failed to encode accept frame: {e}");
            return;
        }
    }

    debug!("[Tunnel] Socket attached to run {run_id}");
    pool.register(writer, reader);
}

/// Full lifecycle of a control socket after `init:run`.
async fn run_control(
    state: &ServerState,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    request: RequestStartRun,
) -> Result<()> {
    // Authorize against the observer when one is configured.
    let observer = match &state.config.observer_url {
        Some(url) => {
            match observer::connect(url, request.api_key.as_deref(), request.test_case_id.as_deref())
                .await
            {
                Ok(conn) => Some(conn),
                Err(e) => return fatal(writer, &format!("{e:#}")).await,
            }
        }
        None => None,
    };

    let pool = if request.need_tunnel {
        Some(Arc::new(TunnelPool::new(state.config.sockets_per_run)))
    } else {
        None
    };
    let approved = if request.need_tunnel {
        state.config.sockets_per_run
    } else {
        0
    };

    let run_id = state.registry.insert(RunHandle {
        pool: pool.clone(),
        remaining_tunnel_sockets: approved,
    });

    let confirm = ControlMessage::ConfirmStartRun(ConfirmStartRun {
        run_id: run_id.clone(),
        approved_tunnel_sockets: approved,
    });
    writer
        .send_text(&serde_json::to_string(&confirm)?)
        .await
        .context("Failed to confirm run")?;

    info!("[Control] Run {run_id} started (tunnel: {})", request.need_tunnel);

    let result = drive_run(state, writer, reader, &run_id, request, pool, observer).await;

    // Control socket is the run's lifeline; its end removes the run and
    // cascade-closes the tunnel pool.
    state.registry.remove(&run_id);
    result
}

async fn drive_run(
    state: &ServerState,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    run_id: &str,
    request: RequestStartRun,
    pool: Option<Arc<TunnelPool>>,
    mut observer: Option<ObserverConn>,
) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let grant = observer.as_ref().map(|conn| conn.grant.clone());

    let agent = Arc::clone(&state.agent);
    let start_url = pool
        .is_some()
        .then(|| format!("http://{run_id}.localhost:{}", state.config.port));
    let agent_run_id = run_id.to_string();
    let test_case = request.test_case;

    let mut agent_task = tokio::spawn(async move {
        // The agent must not start until the caller's tunnel sockets are
        // attached; its first page load depends on them.
        if let Some(pool) = pool {
            tokio::time::timeout(HANDSHAKE_TIMEOUT, pool.ready())
                .await
                .map_err(|_| anyhow!("Timed out waiting for tunnel sockets"))??;
        }
        agent.run(&agent_run_id, test_case, start_url, events_tx).await
    });
    let mut agent_finished = false;

    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => {
                    let done = matches!(event, AgentEvent::Done { .. });
                    let frame = event_to_frame(event, grant.as_ref());
                    let text = serde_json::to_string(&frame)?;
                    writer
                        .send_text(&text)
                        .await
                        .context("Failed to send event to caller")?;
                    if let Some(conn) = observer.as_mut() {
                        conn.mirror(&text).await;
                    }
                    if done {
                        writer.close_with_code(CLOSE_NORMAL, "run complete").await.ok();
                        return Ok(());
                    }
                }
                None => {
                    // Channel drained without a Done event. Prefer the
                    // agent's own error when it has one.
                    if !agent_finished {
                        match (&mut agent_task).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => return fatal(writer, &format!("{e:#}")).await,
                            Err(e) => {
                                return fatal(writer, &format!("Agent task panicked: {e}")).await
                            }
                        }
                    }
                    return fatal(writer, "Agent finished without reporting an outcome").await;
                }
            },
            result = &mut agent_task, if !agent_finished => {
                agent_finished = true;
                match result {
                    Ok(Ok(())) => {
                        // Buffered events, including Done, still drain above.
                    }
                    Ok(Err(e)) => return fatal(writer, &format!("{e:#}")).await,
                    Err(e) => return fatal(writer, &format!("Agent task panicked: {e}")).await,
                }
            },
            message = reader.recv() => match message {
                Some(Ok(WsMessage::Ping(data))) => writer.send_pong(data).await?,
                Some(Ok(WsMessage::Close { code, reason })) => {
                    debug!("[Control] Caller closed run {run_id} ({code}: {reason})");
                    agent_task.abort();
                    return Ok(());
                }
                Some(Ok(WsMessage::Text(text))) => {
                    warn!("[Control] Unexpected frame during run, ignoring: {text}");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    agent_task.abort();
                    return Err(e.context("Control socket failed"));
                }
                None => {
                    agent_task.abort();
                    return Ok(());
                }
            },
        }
    }
}

/// Map an agent event to its control frame, folding the authorization
/// grant into the start event's metadata.
fn event_to_frame(event: AgentEvent, grant: Option<&AuthorizationGrant>) -> ControlMessage {
    match event {
        AgentEvent::Start { run_metadata } => {
            let run_metadata = fold_grant(run_metadata, grant);
            ControlMessage::EventStart { run_metadata }
        }
        AgentEvent::ActionTaken { action } => ControlMessage::EventActionTaken { action },
        AgentEvent::StepCompleted => ControlMessage::EventStepCompleted {},
        AgentEvent::CheckCompleted => ControlMessage::EventCheckCompleted {},
        AgentEvent::Fail { failure } => ControlMessage::EventFail { failure },
        AgentEvent::Done { result } => ControlMessage::EventDone { result },
    }
}

fn fold_grant(metadata: Value, grant: Option<&AuthorizationGrant>) -> Value {
    let Some(grant) = grant else {
        return metadata;
    };
    let mut map = match metadata {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    map.insert("orgName".to_string(), Value::String(grant.org_name.clone()));
    if let Some(url) = &grant.dashboard_url {
        map.insert("dashboardUrl".to_string(), Value::String(url.clone()));
    }
    Value::Object(map)
}

/// Send `error` and close 1011.
async fn fatal(writer: &mut WsWriter, message: &str) -> Result<()> {
    warn!("[Control] Fatal: {message}");
    let frame = ControlMessage::Error {
        message: message.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&frame) {
        writer.send_text(&text).await.ok();
    }
    writer.close_with_code(CLOSE_SERVER_ERROR, message).await.ok();
    Ok(())
}

/// Read frames until the next text frame, answering pings along the way.
async fn next_text(writer: &mut WsWriter, reader: &mut WsReader) -> Result<Option<String>> {
    loop {
        match reader.recv().await {
            Some(Ok(WsMessage::Text(text))) => return Ok(Some(text)),
            Some(Ok(WsMessage::Ping(data))) => writer.send_pong(data).await?,
            Some(Ok(WsMessage::Close { .. })) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e),
        }
    }
}
