//! Socket message families.
//!
//! Every frame on every socket is a single UTF-8 JSON object, adjacently
//! tagged as `{ "kind": ..., "payload": { ... } }` with camelCase payload
//! fields. Three exhaustive families exist:
//!
//! - [`ControlMessage`] — run lifecycle on the control socket.
//! - [`TunnelMessage`] — handshake and HTTP exchange on tunnel sockets.
//! - [`ObserverMessage`] — authorization handshake on the observer socket.
//!
//! Tunnel HTTP bodies are base64-encoded bytes in both directions so binary
//! content survives the JSON envelope. An unrecognized `kind` is a decode
//! error the receiver handles per message, never a crash.

// Rust guideline compliant 2026-02

use std::collections::HashMap;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::RunOutcome;
use crate::wire::{Body, WireRequest, WireResponse};

/// Messages exchanged on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum ControlMessage {
    /// Caller requests a run.
    #[serde(rename = "init:run")]
    RequestStartRun(RequestStartRun),
    /// Server confirms the run and reports the tunnel socket quota.
    #[serde(rename = "accept:run")]
    ConfirmStartRun(ConfirmStartRun),
    /// Application error. Fatal for the run when sent by the server.
    #[serde(rename = "error")]
    Error {
        /// Human-readable failure description.
        message: String,
    },
    /// The run has started executing.
    #[serde(rename = "event:start")]
    EventStart {
        /// Server-side metadata about the run (organization, dashboard link).
        #[serde(rename = "runMetadata")]
        run_metadata: Value,
    },
    /// The agent performed a browser action.
    #[serde(rename = "event:action_taken")]
    EventActionTaken {
        /// Description of the action.
        action: Value,
    },
    /// A test step finished.
    #[serde(rename = "event:step_completed")]
    EventStepCompleted {},
    /// A test check finished.
    #[serde(rename = "event:check_completed")]
    EventCheckCompleted {},
    /// The run failed mid-execution.
    #[serde(rename = "event:fail")]
    EventFail {
        /// Failure detail.
        failure: Value,
    },
    /// The run finished and produced its outcome.
    #[serde(rename = "event:done")]
    EventDone {
        /// Final run outcome.
        result: RunOutcome,
    },
}

/// Payload of `init:run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStartRun {
    /// Test-case definition, opaque to the transport.
    pub test_case: Value,
    /// Stable identifier of the test case for authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<String>,
    /// API key forwarded to the observer for authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Whether the caller needs a reverse tunnel to its local origin.
    #[serde(default)]
    pub need_tunnel: bool,
}

/// Payload of `accept:run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmStartRun {
    /// Opaque run identifier, DNS-label-safe.
    pub run_id: String,
    /// Number of tunnel sockets the caller may open for this run.
    pub approved_tunnel_sockets: usize,
}

/// Messages exchanged on a tunnel socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum TunnelMessage {
    /// Caller attaches a tunnel socket to an existing run.
    #[serde(rename = "init:tunnel")]
    InitTunnel {
        /// The run this socket belongs to.
        #[serde(rename = "runId")]
        run_id: String,
    },
    /// Server accepts the tunnel socket into the run's pool.
    #[serde(rename = "accept:tunnel")]
    AcceptTunnel {},
    /// Server forwards an HTTP request toward the caller's local origin.
    #[serde(rename = "tunnel:http_request")]
    HttpRequest(TunnelHttpRequest),
    /// Caller returns the origin's HTTP response.
    #[serde(rename = "tunnel:http_response")]
    HttpResponse(TunnelHttpResponse),
    /// Handshake or forwarding failure on this socket.
    #[serde(rename = "error")]
    Error {
        /// Human-readable failure description.
        message: String,
    },
}

/// HTTP request as carried inside a tunnel frame. Body is base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelHttpRequest {
    /// HTTP method.
    pub method: String,
    /// Path plus query string.
    pub path: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Base64-encoded body bytes, absent when the request has no body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl TunnelHttpRequest {
    /// Build the tunnel form of a decoded request.
    #[must_use]
    pub fn from_wire(request: &WireRequest) -> Self {
        Self {
            method: request.method.clone(),
            path: request.path.clone(),
            headers: request
                .headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: encode_body(&request.body),
        }
    }

    /// Reconstruct a [`WireRequest`] targeting `host`.
    ///
    /// # Errors
    ///
    /// Returns an error when the body is not valid base64.
    pub fn to_wire(&self, host: &str) -> Result<WireRequest> {
        Ok(WireRequest {
            method: self.method.clone(),
            path: self.path.clone(),
            host: host.to_string(),
            headers: self.headers.iter().collect(),
            body: decode_body(self.body.as_deref())?,
        })
    }
}

/// HTTP response as carried inside a tunnel frame. Body is base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelHttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Base64-encoded body bytes, absent when the response has no body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl TunnelHttpResponse {
    /// Build the tunnel form of a decoded response.
    #[must_use]
    pub fn from_wire(response: &WireResponse) -> Self {
        Self {
            status: response.status,
            headers: response
                .headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: encode_body(&response.body),
        }
    }

    /// Reconstruct a [`WireResponse`].
    ///
    /// # Errors
    ///
    /// Returns an error when the body is not valid base64.
    pub fn to_wire(&self) -> Result<WireResponse> {
        Ok(WireResponse {
            status: self.status,
            reason: canonical_reason(self.status).to_string(),
            headers: self.headers.iter().collect(),
            body: decode_body(self.body.as_deref())?,
        })
    }
}

/// Messages exchanged on the observer socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum ObserverMessage {
    /// Request authorization for a run.
    #[serde(rename = "init:authorize")]
    InitAuthorize {
        /// Stable identifier of the test case being run.
        #[serde(rename = "testCaseId", default, skip_serializing_if = "Option::is_none")]
        test_case_id: Option<String>,
        /// API key to authorize against.
        #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
    /// Authorization granted.
    #[serde(rename = "accept:authorize")]
    AcceptAuthorize(AuthorizationGrant),
    /// Authorization denied or observer failure.
    #[serde(rename = "error")]
    Error {
        /// Human-readable failure description.
        message: String,
    },
}

/// What a successful authorization carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationGrant {
    /// Name of the authorized organization.
    pub org_name: String,
    /// Dashboard link for this run, when the observer provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}

fn encode_body(body: &Body) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(BASE64.encode(body.as_bytes()))
    }
}

fn decode_body(encoded: Option<&str>) -> Result<Body> {
    match encoded {
        None => Ok(Body::Empty),
        Some(text) => {
            let bytes = BASE64
                .decode(text)
                .context("Invalid base64 in tunnel body")?;
            Ok(Body::Binary(bytes))
        }
    }
}

/// Standard reason phrase for a status code.
#[must_use]
pub fn canonical_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
