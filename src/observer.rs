//! Observer channel.
//!
//! The server authorizes runs against an external observer service over a
//! WebSocket: send `init:authorize`, wait for `accept:authorize` or `error`.
//! After the handshake the connection stays open and the server mirrors run
//! events to it, so the observer sees the same `event:*` stream the caller
//! does.

// Rust guideline compliant 2026-02

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};

use crate::constants::HANDSHAKE_TIMEOUT;
use crate::protocol::{AuthorizationGrant, ObserverMessage};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// An authorized observer connection.
#[derive(Debug)]
pub struct ObserverConn {
    /// What the observer granted.
    pub grant: AuthorizationGrant,
    /// Write half, kept open for event mirroring.
    pub writer: WsWriter,
    /// Read half. The server does not expect further traffic but keeps it
    /// to notice the observer going away.
    pub reader: WsReader,
}

impl ObserverConn {
    /// Mirror a control-socket frame to the observer.
    ///
    /// Failures are logged and swallowed; the observer going away never
    /// affects the run.
    pub async fn mirror(&mut self, frame: &str) {
        if let Err(e) = self.writer.send_text(frame).await {
            warn!("[Observer] Failed to mirror event: {e:#}");
        }
    }
}

/// Connect to the observer and perform the authorization handshake.
///
/// Resolves with the grant on `accept:authorize`. An `error` reply, a
/// transport failure, or the handshake timeout all reject; the `error`
/// message is surfaced verbatim so callers see phrases like "invalid key".
///
/// # Errors
///
/// Returns an error when the socket cannot be opened, the observer denies
/// the request, or no reply arrives within the handshake timeout.
pub async fn connect(
    observer_url: &str,
    api_key: Option<&str>,
    test_case_id: Option<&str>,
) -> Result<ObserverConn> {
    let url = ws::http_to_ws_scheme(observer_url);
    let (mut writer, mut reader) = ws::connect(&url, &[])
        .await
        .with_context(|| format!("Failed to connect to observer at {observer_url}"))?;

    let init = ObserverMessage::InitAuthorize {
        test_case_id: test_case_id.map(str::to_string),
        api_key: api_key.map(str::to_string),
    };
    writer
        .send_text(&serde_json::to_string(&init)?)
        .await
        .context("Failed to send authorization request")?;

    let grant = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_grant(&mut writer, &mut reader))
        .await
        .map_err(|_| anyhow!("Observer authorization timed out"))??;

    debug!("[Observer] Authorized for org {}", grant.org_name);

    Ok(ObserverConn {
        grant,
        writer,
        reader,
    })
}

/// Read frames until the handshake settles one way or the other.
async fn await_grant(writer: &mut WsWriter, reader: &mut WsReader) -> Result<AuthorizationGrant> {
    loop {
        let message = match reader.recv().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(e.context("Observer socket failed during handshake")),
            None => bail!("Observer closed the socket during handshake"),
        };

        match message {
            WsMessage::Text(text) => {
                let reply: ObserverMessage = serde_json::from_str(&text)
                    .context("Observer sent an unrecognized handshake frame")?;
                match reply {
                    ObserverMessage::AcceptAuthorize(grant) => return Ok(grant),
                    ObserverMessage::Error { message } => bail!("{message}"),
                    ObserverMessage::InitAuthorize { .. } => {
                        warn!("[Observer] Unexpected init:authorize from observer, ignoring");
                    }
                }
            }
            WsMessage::Ping(data) => writer.send_pong(data).await?,
            WsMessage::Close { code, reason } => {
                bail!("Observer closed during handshake ({code}: {reason})")
            }
            WsMessage::Binary(_) | WsMessage::Pong(_) => {}
        }
    }
}
