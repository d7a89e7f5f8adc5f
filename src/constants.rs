//! Application-wide constants.
//!
//! Centralizes timeouts and protocol defaults so callers and the server
//! agree on the same numbers.

// Rust guideline compliant 2026-02

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Handshake timeout for `init:tunnel` and `init:authorize`.
///
/// A socket that has not been accepted within this window is torn down;
/// only that socket is affected.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for forwarding one HTTP request through the tunnel.
///
/// Covers the full round trip: queue on the pool, transit to the caller,
/// the caller's local HTTP call, and the response frame coming back.
pub const TUNNEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for the rest of a partially arrived
/// request head. Peeking leaves the bytes in the kernel buffer, so
/// without this pause a stalled head would be re-peeked in a tight loop.
pub const HEAD_POLL_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Protocol defaults
// ============================================================================

/// Default port the server listens on. Also the port baked into
/// `http://<runId>.localhost:<port>` URLs handed to the hosted browser.
pub const DEFAULT_PORT: u16 = 4444;

/// Tunnel sockets approved per run. Bounds the number of HTTP requests
/// that can be in flight toward one caller's local origin.
pub const SOCKETS_PER_RUN: usize = 6;

/// Length of generated run identifiers.
pub const RUN_ID_LENGTH: usize = 12;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_shorter_than_forward_timeout() {
        assert!(HANDSHAKE_TIMEOUT < TUNNEL_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_head_poll_much_shorter_than_handshake() {
        assert!(HEAD_POLL_INTERVAL * 10 < HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn test_protocol_defaults_are_positive() {
        assert!(DEFAULT_PORT > 1024);
        assert!(SOCKETS_PER_RUN >= 1);
        assert!(RUN_ID_LENGTH >= 8);
    }
}
