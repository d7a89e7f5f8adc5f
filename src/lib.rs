//! Transport layer for remote browser-test runs.
//!
//! A caller submits a test case over a WebSocket control channel; the
//! server registers the run, executes it through a pluggable agent, and
//! streams lifecycle events back. When the test targets an app on the
//! caller's machine, a pool of reverse tunnel sockets carries the hosted
//! browser's HTTP traffic to the caller's local origin.
//!
//! # Modules
//!
//! - [`client`] — caller-side control channel ([`client::RunClient`]).
//! - [`tunnel`] — caller-side tunnel socket workers.
//! - [`server`] — router, run registry, and server-side socket handling.
//! - [`observer`] — authorization channel to the observer service.
//! - [`agent`] — the execution-agent seam.
//! - [`protocol`] — JSON message families shared by both sides.
//! - [`wire`] — HTTP/1.1 codec for tunneled requests.
//! - [`ws`] — shared WebSocket transport.

// Rust guideline compliant 2026-02

pub mod agent;
pub mod client;
pub mod config;
pub mod constants;
pub mod observer;
pub mod protocol;
pub mod server;
pub mod tunnel;
pub mod wire;
pub mod ws;

pub use agent::{AgentEvent, RunAgent, RunOutcome};
pub use client::{RunClient, RunListener};
pub use config::Config;
pub use server::RunServer;
