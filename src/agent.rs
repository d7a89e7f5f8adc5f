//! Execution-agent seam.
//!
//! The transport never drives a browser itself. The server hands each
//! confirmed run to a [`RunAgent`] implementation and bridges the events it
//! emits onto the control socket (and the observer socket when one is
//! attached).
//!
//! Events travel over an `mpsc::UnboundedSender<AgentEvent>` rather than
//! callbacks, so the agent's concurrency model stays decoupled from the
//! protocol layer.

// Rust guideline compliant 2026-02

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Lifecycle events an agent emits while executing a run.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Execution has started.
    Start {
        /// Metadata attached to the run by the server (organization,
        /// dashboard link). Agents usually emit an empty object; the
        /// server fills this in before forwarding.
        run_metadata: Value,
    },
    /// A browser action was performed.
    ActionTaken {
        /// Description of the action.
        action: Value,
    },
    /// A test step finished.
    StepCompleted,
    /// A test check finished.
    CheckCompleted,
    /// The run failed mid-execution.
    Fail {
        /// Failure detail.
        failure: Value,
    },
    /// The run finished with an outcome. Terminal; nothing may follow.
    Done {
        /// Final run outcome.
        result: RunOutcome,
    },
}

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Whether every step and check succeeded.
    pub passed: bool,
    /// Additional outcome fields, carried through untouched.
    #[serde(flatten)]
    pub extra: Value,
}

impl RunOutcome {
    /// An outcome with `passed` set and no extra fields.
    #[must_use]
    pub fn new(passed: bool) -> Self {
        Self {
            passed,
            extra: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Executes a confirmed run.
///
/// Implementations emit [`AgentEvent`]s on `events` as execution progresses
/// and must finish with [`AgentEvent::Done`]. When the run needs a tunnel,
/// `start_url` points at the run's proxy address; the agent's browser
/// traffic to that URL reaches the caller's local origin.
#[async_trait]
pub trait RunAgent: Send + Sync {
    /// Execute `test_case` for the run identified by `run_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when execution cannot proceed at all; mid-run
    /// failures are reported as [`AgentEvent::Fail`] instead.
    async fn run(
        &self,
        run_id: &str,
        test_case: Value,
        start_url: Option<String>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()>;
}
