//! Run registry.
//!
//! Maps live run ids to their server-side state. Runs are inserted when the
//! control handshake is confirmed and removed when the control socket
//! closes; removal cascade-closes the run's tunnel pool.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;
use rand::Rng;

use crate::constants::RUN_ID_LENGTH;
use crate::server::tunnel::TunnelPool;

/// Server-side state of one live run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    /// Tunnel pool, present when the caller requested tunneling.
    pub pool: Option<Arc<TunnelPool>>,
    /// Sockets the caller may still attach (starts at the approved quota).
    pub remaining_tunnel_sockets: usize,
}

/// All live runs, keyed by run id.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, RunHandle>>,
}

impl RunRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a confirmed run under a freshly generated id.
    ///
    /// Returns the id.
    pub fn insert(&self, handle: RunHandle) -> String {
        let mut runs = self.lock();
        let run_id = loop {
            let candidate = generate_run_id();
            if !runs.contains_key(&candidate) {
                break candidate;
            }
        };
        runs.insert(run_id.clone(), handle);
        info!("[Registry] Run {run_id} registered ({} live)", runs.len());
        run_id
    }

    /// Look up a run.
    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<RunHandle> {
        self.lock().get(run_id).cloned()
    }

    /// Claim one tunnel socket slot for a run.
    ///
    /// Returns the run's pool when a slot was available, `None` when the
    /// run is unknown, has no pool, or is over quota.
    #[must_use]
    pub fn claim_tunnel_slot(&self, run_id: &str) -> Option<Arc<TunnelPool>> {
        let mut runs = self.lock();
        let handle = runs.get_mut(run_id)?;
        let pool = handle.pool.as_ref()?;
        if handle.remaining_tunnel_sockets == 0 {
            return None;
        }
        let pool = Arc::clone(pool);
        handle.remaining_tunnel_sockets -= 1;
        Some(pool)
    }

    /// Remove a run, cascade-closing its tunnel pool.
    pub fn remove(&self, run_id: &str) {
        let removed = self.lock().remove(run_id);
        if let Some(handle) = removed {
            if let Some(pool) = handle.pool {
                pool.shutdown();
            }
            info!("[Registry] Run {run_id} removed");
        }
    }

    /// Number of live runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no runs are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunHandle>> {
        // Lock poisoning means a panic while holding the map; the state is
        // plain data, so continuing with it is sound.
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Generate an opaque run id usable as a DNS label
/// (`<runId>.localhost` subdomain): lowercase alphanumeric, first
/// character a letter.
#[must_use]
pub fn generate_run_id() -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    let mut rng = rand::rng();
    let mut id = String::with_capacity(RUN_ID_LENGTH);
    id.push(LETTERS[rng.random_range(0..LETTERS.len())] as char);
    for _ in 1..RUN_ID_LENGTH {
        id.push(ALPHANUMERIC[rng.random_range(0..ALPHANUMERIC.len())] as char);
    }
    id
}
