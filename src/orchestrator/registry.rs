//! Single-flight registry: at most one active run per session within this
//! process. Cross-process exclusion is the run store's session claim.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Process-wide map of `session_id -> active run_id`.
#[derive(Debug, Default)]
pub struct SingleFlight {
    active: Mutex<HashMap<String, String>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        // Inserts and removes cannot leave the map half-updated.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically claim `session_id` for `run_id`.
    ///
    /// Returns the id of the run already holding the session on conflict.
    pub fn try_acquire(
        self: &Arc<Self>,
        session_id: &str,
        run_id: &str,
    ) -> Result<FlightGuard, String> {
        let mut active = self.lock();
        if let Some(existing) = active.get(session_id) {
            return Err(existing.clone());
        }
        active.insert(session_id.to_string(), run_id.to_string());
        debug!("Session {} claimed by run {}", session_id, run_id);

        Ok(FlightGuard {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
            run_id: run_id.to_string(),
        })
    }

    pub fn active_run(&self, session_id: &str) -> Option<String> {
        self.lock().get(session_id).cloned()
    }

    #[allow(dead_code)] // Used by tests and embedders
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, session_id: &str, run_id: &str) {
        let mut active = self.lock();
        if active.get(session_id).map(String::as_str) == Some(run_id) {
            active.remove(session_id);
            debug!("Session {} released by run {}", session_id, run_id);
        }
    }
}

/// Holds a session's slot; releases it when dropped, on every exit path.
#[derive(Debug)]
pub struct FlightGuard {
    registry: Arc<SingleFlight>,
    session_id: String,
    run_id: String,
}

impl FlightGuard {
    #[allow(dead_code)] // Used by tests and embedders
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.registry.release(&self.session_id, &self.run_id);
    }
}
