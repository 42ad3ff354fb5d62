//! Run lifecycle and execution.
//!
//! The orchestrator owns every write to runs and dimension results. It
//! admits at most one active run per session, evaluates the target
//! dimensions with bounded concurrency, and reports progress to the
//! broadcaster as each dimension finishes. Admission is checked in-process
//! first and then claimed in the run store, which other processes share.

pub mod pacer;
pub mod registry;
pub mod runner;

pub use runner::{Orchestrator, RunHandle};

use crate::catalog::SubsetError;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Execution settings for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Maximum dimensions evaluated at once (at least 1).
    pub concurrency: usize,
    /// Minimum gap between dispatches; zero disables pacing.
    pub dispatch_delay: Duration,
    /// Per-dimension limit on the analysis call.
    pub dimension_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            dispatch_delay: Duration::ZERO,
            dimension_timeout: Duration::from_secs(180),
        }
    }
}

/// Why a run could not be started.
#[derive(Debug, Error)]
pub enum StartRunError {
    /// Expected control-flow signal: observe the existing run instead.
    #[error("already_running: session {session_id} has active run {run_id}")]
    AlreadyRunning { session_id: String, run_id: String },

    #[error("Invalid dimension subset: {0}")]
    InvalidSubset(#[from] SubsetError),

    #[error("Run store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl StartRunError {
    pub fn is_already_running(&self) -> bool {
        matches!(self, StartRunError::AlreadyRunning { .. })
    }

    /// Id of the run to observe when the session is busy.
    pub fn active_run_id(&self) -> Option<&str> {
        match self {
            StartRunError::AlreadyRunning { run_id, .. } => Some(run_id),
            _ => None,
        }
    }
}

/// Terminal orchestration failure of a started run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {run_id} failed: {reason}")]
    Failed { run_id: String, reason: String },

    #[error("Run {run_id} task aborted: {reason}")]
    Aborted { run_id: String, reason: String },
}
