//! Durable storage for runs and dimension results.
//!
//! The orchestrator is the only writer. Both implementations enforce the
//! same two invariants: terminal runs are immutable, and each
//! (run, dimension) pair receives at most one result. The store also holds
//! the session claims that keep one run active per session across every
//! process sharing it.

pub mod file;
pub mod memory;

pub use file::FileRunStore;
pub use memory::MemoryRunStore;

use crate::models::{DimensionResult, Run, RunStatus};
use async_trait::async_trait;
use thiserror::Error;

/// Errors returned by a [`RunStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run store unavailable: {0}")]
    Unavailable(String),

    #[error("Run {run_id} not found")]
    NotFound { run_id: String },

    #[error("Run {run_id} is {status} and can no longer be modified")]
    Immutable { run_id: String, status: RunStatus },

    #[error("Run {run_id} already has a result for dimension {dimension_id}")]
    DuplicateResult { run_id: String, dimension_id: String },

    #[error("Run store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage contract consumed by the orchestrator and the gap analyzer.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a freshly created run.
    async fn create_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Replace a run's fields. Rejected once the stored run is terminal.
    async fn update_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Append one dimension result to its run.
    async fn append_result(&self, result: &DimensionResult) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

    async fn results_for_run(&self, run_id: &str) -> Result<Vec<DimensionResult>, StoreError>;

    /// All runs for a session, oldest first.
    async fn runs_for_session(&self, session_id: &str) -> Result<Vec<Run>, StoreError>;

    /// Claim `session_id` for `run_id`.
    ///
    /// Returns `Some(holder)` with the run currently holding the session, or
    /// `None` once the claim is taken. A claim whose run is already terminal
    /// is stale and gets replaced.
    async fn claim_session(&self, session_id: &str, run_id: &str) -> Result<Option<String>, StoreError>;

    /// Drop the claim on `session_id` if `run_id` still holds it.
    async fn release_session(&self, session_id: &str, run_id: &str) -> Result<(), StoreError>;

    /// Most recently started completed run for a session.
    async fn latest_completed_run(&self, session_id: &str) -> Result<Option<Run>, StoreError> {
        let runs = self.runs_for_session(session_id).await?;
        Ok(runs
            .into_iter()
            .filter(|r| r.status == RunStatus::Completed)
            .max_by_key(|r| r.started_at))
    }
}

/// Check shared by both implementations before overwriting a run.
fn ensure_mutable(stored: &Run) -> Result<(), StoreError> {
    if stored.status.is_terminal() {
        return Err(StoreError::Immutable {
            run_id: stored.id.clone(),
            status: stored.status,
        });
    }
    Ok(())
}
