//! Process-local run store.

use super::{ensure_mutable, RunStore, StoreError};
use crate::models::{DimensionResult, Run};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    runs: HashMap<String, Run>,
    results: HashMap<String, Vec<DimensionResult>>,
    /// session id -> run id holding it
    sessions: HashMap<String, String>,
}

/// In-memory [`RunStore`], used for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryRunStore {
    inner: Mutex<Inner>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.runs.insert(run.id.clone(), run.clone());
        inner.results.entry(run.id.clone()).or_default();
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let stored = inner.runs.get_mut(&run.id).ok_or_else(|| StoreError::NotFound {
            run_id: run.id.clone(),
        })?;
        ensure_mutable(stored)?;
        *stored = run.clone();
        Ok(())
    }

    async fn append_result(&self, result: &DimensionResult) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if !inner.runs.contains_key(&result.run_id) {
            return Err(StoreError::NotFound {
                run_id: result.run_id.clone(),
            });
        }

        let results = inner.results.entry(result.run_id.clone()).or_default();
        if results.iter().any(|r| r.dimension_id == result.dimension_id) {
            return Err(StoreError::DuplicateResult {
                run_id: result.run_id.clone(),
                dimension_id: result.dimension_id.clone(),
            });
        }
        results.push(result.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    async fn results_for_run(&self, run_id: &str) -> Result<Vec<DimensionResult>, StoreError> {
        Ok(self
            .lock()?
            .results
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn runs_for_session(&self, session_id: &str) -> Result<Vec<Run>, StoreError> {
        let mut runs: Vec<Run> = self
            .lock()?
            .runs
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn claim_session(&self, session_id: &str, run_id: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock()?;
        if let Some(holder) = inner.sessions.get(session_id) {
            let live = inner.runs.get(holder).map_or(true, |run| run.is_active());
            if live && holder != run_id {
                return Ok(Some(holder.clone()));
            }
        }
        inner.sessions.insert(session_id.to_string(), run_id.to_string());
        Ok(None)
    }

    async fn release_session(&self, session_id: &str, run_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.sessions.get(session_id).map(String::as_str) == Some(run_id) {
            inner.sessions.remove(session_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, DimensionDescriptor, Judgment, Priority, RunStatus};
    use tokio_test::{assert_err, assert_ok};

    fn descriptor(id: &str) -> DimensionDescriptor {
        DimensionDescriptor {
            id: id.to_string(),
            category: Category::Market,
            priority: Priority::High,
            title: id.to_string(),
            guidance: String::new(),
        }
    }

    #[tokio::test]
    async fn test_terminal_run_is_immutable() {
        let store = MemoryRunStore::new();
        let mut run = Run::new("s", vec!["a".into()], String::new());
        assert_ok!(store.create_run(&run).await);

        run.status = RunStatus::Completed;
        assert_ok!(store.update_run(&run).await);

        run.overall_score = Some(99);
        let err = store.update_run(&run).await.unwrap_err();
        assert!(matches!(err, StoreError::Immutable { .. }));
    }

    #[tokio::test]
    async fn test_result_appended_once_per_dimension() {
        let store = MemoryRunStore::new();
        let run = Run::new("s", vec!["a".into()], String::new());
        store.create_run(&run).await.unwrap();

        let result = DimensionResult::scored(&run.id, &descriptor("a"), Judgment::default());
        assert_ok!(store.append_result(&result).await);
        assert_err!(store.append_result(&result).await);
        assert_eq!(store.results_for_run(&run.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_completed_run() {
        let store = MemoryRunStore::new();
        let mut first = Run::new("s", vec!["a".into()], String::new());
        first.status = RunStatus::Completed;
        let mut second = Run::new("s", vec!["a".into()], String::new());
        second.started_at = first.started_at + chrono::Duration::seconds(5);
        second.status = RunStatus::Completed;
        let mut running = Run::new("s", vec!["a".into()], String::new());
        running.started_at = first.started_at + chrono::Duration::seconds(10);

        for run in [&first, &second, &running] {
            store.create_run(run).await.unwrap();
        }

        let latest = store.latest_completed_run("s").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(store.latest_completed_run("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_claim_is_exclusive_until_released() {
        let store = MemoryRunStore::new();
        assert_eq!(store.claim_session("s", "run-1").await.unwrap(), None);
        assert_eq!(
            store.claim_session("s", "run-2").await.unwrap(),
            Some("run-1".to_string())
        );
        assert_eq!(store.claim_session("other", "run-3").await.unwrap(), None);

        // only the holder can release
        store.release_session("s", "run-2").await.unwrap();
        assert!(store.claim_session("s", "run-2").await.unwrap().is_some());

        store.release_session("s", "run-1").await.unwrap();
        assert_eq!(store.claim_session("s", "run-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claim_held_by_finished_run_is_stale() {
        let store = MemoryRunStore::new();
        let mut run = Run::new("s", vec!["a".into()], String::new());
        store.create_run(&run).await.unwrap();
        assert_eq!(store.claim_session("s", &run.id).await.unwrap(), None);
        assert!(store.claim_session("s", "next").await.unwrap().is_some());

        run.status = RunStatus::Failed;
        store.update_run(&run).await.unwrap();
        assert_eq!(store.claim_session("s", "next").await.unwrap(), None);
    }
}
