//! Test doubles shared by the unit tests.

use crate::catalog::Catalog;
use crate::evaluator::{EvaluationError, Evaluator};
use crate::models::{Category, DimensionDescriptor, DimensionResult, Judgment, Priority, Run};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::progress::ProgressBroadcaster;
use crate::store::{MemoryRunStore, RunStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

const DEFAULT_SCORE: u8 = 50;

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Score(u8),
    Fail,
    Panic,
    Hang,
}

/// Evaluator whose outcome per dimension is fixed up front.
///
/// A gated evaluator blocks every call until [`ScriptedEvaluator::release`]
/// hands out a permit. Calls in flight are counted so tests can check the
/// concurrency bound.
pub struct ScriptedEvaluator {
    behaviors: HashMap<String, Behavior>,
    gate: Option<Semaphore>,
    latency: Duration,
    calls: Mutex<Vec<(String, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            gate: None,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn score(mut self, id: &str, score: u8) -> Self {
        self.behaviors.insert(id.to_string(), Behavior::Score(score));
        self
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.behaviors.insert(id.to_string(), Behavior::Fail);
        self
    }

    pub fn panicking(mut self, id: &str) -> Self {
        self.behaviors.insert(id.to_string(), Behavior::Panic);
        self
    }

    pub fn hanging(mut self, id: &str) -> Self {
        self.behaviors.insert(id.to_string(), Behavior::Hang);
        self
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Sleep this long inside every call.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Most calls that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Let `n` more gated calls proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Dimension ids in the order they were called.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        dimension: &DimensionDescriptor,
        _context: &str,
    ) -> Result<Judgment, EvaluationError> {
        self.calls
            .lock()
            .unwrap()
            .push((dimension.id.clone(), Instant::now()));
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let _done = InFlight(&self.in_flight);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self
            .behaviors
            .get(&dimension.id)
            .copied()
            .unwrap_or(Behavior::Score(DEFAULT_SCORE))
        {
            Behavior::Score(score) => Ok(Judgment {
                score,
                findings: vec![format!("{} reviewed", dimension.title)],
                follow_up_questions: vec![format!("What else about {}?", dimension.id)],
                ..Default::default()
            }),
            Behavior::Fail => Err(EvaluationError::Malformed("scripted failure".to_string())),
            Behavior::Panic => panic!("scripted panic for {}", dimension.id),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Decrements the in-flight count however the call ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Catalog of market dimensions with the given ids.
pub fn catalog(ids: &[&str]) -> Catalog {
    let dimensions = ids
        .iter()
        .map(|id| DimensionDescriptor {
            id: id.to_string(),
            category: Category::Market,
            priority: Priority::High,
            title: format!("Dimension {}", id),
            guidance: String::new(),
        })
        .collect();
    Catalog::new(dimensions).unwrap()
}

/// Orchestrator over an in-memory store and a fresh broadcaster.
pub fn orchestrator(
    catalog: Catalog,
    evaluator: Arc<ScriptedEvaluator>,
    config: OrchestratorConfig,
) -> (Orchestrator, Arc<MemoryRunStore>, Arc<ProgressBroadcaster>) {
    let store = Arc::new(MemoryRunStore::new());
    let broadcaster = Arc::new(ProgressBroadcaster::default());
    let orchestrator = Orchestrator::new(
        store.clone(),
        evaluator,
        Arc::new(catalog),
        broadcaster.clone(),
        config,
    );
    (orchestrator, store, broadcaster)
}

/// In-memory store that can be told to reject specific writes.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryRunStore,
    fail_create: bool,
    fail_append: bool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn fail_append(mut self) -> Self {
        self.fail_append = true;
        self
    }
}

#[async_trait]
impl RunStore for FlakyStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        if self.fail_create {
            return Err(StoreError::Unavailable("create rejected".to_string()));
        }
        self.inner.create_run(run).await
    }

    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        self.inner.update_run(run).await
    }

    async fn append_result(&self, result: &DimensionResult) -> Result<(), StoreError> {
        if self.fail_append {
            return Err(StoreError::Unavailable("append rejected".to_string()));
        }
        self.inner.append_result(result).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        self.inner.get_run(run_id).await
    }

    async fn results_for_run(&self, run_id: &str) -> Result<Vec<DimensionResult>, StoreError> {
        self.inner.results_for_run(run_id).await
    }

    async fn runs_for_session(&self, session_id: &str) -> Result<Vec<Run>, StoreError> {
        self.inner.runs_for_session(session_id).await
    }

    async fn claim_session(&self, session_id: &str, run_id: &str) -> Result<Option<String>, StoreError> {
        self.inner.claim_session(session_id, run_id).await
    }

    async fn release_session(&self, session_id: &str, run_id: &str) -> Result<(), StoreError> {
        self.inner.release_session(session_id, run_id).await
    }
}
