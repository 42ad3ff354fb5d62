//! The orchestrator and its per-run execution loop.

use super::pacer::Pacer;
use super::registry::{FlightGuard, SingleFlight};
use super::{OrchestratorConfig, RunError, StartRunError};
use crate::analysis::aggregate;
use crate::catalog::Catalog;
use crate::evaluator::{EvaluationError, Evaluator};
use crate::models::{Category, DimensionDescriptor, DimensionResult, ProgressEvent, Run, RunStatus};
use crate::progress::ProgressBroadcaster;
use crate::store::RunStore;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Entry point for starting and executing runs. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    evaluator: Arc<dyn Evaluator>,
    catalog: Arc<Catalog>,
    broadcaster: Arc<ProgressBroadcaster>,
    registry: Arc<SingleFlight>,
    config: OrchestratorConfig,
}

/// Observable handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    session_id: String,
    progress_total: usize,
    task: JoinHandle<Result<Run, RunError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn progress_total(&self) -> usize {
        self.progress_total
    }

    /// Wait for the run to reach a terminal state.
    ///
    /// The session's single-flight slot is already released when this
    /// returns.
    pub async fn wait(self) -> Result<Run, RunError> {
        let run_id = self.run_id;
        self.task.await.map_err(|e| RunError::Aborted {
            run_id,
            reason: e.to_string(),
        })?
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        evaluator: Arc<dyn Evaluator>,
        catalog: Arc<Catalog>,
        broadcaster: Arc<ProgressBroadcaster>,
        mut config: OrchestratorConfig,
    ) -> Self {
        config.concurrency = config.concurrency.max(1);
        Self {
            store,
            evaluator,
            catalog,
            broadcaster,
            registry: Arc::new(SingleFlight::new()),
            config,
        }
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        Arc::clone(&self.store)
    }

    pub fn broadcaster(&self) -> Arc<ProgressBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn model_name(&self) -> &str {
        self.evaluator.model_name()
    }

    /// Id of the run this process is driving for `session_id`, if any.
    #[allow(dead_code)] // Used by tests and embedders
    pub fn active_run(&self, session_id: &str) -> Option<String> {
        self.registry.active_run(session_id)
    }

    /// Start a run for `session_id` over the whole catalog or a subset.
    ///
    /// Returns as soon as the run is persisted and scheduled. A session
    /// with a pending or analyzing run, in this process or in another one
    /// sharing the store, yields [`StartRunError::AlreadyRunning`].
    pub async fn start_run(
        &self,
        session_id: &str,
        context: String,
        dimension_subset: Option<Vec<String>>,
    ) -> Result<RunHandle, StartRunError> {
        let dimensions = self.catalog.resolve(dimension_subset.as_deref())?;
        let run = Run::new(
            session_id,
            dimensions.iter().map(|d| d.id.clone()).collect(),
            context,
        );

        let guard = self
            .registry
            .try_acquire(session_id, &run.id)
            .map_err(|active| {
                info!("Session {} already has active run {}", session_id, active);
                StartRunError::AlreadyRunning {
                    session_id: session_id.to_string(),
                    run_id: active,
                }
            })?;

        match self.store.claim_session(session_id, &run.id).await {
            Ok(None) => {}
            Ok(Some(active)) => {
                info!("Session {} already has run {} in the store", session_id, active);
                return Err(StartRunError::AlreadyRunning {
                    session_id: session_id.to_string(),
                    run_id: active,
                });
            }
            Err(e) => return Err(self.reject_start(&run, e.into())),
        }

        if let Err(e) = self.store.create_run(&run).await {
            self.release_claim(&run).await;
            return Err(self.reject_start(&run, e.into()));
        }

        self.broadcaster
            .register(session_id, &run.id, run.progress_total);
        info!(
            "Started run {} for session {} over {} dimension(s)",
            run.id, session_id, run.progress_total
        );

        let handle_run_id = run.id.clone();
        let progress_total = run.progress_total;
        let orchestrator = self.clone();
        let task = tokio::spawn(async move { orchestrator.drive(run, dimensions, guard).await });

        Ok(RunHandle {
            run_id: handle_run_id,
            session_id: session_id.to_string(),
            progress_total,
            task,
        })
    }

    /// Run to a terminal state, then give up the session's slot.
    async fn drive(
        self,
        mut run: Run,
        dimensions: Vec<DimensionDescriptor>,
        guard: FlightGuard,
    ) -> Result<Run, RunError> {
        let outcome = match self.execute(&mut run, dimensions).await {
            Ok(results) => self.complete(&mut run, &results).await,
            Err(reason) => Err(self.fail(&mut run, reason).await),
        };
        self.release_claim(&run).await;
        drop(guard);
        outcome
    }

    /// Report a run that could not be started to the session's observers.
    fn reject_start(&self, run: &Run, err: StartRunError) -> StartRunError {
        error!("Could not start run for session {}: {}", run.session_id, err);
        self.broadcaster.publish(
            &run.session_id,
            ProgressEvent::Failed {
                run_id: run.id.clone(),
                reason: err.to_string(),
            },
        );
        err
    }

    async fn release_claim(&self, run: &Run) {
        if let Err(e) = self.store.release_session(&run.session_id, &run.id).await {
            warn!(
                "Could not release session {} held by run {}: {}",
                run.session_id, run.id, e
            );
        }
    }

    /// Evaluate every target dimension. `Err` only for orchestration-level
    /// failures; dimension failures are recorded as results.
    async fn execute(
        &self,
        run: &mut Run,
        dimensions: Vec<DimensionDescriptor>,
    ) -> Result<Vec<DimensionResult>, String> {
        run.status = RunStatus::Analyzing;
        self.store
            .update_run(run)
            .await
            .map_err(|e| format!("could not mark run analyzing: {}", e))?;

        let tracker = Arc::new(Mutex::new(Tracker::new(run.clone(), &dimensions)));
        let context: Arc<str> = Arc::from(run.context.as_str());
        let slots = Arc::new(Semaphore::new(self.config.concurrency));
        let mut pacer = Pacer::new(self.config.dispatch_delay);
        let mut workers = JoinSet::new();

        for dimension in dimensions {
            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                break;
            };
            if tracker.lock().await.fatal.is_some() {
                break;
            }
            pacer.ready().await;

            debug!("Dispatching dimension {} for run {}", dimension.id, run.id);
            let worker = Worker {
                orchestrator: self.clone(),
                run_id: run.id.clone(),
                tracker: Arc::clone(&tracker),
                context: Arc::clone(&context),
            };
            workers.spawn(async move {
                worker.process(dimension).await;
                drop(permit);
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Dimension worker for run {} aborted: {}", run.id, e);
                tracker
                    .lock()
                    .await
                    .fatal
                    .get_or_insert_with(|| format!("dimension worker aborted: {}", e));
            }
        }

        let mut tracker = tracker.lock().await;
        *run = tracker.run.clone();
        match tracker.fatal.take() {
            Some(reason) => Err(reason),
            None => Ok(std::mem::take(&mut tracker.results)),
        }
    }

    async fn complete(&self, run: &mut Run, results: &[DimensionResult]) -> Result<Run, RunError> {
        let summary = aggregate(results);

        let mut completed = run.clone();
        completed.status = RunStatus::Completed;
        completed.overall_score = Some(summary.overall_score);
        completed.readiness = Some(summary.readiness);
        completed.score_basis = Some(summary.basis);
        completed.failed_dimensions = summary.failed;
        completed.completed_at = Some(Utc::now());

        if let Err(e) = self.store.update_run(&completed).await {
            return Err(self
                .fail(run, format!("could not record completion: {}", e))
                .await);
        }
        *run = completed.clone();

        self.broadcaster.publish(
            &run.session_id,
            ProgressEvent::Complete {
                run_id: run.id.clone(),
                overall_score: summary.overall_score,
                readiness: summary.readiness,
                score_basis: summary.basis,
                failed_dimensions: summary.failed,
            },
        );
        info!(
            "Run {} completed: score {} readiness {} ({} scored, {} failed)",
            run.id, summary.overall_score, summary.readiness, summary.scored, summary.failed
        );

        Ok(completed)
    }

    async fn fail(&self, run: &mut Run, reason: String) -> RunError {
        error!("Run {} failed: {}", run.id, reason);
        run.status = RunStatus::Failed;
        run.error = Some(reason.clone());
        run.completed_at = Some(Utc::now());

        if let Err(e) = self.store.update_run(run).await {
            warn!("Could not persist failed status for run {}: {}", run.id, e);
        }

        self.broadcaster.publish(
            &run.session_id,
            ProgressEvent::Failed {
                run_id: run.id.clone(),
                reason: reason.clone(),
            },
        );

        RunError::Failed {
            run_id: run.id.clone(),
            reason,
        }
    }
}

/// Shared per-run progress state. Updated and published under one lock so
/// observers see `completed` strictly increase.
struct Tracker {
    run: Run,
    results: Vec<DimensionResult>,
    remaining_by_category: HashMap<Category, usize>,
    categories_completed: Vec<Category>,
    fatal: Option<String>,
}

impl Tracker {
    fn new(run: Run, dimensions: &[DimensionDescriptor]) -> Self {
        let mut remaining_by_category = HashMap::new();
        for dimension in dimensions {
            *remaining_by_category
                .entry(dimension.category.clone())
                .or_insert(0) += 1;
        }
        Self {
            run,
            results: Vec::new(),
            remaining_by_category,
            categories_completed: Vec::new(),
            fatal: None,
        }
    }

    fn record(&mut self, result: DimensionResult) {
        self.run.progress_completed += 1;
        if !result.succeeded {
            self.run.failed_dimensions += 1;
        }
        if let Some(remaining) = self.remaining_by_category.get_mut(&result.category) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.categories_completed.push(result.category.clone());
            }
        }
        self.results.push(result);
    }

    fn progress_event(&self) -> ProgressEvent {
        ProgressEvent::Progress {
            run_id: self.run.id.clone(),
            completed: self.run.progress_completed,
            total: self.run.progress_total,
            categories_completed: self.categories_completed.clone(),
        }
    }
}

/// Evaluates one dimension and records its outcome.
struct Worker {
    orchestrator: Orchestrator,
    run_id: String,
    tracker: Arc<Mutex<Tracker>>,
    context: Arc<str>,
}

impl Worker {
    async fn process(self, dimension: DimensionDescriptor) {
        let result = self.evaluate(&dimension).await;
        let orchestrator = &self.orchestrator;

        if let Err(e) = orchestrator.store.append_result(&result).await {
            let mut tracker = self.tracker.lock().await;
            tracker
                .fatal
                .get_or_insert_with(|| format!("could not store result for {}: {}", dimension.id, e));
            return;
        }

        let mut tracker = self.tracker.lock().await;
        tracker.record(result);
        if let Err(e) = orchestrator.store.update_run(&tracker.run).await {
            tracker
                .fatal
                .get_or_insert_with(|| format!("could not update progress: {}", e));
            return;
        }

        let event = tracker.progress_event();
        orchestrator
            .broadcaster
            .publish(&tracker.run.session_id, event);
        debug!(
            "Run {} progress {}/{}",
            self.run_id, tracker.run.progress_completed, tracker.run.progress_total
        );
    }

    /// Call the evaluator with a timeout, containing panics.
    async fn evaluate(&self, dimension: &DimensionDescriptor) -> DimensionResult {
        let run_id = self.run_id.as_str();
        let timeout = self.orchestrator.config.dimension_timeout;
        let call = AssertUnwindSafe(self.orchestrator.evaluator.evaluate(dimension, &self.context))
            .catch_unwind();

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(judgment))) => DimensionResult::scored(run_id, dimension, judgment),
            Ok(Ok(Err(e))) => {
                warn!("Dimension {} failed: {}", dimension.id, e);
                DimensionResult::failed(run_id, dimension, e.to_string())
            }
            Ok(Err(_)) => {
                warn!("Dimension {} evaluator panicked", dimension.id);
                DimensionResult::failed(run_id, dimension, "evaluator panicked".to_string())
            }
            Err(_) => {
                warn!("Dimension {} timed out after {:?}", dimension.id, timeout);
                DimensionResult::failed(
                    run_id,
                    dimension,
                    EvaluationError::Timeout(timeout.as_secs()).to_string(),
                )
            }
        }
    }
}
