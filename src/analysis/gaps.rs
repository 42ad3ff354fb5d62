//! Gap analysis.
//!
//! Gaps are recomputed from a run's dimension results on every call and
//! never stored. A gap can be turned into an incremental run through
//! [`GapAnalyzer::request_incremental_run`], which goes through the
//! orchestrator's normal entry point.

use crate::models::{Category, DimensionResult, Gap, GapPriority, Run};
use crate::orchestrator::{Orchestrator, RunHandle, StartRunError};
use crate::store::{RunStore, StoreError};
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Results scoring at or above this are not gaps.
pub const GAP_THRESHOLD: u8 = 80;

/// Upper bound on the improvement promised for a single gap.
pub const MAX_SCORE_DELTA: u8 = 30;

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Error)]
pub enum GapError {
    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Priority of a scored gap.
pub fn gap_priority(score: u8, category: &Category) -> GapPriority {
    if score < 40 && category.is_core() {
        GapPriority::Critical
    } else if score < 50 {
        GapPriority::High
    } else if score < 65 {
        GapPriority::Medium
    } else {
        GapPriority::Low
    }
}

/// Conservative estimate of what answering the gap could add.
pub fn potential_score_delta(score: u8) -> u8 {
    (100 - score.min(100)).min(MAX_SCORE_DELTA)
}

/// Derive the ordered gap list from a run's results.
///
/// Failed dimensions become `Unanalyzed` gaps. Succeeded dimensions below
/// [`GAP_THRESHOLD`] are ranked by priority, then category weight, then
/// ascending score.
pub fn compute_gaps(results: &[DimensionResult]) -> Vec<Gap> {
    let mut gaps: Vec<Gap> = results
        .iter()
        .filter_map(|result| {
            if !result.succeeded {
                return Some(Gap {
                    dimension_id: result.dimension_id.clone(),
                    category: result.category.clone(),
                    current_score: None,
                    priority: GapPriority::Unanalyzed,
                    suggested_questions: Vec::new(),
                    potential_score_delta: None,
                });
            }

            let score = result.score?;
            if score >= GAP_THRESHOLD {
                return None;
            }

            Some(Gap {
                dimension_id: result.dimension_id.clone(),
                category: result.category.clone(),
                current_score: Some(score),
                priority: gap_priority(score, &result.category),
                suggested_questions: result.follow_up_questions.clone(),
                potential_score_delta: Some(potential_score_delta(score)),
            })
        })
        .collect();

    gaps.sort_by(rank);
    gaps
}

fn rank(a: &Gap, b: &Gap) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.category.weight().cmp(&a.category.weight()))
        .then_with(|| a.current_score.cmp(&b.current_score))
        .then_with(|| a.dimension_id.cmp(&b.dimension_id))
}

/// Put supplementary context ahead of the original, bounded to `max_chars`.
///
/// The original is cut first; the supplement is only cut if it alone
/// exceeds the bound.
pub fn merge_context(supplementary: &str, original: &str, max_chars: usize) -> String {
    let supplementary = supplementary.trim();
    let original = original.trim();

    if supplementary.is_empty() {
        return truncate_chars(original, max_chars).to_string();
    }
    if original.is_empty() {
        return truncate_chars(supplementary, max_chars).to_string();
    }

    let supplement = truncate_chars(supplementary, max_chars);
    let used = supplement.chars().count() + CONTEXT_SEPARATOR.chars().count();
    if used >= max_chars {
        return supplement.to_string();
    }

    let mut merged = String::with_capacity(supplement.len() + original.len());
    merged.push_str(supplement);
    merged.push_str(CONTEXT_SEPARATOR);
    merged.push_str(truncate_chars(original, max_chars - used));
    merged
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Read side of gap analysis plus the incremental re-run entry point.
#[derive(Clone)]
pub struct GapAnalyzer {
    store: Arc<dyn RunStore>,
    orchestrator: Orchestrator,
    max_context_chars: usize,
}

impl GapAnalyzer {
    pub fn new(orchestrator: Orchestrator, max_context_chars: usize) -> Self {
        Self {
            store: orchestrator.store(),
            orchestrator,
            max_context_chars,
        }
    }

    /// Gaps for one run.
    pub async fn compute_gaps(&self, run_id: &str) -> Result<Vec<Gap>, GapError> {
        if self.store.get_run(run_id).await?.is_none() {
            return Err(GapError::RunNotFound(run_id.to_string()));
        }
        let results = self.store.results_for_run(run_id).await?;
        Ok(compute_gaps(&results))
    }

    /// Gaps for the latest completed run of a session, if there is one.
    pub async fn gaps_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<(Run, Vec<Gap>)>, GapError> {
        let Some(run) = self.store.latest_completed_run(session_id).await? else {
            return Ok(None);
        };
        let results = self.store.results_for_run(&run.id).await?;
        Ok(Some((run, compute_gaps(&results))))
    }

    /// Re-run a subset of dimensions with extra context.
    ///
    /// Subject to the same single-flight rule as any other run.
    pub async fn request_incremental_run(
        &self,
        session_id: &str,
        dimension_ids: Vec<String>,
        supplementary_context: &str,
    ) -> Result<RunHandle, StartRunError> {
        let original = match self.store.latest_completed_run(session_id).await? {
            Some(run) => run.context,
            None => self
                .store
                .runs_for_session(session_id)
                .await?
                .pop()
                .map(|run| run.context)
                .unwrap_or_default(),
        };

        let context = merge_context(supplementary_context, &original, self.max_context_chars);
        info!(
            "Requesting incremental run for session {} over {} dimension(s)",
            session_id,
            dimension_ids.len()
        );

        self.orchestrator
            .start_run(session_id, context, Some(dimension_ids))
            .await
    }
}
