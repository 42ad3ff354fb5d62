//! Score aggregation.
//!
//! Folds dimension results into an overall score and the coarser
//! readiness scale. Everything here is pure.

use crate::models::{Category, DimensionResult, ScoreBasis};
use std::collections::BTreeMap;

/// Overall metrics for a set of dimension results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    /// Rounded mean over succeeded results (0 when none succeeded).
    pub overall_score: u8,
    /// `round(overall_score / 10)`, clamped to 0..=10.
    pub readiness: u8,
    pub basis: ScoreBasis,
    /// Number of results that contributed a score.
    pub scored: usize,
    /// Number of failed results, excluded from the mean.
    pub failed: usize,
    /// Rounded mean score per category.
    pub category_scores: BTreeMap<Category, u8>,
}

/// Aggregate dimension results into overall metrics.
pub fn aggregate(results: &[DimensionResult]) -> Aggregate {
    let scores: Vec<u8> = results
        .iter()
        .filter(|r| r.succeeded)
        .filter_map(|r| r.score)
        .collect();
    let failed = results.len() - scores.len();

    let (overall_score, basis) = match mean(&scores) {
        Some(score) => (score, ScoreBasis::Scored),
        None => (0, ScoreBasis::NoData),
    };

    Aggregate {
        overall_score,
        readiness: readiness(overall_score),
        basis,
        scored: scores.len(),
        failed,
        category_scores: category_scores(results),
    }
}

/// Map a 0-100 score onto the 0-10 readiness scale.
pub fn readiness(overall_score: u8) -> u8 {
    (f64::from(overall_score) / 10.0).round().clamp(0.0, 10.0) as u8
}

/// Mean score per category over succeeded results.
pub fn category_scores(results: &[DimensionResult]) -> BTreeMap<Category, u8> {
    let mut grouped: BTreeMap<Category, Vec<u8>> = BTreeMap::new();

    for result in results.iter().filter(|r| r.succeeded) {
        if let Some(score) = result.score {
            grouped
                .entry(result.category.clone())
                .or_default()
                .push(score);
        }
    }

    grouped
        .into_iter()
        .filter_map(|(category, scores)| mean(&scores).map(|m| (category, m)))
        .collect()
}

/// Count red flags across all results (for report summaries).
pub fn red_flag_count(results: &[DimensionResult]) -> usize {
    results.iter().map(|r| r.red_flags.len()).sum()
}

fn mean(scores: &[u8]) -> Option<u8> {
    if scores.is_empty() {
        return None;
    }
    let total: u32 = scores.iter().map(|s| u32::from(*s)).sum();
    Some((f64::from(total) / scores.len() as f64).round() as u8)
}
