//! Analysis caller.
//!
//! The orchestrator only sees the [`Evaluator`] trait; the Ollama client is
//! one implementation of it.

pub mod ollama;

pub use ollama::{OllamaConfig, OllamaEvaluator};

use crate::models::{DimensionDescriptor, Judgment};
use async_trait::async_trait;
use thiserror::Error;

/// Failure of a single evaluation call.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Cannot reach model endpoint: {0}")]
    Transport(String),

    #[error("Model API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Evaluation timed out after {0}s")]
    Timeout(u64),

    #[error("Malformed judgment: {0}")]
    Malformed(String),
}

/// Scores one dimension against the supplied context.
///
/// Implementations must be safe to call concurrently and repeatedly.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        dimension: &DimensionDescriptor,
        context: &str,
    ) -> Result<Judgment, EvaluationError>;

    /// Model identifier shown in reports.
    fn model_name(&self) -> &str;
}
