//! Read-side analysis of completed runs.
//!
//! - [`aggregator`]: overall score and readiness
//! - [`gaps`]: prioritized follow-up queue and incremental re-runs

pub mod aggregator;
pub mod gaps;

pub use aggregator::aggregate;
pub use gaps::{compute_gaps, GapAnalyzer, GapError};
