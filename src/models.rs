//! Data models for the readiness evaluator.
//!
//! This module contains the core data structures shared by the
//! orchestrator, the run store, the progress broadcaster and the
//! gap analyzer: runs, dimension results, judgments and gaps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Evaluation category of a dimension.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    ProblemSolution,
    Market,
    BusinessModel,
    Traction,
    Team,
    GoToMarket,
    Financials,
    Competition,
    Product,
    Legal,
    Other(String),
}

impl Category {
    /// Relative importance used to break ties between equally ranked gaps.
    pub fn weight(&self) -> u8 {
        match self {
            Category::ProblemSolution => 10,
            Category::Market => 9,
            Category::BusinessModel => 8,
            Category::Traction => 7,
            Category::Team => 6,
            Category::GoToMarket => 5,
            Category::Financials => 5,
            Category::Competition => 4,
            Category::Product => 4,
            Category::Legal => 3,
            Category::Other(_) => 1,
        }
    }

    /// Core categories are the only ones that can produce critical gaps.
    pub fn is_core(&self) -> bool {
        matches!(
            self,
            Category::ProblemSolution | Category::Market | Category::BusinessModel
        )
    }

    /// Stable identifier used in config files and reports.
    pub fn slug(&self) -> &str {
        match self {
            Category::ProblemSolution => "problem-solution",
            Category::Market => "market",
            Category::BusinessModel => "business-model",
            Category::Traction => "traction",
            Category::Team => "team",
            Category::GoToMarket => "go-to-market",
            Category::Financials => "financials",
            Category::Competition => "competition",
            Category::Product => "product",
            Category::Legal => "legal",
            Category::Other(s) => s,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::ProblemSolution => write!(f, "Problem/Solution"),
            Category::Market => write!(f, "Market"),
            Category::BusinessModel => write!(f, "Business Model"),
            Category::Traction => write!(f, "Traction"),
            Category::Team => write!(f, "Team"),
            Category::GoToMarket => write!(f, "Go-to-Market"),
            Category::Financials => write!(f, "Financials"),
            Category::Competition => write!(f, "Competition"),
            Category::Product => write!(f, "Product"),
            Category::Legal => write!(f, "Legal"),
            Category::Other(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "problem-solution" | "problem/solution" | "problem_solution" | "problem" => {
                Category::ProblemSolution
            }
            "market" => Category::Market,
            "business-model" | "business model" | "business_model" => Category::BusinessModel,
            "traction" => Category::Traction,
            "team" => Category::Team,
            "go-to-market" | "gtm" | "go_to_market" => Category::GoToMarket,
            "financials" | "finance" => Category::Financials,
            "competition" => Category::Competition,
            "product" => Category::Product,
            "legal" => Category::Legal,
            other => Category::Other(other.to_string()),
        }
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        Category::from(s.as_str())
    }
}

impl From<Category> for String {
    fn from(c: Category) -> Self {
        c.slug().to_string()
    }
}

/// Importance of a dimension within the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "Low"),
            Priority::Medium => write!(f, "Medium"),
            Priority::High => write!(f, "High"),
            Priority::Critical => write!(f, "Critical"),
        }
    }
}

/// One evaluation criterion from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionDescriptor {
    /// Stable identifier (unique within a catalog).
    pub id: String,
    pub category: Category,
    pub priority: Priority,
    /// Human readable title.
    pub title: String,
    /// What the evaluator should look at when scoring this dimension.
    #[serde(default)]
    pub guidance: String,
}

/// Structured judgment returned by the analysis caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Judgment {
    pub score: u8,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub red_flags: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Analyzing,
    Completed,
    Failed,
}

impl RunStatus {
    /// Pending and Analyzing runs hold the session's single-flight slot.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Analyzing)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Analyzing => write!(f, "analyzing"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Whether an overall score was computed from real data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBasis {
    /// At least one dimension succeeded.
    Scored,
    /// Every dimension failed; the score of 0 carries no information.
    NoData,
}

/// One execution of the pipeline for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub session_id: String,
    pub status: RunStatus,
    /// Target dimension ids, in catalog order.
    pub dimension_ids: Vec<String>,
    pub progress_completed: usize,
    pub progress_total: usize,
    pub overall_score: Option<u8>,
    pub readiness: Option<u8>,
    pub score_basis: Option<ScoreBasis>,
    /// Number of dimensions whose evaluation failed.
    #[serde(default)]
    pub failed_dimensions: usize,
    /// Context the run was evaluated against.
    pub context: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Run {
    /// Creates a pending run over the given dimensions.
    pub fn new(session_id: &str, dimension_ids: Vec<String>, context: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            status: RunStatus::Pending,
            progress_total: dimension_ids.len(),
            dimension_ids,
            progress_completed: 0,
            overall_score: None,
            readiness: None,
            score_basis: None,
            failed_dimensions: 0,
            context,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Completion percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.progress_total == 0 {
            return 100;
        }
        ((self.progress_completed * 100) / self.progress_total).min(100) as u8
    }
}

/// Outcome of one dimension within one run. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionResult {
    pub run_id: String,
    pub dimension_id: String,
    pub category: Category,
    pub priority: Priority,
    /// Absent when the evaluation failed.
    pub score: Option<u8>,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub red_flags: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl DimensionResult {
    /// Creates a successful result from a judgment.
    pub fn scored(run_id: &str, dimension: &DimensionDescriptor, judgment: Judgment) -> Self {
        Self {
            run_id: run_id.to_string(),
            dimension_id: dimension.id.clone(),
            category: dimension.category.clone(),
            priority: dimension.priority,
            score: Some(judgment.score.min(100)),
            findings: judgment.findings,
            red_flags: judgment.red_flags,
            strengths: judgment.strengths,
            follow_up_questions: judgment.follow_up_questions,
            succeeded: true,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    /// Creates a failed result.
    pub fn failed(run_id: &str, dimension: &DimensionDescriptor, error: String) -> Self {
        Self {
            run_id: run_id.to_string(),
            dimension_id: dimension.id.clone(),
            category: dimension.category.clone(),
            priority: dimension.priority,
            score: None,
            findings: Vec::new(),
            red_flags: Vec::new(),
            strengths: Vec::new(),
            follow_up_questions: Vec::new(),
            succeeded: false,
            error: Some(error),
            recorded_at: Utc::now(),
        }
    }
}

/// Priority of an information gap. `Unanalyzed` ranks above everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapPriority {
    Low,
    Medium,
    High,
    Critical,
    Unanalyzed,
}

impl GapPriority {
    /// Returns an emoji representation of the priority.
    pub fn emoji(&self) -> &'static str {
        match self {
            GapPriority::Low => "🟢",
            GapPriority::Medium => "🟡",
            GapPriority::High => "🟠",
            GapPriority::Critical => "🔴",
            GapPriority::Unanalyzed => "⚫",
        }
    }
}

impl fmt::Display for GapPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapPriority::Low => write!(f, "Low"),
            GapPriority::Medium => write!(f, "Medium"),
            GapPriority::High => write!(f, "High"),
            GapPriority::Critical => write!(f, "Critical"),
            GapPriority::Unanalyzed => write!(f, "Unanalyzed"),
        }
    }
}

/// Derived, never persisted indication that a dimension needs more input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub dimension_id: String,
    pub category: Category,
    /// `None` for unanalyzed dimensions.
    pub current_score: Option<u8>,
    pub priority: GapPriority,
    pub suggested_questions: Vec<String>,
    /// `None` for unanalyzed dimensions.
    pub potential_score_delta: Option<u8>,
}

/// Event pushed to progress observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        run_id: String,
        completed: usize,
        total: usize,
        categories_completed: Vec<Category>,
    },
    Complete {
        run_id: String,
        overall_score: u8,
        readiness: u8,
        score_basis: ScoreBasis,
        failed_dimensions: usize,
    },
    Failed {
        run_id: String,
        reason: String,
    },
}

impl ProgressEvent {
    pub fn run_id(&self) -> &str {
        match self {
            ProgressEvent::Progress { run_id, .. }
            | ProgressEvent::Complete { run_id, .. }
            | ProgressEvent::Failed { run_id, .. } => run_id,
        }
    }

    /// `complete` and `failed` end a run's stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }
}

/// Final evaluation report for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run: Run,
    pub results: Vec<DimensionResult>,
    pub category_scores: BTreeMap<Category, u8>,
    pub gaps: Vec<Gap>,
    pub model_used: String,
    pub duration_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_priority_ordering() {
        assert!(GapPriority::Low < GapPriority::Medium);
        assert!(GapPriority::High < GapPriority::Critical);
        assert!(GapPriority::Critical < GapPriority::Unanalyzed);
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!(Category::from("market"), Category::Market);
        assert_eq!(Category::from("Problem/Solution"), Category::ProblemSolution);
        assert_eq!(Category::from("Business Model"), Category::BusinessModel);
        assert_eq!(
            Category::from("esg"),
            Category::Other("esg".to_string())
        );
    }

    #[test]
    fn test_category_serde_uses_slug() {
        let json = serde_json::to_string(&Category::GoToMarket).unwrap();
        assert_eq!(json, "\"go-to-market\"");
        let back: Category = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Category::GoToMarket);
    }

    #[test]
    fn test_core_categories() {
        assert!(Category::Market.is_core());
        assert!(Category::BusinessModel.is_core());
        assert!(!Category::Team.is_core());
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = Run::new("s1", vec!["a".into(), "b".into()], "ctx".into());
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.progress_total, 2);
        assert_eq!(run.progress_completed, 0);
        assert!(run.is_active());
        assert_eq!(run.percent(), 0);
    }

    #[test]
    fn test_progress_event_wire_format() {
        let event = ProgressEvent::Progress {
            run_id: "r".into(),
            completed: 1,
            total: 3,
            categories_completed: vec![Category::Market],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["categories_completed"][0], "market");
        assert!(!event.is_terminal());

        let failed = ProgressEvent::Failed {
            run_id: "r".into(),
            reason: "store down".into(),
        };
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_judgment_defaults_missing_lists() {
        let judgment: Judgment = serde_json::from_str(r#"{"score": 55}"#).unwrap();
        assert_eq!(judgment.score, 55);
        assert!(judgment.findings.is_empty());
        assert!(judgment.follow_up_questions.is_empty());
    }
}
