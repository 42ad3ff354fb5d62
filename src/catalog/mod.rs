//! Dimension catalog.
//!
//! The catalog is plain configuration: an ordered list of descriptors.
//! How a dimension is scored lives in the evaluator, not here.

use crate::models::{Category, DimensionDescriptor, Priority};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Reasons a requested dimension subset is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubsetError {
    #[error("dimension subset must not be empty")]
    Empty,

    #[error("unknown dimension: {0}")]
    UnknownDimension(String),
}

/// Ordered, validated list of dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    dimensions: Vec<DimensionDescriptor>,
}

impl Catalog {
    /// Build a catalog, rejecting empty catalogs and duplicate ids.
    pub fn new(dimensions: Vec<DimensionDescriptor>) -> Result<Self> {
        if dimensions.is_empty() {
            bail!("Dimension catalog is empty");
        }

        let mut seen = HashSet::new();
        for dimension in &dimensions {
            if dimension.id.trim().is_empty() {
                bail!("Dimension with empty id in catalog");
            }
            if !seen.insert(dimension.id.as_str()) {
                bail!("Duplicate dimension id in catalog: {}", dimension.id);
            }
        }

        Ok(Self { dimensions })
    }

    /// Load a catalog from a TOML file with `[[dimensions]]` tables.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;

        #[derive(Deserialize)]
        struct CatalogFile {
            dimensions: Vec<DimensionDescriptor>,
        }

        let file: CatalogFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse catalog file: {}", path.display()))?;

        Self::new(file.dimensions)
            .with_context(|| format!("Invalid catalog: {}", path.display()))
    }

    pub fn dimensions(&self) -> &[DimensionDescriptor] {
        &self.dimensions
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn get(&self, id: &str) -> Option<&DimensionDescriptor> {
        self.dimensions.iter().find(|d| d.id == id)
    }

    /// Resolve the target set for a run.
    ///
    /// `None` selects the whole catalog. A subset must be non-empty and
    /// only name known ids; duplicates collapse and catalog order is kept.
    pub fn resolve(&self, subset: Option<&[String]>) -> Result<Vec<DimensionDescriptor>, SubsetError> {
        let Some(subset) = subset else {
            return Ok(self.dimensions.clone());
        };

        if subset.is_empty() {
            return Err(SubsetError::Empty);
        }

        let wanted: HashSet<&str> = subset.iter().map(String::as_str).collect();
        if let Some(unknown) = subset.iter().find(|id| self.get(id).is_none()) {
            return Err(SubsetError::UnknownDimension(unknown.clone()));
        }

        Ok(self
            .dimensions
            .iter()
            .filter(|d| wanted.contains(d.id.as_str()))
            .cloned()
            .collect())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            dimensions: builtin_dimensions(),
        }
    }
}

fn dimension(
    id: &str,
    category: Category,
    priority: Priority,
    title: &str,
    guidance: &str,
) -> DimensionDescriptor {
    DimensionDescriptor {
        id: id.to_string(),
        category,
        priority,
        title: title.to_string(),
        guidance: guidance.to_string(),
    }
}

/// Built-in catalog used when no catalog file is configured.
fn builtin_dimensions() -> Vec<DimensionDescriptor> {
    vec![
        dimension(
            "problem-clarity",
            Category::ProblemSolution,
            Priority::Critical,
            "Problem Clarity",
            "Is the customer problem specific, painful and evidenced? Who has it and how often?",
        ),
        dimension(
            "solution-fit",
            Category::ProblemSolution,
            Priority::Critical,
            "Solution Fit",
            "Does the proposed solution directly address the stated problem better than current alternatives?",
        ),
        dimension(
            "market-size",
            Category::Market,
            Priority::High,
            "Market Size",
            "Are TAM/SAM/SOM estimated with a credible, bottom-up method?",
        ),
        dimension(
            "market-timing",
            Category::Market,
            Priority::Medium,
            "Market Timing",
            "Why now? Which shifts in technology, regulation or behaviour make this the right moment?",
        ),
        dimension(
            "revenue-model",
            Category::BusinessModel,
            Priority::Critical,
            "Revenue Model",
            "How does the business make money, and is pricing justified by customer value?",
        ),
        dimension(
            "unit-economics",
            Category::BusinessModel,
            Priority::High,
            "Unit Economics",
            "Are CAC, LTV, gross margin and payback period known or reasonably estimated?",
        ),
        dimension(
            "traction-evidence",
            Category::Traction,
            Priority::High,
            "Traction Evidence",
            "What measurable evidence of demand exists: users, revenue, pilots, letters of intent?",
        ),
        dimension(
            "team-capability",
            Category::Team,
            Priority::High,
            "Team Capability",
            "Does the team have the domain, technical and commercial skills to execute?",
        ),
        dimension(
            "go-to-market-plan",
            Category::GoToMarket,
            Priority::Medium,
            "Go-to-Market Plan",
            "Are target segments, channels and the first 12 months of acquisition clearly planned?",
        ),
        dimension(
            "financial-plan",
            Category::Financials,
            Priority::Medium,
            "Financial Plan",
            "Are projections, burn rate, runway and funding needs consistent and explained?",
        ),
        dimension(
            "competitive-landscape",
            Category::Competition,
            Priority::Medium,
            "Competitive Landscape",
            "Are direct and indirect competitors identified, with a defensible differentiation?",
        ),
        dimension(
            "product-readiness",
            Category::Product,
            Priority::Medium,
            "Product Readiness",
            "What is the current product stage and what remains before customers can use it?",
        ),
        dimension(
            "legal-compliance",
            Category::Legal,
            Priority::Low,
            "Legal & Compliance",
            "Are IP ownership, licences and regulatory obligations addressed?",
        ),
    ]
}
