//! Markdown report generation.
//!
//! This module renders a completed run, its dimension results and the
//! derived gaps as a Markdown evaluation report.

use crate::analysis::aggregator::red_flag_count;
use crate::models::{Category, DimensionResult, Gap, Report, ScoreBasis};
use anyhow::Result;
use std::collections::BTreeMap;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# Readiness Report\n\n");
    output.push_str(&generate_metadata_section(report));
    output.push_str(&generate_table_of_contents(report));
    output.push_str(&generate_summary_section(report));
    output.push_str(&generate_category_section(&report.category_scores));
    output.push_str(&generate_results_section(&report.results));
    output.push_str(&generate_gaps_section(&report.gaps));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(report: &Report) -> String {
    let run = &report.run;
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Session:** `{}`\n", run.session_id));
    section.push_str(&format!("- **Run:** `{}`\n", run.id));
    section.push_str(&format!("- **Status:** {}\n", run.status));
    section.push_str(&format!(
        "- **Started:** {}\n",
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Model Used:** `{}`\n", report.model_used));
    section.push_str(&format!(
        "- **Dimensions Evaluated:** {}/{}\n",
        run.progress_completed, run.progress_total
    ));
    if run.failed_dimensions > 0 {
        section.push_str(&format!(
            "- **Dimensions Failed:** {}\n",
            run.failed_dimensions
        ));
    }
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n",
        report.duration_seconds
    ));
    section.push('\n');

    section
}

fn generate_table_of_contents(report: &Report) -> String {
    let mut toc = String::new();

    toc.push_str("## Table of Contents\n\n");
    toc.push_str("- [Metadata](#metadata)\n");
    toc.push_str("- [Summary](#summary)\n");
    if !report.category_scores.is_empty() {
        toc.push_str("- [Scores by Category](#scores-by-category)\n");
    }
    toc.push_str("- [Dimension Results](#dimension-results)\n");
    if !report.gaps.is_empty() {
        toc.push_str("- [Information Gaps](#information-gaps)\n");
    }
    toc.push('\n');

    toc
}

/// Generate the summary section.
fn generate_summary_section(report: &Report) -> String {
    let run = &report.run;
    let mut section = String::new();

    section.push_str("## Summary\n\n");

    if let Some(error) = &run.error {
        section.push_str(&format!("> ⛔ **Run failed:** {}\n\n", error));
        return section;
    }

    let overall = run.overall_score.unwrap_or(0);
    let readiness = run.readiness.unwrap_or(0);

    section.push_str("| Overall Score | Readiness | Red Flags | Gaps |\n");
    section.push_str("|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| **{}**/100 | **{}**/10 | {} | {} |\n\n",
        overall,
        readiness,
        red_flag_count(&report.results),
        report.gaps.len()
    ));

    if run.score_basis == Some(ScoreBasis::NoData) {
        section.push_str(
            "> ⚠️ No dimension could be evaluated. The score above reflects missing data, not a weak submission.\n\n",
        );
    }

    section
}

fn generate_category_section(category_scores: &BTreeMap<Category, u8>) -> String {
    if category_scores.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Scores by Category\n\n");
    section.push_str("| Category | Score |\n");
    section.push_str("|:---|:---:|\n");

    let mut categories: Vec<_> = category_scores.iter().collect();
    categories.sort_by(|a, b| b.0.weight().cmp(&a.0.weight()).then_with(|| a.0.cmp(b.0)));

    for (category, score) in categories {
        section.push_str(&format!("| {} | {} |\n", category, score));
    }
    section.push('\n');

    section
}

/// Generate the per-dimension results section.
fn generate_results_section(results: &[DimensionResult]) -> String {
    let mut section = String::new();

    section.push_str("## Dimension Results\n\n");

    if results.is_empty() {
        section.push_str("No dimension results were recorded for this run.\n\n");
        return section;
    }

    let mut ordered: Vec<&DimensionResult> = results.iter().collect();
    ordered.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.dimension_id.cmp(&b.dimension_id))
    });

    for result in ordered {
        section.push_str(&generate_result_block(result));
    }

    section
}

fn generate_result_block(result: &DimensionResult) -> String {
    let mut block = String::new();

    let badge = match result.score {
        Some(score) if score >= 80 => format!("🟢 **{}**", score),
        Some(score) if score >= 65 => format!("🟡 **{}**", score),
        Some(score) if score >= 40 => format!("🟠 **{}**", score),
        Some(score) => format!("🔴 **{}**", score),
        None => "⚫ **not analyzed**".to_string(),
    };

    block.push_str(&format!(
        "### {} {} - {}\n\n",
        badge, result.category, result.dimension_id
    ));
    block.push_str(&format!("*Priority: {}*\n\n", result.priority));

    if let Some(error) = &result.error {
        block.push_str(&format!("**Error:** {}\n\n", error));
    }

    push_list(&mut block, "Findings", &result.findings);
    push_list(&mut block, "🚩 Red Flags", &result.red_flags);
    push_list(&mut block, "💪 Strengths", &result.strengths);

    block.push_str("---\n\n");

    block
}

fn push_list(block: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    block.push_str(&format!("**{}:**\n\n", heading));
    for item in items {
        block.push_str(&format!("- {}\n", item));
    }
    block.push('\n');
}

/// Generate the gaps section with suggested follow-up questions.
fn generate_gaps_section(gaps: &[Gap]) -> String {
    if gaps.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Information Gaps\n\n");
    section.push_str(
        "Answering these questions and re-running the listed dimensions is the fastest way to raise the score:\n\n",
    );

    for (i, gap) in gaps.iter().enumerate() {
        let current = gap
            .current_score
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let delta = gap
            .potential_score_delta
            .map(|d| format!(" (up to +{})", d))
            .unwrap_or_default();

        section.push_str(&format!(
            "{}. {} **{}** `{}` - current {}{}\n",
            i + 1,
            gap.priority.emoji(),
            gap.priority,
            gap.dimension_id,
            current,
            delta
        ));
        for question in &gap.suggested_questions {
            section.push_str(&format!("   - {}\n", question));
        }
    }
    section.push('\n');

    section
}

fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(&format!(
        "*Report generated by readiscore v{}*\n",
        env!("CARGO_PKG_VERSION")
    ));

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{aggregate, compute_gaps};
    use crate::models::{DimensionDescriptor, GapPriority, Judgment, Priority, Run, RunStatus};

    fn descriptor(id: &str, category: Category) -> DimensionDescriptor {
        DimensionDescriptor {
            id: id.to_string(),
            category,
            priority: Priority::High,
            title: id.to_string(),
            guidance: String::new(),
        }
    }

    fn create_test_report() -> Report {
        let mut run = Run::new("session-1", vec!["market-size".into(), "team".into()], String::new());
        let results = vec![
            DimensionResult::scored(
                &run.id,
                &descriptor("market-size", Category::Market),
                Judgment {
                    score: 35,
                    red_flags: vec!["TAM is unsourced".to_string()],
                    follow_up_questions: vec!["Where does the TAM figure come from?".to_string()],
                    ..Default::default()
                },
            ),
            DimensionResult::failed(
                &run.id,
                &descriptor("team", Category::Team),
                "Evaluation timed out after 180s".to_string(),
            ),
        ];

        let summary = aggregate(&results);
        run.status = RunStatus::Completed;
        run.progress_completed = 2;
        run.overall_score = Some(summary.overall_score);
        run.readiness = Some(summary.readiness);
        run.score_basis = Some(summary.basis);
        run.failed_dimensions = summary.failed;

        Report {
            category_scores: summary.category_scores,
            gaps: compute_gaps(&results),
            run,
            results,
            model_used: "llama3.2:latest".to_string(),
            duration_seconds: 4.2,
        }
    }

    #[test]
    fn test_generate_markdown_report() {
        let report = create_test_report();
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# Readiness Report"));
        assert!(markdown.contains("**35**/100"));
        assert!(markdown.contains("**4**/10"));
        assert!(markdown.contains("TAM is unsourced"));
        assert!(markdown.contains("⚫ **not analyzed**"));
        assert!(markdown.contains("## Information Gaps"));
        assert!(markdown.contains("Where does the TAM figure come from?"));
        assert!(markdown.contains("- **Dimensions Failed:** 1"));
    }

    #[test]
    fn test_gaps_are_listed_in_rank_order() {
        let report = create_test_report();
        assert_eq!(report.gaps[0].priority, GapPriority::Unanalyzed);

        let markdown = generate_markdown_report(&report);
        let unanalyzed = markdown.find("`team`").unwrap();
        let critical = markdown.find("`market-size` - current 35").unwrap();
        assert!(unanalyzed < critical);
    }

    #[test]
    fn test_no_data_is_called_out() {
        let mut report = create_test_report();
        report.run.score_basis = Some(ScoreBasis::NoData);
        let markdown = generate_markdown_report(&report);
        assert!(markdown.contains("No dimension could be evaluated"));
    }

    #[test]
    fn test_json_report_round_trips() {
        let report = create_test_report();
        let json = generate_json_report(&report).unwrap();
        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run, report.run);
        assert_eq!(back.gaps, report.gaps);
    }
}
