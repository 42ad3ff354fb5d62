//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// readiscore - multi-dimension readiness scoring with local AI
///
/// Evaluates a submission across a catalog of dimensions, streams progress
/// while it runs, and writes a Markdown/JSON report with the overall score,
/// readiness and the information gaps worth closing next.
///
/// Examples:
///   readiscore --session acme --context pitch.md
///   readiscore --session acme --context pitch.md --dimensions market-size,team-capability
///   readiscore --session acme --supplement answers.md
///   readiscore --session acme --gaps
///   readiscore --session acme --gaps --run 3f2c9d1e-...
///   readiscore --session acme --dry-run
///   readiscore --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Session the run belongs to
    ///
    /// At most one run per session is active at a time.
    #[arg(short, long, value_name = "ID", required_unless_present = "init_config")]
    pub session: Option<String>,

    /// File holding the submission text to evaluate
    #[arg(long, value_name = "FILE", conflicts_with = "supplement")]
    pub context: Option<PathBuf>,

    /// Supplementary answers for an incremental re-run
    ///
    /// Re-evaluates --dimensions, or every current gap when none are given.
    /// The supplement is placed ahead of the previous context.
    #[arg(long, value_name = "FILE")]
    pub supplement: Option<PathBuf>,

    /// Only evaluate these dimension ids (comma-separated)
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    pub dimensions: Option<Vec<String>>,

    /// Print the gaps of the session's latest completed run and exit
    #[arg(long, conflicts_with_all = ["context", "supplement"])]
    pub gaps: bool,

    /// With --gaps: show the gaps of this run instead of the latest one
    #[arg(long, value_name = "RUN_ID", requires = "gaps")]
    pub run: Option<String>,

    /// Ollama model to use for analysis
    #[arg(short, long, env = "READISCORE_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .readiscore.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Dimension catalog (TOML) to use instead of the built-in one
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// Directory for persisted runs and results
    #[arg(long, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// Keep runs in memory only; nothing is written to the store directory
    #[arg(long, conflicts_with_all = ["gaps", "supplement", "store"])]
    pub ephemeral: bool,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// HTTP timeout for one model call, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Per-dimension time limit, in seconds
    #[arg(long, value_name = "SECS")]
    pub dimension_timeout: Option<u64>,

    /// Number of dimensions evaluated concurrently
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Minimum delay between dimension dispatches, in milliseconds
    ///
    /// Use with rate-limited hosted models.
    #[arg(long, value_name = "MS")]
    pub delay_ms: Option<u64>,

    /// Exit with code 2 when the overall score is below this value
    #[arg(long, value_name = "SCORE")]
    pub fail_below: Option<u8>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: list the dimensions that would be evaluated and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .readiscore.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn session_id(&self) -> &str {
        self.session.as_deref().unwrap_or("")
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.session_id().trim().is_empty() {
            return Err("Session id must not be empty".to_string());
        }

        if !self.gaps && !self.dry_run && self.context.is_none() && self.supplement.is_none() {
            return Err("One of --context, --supplement, --gaps or --dry-run is required".to_string());
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.timeout == Some(0) || self.dimension_timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        if let Some(score) = self.fail_below {
            if score > 100 {
                return Err("--fail-below must be between 0 and 100".to_string());
            }
        }

        if let Some(ref run) = self.run {
            if run.trim().is_empty() {
                return Err("--run must name a run id".to_string());
            }
        }

        if let Some(ref dimensions) = self.dimensions {
            if dimensions.iter().all(|d| d.trim().is_empty()) {
                return Err("--dimensions must name at least one dimension".to_string());
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        for path in [&self.context, &self.supplement].into_iter().flatten() {
            if !path.is_file() {
                return Err(format!("File does not exist: {}", path.display()));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `--quiet` wins over both `--verbose` and the config file's `verbose`.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Requested dimension ids, trimmed, or `None` for the whole catalog.
    pub fn dimension_subset(&self) -> Option<Vec<String>> {
        self.dimensions.as_ref().map(|ids| {
            ids.iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect()
        })
    }
}
