//! readiscore - multi-dimension readiness scoring
//!
//! A CLI tool that evaluates a submission across a catalog of dimensions
//! with a local Ollama model, streams progress while the run executes, and
//! writes a report with the overall score, readiness and information gaps.
//!
//! Exit codes:
//!   0 - Success (score at or above --fail-below, or no --fail-below set)
//!   1 - Runtime error (connection, config, store failure, etc.)
//!   2 - Overall score below the --fail-below threshold

mod analysis;
mod catalog;
mod cli;
mod config;
mod evaluator;
mod models;
mod orchestrator;
mod progress;
mod report;
mod store;

#[cfg(test)]
mod testing;

use analysis::{aggregate, compute_gaps, GapAnalyzer, GapError};
use anyhow::{bail, Context, Result};
use catalog::Catalog;
use cli::{Args, OutputFormat};
use config::{Config, CONFIG_FILE};
use evaluator::OllamaEvaluator;
use indicatif::{ProgressBar, ProgressStyle};
use models::{Gap, ProgressEvent, Report, Run, RunStatus};
use orchestrator::{Orchestrator, RunHandle, StartRunError};
use progress::{follow, Connectivity, ProgressBroadcaster};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{FileRunStore, MemoryRunStore, RunStore};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if args.init_config {
        return handle_init_config();
    }

    let (config, source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(&args, &config);

    info!("readiscore v{}", env!("CARGO_PKG_VERSION"));
    source.log();
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Evaluation failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .readiscore.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", CONFIG_FILE);
        std::process::exit(1);
    }

    std::fs::write(path, Config::default_toml())
        .with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to customize the model, concurrency, pacing and more.");
    Ok(())
}

/// Initialize logging; `RUST_LOG` takes precedence over the CLI flags,
/// which take precedence over `general.verbose`.
fn init_logging(args: &Args, config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level(config.general.verbose).to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the requested workflow. Returns exit code (0, 1 or 2).
async fn run(args: Args, mut config: Config) -> Result<i32> {
    config.merge_with_args(&args);
    config.validate().context("Invalid configuration")?;

    let catalog = match config.catalog.path {
        Some(ref path) => {
            info!("Loading dimension catalog from {}", path.display());
            Catalog::load(path)?
        }
        None => Catalog::default(),
    };

    if args.dry_run {
        return handle_dry_run(&args, &catalog);
    }

    let store: Arc<dyn RunStore> = if args.ephemeral {
        info!("Ephemeral mode: runs are kept in memory only");
        Arc::new(MemoryRunStore::new())
    } else {
        let file_store = FileRunStore::new(&config.store.dir);
        debug!("Run store at {}", file_store.root().display());
        Arc::new(file_store)
    };
    let broadcaster = Arc::new(ProgressBroadcaster::new(config.progress.channel_capacity));
    let evaluator = OllamaEvaluator::new(config.ollama_config())
        .context("Failed to initialize the Ollama client")?;

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(evaluator),
        Arc::new(catalog),
        broadcaster,
        config.orchestrator_config(),
    );
    let analyzer = GapAnalyzer::new(orchestrator.clone(), config.gaps.max_context_chars);
    let session_id = args.session_id().to_string();

    if args.gaps {
        return handle_gaps(&analyzer, &session_id, args.run.as_deref()).await;
    }

    println!("🤖 Evaluating session {}", session_id);
    println!("   Model: {}", config.model.name);
    println!("   Ollama: {}", config.model.ollama_url);
    println!(
        "   Concurrency: {} | Dispatch delay: {}ms | Dimension timeout: {}s",
        config.orchestrator.concurrency,
        config.orchestrator.dispatch_delay_ms,
        config.orchestrator.dimension_timeout_seconds
    );

    let start_time = Instant::now();
    let started = if let Some(ref supplement) = args.supplement {
        start_incremental(&analyzer, &session_id, supplement, args.dimension_subset()).await?
    } else {
        let path = args
            .context
            .as_ref()
            .context("--context is required for a full evaluation")?;
        let context = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read context file: {}", path.display()))?;
        Started::from_start(
            orchestrator
                .start_run(&session_id, context, args.dimension_subset())
                .await,
        )?
    };

    let run = match started {
        Started::Own(handle) => {
            println!(
                "\n🔬 Run {} started over {} dimension(s)...\n",
                handle.run_id(),
                handle.progress_total()
            );
            watch_run(&orchestrator, &config, handle, args.quiet).await?
        }
        Started::Existing(run_id) => {
            println!(
                "\n⏳ Session {} already has run {} in progress. Following it instead...\n",
                session_id, run_id
            );
            observe_stored_run(store.as_ref(), &run_id, args.quiet).await?
        }
    };
    let duration = start_time.elapsed().as_secs_f64();

    println!("\n📝 Generating report...");
    let report = build_report(store.as_ref(), run, orchestrator.model_name(), duration).await?;

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };
    let output_path = Path::new(&config.general.output);
    std::fs::write(output_path, &output)
        .with_context(|| format!("Failed to write report to {}", output_path.display()))?;

    print_summary(&report);
    println!(
        "\n✅ Evaluation complete! Report saved to: {}",
        output_path.display()
    );

    if let Some(threshold) = args.fail_below {
        let score = report.run.overall_score.unwrap_or(0);
        if score < threshold {
            eprintln!(
                "\n⛔ Overall score {} is below {}. Failing (exit code 2).",
                score, threshold
            );
            return Ok(2);
        }
    }

    Ok(0)
}

/// Interval between store reads while following another process's run.
const STORED_RUN_POLL: Duration = Duration::from_millis(500);

/// Outcome of asking the orchestrator for a run.
enum Started {
    /// This process drives the run.
    Own(RunHandle),
    /// Another run holds the session; follow it through the store.
    Existing(String),
}

impl Started {
    fn from_start(result: Result<RunHandle, StartRunError>) -> Result<Self> {
        match result {
            Ok(handle) => Ok(Started::Own(handle)),
            Err(e) if e.is_already_running() => Ok(Started::Existing(
                e.active_run_id().unwrap_or_default().to_string(),
            )),
            Err(e) => Err(anyhow::Error::new(e).context("Could not start run")),
        }
    }
}

/// Start an incremental run over the requested dimensions, or every
/// current gap when none were named.
async fn start_incremental(
    analyzer: &GapAnalyzer,
    session_id: &str,
    supplement: &Path,
    requested: Option<Vec<String>>,
) -> Result<Started> {
    let text = std::fs::read_to_string(supplement)
        .with_context(|| format!("Failed to read supplement file: {}", supplement.display()))?;

    let dimension_ids = match requested {
        Some(ids) => ids,
        None => {
            let (_, gaps) = analyzer
                .gaps_for_session(session_id)
                .await?
                .context("No completed run for this session; run a full evaluation first")?;
            if gaps.is_empty() {
                bail!("The latest run has no gaps to re-evaluate");
            }
            gaps.into_iter().map(|g| g.dimension_id).collect()
        }
    };

    info!(
        "Incremental run for {} over {} dimension(s)",
        session_id,
        dimension_ids.len()
    );
    Started::from_start(
        analyzer
            .request_incremental_run(session_id, dimension_ids, &text)
            .await,
    )
}

/// Render live progress until the run ends, then return the final run.
async fn watch_run(
    orchestrator: &Orchestrator,
    config: &Config,
    handle: RunHandle,
    quiet: bool,
) -> Result<Run> {
    let progress_bar = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(handle.progress_total() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .map(|style| style.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    };

    let broadcaster = orchestrator.broadcaster();
    let session_id = handle.session_id().to_string();
    let run_id = handle.run_id().to_string();
    let policy = config.reconnect_policy();
    let pb = progress_bar.clone();

    let follower = tokio::spawn(async move {
        follow(
            &broadcaster,
            &session_id,
            &policy,
            &Connectivity::default(),
            |event| {
                if event.run_id() != run_id {
                    return;
                }
                if let ProgressEvent::Progress {
                    completed,
                    total,
                    categories_completed,
                    ..
                } = event
                {
                    pb.set_length(*total as u64);
                    pb.set_position(*completed as u64);
                    if let Some(last) = categories_completed.last() {
                        pb.set_message(format!("{} done", last));
                    }
                }
            },
        )
        .await
    });

    let outcome = handle.wait().await;

    match follower.await {
        Ok(Ok(event)) => debug!("Progress stream ended with {:?}", event),
        Ok(Err(e)) => warn!("Progress display stopped early: {}", e),
        Err(e) => warn!("Progress task failed: {}", e),
    }

    match outcome {
        Ok(run) => {
            progress_bar.finish_with_message("done");
            Ok(run)
        }
        Err(e) => {
            progress_bar.abandon_with_message("failed");
            Err(e.into())
        }
    }
}

/// Follow a run driven by another process by polling the shared store.
async fn observe_stored_run(store: &dyn RunStore, run_id: &str, quiet: bool) -> Result<Run> {
    let progress_bar = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .map(|style| style.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    };

    let mut ticker = tokio::time::interval(STORED_RUN_POLL);
    loop {
        ticker.tick().await;
        let run = store
            .get_run(run_id)
            .await
            .context("Failed to read the active run")?
            .with_context(|| format!("Run {} is not in the store", run_id))?;

        progress_bar.set_length(run.progress_total as u64);
        progress_bar.set_position(run.progress_completed as u64);
        progress_bar.set_message(format!("{}%", run.percent()));

        if run.is_active() {
            continue;
        }
        if run.status == RunStatus::Completed {
            progress_bar.finish_with_message("done");
            return Ok(run);
        }
        progress_bar.abandon_with_message("failed");
        bail!(
            "Run {} failed: {}",
            run.id,
            run.error.as_deref().unwrap_or("unknown error")
        );
    }
}

/// Assemble the report for a finished run from the store.
async fn build_report(
    store: &dyn RunStore,
    run: Run,
    model_used: &str,
    duration_seconds: f64,
) -> Result<Report> {
    let results = store
        .results_for_run(&run.id)
        .await
        .context("Failed to load dimension results")?;
    let summary = aggregate(&results);
    let gaps = compute_gaps(&results);

    Ok(Report {
        run,
        category_scores: summary.category_scores,
        gaps,
        results,
        model_used: model_used.to_string(),
        duration_seconds,
    })
}

fn print_summary(report: &Report) {
    let run = &report.run;
    println!("\n📊 Evaluation Summary:");
    if run.status == RunStatus::Completed {
        println!(
            "   Overall score: {}/100 | Readiness: {}/10",
            run.overall_score.unwrap_or(0),
            run.readiness.unwrap_or(0)
        );
    }
    println!(
        "   Dimensions: {} evaluated, {} failed",
        run.progress_completed, run.failed_dimensions
    );
    println!("   Gaps: {}", report.gaps.len());
    println!("   Duration: {:.1}s", report.duration_seconds);
}

/// Handle --gaps: print the gap list of one run, or of the session's latest
/// completed run.
async fn handle_gaps(analyzer: &GapAnalyzer, session_id: &str, run_id: Option<&str>) -> Result<i32> {
    if let Some(run_id) = run_id {
        return match analyzer.compute_gaps(run_id).await {
            Ok(gaps) => {
                println!("🔍 Gaps for run {}:\n", run_id);
                print_gaps(&gaps);
                Ok(0)
            }
            Err(GapError::RunNotFound(id)) => {
                eprintln!("❌ No run {} in the store.", id);
                Ok(1)
            }
            Err(e) => Err(e.into()),
        };
    }

    let Some((run, gaps)) = analyzer.gaps_for_session(session_id).await? else {
        println!("No completed run for session {}.", session_id);
        return Ok(0);
    };

    println!(
        "🔍 Gaps for run {} (score {}/100):\n",
        run.id,
        run.overall_score.unwrap_or(0)
    );
    print_gaps(&gaps);
    Ok(0)
}

fn print_gaps(gaps: &[Gap]) {
    if gaps.is_empty() {
        println!("   No gaps. Every dimension scored at or above the threshold.");
        return;
    }
    for gap in gaps {
        let score = gap
            .current_score
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "   {} {:<11} {:<24} score {:>3}",
            gap.priority.emoji(),
            gap.priority.to_string(),
            gap.dimension_id,
            score
        );
        for question in &gap.suggested_questions {
            println!("        ? {}", question);
        }
    }
}

/// Handle --dry-run: list the dimensions that would be evaluated, exit.
fn handle_dry_run(args: &Args, catalog: &Catalog) -> Result<i32> {
    println!("\n🔍 Dry run: resolving dimensions (no model calls)...\n");

    let dimensions = catalog.resolve(args.dimension_subset().as_deref())?;
    for dimension in &dimensions {
        println!(
            "     📄 {} [{} | {}] {}",
            dimension.id, dimension.category, dimension.priority, dimension.title
        );
    }
    println!(
        "\n   Total: {} of {} catalog dimension(s)",
        dimensions.len(),
        catalog.len()
    );

    println!("\n✅ Dry run complete. No model calls were made.");
    Ok(0)
}

/// Where the configuration came from. Reported once logging is up.
enum ConfigSource {
    File(PathBuf),
    Defaults,
    Unreadable(String),
}

impl ConfigSource {
    fn log(&self) {
        match self {
            ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
            ConfigSource::Defaults => debug!("No config file found, using defaults"),
            ConfigSource::Unreadable(e) => warn!("Failed to load config: {}", e),
        }
    }
}

/// Load configuration from file or use defaults.
///
/// Runs before logging is initialized, so `general.verbose` can take effect.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigSource::File(config_path.clone())));
    }

    match Config::load_default() {
        Ok(Some(config)) => Ok((config, ConfigSource::File(PathBuf::from(CONFIG_FILE)))),
        Ok(None) => Ok((Config::default(), ConfigSource::Defaults)),
        Err(e) => Ok((Config::default(), ConfigSource::Unreadable(format!("{:#}", e)))),
    }
}
