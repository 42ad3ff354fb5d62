//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.readiscore.toml` files.

use crate::evaluator::OllamaConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::progress::ReconnectPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".readiscore.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorSection,

    #[serde(default)]
    pub gaps: GapsConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default report path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "readiness_report.md".to_string()
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub name: String,

    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// HTTP timeout for one model call, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout() -> u64 {
    300
}

/// Run execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Dimensions evaluated at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum gap between dispatches, for rate-limited backends. 0 disables.
    #[serde(default)]
    pub dispatch_delay_ms: u64,

    #[serde(default = "default_dimension_timeout")]
    pub dimension_timeout_seconds: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            dispatch_delay_ms: 0,
            dimension_timeout_seconds: default_dimension_timeout(),
        }
    }
}

fn default_concurrency() -> usize {
    2
}

fn default_dimension_timeout() -> u64 {
    180
}

/// Incremental re-run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapsConfig {
    /// Upper bound on merged context, in characters.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for GapsConfig {
    fn default() -> Self {
        Self {
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_max_context_chars() -> usize {
    24_000
}

/// Progress channel and reconnect settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// 0 retries forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_channel_capacity() -> usize {
    crate::progress::broadcaster::DEFAULT_CHANNEL_CAPACITY
}

fn default_initial_backoff() -> u64 {
    250
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    8
}

/// File-backed run store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".readiscore")
}

/// Dimension catalog source. The built-in catalog is used when unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence, but only when explicitly provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }

        if let Some(concurrency) = args.concurrency {
            self.orchestrator.concurrency = concurrency;
        }
        if let Some(delay) = args.delay_ms {
            self.orchestrator.dispatch_delay_ms = delay;
        }
        if let Some(timeout) = args.dimension_timeout {
            self.orchestrator.dimension_timeout_seconds = timeout;
        }

        if let Some(ref dir) = args.store {
            self.store.dir = dir.clone();
        }
        if let Some(ref path) = args.catalog {
            self.catalog.path = Some(path.clone());
        }
        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.concurrency == 0 {
            bail!("orchestrator.concurrency must be at least 1");
        }
        if self.orchestrator.dimension_timeout_seconds == 0 {
            bail!("orchestrator.dimension_timeout_seconds must be at least 1");
        }
        if self.gaps.max_context_chars == 0 {
            bail!("gaps.max_context_chars must be at least 1");
        }
        if self.progress.initial_backoff_ms > self.progress.max_backoff_ms {
            bail!("progress.initial_backoff_ms cannot exceed progress.max_backoff_ms");
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency: self.orchestrator.concurrency,
            dispatch_delay: Duration::from_millis(self.orchestrator.dispatch_delay_ms),
            dimension_timeout: Duration::from_secs(self.orchestrator.dimension_timeout_seconds),
        }
    }

    pub fn ollama_config(&self) -> OllamaConfig {
        OllamaConfig {
            ollama_url: self.model.ollama_url.clone(),
            model_name: self.model.name.clone(),
            temperature: self.model.temperature,
            timeout_seconds: self.model.timeout_seconds,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.progress.initial_backoff_ms),
            max_delay: Duration::from_millis(self.progress.max_backoff_ms),
            max_attempts: match self.progress.max_attempts {
                0 => None,
                n => Some(n),
            },
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
