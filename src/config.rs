//! TOML configuration.
//!
//! Every section except `[db]` may be omitted; missing values fall back to
//! the defaults below. Tracker credentials are never read from the file:
//! they come from `JIRA_EMAIL` and `JIRA_API_TOKEN`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ticket_flow_core::conversation::store::StoreSettings;
use ticket_flow_core::detect::DetectionParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub suggestions: SuggestionsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_detection_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            timeout_ms: default_detection_timeout_ms(),
        }
    }
}

impl DetectionConfig {
    pub fn params(&self) -> DetectionParams {
        DetectionParams {
            threshold: self.threshold,
            top_k: self.top_k,
            candidate_k: self.candidate_k,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_threshold() -> f32 {
    0.80
}
fn default_top_k() -> usize {
    5
}
fn default_candidate_k() -> usize {
    20
}
fn default_detection_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Re-read-and-retry attempts for events that carry no version.
    #[serde(default = "default_max_stale_retries")]
    pub max_stale_retries: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            dedup_window_secs: default_dedup_window_secs(),
            dedup_capacity: default_dedup_capacity(),
            max_stale_retries: default_max_stale_retries(),
        }
    }
}

impl ConversationConfig {
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            idle_ttl: chrono::Duration::seconds(self.idle_ttl_secs as i64),
            dedup_window: chrono::Duration::seconds(self.dedup_window_secs as i64),
            dedup_capacity: self.dedup_capacity,
        }
    }
}

fn default_idle_ttl_secs() -> u64 {
    1800
}
fn default_dedup_window_secs() -> u64 {
    600
}
fn default_dedup_capacity() -> usize {
    64
}
fn default_max_stale_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_ingest_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_ingest_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_closed_statuses")]
    pub closed_statuses: Vec<String>,
    #[serde(default = "default_closed_retention_days")]
    pub closed_retention_days: i64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            page_size: default_page_size(),
            batch_size: default_ingest_batch_size(),
            max_retries: default_ingest_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            closed_statuses: default_closed_statuses(),
            closed_retention_days: default_closed_retention_days(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_page_size() -> usize {
    50
}
fn default_ingest_batch_size() -> usize {
    32
}
fn default_ingest_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_closed_statuses() -> Vec<String> {
    vec!["Done".to_string(), "Closed".to_string(), "Resolved".to_string()]
}
fn default_closed_retention_days() -> i64 {
    90
}
fn default_poll_interval_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (Ollama defaults to `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub default_project: Option<String>,
    #[serde(default = "default_issue_type")]
    pub default_issue_type: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            default_project: None,
            default_issue_type: default_issue_type(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_issue_type() -> String {
    "Task".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SuggestionsConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_suggestion_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SuggestionsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            timeout_secs: default_suggestion_timeout_secs(),
        }
    }
}

fn default_suggestion_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let d = &config.detection;
    if !(0.0..=1.0).contains(&d.threshold) {
        bail!("detection.threshold must be in [0.0, 1.0]");
    }
    if d.top_k < 1 {
        bail!("detection.top_k must be >= 1");
    }
    if d.candidate_k < d.top_k {
        bail!("detection.candidate_k must be >= detection.top_k");
    }
    if d.timeout_ms == 0 {
        bail!("detection.timeout_ms must be > 0");
    }

    if config.conversation.idle_ttl_secs == 0 {
        bail!("conversation.idle_ttl_secs must be > 0");
    }
    if config.conversation.dedup_capacity == 0 {
        bail!("conversation.dedup_capacity must be > 0");
    }

    if config.ingestion.page_size == 0 || config.ingestion.batch_size == 0 {
        bail!("ingestion.page_size and ingestion.batch_size must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    match config.tracker.provider.as_str() {
        "disabled" => {}
        "jira" => {
            if config.tracker.base_url.is_none() {
                bail!("tracker.base_url must be specified when provider is 'jira'");
            }
        }
        other => bail!("Unknown tracker provider: '{}'. Must be disabled or jira.", other),
    }

    match config.suggestions.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown suggestions provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/tflow.sqlite\"\n").unwrap();
        assert!((config.detection.threshold - 0.80).abs() < f32::EPSILON);
        assert_eq!(config.detection.top_k, 5);
        assert_eq!(config.conversation.idle_ttl_secs, 1800);
        assert_eq!(config.ingestion.closed_statuses.len(), 3);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.tracker.default_issue_type, "Task");
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let err = parse("[db]\npath = \"x\"\n[detection]\nthreshold = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn test_rejects_candidate_k_below_top_k() {
        let err = parse("[db]\npath = \"x\"\n[detection]\ntop_k = 10\ncandidate_k = 5\n").unwrap_err();
        assert!(err.to_string().contains("candidate_k"));
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("dims"));
    }

    #[test]
    fn test_jira_requires_base_url() {
        let err = parse("[db]\npath = \"x\"\n[tracker]\nprovider = \"jira\"\n").unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }
}
