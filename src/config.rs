//! TOML configuration parsing and validation.
//!
//! The whole engine is configured from one file (default
//! `./config/gnd.toml`). Only `[db]` is required; every other section has
//! defaults that run fully offline (hashing embeddings, echo generation).
//!
//! The loaded [`Config`] is never stored in a global. Each component gets
//! the parameter struct it needs ([`ChunkParams`], [`SearchParams`],
//! [`AssemblyParams`], [`RetryPolicy`], [`ProcessorParams`]) at
//! construction time.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use grounding_core::assemble::AssemblyParams;
use grounding_core::chunk::ChunkParams;
use grounding_core::models::{Tenant, PARTITION_SEPARATOR};
use grounding_core::search::SearchParams;
use grounding_core::tenant::{StaticDirectory, TenantProfile, TenantTable};

use crate::analytics::ProcessorParams;
use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub assembly: AssemblyConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantConfig>,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    200
}
fn default_overlap() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Global minimum cosine similarity; tenants may override it.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Maximum concurrent partition sub-queries per search.
    #[serde(default = "default_max_fanout")]
    pub max_fanout: usize,
    /// Retries for transient store errors on a partition sub-query.
    #[serde(default = "default_retrieval_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retrieval_backoff_ms")]
    pub backoff_base_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            max_fanout: default_max_fanout(),
            max_retries: default_retrieval_retries(),
            backoff_base_ms: default_retrieval_backoff_ms(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f64 {
    0.25
}
fn default_max_fanout() -> usize {
    8
}
fn default_retrieval_retries() -> u32 {
    2
}
fn default_retrieval_backoff_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssemblyConfig {
    #[serde(default = "default_budget_chars")]
    pub budget_chars: usize,
    /// Preamble for tenants without a `[tenants.<id>]` entry.
    #[serde(default = "default_preamble")]
    pub default_preamble: String,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            budget_chars: default_budget_chars(),
            default_preamble: default_preamble(),
        }
    }
}

fn default_budget_chars() -> usize {
    6000
}
fn default_preamble() -> String {
    "You are a thoughtful guide. Ground every answer in the provided passages.".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: Some(384),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
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

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Retries for transient (network, 429, 5xx) failures.
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_backoff_ms")]
    pub backoff_base_ms: u64,
    /// Hard deadline for the whole generation call, retries included.
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// Deterministic reply returned when generation times out.
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            max_retries: default_generation_retries(),
            backoff_base_ms: default_generation_backoff_ms(),
            timeout_secs: default_generation_timeout_secs(),
            fallback_message: default_fallback_message(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

fn default_generation_provider() -> String {
    "echo".to_string()
}
fn default_generation_retries() -> u32 {
    3
}
fn default_generation_backoff_ms() -> u64 {
    500
}
fn default_generation_timeout_secs() -> u64 {
    30
}
fn default_fallback_message() -> String {
    "I'm sorry, I couldn't finish composing an answer in time. Please try again in a moment."
        .to_string()
}
fn default_max_output_tokens() -> u32 {
    512
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TenantConfig {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub preamble: Option<String>,
    #[serde(default)]
    pub min_score: Option<f64>,
    /// Sources registered for this tenant. When absent, the sources found
    /// in the store are used.
    #[serde(default)]
    pub sources: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    #[serde(default = "default_analytics_batch")]
    pub batch_size: usize,
    #[serde(default = "default_analytics_retries")]
    pub max_retries: u32,
    /// Retry delay is `backoff_base_ms × attempt`.
    #[serde(default = "default_analytics_backoff_ms")]
    pub backoff_base_ms: u64,
    /// Sleep between polls when the stream is drained.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consumers allowed to process a batch at the same time.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// USD per 1k tokens by model id. A `default` entry prices unknown
    /// models.
    #[serde(default = "default_pricing")]
    pub pricing: BTreeMap<String, ModelPricing>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_analytics_batch(),
            max_retries: default_analytics_retries(),
            backoff_base_ms: default_analytics_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            workers: default_workers(),
            pricing: default_pricing(),
        }
    }
}

fn default_analytics_batch() -> usize {
    100
}
fn default_analytics_retries() -> u32 {
    3
}
fn default_analytics_backoff_ms() -> u64 {
    200
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_workers() -> usize {
    3
}
fn default_pricing() -> BTreeMap<String, ModelPricing> {
    BTreeMap::from([(
        "echo".to_string(),
        ModelPricing {
            input_per_1k: 0.0,
            output_per_1k: 0.0,
        },
    )])
}

/// USD per 1,000 tokens.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Run the analytics consumers inside `gnd serve`.
    #[serde(default = "default_true")]
    pub analytics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            analytics: true,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// A config with every default and the given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            assembly: AssemblyConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            tenants: BTreeMap::new(),
            analytics: AnalyticsConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn chunk_params(&self) -> ChunkParams {
        ChunkParams::new(self.chunking.max_tokens, self.chunking.overlap_tokens)
    }

    /// Global search parameters; tenants may override `min_score`.
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            top_k: self.retrieval.top_k,
            min_score: self.retrieval.min_score,
            max_fanout: self.retrieval.max_fanout,
        }
    }

    pub fn assembly_params(&self) -> AssemblyParams {
        AssemblyParams {
            budget_chars: self.assembly.budget_chars,
        }
    }

    pub fn retrieval_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retrieval.max_retries,
            base_delay: Duration::from_millis(self.retrieval.backoff_base_ms),
            backoff: Backoff::Exponential,
        }
    }

    pub fn generation_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.generation.max_retries,
            base_delay: Duration::from_millis(self.generation.backoff_base_ms),
            backoff: Backoff::Exponential,
        }
    }

    pub fn processor_params(&self) -> ProcessorParams {
        ProcessorParams {
            batch_size: self.analytics.batch_size.max(1),
            retry: RetryPolicy {
                max_retries: self.analytics.max_retries,
                base_delay: Duration::from_millis(self.analytics.backoff_base_ms),
                backoff: Backoff::Linear,
            },
            poll_interval: Duration::from_millis(self.analytics.poll_interval_ms),
            workers: self.analytics.workers.max(1),
        }
    }

    /// Per-tenant behaviour table.
    pub fn tenant_table(&self) -> TenantTable {
        let mut table = TenantTable::new(self.assembly.default_preamble.clone());
        for (id, t) in &self.tenants {
            table.insert(TenantProfile {
                tenant_id: id.clone(),
                display_name: t.display_name.clone().unwrap_or_else(|| id.clone()),
                preamble: t
                    .preamble
                    .clone()
                    .unwrap_or_else(|| self.assembly.default_preamble.clone()),
                min_score: t.min_score,
            });
        }
        table
    }

    /// Registry view of tenants that declare an explicit source list.
    pub fn tenant_directory(&self) -> StaticDirectory {
        StaticDirectory::new(self.tenants.iter().filter_map(|(id, t)| {
            t.sources.as_ref().map(|sources| Tenant {
                tenant_id: id.clone(),
                display_config: serde_json::json!({
                    "display_name": t.display_name.clone().unwrap_or_else(|| id.clone()),
                }),
                associated_source_ids: sources.clone(),
            })
        }))
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
        }

        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_score) {
            bail!("retrieval.min_score must be in [-1.0, 1.0]");
        }
        if self.retrieval.max_fanout < 1 {
            bail!("retrieval.max_fanout must be >= 1");
        }

        if self.assembly.budget_chars == 0 {
            bail!("assembly.budget_chars must be > 0");
        }

        for (id, t) in &self.tenants {
            if id.is_empty() || id.contains(PARTITION_SEPARATOR) {
                bail!("tenant id '{}' must be non-empty and must not contain '::'", id);
            }
            if let Some(score) = t.min_score {
                if !(-1.0..=1.0).contains(&score) {
                    bail!("tenants.{}.min_score must be in [-1.0, 1.0]", id);
                }
            }
        }

        match self.embedding.provider.as_str() {
            "disabled" | "hashing" | "openai" | "ollama" | "local" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, hashing, openai, ollama, or local.",
                other
            ),
        }
        if matches!(self.embedding.provider.as_str(), "openai" | "ollama") {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        if self.embedding.provider == "hashing" && self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0 for the hashing provider");
        }

        match self.generation.provider.as_str() {
            "disabled" | "echo" => {}
            "openai" | "ollama" => {
                if self.generation.model.is_none() {
                    bail!(
                        "generation.model must be specified when provider is '{}'",
                        self.generation.provider
                    );
                }
            }
            other => bail!(
                "Unknown generation provider: '{}'. Must be disabled, echo, openai, or ollama.",
                other
            ),
        }
        if self.generation.timeout_secs == 0 {
            bail!("generation.timeout_secs must be > 0");
        }
        if self.generation.max_retries > 10 {
            bail!("generation.max_retries must be <= 10");
        }

        if self.analytics.max_retries > 20 {
            bail!("analytics.max_retries must be <= 20");
        }
        for (model, p) in &self.analytics.pricing {
            if p.input_per_1k < 0.0 || p.output_per_1k < 0.0 {
                bail!("analytics.pricing.{} must not be negative", model);
            }
        }

        Ok(())
    }
}

/// Read, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Config {
        let content = format!("[db]\npath = \"/tmp/gnd.sqlite\"\n{}", extra);
        toml::from_str(&content).unwrap()
    }

    #[test]
    fn test_minimal_config_uses_offline_defaults() {
        let cfg = parse("");
        cfg.validate().unwrap();
        assert_eq!(cfg.embedding.provider, "hashing");
        assert_eq!(cfg.embedding.dims, Some(384));
        assert_eq!(cfg.generation.provider, "echo");
        assert_eq!(cfg.retrieval.top_k, 5);
        assert_eq!(cfg.analytics.max_retries, 3);
    }

    #[test]
    fn test_overlap_must_be_below_max() {
        let cfg = parse("[chunking]\nmax_tokens = 10\noverlap_tokens = 10\n");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_min_score_range() {
        let cfg = parse("[retrieval]\nmin_score = 1.5\n");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_providers_rejected() {
        assert!(parse("[embedding]\nprovider = \"magic\"\n").validate().is_err());
        assert!(parse("[generation]\nprovider = \"magic\"\n").validate().is_err());
    }

    #[test]
    fn test_openai_embedding_requires_model_and_dims() {
        let cfg = parse("[embedding]\nprovider = \"openai\"\ndims = 1536\n");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tenant_id_cannot_contain_separator() {
        let cfg = parse("[tenants.\"a::b\"]\npreamble = \"x\"\n");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tenant_table_and_directory() {
        let cfg = parse(
            r#"
[tenants.sage]
display_name = "The Sage"
preamble = "You are a stoic sage."
min_score = 0.4
sources = ["meditations", "letters"]

[tenants.coach]
preamble = "You are a running coach."
"#,
        );
        cfg.validate().unwrap();
        let table = cfg.tenant_table();
        assert_eq!(table.resolve("sage").preamble, "You are a stoic sage.");
        assert_eq!(table.resolve("coach").display_name, "coach");
        assert_eq!(table.resolve("other").preamble, cfg.assembly.default_preamble);

        assert_eq!(table.resolve("sage").min_score, Some(0.4));
        assert_eq!(cfg.search_params().min_score, cfg.retrieval.min_score);
    }

    #[test]
    fn test_pricing_table() {
        let cfg = parse(
            r#"
[analytics.pricing."gpt-4o-mini"]
input_per_1k = 0.00015
output_per_1k = 0.0006
"#,
        );
        cfg.validate().unwrap();
        assert_eq!(cfg.analytics.pricing["gpt-4o-mini"].output_per_1k, 0.0006);
    }

    #[test]
    fn test_processor_params_linear_backoff() {
        let cfg = parse("[analytics]\nbackoff_base_ms = 100\nmax_retries = 2\n");
        let p = cfg.processor_params();
        assert_eq!(p.retry.max_retries, 2);
        assert_eq!(p.retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.retry.delay_for(2), Duration::from_millis(200));
    }
}
