//! TOML configuration parsing and validation.
//!
//! Every section except `[storage]` is optional; omitted fields fall back to
//! the defaults below. See [`load_config`] for the validation rules.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub entities: EntitiesConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("vectorstore")
}
fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

impl StorageConfig {
    pub fn raw_messages_path(&self) -> PathBuf {
        self.data_dir.join("raw").join("messages.json")
    }

    pub fn processed_messages_path(&self) -> PathBuf {
        self.data_dir.join("processed").join("messages.json")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// `"file"` or `"http"`.
    #[serde(default = "default_source_kind")]
    pub kind: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            path: None,
            url: None,
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_source_kind() -> String {
    "file".to_string()
}
fn default_page_size() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Top-K for the dense index.
    #[serde(default = "default_dense_k")]
    pub dense_k: usize,
    /// Top-M for the sparse index.
    #[serde(default = "default_sparse_k")]
    pub sparse_k: usize,
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_sparse_weight")]
    pub sparse_weight: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_k: default_dense_k(),
            sparse_k: default_sparse_k(),
            dense_weight: default_dense_weight(),
            sparse_weight: default_sparse_weight(),
        }
    }
}

fn default_dense_k() -> usize {
    6
}
fn default_sparse_k() -> usize {
    8
}
fn default_dense_weight() -> f64 {
    0.6
}
fn default_sparse_weight() -> f64 {
    0.4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"hash"`, `"openai"`, `"ollama"`, `"local"` or `"disabled"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
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
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
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
pub struct GenerationConfig {
    /// `"ollama"`, `"openai"` or `"disabled"`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            url: None,
            temperature: default_temperature(),
            max_retries: default_generation_retries(),
            timeout_secs: default_generation_timeout(),
        }
    }
}

fn default_generation_provider() -> String {
    "ollama".to_string()
}
fn default_generation_model() -> String {
    "mistral:instruct".to_string()
}
fn default_temperature() -> f64 {
    0.2
}
fn default_generation_retries() -> u32 {
    2
}
fn default_generation_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerifierConfig {
    /// `"http"` or `"disabled"`.
    #[serde(default = "default_verifier_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_verifier_model")]
    pub model: String,
    /// Minimum entailment probability for an answer to count as supported.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            provider: default_verifier_provider(),
            url: None,
            model: default_verifier_model(),
            threshold: default_threshold(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_verifier_provider() -> String {
    "disabled".to_string()
}
fn default_verifier_model() -> String {
    "MoritzLaurer/mDeBERTa-v3-base-mnli-xnli".to_string()
}
fn default_threshold() -> f64 {
    0.55
}

/// Gazetteer for best-effort entity tagging: label → surface forms.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EntitiesConfig {
    #[serde(default)]
    pub gazetteer: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Upper bound on one `/api/ask` request, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            environment: default_environment(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_environment() -> String {
    "local".to_string()
}
fn default_request_timeout() -> u64 {
    180
}

impl Config {
    /// Configuration rooted at `data_dir` with every other section defaulted.
    pub fn minimal(data_dir: &Path) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.to_path_buf(),
                index_dir: data_dir.join("vectorstore"),
                reports_dir: data_dir.join("reports"),
            },
            source: SourceConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            verifier: VerifierConfig::default(),
            entities: EntitiesConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Retrieval
    if config.retrieval.dense_k == 0 || config.retrieval.sparse_k == 0 {
        bail!("retrieval.dense_k and retrieval.sparse_k must be >= 1");
    }
    let (dw, sw) = (config.retrieval.dense_weight, config.retrieval.sparse_weight);
    if dw < 0.0 || sw < 0.0 || !dw.is_finite() || !sw.is_finite() {
        bail!("retrieval weights must be finite and >= 0");
    }
    if dw == 0.0 && sw == 0.0 {
        bail!("at least one of retrieval.dense_weight / retrieval.sparse_weight must be > 0");
    }

    // Source
    match config.source.kind.as_str() {
        "file" => {
            if config.source.path.is_none() {
                bail!("source.path must be set when source.kind = 'file'");
            }
        }
        "http" => {
            if config.source.url.is_none() {
                bail!("source.url must be set when source.kind = 'http'");
            }
            if config.source.page_size == 0 {
                bail!("source.page_size must be >= 1");
            }
        }
        other => bail!("Unknown source kind: '{}'. Must be file or http.", other),
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "local" => {}
        "openai" | "ollama" => {
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
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, local, openai, or ollama.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }

    // Generation
    match config.generation.provider.as_str() {
        "disabled" | "ollama" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, ollama, or openai.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        bail!("generation.temperature must be in [0.0, 2.0]");
    }

    // Verifier
    match config.verifier.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.verifier.url.is_none() {
                bail!("verifier.url must be set when verifier.provider = 'http'");
            }
        }
        other => bail!(
            "Unknown verifier provider: '{}'. Must be disabled or http.",
            other
        ),
    }
    if !(0.0..=1.0).contains(&config.verifier.threshold) {
        bail!("verifier.threshold must be in [0.0, 1.0]");
    }

    // Server
    if config.server.request_timeout_secs == 0 {
        bail!("server.request_timeout_secs must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse(include_str!("../config/mqa.example.toml")).unwrap();
        assert_eq!(config.source.kind, "http");
        assert_eq!(config.server.request_timeout_secs, 180);
        assert_eq!(config.entities.gazetteer["GPE"].len(), 5);
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse(
            r#"
[storage]
data_dir = "data"

[source]
path = "messages.json"
"#,
        )
        .unwrap();
        assert_eq!(config.retrieval.dense_k, 6);
        assert_eq!(config.retrieval.sparse_k, 8);
        assert!((config.retrieval.dense_weight - 0.6).abs() < 1e-12);
        assert!((config.verifier.threshold - 0.55).abs() < 1e-12);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.storage.index_dir, PathBuf::from("vectorstore"));
    }

    #[test]
    fn test_rejects_zero_weights() {
        let err = parse(
            r#"
[storage]
data_dir = "data"
[source]
path = "m.json"
[retrieval]
dense_weight = 0.0
sparse_weight = 0.0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be > 0"));
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let err = parse(
            r#"
[storage]
data_dir = "data"
[source]
path = "m.json"
[verifier]
threshold = 1.5
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn test_openai_embedding_requires_dims() {
        let err = parse(
            r#"
[storage]
data_dir = "data"
[source]
path = "m.json"
[embedding]
provider = "openai"
model = "text-embedding-3-small"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_http_source_requires_url() {
        let err = parse(
            r#"
[storage]
data_dir = "data"
[source]
kind = "http"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("source.url"));
    }

    #[test]
    fn test_gazetteer_parses() {
        let config = parse(
            r#"
[storage]
data_dir = "data"
[source]
path = "m.json"
[entities.gazetteer]
GPE = ["London", "Paris"]
"#,
        )
        .unwrap();
        assert_eq!(config.entities.gazetteer["GPE"].len(), 2);
    }
}
