//! Application constants and the pipeline configuration surface.
//!
//! `PipelineConfig` is plain serde data with documented defaults. It can be
//! read from JSON, overridden from `NUTRILENS_*` environment variables, and
//! must pass [`PipelineConfig::validate`] before a pipeline is built from it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::prompt::Tone;

/// Application-level constants
pub const APP_NAME: &str = "nutrilens";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent sent to public knowledge APIs (Wikimedia requires one).
pub fn user_agent() -> String {
    format!("{APP_NAME}/{APP_VERSION} (food-label evidence retrieval)")
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "nutrilens=info,warn"
}

/// Smallest prompt budget that still fits the fixed prompt skeleton.
pub const MIN_PROMPT_BUDGET_CHARS: usize = 1_024;
/// Upper bound for fan-out concurrency.
pub const MAX_SOURCE_CONCURRENCY: usize = 32;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Environment variable {var} has an invalid value: {value}")]
    Env { var: &'static str, value: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("HTTP client setup failed: {0}")]
    HttpClient(String),
}

// ═══════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════

/// Evidence retrieval: fan-out, retries, caching and the evidence cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Only the K highest-ranked keywords are queried.
    pub top_k_keywords: usize,
    /// Results requested from each source per keyword.
    pub results_per_source: usize,
    /// Maximum in-flight source queries within one run.
    pub max_concurrency: usize,
    /// Timeout for each individual source request attempt.
    pub source_timeout_ms: u64,
    /// Retries after the first attempt for retryable source failures.
    pub source_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    /// Items below this relevance are discarded before merging.
    pub min_relevance: f32,
    /// Evidence cap N.
    pub max_evidence_items: usize,
    /// Evidence cap L (sum of snippet characters).
    pub max_evidence_chars: usize,
    /// Longest snippet a source client keeps per item.
    pub max_snippet_chars: usize,
    /// Local rate limit per source, requests per minute.
    pub requests_per_minute: u32,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_keywords: 8,
            results_per_source: 3,
            max_concurrency: 4,
            source_timeout_ms: 5_000,
            source_retries: 2,
            retry_backoff_ms: 500,
            max_retry_backoff_ms: 5_000,
            min_relevance: 0.05,
            max_evidence_items: 12,
            max_evidence_chars: 6_000,
            max_snippet_chars: 600,
            requests_per_minute: 60,
            cache_ttl_secs: 3_600,
            cache_capacity: 1_000,
        }
    }
}

/// Prompt composition limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Hard cap on the rendered prompt, in characters.
    pub budget_chars: usize,
    /// Output token budget passed to the model.
    pub max_output_tokens: u32,
    pub tone: Tone,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            // ~3000 tokens at 4 chars/token
            budget_chars: 12_000,
            max_output_tokens: 500,
            tone: Tone::Friendly,
        }
    }
}

/// Language-model call behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Client-side timeout for one model call.
    pub model_timeout_ms: u64,
    /// Retries after a model timeout.
    pub timeout_retries: u32,
    pub retry_backoff_ms: u64,
    /// Sampling temperature; low for reproducible advice.
    pub temperature: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            model_timeout_ms: 60_000,
            timeout_retries: 1,
            retry_backoff_ms: 1_000,
            temperature: 0.2,
        }
    }
}

/// Per-stage timeouts and the overall run deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub text_extraction_ms: u64,
    pub keyword_extraction_ms: u64,
    pub retrieval_ms: u64,
    pub composing_ms: u64,
    pub synthesis_ms: u64,
    pub run_deadline_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            text_extraction_ms: 120_000,
            keyword_extraction_ms: 60_000,
            retrieval_ms: 45_000,
            composing_ms: 1_000,
            synthesis_ms: 150_000,
            run_deadline_ms: 300_000,
        }
    }
}

/// Which language-model backend synthesizes recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    /// Local Ollama instance.
    Ollama,
    /// Any OpenAI-compatible `/chat/completions` endpoint (Groq, vLLM, ...).
    ChatCompletions,
}

/// Endpoints and model names of every external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub ollama_base_url: String,
    pub vision_model: String,
    pub llm_backend: LlmBackend,
    pub text_model: String,
    pub chat_completions_base_url: String,
    /// Never serialized; read from `LLM_API_KEY`.
    #[serde(skip)]
    pub chat_completions_api_key: Option<String>,
    pub europe_pmc_base_url: String,
    pub wikipedia_base_url: String,
    pub fooddata_base_url: String,
    /// Never serialized; read from `FOODDATA_API_KEY`. The nutrition source
    /// is only enabled when a key is present.
    #[serde(skip)]
    pub fooddata_api_key: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://localhost:11434".into(),
            vision_model: "llava".into(),
            llm_backend: LlmBackend::Ollama,
            text_model: "llama3.1".into(),
            chat_completions_base_url: "https://api.groq.com/openai/v1".into(),
            chat_completions_api_key: None,
            europe_pmc_base_url: "https://www.ebi.ac.uk/europepmc/webservices/rest".into(),
            wikipedia_base_url: "https://en.wikipedia.org".into(),
            fooddata_base_url: "https://api.nal.usda.gov".into(),
            fooddata_api_key: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// PipelineConfig
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retrieval: RetrievalConfig,
    pub prompt: PromptConfig,
    pub synthesis: SynthesisConfig,
    pub timeouts: StageTimeouts,
    pub endpoints: EndpointConfig,
    /// Uploads above this size are rejected before OCR.
    pub max_image_bytes: usize,
    /// OCR confidence under this floor adds a warning to the recommendation.
    pub min_ocr_confidence: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            prompt: PromptConfig::default(),
            synthesis: SynthesisConfig::default(),
            timeouts: StageTimeouts::default(),
            endpoints: EndpointConfig::default(),
            max_image_bytes: 5 * 1024 * 1024,
            min_ocr_confidence: 0.3,
        }
    }
}

impl PipelineConfig {
    /// Parse a (possibly partial) JSON document; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NUTRILENS_*` overrides from `lookup` (injectable for tests).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("NUTRILENS_MAX_CONCURRENCY") {
            self.retrieval.max_concurrency = parse_env("NUTRILENS_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("NUTRILENS_TOP_K_KEYWORDS") {
            self.retrieval.top_k_keywords = parse_env("NUTRILENS_TOP_K_KEYWORDS", &v)?;
        }
        if let Some(v) = get("NUTRILENS_SOURCE_RETRIES") {
            self.retrieval.source_retries = parse_env("NUTRILENS_SOURCE_RETRIES", &v)?;
        }
        if let Some(v) = get("NUTRILENS_MAX_EVIDENCE_ITEMS") {
            self.retrieval.max_evidence_items = parse_env("NUTRILENS_MAX_EVIDENCE_ITEMS", &v)?;
        }
        if let Some(v) = get("NUTRILENS_MAX_EVIDENCE_CHARS") {
            self.retrieval.max_evidence_chars = parse_env("NUTRILENS_MAX_EVIDENCE_CHARS", &v)?;
        }
        if let Some(v) = get("NUTRILENS_PROMPT_BUDGET") {
            self.prompt.budget_chars = parse_env("NUTRILENS_PROMPT_BUDGET", &v)?;
        }
        if let Some(v) = get("NUTRILENS_RUN_DEADLINE_MS") {
            self.timeouts.run_deadline_ms = parse_env("NUTRILENS_RUN_DEADLINE_MS", &v)?;
        }
        if let Some(v) = get("NUTRILENS_OLLAMA_URL") {
            self.endpoints.ollama_base_url = v;
        }
        if let Some(v) = get("NUTRILENS_VISION_MODEL") {
            self.endpoints.vision_model = v;
        }
        if let Some(v) = get("NUTRILENS_TEXT_MODEL") {
            self.endpoints.text_model = v;
        }
        if let Some(v) = get("NUTRILENS_LLM_BACKEND") {
            self.endpoints.llm_backend = match v.to_lowercase().as_str() {
                "ollama" => LlmBackend::Ollama,
                "chat_completions" | "openai" | "groq" => LlmBackend::ChatCompletions,
                _ => {
                    return Err(ConfigError::Env {
                        var: "NUTRILENS_LLM_BACKEND",
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = get("LLM_API_KEY") {
            self.endpoints.chat_completions_api_key = Some(v);
        }
        if let Some(v) = get("FOODDATA_API_KEY") {
            self.endpoints.fooddata_api_key = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.retrieval;
        if r.top_k_keywords == 0 {
            return Err(invalid("retrieval.top_k_keywords", "must be at least 1"));
        }
        if r.results_per_source == 0 {
            return Err(invalid("retrieval.results_per_source", "must be at least 1"));
        }
        if r.max_concurrency == 0 || r.max_concurrency > MAX_SOURCE_CONCURRENCY {
            return Err(invalid(
                "retrieval.max_concurrency",
                format!("must be between 1 and {MAX_SOURCE_CONCURRENCY}"),
            ));
        }
        if r.source_timeout_ms == 0 {
            return Err(invalid("retrieval.source_timeout_ms", "must be positive"));
        }
        if r.max_retry_backoff_ms < r.retry_backoff_ms {
            return Err(invalid(
                "retrieval.max_retry_backoff_ms",
                "must not be below retry_backoff_ms",
            ));
        }
        if !(0.0..=1.0).contains(&r.min_relevance) {
            return Err(invalid("retrieval.min_relevance", "must be within [0, 1]"));
        }
        if r.max_evidence_items == 0 {
            return Err(invalid("retrieval.max_evidence_items", "must be at least 1"));
        }
        if r.requests_per_minute == 0 {
            return Err(invalid("retrieval.requests_per_minute", "must be at least 1"));
        }
        if self.prompt.budget_chars < MIN_PROMPT_BUDGET_CHARS {
            return Err(invalid(
                "prompt.budget_chars",
                format!("must be at least {MIN_PROMPT_BUDGET_CHARS}"),
            ));
        }
        if self.prompt.max_output_tokens == 0 {
            return Err(invalid("prompt.max_output_tokens", "must be at least 1"));
        }
        if self.synthesis.model_timeout_ms == 0 {
            return Err(invalid("synthesis.model_timeout_ms", "must be positive"));
        }
        let t = &self.timeouts;
        for (field, value) in [
            ("timeouts.text_extraction_ms", t.text_extraction_ms),
            ("timeouts.keyword_extraction_ms", t.keyword_extraction_ms),
            ("timeouts.retrieval_ms", t.retrieval_ms),
            ("timeouts.composing_ms", t.composing_ms),
            ("timeouts.synthesis_ms", t.synthesis_ms),
            ("timeouts.run_deadline_ms", t.run_deadline_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be positive"));
            }
        }
        if t.retrieval_ms < r.source_timeout_ms {
            return Err(invalid(
                "timeouts.retrieval_ms",
                "must cover at least one source attempt (retrieval.source_timeout_ms)",
            ));
        }
        if self.max_image_bytes == 0 {
            return Err(invalid("max_image_bytes", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_ocr_confidence) {
            return Err(invalid("min_ocr_confidence", "must be within [0, 1]"));
        }
        if self.endpoints.llm_backend == LlmBackend::ChatCompletions
            && self.endpoints.chat_completions_api_key.is_none()
        {
            return Err(invalid(
                "endpoints.chat_completions_api_key",
                "LLM_API_KEY is required for the chat_completions backend",
            ));
        }
        Ok(())
    }
}

impl RetrievalConfig {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl SynthesisConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::Env {
        var,
        value: value.to_string(),
    })
}
