pub mod aggregation;
pub mod coordinator;
pub mod extraction;
pub mod keywords;
pub mod ollama;
pub mod prompt;
pub mod sanitize;
pub mod sources;
pub mod synthesis;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigError, LlmBackend, PipelineConfig};
use aggregation::{AggregatorSettings, EvidenceAggregator};
use coordinator::{CoordinatorSettings, PipelineCoordinator};
use extraction::OllamaVisionOcr;
use keywords::LlmKeywordExtractor;
use ollama::OllamaClient;
use sources::http::build_client;
use sources::{
    CachedSource, EuropePmcClient, FoodDataClient, RateLimiter, SlidingWindowLimiter, SourceClient,
    WikipediaClient,
};
use synthesis::llm::LlmGenerate;
use synthesis::{ChatCompletionsGenerator, OllamaGenerator, Synthesizer, SynthesizerSettings};

/// Wire a coordinator from configuration.
///
/// One rate limiter is shared by all source clients (keyed per source) and
/// every source sits behind a response cache. The nutrition database is only
/// queried when an API key is configured.
pub fn build_pipeline(config: &PipelineConfig) -> Result<PipelineCoordinator, ConfigError> {
    config.validate()?;
    let retrieval = &config.retrieval;
    let endpoints = &config.endpoints;

    let http = build_client(retrieval.source_timeout()).map_err(|e| ConfigError::HttpClient(e.to_string()))?;
    let limiter: Arc<dyn RateLimiter> = Arc::new(SlidingWindowLimiter::per_minute(retrieval.requests_per_minute));

    let mut clients: Vec<Arc<dyn SourceClient>> = vec![
        Arc::new(EuropePmcClient::new(
            &endpoints.europe_pmc_base_url,
            http.clone(),
            limiter.clone(),
            retrieval.max_snippet_chars,
        )),
        Arc::new(WikipediaClient::new(
            &endpoints.wikipedia_base_url,
            http.clone(),
            limiter.clone(),
            retrieval.max_snippet_chars,
        )),
    ];
    match endpoints.fooddata_api_key.as_deref() {
        Some(key) => clients.push(Arc::new(FoodDataClient::new(
            &endpoints.fooddata_base_url,
            key,
            http,
            limiter,
            retrieval.max_snippet_chars,
        ))),
        None => tracing::info!("No FoodData Central API key; nutrition database disabled"),
    }
    let sources: Vec<Arc<dyn SourceClient>> = clients
        .into_iter()
        .map(|client| {
            Arc::new(CachedSource::new(client, retrieval.cache_ttl(), retrieval.cache_capacity))
                as Arc<dyn SourceClient>
        })
        .collect();

    let vision_client = OllamaClient::new(
        &endpoints.ollama_base_url,
        Duration::from_millis(config.timeouts.text_extraction_ms),
    )
    .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
    let text_extractor = Arc::new(OllamaVisionOcr::new(Arc::new(vision_client), endpoints.vision_model.clone()));

    let llm: Arc<dyn LlmGenerate> = match endpoints.llm_backend {
        LlmBackend::Ollama => {
            let client = OllamaClient::new(&endpoints.ollama_base_url, config.synthesis.model_timeout())
                .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
            Arc::new(OllamaGenerator::new(
                Arc::new(client),
                &endpoints.text_model,
                config.synthesis.temperature,
            ))
        }
        LlmBackend::ChatCompletions => {
            let key = endpoints
                .chat_completions_api_key
                .as_deref()
                .ok_or_else(|| ConfigError::Invalid {
                    field: "endpoints.chat_completions_api_key",
                    reason: "required for the chat_completions backend".into(),
                })?;
            Arc::new(
                ChatCompletionsGenerator::new(
                    &endpoints.chat_completions_base_url,
                    key,
                    &endpoints.text_model,
                    config.synthesis.temperature,
                    config.synthesis.model_timeout(),
                )
                .map_err(|e| ConfigError::HttpClient(e.to_string()))?,
            )
        }
    };

    tracing::info!(
        sources = sources.len(),
        backend = ?endpoints.llm_backend,
        text_model = %endpoints.text_model,
        vision_model = %endpoints.vision_model,
        "Pipeline assembled"
    );

    Ok(PipelineCoordinator::new(
        text_extractor,
        Arc::new(LlmKeywordExtractor::new(llm.clone())),
        EvidenceAggregator::new(sources, AggregatorSettings::from_config(retrieval)),
        Synthesizer::new(llm, SynthesizerSettings::from_config(&config.synthesis)),
        CoordinatorSettings::from_config(config),
    ))
}
