//! Recommendation synthesis: one model call, parsed into a [`Recommendation`].
//!
//! Timeouts are retried once (configurable) after a backoff. Refusals and
//! unparseable answers do not fail the run: they yield a low-confidence
//! fallback recommendation. An unreachable model is fatal.

pub mod llm;
pub mod ollama;
pub mod openai;
pub mod response;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::SynthesisConfig;
use crate::models::{ConfidenceLevel, Recommendation, Suitability};
use crate::pipeline::prompt::{SynthesisMode, SynthesisRequest};
use llm::{LlmError, LlmGenerate};
use response::{parse_response, ResponseIssue};

pub use ollama::OllamaGenerator;
pub use openai::ChatCompletionsGenerator;

pub const FALLBACK_SUMMARY: &str = "A detailed assessment could not be generated for this product. \
Review the ingredient list and nutrition facts yourself, and check with a healthcare provider about \
any allergies, medications or conditions.";

pub const LOW_CONFIDENCE_WARNING: &str =
    "No supporting evidence could be retrieved; this assessment relies on general nutrition knowledge only.";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthesisError {
    #[error("Model timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("Model unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesizerSettings {
    pub model_timeout: Duration,
    pub timeout_retries: u32,
    pub retry_backoff: Duration,
}

impl SynthesizerSettings {
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            model_timeout: config.model_timeout(),
            timeout_retries: config.timeout_retries,
            retry_backoff: config.retry_backoff(),
        }
    }
}

pub struct Synthesizer {
    llm: Arc<dyn LlmGenerate>,
    settings: SynthesizerSettings,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmGenerate>, settings: SynthesizerSettings) -> Self {
        Self { llm, settings }
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    async fn call_model(&self, request: &SynthesisRequest) -> Result<String, LlmError> {
        let prompt = request.render_prompt();
        let mut attempt = 0u32;
        loop {
            let call = self.llm.generate(
                request.system_prompt(),
                &prompt,
                request.constraints.max_output_tokens,
            );
            let result = match tokio::time::timeout(self.settings.model_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout),
            };
            match result {
                Err(LlmError::Timeout) if attempt < self.settings.timeout_retries => {
                    attempt += 1;
                    tracing::warn!(
                        model = self.llm.model_name(),
                        attempt,
                        backoff_ms = self.settings.retry_backoff.as_millis() as u64,
                        "Model call timed out, retrying"
                    );
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
                other => return other,
            }
        }
    }

    pub async fn synthesize(
        &self,
        request: &SynthesisRequest,
        run_id: Uuid,
    ) -> Result<Recommendation, SynthesisError> {
        let started = std::time::Instant::now();
        let outcome = self.call_model(request).await;
        tracing::info!(
            model = self.llm.model_name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Model call finished"
        );

        let raw = match outcome {
            Ok(raw) => raw,
            Err(LlmError::Timeout) => {
                return Err(SynthesisError::Timeout {
                    attempts: self.settings.timeout_retries + 1,
                })
            }
            Err(LlmError::Unavailable(msg)) => return Err(SynthesisError::Unavailable(msg)),
            Err(LlmError::Refused(msg)) => {
                tracing::warn!(reason = %msg, "Model refused the request");
                return Ok(fallback(request, run_id, "The language model declined to assess this product."));
            }
            Err(LlmError::InvalidResponse(msg)) => {
                tracing::warn!(reason = %msg, "Model returned an invalid response");
                return Ok(fallback(request, run_id, "The language model returned an unusable response."));
            }
        };

        match parse_response(&raw) {
            Ok(parsed) => {
                let referenced: Vec<String> = parsed
                    .cited_labels
                    .iter()
                    .filter_map(|label| request.url_for_label(*label))
                    .map(str::to_string)
                    .collect();
                let attributions = if referenced.is_empty() {
                    request.evidence_urls()
                } else {
                    referenced
                };

                let mut warnings = base_warnings(request);
                warnings.extend(parsed.warnings);

                let confidence = match request.mode {
                    SynthesisMode::Grounded => ConfidenceLevel::Normal,
                    SynthesisMode::GeneralKnowledgeOnly => ConfidenceLevel::Low,
                };

                Ok(Recommendation {
                    run_id,
                    summary: parsed.summary,
                    attributions,
                    warnings,
                    suitability: parsed.verdict,
                    confidence,
                    generated_at: Utc::now(),
                })
            }
            Err(ResponseIssue::Refusal) => {
                tracing::warn!("Model answer is a refusal");
                Ok(fallback(request, run_id, "The language model declined to assess this product."))
            }
            Err(ResponseIssue::Malformed(reason)) => {
                tracing::warn!(reason = %reason, "Model answer could not be parsed");
                Ok(fallback(request, run_id, "The language model response could not be understood."))
            }
        }
    }
}

fn base_warnings(request: &SynthesisRequest) -> Vec<String> {
    let mut warnings = Vec::new();
    if request.mode == SynthesisMode::GeneralKnowledgeOnly {
        warnings.push(LOW_CONFIDENCE_WARNING.to_string());
    }
    if request.text_truncated {
        warnings.push("The label text was long and only its beginning was analyzed.".to_string());
    }
    warnings
}

fn fallback(request: &SynthesisRequest, run_id: Uuid, problem: &str) -> Recommendation {
    let mut warnings = base_warnings(request);
    warnings.push(problem.to_string());
    Recommendation {
        run_id,
        summary: FALLBACK_SUMMARY.to_string(),
        attributions: request.evidence_urls(),
        warnings,
        suitability: Suitability::Unknown,
        confidence: ConfidenceLevel::Low,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvidenceItem, EvidenceSet, EvidenceSource, Keyword, ScoredEvidence, UserProfile};
    use crate::pipeline::prompt::{compose, SynthesisConstraints, Tone};
    use llm::ScriptedLlm;

    fn settings() -> SynthesizerSettings {
        SynthesizerSettings {
            model_timeout: Duration::from_millis(200),
            timeout_retries: 1,
            retry_backoff: Duration::from_millis(5),
        }
    }

    fn request(with_evidence: bool) -> SynthesisRequest {
        let evidence = if with_evidence {
            EvidenceSet::from_ranked(
                ["https://w/Sugar", "https://pmc/1", "https://w/Fiber"]
                    .iter()
                    .map(|url| ScoredEvidence {
                        item: EvidenceItem::new(
                            EvidenceSource::Encyclopedia,
                            "Title",
                            "Snippet",
                            *url,
                            Keyword::new("sugar", 0.9, 0).unwrap(),
                            0.8,
                        )
                        .unwrap(),
                        score: 0.8,
                    })
                    .collect(),
            )
        } else {
            EvidenceSet::empty()
        };
        compose(
            "Ingredients: sugar, oats",
            &evidence,
            &UserProfile::default(),
            SynthesisConstraints {
                max_output_tokens: 300,
                tone: Tone::Concise,
            },
            12_000,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn referenced_markers_become_attributions() {
        let llm = Arc::new(ScriptedLlm::ok(
            "SUMMARY: High in sugar [E2].\nWARNINGS:\n- Watch portions [E3].\nVERDICT: MS",
        ));
        let synth = Synthesizer::new(llm.clone(), settings());
        let rec = synth.synthesize(&request(true), Uuid::new_v4()).await.unwrap();
        assert_eq!(rec.summary, "High in sugar.");
        assert_eq!(rec.attributions, vec!["https://pmc/1", "https://w/Fiber"]);
        assert_eq!(rec.warnings, vec!["Watch portions."]);
        assert_eq!(rec.suitability, Suitability::ModeratelySuitable);
        assert_eq!(rec.confidence, ConfidenceLevel::Normal);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn unreferenced_answer_attributes_all_items() {
        let llm = Arc::new(ScriptedLlm::ok("SUMMARY: Fine [E9].\nVERDICT: S"));
        let synth = Synthesizer::new(llm, settings());
        let rec = synth.synthesize(&request(true), Uuid::new_v4()).await.unwrap();
        assert_eq!(rec.attributions.len(), 3);
    }

    #[tokio::test]
    async fn general_knowledge_mode_is_low_confidence() {
        let llm = Arc::new(ScriptedLlm::ok("SUMMARY: Generally fine.\nWARNINGS:\n- none\nVERDICT: S"));
        let synth = Synthesizer::new(llm, settings());
        let rec = synth.synthesize(&request(false), Uuid::new_v4()).await.unwrap();
        assert!(rec.is_low_confidence());
        assert_eq!(rec.warnings, vec![LOW_CONFIDENCE_WARNING]);
        assert!(rec.attributions.is_empty());
    }

    #[tokio::test]
    async fn timeout_is_retried_once_then_succeeds() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Err(LlmError::Timeout),
            Ok("SUMMARY: Ok.\nVERDICT: S".into()),
        ]));
        let synth = Synthesizer::new(llm.clone(), settings());
        let rec = synth.synthesize(&request(true), Uuid::new_v4()).await.unwrap();
        assert_eq!(rec.summary, "Ok.");
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn repeated_timeout_is_surfaced() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(LlmError::Timeout)]));
        let synth = Synthesizer::new(llm.clone(), settings());
        let err = synth.synthesize(&request(true), Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, SynthesisError::Timeout { attempts: 2 });
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn slow_model_hits_client_timeout() {
        struct Hanging;

        #[async_trait::async_trait]
        impl LlmGenerate for Hanging {
            async fn generate(&self, _s: &str, _p: &str, _m: u32) -> Result<String, LlmError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(String::new())
            }
            fn model_name(&self) -> &str {
                "hanging"
            }
        }

        let synth = Synthesizer::new(Arc::new(Hanging), settings());
        let err = synth.synthesize(&request(true), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SynthesisError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unavailable_is_fatal_and_not_retried() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(LlmError::Unavailable("connection refused".into()))]));
        let synth = Synthesizer::new(llm.clone(), settings());
        let err = synth.synthesize(&request(true), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SynthesisError::Unavailable(_)));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn refusal_yields_fallback() {
        let llm = Arc::new(ScriptedLlm::ok("I'm sorry, I cannot help with that."));
        let synth = Synthesizer::new(llm.clone(), settings());
        let rec = synth.synthesize(&request(true), Uuid::new_v4()).await.unwrap();
        assert_eq!(rec.summary, FALLBACK_SUMMARY);
        assert!(rec.is_low_confidence());
        assert_eq!(rec.suitability, Suitability::Unknown);
        assert_eq!(rec.attributions.len(), 3);
        assert!(rec.warnings.iter().any(|w| w.contains("declined")));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_answer_yields_fallback() {
        let llm = Arc::new(ScriptedLlm::ok("Looks fine to me!"));
        let synth = Synthesizer::new(llm, settings());
        let rec = synth.synthesize(&request(true), Uuid::new_v4()).await.unwrap();
        assert_eq!(rec.summary, FALLBACK_SUMMARY);
        assert!(rec.warnings.iter().any(|w| w.contains("could not be understood")));
    }
}
