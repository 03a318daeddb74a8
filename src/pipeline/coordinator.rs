//! Pipeline coordinator: one run from label photo to recommendation.
//!
//! Runs the stages in order as an explicit state machine:
//!
//! `Init → ExtractingText → ExtractingKeywords → RetrievingEvidence →
//! Composing → Synthesizing → Done`, with `Failed(kind)` reachable from any
//! state. Every transition is recorded in the [`RunReport`].
//!
//! Each stage has its own timeout and the whole run sits under a deadline.
//! When the deadline expires the run future is dropped, which cancels any
//! in-flight source or model request. Retrieval only fails when the
//! aggregator itself errors: its timeout is a budget handed to the
//! aggregator, so slow sources leave less evidence instead of failing the
//! run. No evidence is a degraded, successful path.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::{normalize_keywords, ConfidenceLevel, Keyword, Recommendation, UserProfile};
use crate::pipeline::aggregation::{EvidenceAggregator, QueryFailure};
use crate::pipeline::extraction::{
    validate_image, ExtractedText, ExtractionError, ImageContentType, TextExtractor,
};
use crate::pipeline::keywords::KeywordExtractor;
use crate::pipeline::prompt::{compose, SynthesisConstraints};
use crate::pipeline::synthesis::{SynthesisError, Synthesizer};

pub const LOW_OCR_CONFIDENCE_WARNING: &str =
    "The label text was hard to read; some ingredients or values may have been misread.";
pub const NOT_A_LABEL_WARNING: &str =
    "The photo does not look like a food label; the assessment may not apply to a food product.";
pub const PARTIAL_SOURCES_WARNING: &str =
    "Some evidence sources could not be reached; the supporting evidence may be incomplete.";
pub const NO_SOURCES_WARNING: &str = "None of the evidence sources could be reached.";

// ──────────────────────────────────────────────
// States and failures
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    TextExtraction,
    KeywordExtraction,
    Retrieval,
    Composing,
    Synthesis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextExtraction => "text_extraction",
            Self::KeywordExtraction => "keyword_extraction",
            Self::Retrieval => "retrieval",
            Self::Composing => "composing",
            Self::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Empty, oversized or undecodable image, or no readable text.
    InputError,
    ExtractionFailed,
    KeywordExtractionFailed,
    AggregationFailed,
    CompositionFailed,
    ModelTimeout,
    ModelUnavailable,
    /// A single stage ran past its own timeout.
    StageTimeout,
    /// The run deadline expired.
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputError => "input_error",
            Self::ExtractionFailed => "extraction_failed",
            Self::KeywordExtractionFailed => "keyword_extraction_failed",
            Self::AggregationFailed => "aggregation_failed",
            Self::CompositionFailed => "composition_failed",
            Self::ModelTimeout => "model_timeout",
            Self::ModelUnavailable => "model_unavailable",
            Self::StageTimeout => "stage_timeout",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RunState {
    Init,
    ExtractingText,
    ExtractingKeywords,
    RetrievingEvidence,
    Composing,
    Synthesizing,
    Done,
    Failed(FailureKind),
}

impl RunState {
    /// The stage a working state belongs to.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::ExtractingText => Some(Stage::TextExtraction),
            Self::ExtractingKeywords => Some(Stage::KeywordExtraction),
            Self::RetrievingEvidence => Some(Stage::Retrieval),
            Self::Composing => Some(Stage::Composing),
            Self::Synthesizing => Some(Stage::Synthesis),
            Self::Init | Self::Done | Self::Failed(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

/// Fatal outcome of a run, for presentation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{stage} failed ({}): {message}", .kind.as_str())]
pub struct PipelineFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl PipelineFailure {
    pub fn new(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    #[serde(flatten)]
    pub state: RunState,
    /// Milliseconds since the run started.
    pub at_ms: u64,
}

/// Everything the presentation layer gets back from one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub transitions: Vec<Transition>,
    /// Source queries that failed after retries; empty on a clean run.
    pub source_failures: Vec<QueryFailure>,
    pub elapsed_ms: u64,
    pub outcome: Result<Recommendation, PipelineFailure>,
}

impl RunReport {
    pub fn final_state(&self) -> Option<RunState> {
        self.transitions.last().map(|t| t.state)
    }

    pub fn states(&self) -> Vec<RunState> {
        self.transitions.iter().map(|t| t.state).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineInput {
    pub image: Vec<u8>,
    pub profile: UserProfile,
}

// ──────────────────────────────────────────────
// Settings
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub text_extraction_timeout: Duration,
    pub keyword_extraction_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub composing_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub run_deadline: Duration,
    /// Terms requested from the keyword extractor.
    pub max_keywords: usize,
    pub prompt_budget_chars: usize,
    pub constraints: SynthesisConstraints,
    pub max_image_bytes: usize,
    pub min_ocr_confidence: f32,
}

impl CoordinatorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let t = &config.timeouts;
        Self {
            text_extraction_timeout: Duration::from_millis(t.text_extraction_ms),
            keyword_extraction_timeout: Duration::from_millis(t.keyword_extraction_ms),
            retrieval_timeout: Duration::from_millis(t.retrieval_ms),
            composing_timeout: Duration::from_millis(t.composing_ms),
            synthesis_timeout: Duration::from_millis(t.synthesis_ms),
            run_deadline: Duration::from_millis(t.run_deadline_ms),
            max_keywords: config.retrieval.top_k_keywords,
            prompt_budget_chars: config.prompt.budget_chars,
            constraints: SynthesisConstraints {
                max_output_tokens: config.prompt.max_output_tokens,
                tone: config.prompt.tone,
            },
            max_image_bytes: config.max_image_bytes,
            min_ocr_confidence: config.min_ocr_confidence,
        }
    }
}

// ──────────────────────────────────────────────
// Run bookkeeping
// ──────────────────────────────────────────────

/// Transition log shared between the run future and the deadline handler.
struct RunTracker {
    started: Instant,
    transitions: Mutex<Vec<Transition>>,
    source_failures: Mutex<Vec<QueryFailure>>,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            transitions: Mutex::new(Vec::new()),
            source_failures: Mutex::new(Vec::new()),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn enter(&self, state: RunState) {
        let at_ms = self.elapsed_ms();
        tracing::debug!(state = ?state, at_ms, "Run state transition");
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Transition { state, at_ms });
    }

    fn current_stage(&self) -> Option<Stage> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .and_then(|t| t.state.stage())
    }

    fn record_failure(&self, failure: &QueryFailure) {
        self.source_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure.clone());
    }

    fn finish(
        self,
        run_id: Uuid,
        outcome: Result<Recommendation, PipelineFailure>,
    ) -> RunReport {
        let elapsed_ms = self.elapsed_ms();
        RunReport {
            run_id,
            transitions: self
                .transitions
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
            source_failures: self
                .source_failures
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
            elapsed_ms,
            outcome,
        }
    }
}

/// Run one stage under its timeout.
async fn run_stage<T, F>(stage: Stage, limit: Duration, work: F) -> Result<T, PipelineFailure>
where
    F: Future<Output = Result<T, PipelineFailure>>,
{
    let started = Instant::now();
    let result = match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => Err(PipelineFailure::new(
            stage,
            FailureKind::StageTimeout,
            format!("{stage} exceeded its {}ms timeout", limit.as_millis()),
        )),
    };
    log_stage(stage, started, result.is_ok());
    result
}

fn log_stage(stage: Stage, started: Instant, ok: bool) {
    tracing::info!(
        stage = stage.as_str(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok,
        "Stage finished"
    );
}

fn extraction_failure(error: ExtractionError) -> PipelineFailure {
    let kind = if error.is_input_error() {
        FailureKind::InputError
    } else {
        FailureKind::ExtractionFailed
    };
    PipelineFailure::new(Stage::TextExtraction, kind, error.to_string())
}

fn synthesis_failure(error: SynthesisError) -> PipelineFailure {
    let kind = match error {
        SynthesisError::Timeout { .. } => FailureKind::ModelTimeout,
        SynthesisError::Unavailable(_) => FailureKind::ModelUnavailable,
    };
    PipelineFailure::new(Stage::Synthesis, kind, error.to_string())
}

// ──────────────────────────────────────────────
// PipelineCoordinator
// ──────────────────────────────────────────────

pub struct PipelineCoordinator {
    text_extractor: Arc<dyn TextExtractor>,
    keyword_extractor: Arc<dyn KeywordExtractor>,
    aggregator: EvidenceAggregator,
    synthesizer: Synthesizer,
    settings: CoordinatorSettings,
}

impl PipelineCoordinator {
    pub fn new(
        text_extractor: Arc<dyn TextExtractor>,
        keyword_extractor: Arc<dyn KeywordExtractor>,
        aggregator: EvidenceAggregator,
        synthesizer: Synthesizer,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            text_extractor,
            keyword_extractor,
            aggregator,
            synthesizer,
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn source_names(&self) -> Vec<String> {
        self.aggregator.source_names()
    }

    /// Run the whole pipeline for one photo. Never panics on stage errors;
    /// every failure ends up in the report.
    pub async fn run(&self, input: PipelineInput) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "pipeline_run",
            run_id = %run_id,
            image_size = input.image.len(),
        );
        self.run_with_id(run_id, &input).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid, input: &PipelineInput) -> RunReport {
        let tracker = RunTracker::new();
        tracker.enter(RunState::Init);

        let deadline = self.settings.run_deadline;
        let outcome = match tokio::time::timeout(deadline, self.execute(run_id, input, &tracker)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let stage = tracker.current_stage().unwrap_or(Stage::TextExtraction);
                Err(PipelineFailure::new(
                    stage,
                    FailureKind::Timeout,
                    format!("run deadline of {}ms exceeded during {stage}", deadline.as_millis()),
                ))
            }
        };

        match &outcome {
            Ok(recommendation) => {
                tracker.enter(RunState::Done);
                tracing::info!(
                    elapsed_ms = tracker.elapsed_ms(),
                    attributions = recommendation.attributions.len(),
                    warnings = recommendation.warnings.len(),
                    low_confidence = recommendation.is_low_confidence(),
                    "Pipeline run complete"
                );
            }
            Err(failure) => {
                tracker.enter(RunState::Failed(failure.kind));
                tracing::warn!(
                    elapsed_ms = tracker.elapsed_ms(),
                    stage = failure.stage.as_str(),
                    kind = failure.kind.as_str(),
                    error = %failure.message,
                    "Pipeline run failed"
                );
            }
        }

        tracker.finish(run_id, outcome)
    }

    async fn execute(
        &self,
        run_id: Uuid,
        input: &PipelineInput,
        tracker: &RunTracker,
    ) -> Result<Recommendation, PipelineFailure> {
        let s = &self.settings;
        let mut warnings = Vec::new();

        tracker.enter(RunState::ExtractingText);
        let extracted = run_stage(
            Stage::TextExtraction,
            s.text_extraction_timeout,
            self.extract_text(&input.image),
        )
        .await?;
        let low_ocr_confidence = extracted.confidence < s.min_ocr_confidence;
        if low_ocr_confidence {
            warnings.push(LOW_OCR_CONFIDENCE_WARNING.to_string());
        }
        if extracted.content_type == ImageContentType::Other {
            warnings.push(NOT_A_LABEL_WARNING.to_string());
        }

        tracker.enter(RunState::ExtractingKeywords);
        let keywords = run_stage(
            Stage::KeywordExtraction,
            s.keyword_extraction_timeout,
            self.extract_keywords(&extracted.text),
        )
        .await?;

        tracker.enter(RunState::RetrievingEvidence);
        let started = Instant::now();
        let retrieval = self
            .aggregator
            .aggregate_within(&keywords, Some(s.retrieval_timeout), |failure| {
                tracker.record_failure(failure)
            })
            .await
            .map_err(|e| PipelineFailure::new(Stage::Retrieval, FailureKind::AggregationFailed, e.to_string()));
        log_stage(Stage::Retrieval, started, retrieval.is_ok());
        let retrieval = retrieval?;
        if retrieval.all_failed() {
            warnings.push(NO_SOURCES_WARNING.to_string());
        } else if retrieval.is_partial() {
            warnings.push(PARTIAL_SOURCES_WARNING.to_string());
        }

        tracker.enter(RunState::Composing);
        let request = run_stage(Stage::Composing, s.composing_timeout, async {
            compose(
                &extracted.text,
                &retrieval.evidence,
                &input.profile,
                s.constraints,
                s.prompt_budget_chars,
            )
            .map_err(|e| PipelineFailure::new(Stage::Composing, FailureKind::CompositionFailed, e.to_string()))
        })
        .await?;
        tracing::debug!(
            mode = ?request.mode,
            evidence = request.evidence.len(),
            evidence_dropped = request.evidence_dropped,
            text_truncated = request.text_truncated,
            "Prompt composed"
        );

        tracker.enter(RunState::Synthesizing);
        let mut recommendation = run_stage(Stage::Synthesis, s.synthesis_timeout, async {
            self.synthesizer
                .synthesize(&request, run_id)
                .await
                .map_err(synthesis_failure)
        })
        .await?;

        if low_ocr_confidence {
            recommendation.confidence = ConfidenceLevel::Low;
        }
        warnings.append(&mut recommendation.warnings);
        recommendation.warnings = warnings;
        Ok(recommendation)
    }

    async fn extract_text(&self, image: &[u8]) -> Result<ExtractedText, PipelineFailure> {
        let info = validate_image(image, self.settings.max_image_bytes).map_err(extraction_failure)?;
        tracing::debug!(
            format = info.format,
            width = info.width,
            height = info.height,
            "Image accepted"
        );

        let extracted = self.text_extractor.extract(image).await.map_err(extraction_failure)?;
        if extracted.text.trim().is_empty() {
            return Err(extraction_failure(ExtractionError::NoText));
        }
        Ok(extracted)
    }

    async fn extract_keywords(&self, text: &str) -> Result<Vec<Keyword>, PipelineFailure> {
        let raw = self
            .keyword_extractor
            .extract(text, self.settings.max_keywords)
            .await
            .map_err(|e| {
                PipelineFailure::new(Stage::KeywordExtraction, FailureKind::KeywordExtractionFailed, e.to_string())
            })?;

        let keywords = normalize_keywords(&raw);
        if keywords.is_empty() {
            return Err(PipelineFailure::new(
                Stage::KeywordExtraction,
                FailureKind::KeywordExtractionFailed,
                "no usable keywords in the label text",
            ));
        }
        tracing::info!(
            keywords = keywords.len(),
            top = keywords.first().map(|k| k.term()).unwrap_or_default(),
            "Keywords ready"
        );
        Ok(keywords)
    }
}
