//! Prompt composition: label text + evidence + profile into a bounded request.
//!
//! `compose` is pure and deterministic. The rendered prompt never exceeds the
//! budget in characters. Evidence is admitted in evidence-set order, first as
//! a full block, then as a reference-only block (title and url) so the item
//! can still be attributed. Items are never cut in the middle.

pub mod templates;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{EvidenceSet, EvidenceSource, UserProfile};
use crate::pipeline::sanitize::{sanitize_untrusted, truncate_at_word_boundary};

#[derive(Error, Debug, PartialEq)]
pub enum ComposeError {
    #[error("Prompt budget of {budget} chars cannot hold the {required}-char prompt skeleton")]
    BudgetTooSmall { budget: usize, required: usize },

    #[error("No label text to compose a prompt from")]
    EmptyText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Friendly,
    Clinical,
    Concise,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConstraints {
    pub max_output_tokens: u32,
    pub tone: Tone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    /// Evidence is present and must be cited.
    Grounded,
    /// No evidence survived; the model answers from general knowledge.
    GeneralKnowledgeOnly,
}

/// One evidence entry as it appears in the prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptEvidence {
    /// 1-based marker number, `[E<label>]`.
    pub label: usize,
    pub source: EvidenceSource,
    pub title: String,
    pub url: String,
    /// `None` for a reference-only block.
    pub snippet: Option<String>,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisRequest {
    pub extracted_text: String,
    pub evidence: Vec<PromptEvidence>,
    pub constraints: SynthesisConstraints,
    pub profile_block: Option<String>,
    pub mode: SynthesisMode,
    pub text_truncated: bool,
    /// Evidence items that did not fit at all.
    pub evidence_dropped: usize,
}

impl SynthesisRequest {
    pub fn render_prompt(&self) -> String {
        templates::render(self)
    }

    pub fn system_prompt(&self) -> &'static str {
        templates::SYSTEM_PROMPT
    }

    /// Urls of every evidence item in the prompt, in label order.
    pub fn evidence_urls(&self) -> Vec<String> {
        self.evidence.iter().map(|e| e.url.clone()).collect()
    }

    pub fn url_for_label(&self, label: usize) -> Option<&str> {
        self.evidence
            .iter()
            .find(|e| e.label == label)
            .map(|e| e.url.as_str())
    }
}

fn rendered_len(request: &SynthesisRequest) -> usize {
    request.render_prompt().chars().count()
}

/// Build a [`SynthesisRequest`] whose rendered prompt fits `budget_chars`.
pub fn compose(
    extracted_text: &str,
    evidence: &EvidenceSet,
    profile: &UserProfile,
    constraints: SynthesisConstraints,
    budget_chars: usize,
) -> Result<SynthesisRequest, ComposeError> {
    let text = sanitize_untrusted(extracted_text).text;
    if text.is_empty() {
        return Err(ComposeError::EmptyText);
    }

    let mut request = SynthesisRequest {
        extracted_text: String::new(),
        evidence: Vec::new(),
        constraints,
        profile_block: templates::render_profile(profile),
        mode: SynthesisMode::GeneralKnowledgeOnly,
        text_truncated: false,
        evidence_dropped: 0,
    };

    let skeleton = rendered_len(&request);
    if skeleton >= budget_chars {
        return Err(ComposeError::BudgetTooSmall {
            budget: budget_chars,
            required: skeleton + 1,
        });
    }

    let room = budget_chars - skeleton;
    if text.chars().count() > room {
        request.extracted_text = truncate_at_word_boundary(&text, room);
        request.text_truncated = true;
    } else {
        request.extracted_text = text;
    }

    // The text-only prompt fits; every evidence step below re-checks the
    // full render, so the budget holds whatever is admitted.
    let mut admitted = Vec::new();
    let mut dropped = 0usize;
    let items = evidence.items();
    for (index, scored) in items.iter().enumerate() {
        let item = &scored.item;
        let title = sanitize_untrusted(item.display_title()).text;
        let snippet = sanitize_untrusted(item.snippet()).text;
        let full = PromptEvidence {
            label: admitted.len() + 1,
            source: item.source(),
            title,
            url: item.url().to_string(),
            snippet: (!snippet.is_empty()).then_some(snippet),
            score: scored.score,
        };

        if templates::render_evidence_block(&full).chars().count() > budget_chars {
            dropped += 1;
            tracing::debug!(url = item.url(), "Evidence item larger than the whole budget, dropped");
            continue;
        }

        let reference_only = PromptEvidence {
            snippet: None,
            ..full.clone()
        };

        let mut admitted_one = false;
        for candidate in [full, reference_only] {
            let mut trial = request.clone();
            trial.mode = SynthesisMode::Grounded;
            trial.evidence = admitted.clone();
            trial.evidence.push(candidate.clone());
            if rendered_len(&trial) <= budget_chars {
                admitted.push(candidate);
                admitted_one = true;
                break;
            }
        }

        if !admitted_one {
            dropped += items.len() - index;
            break;
        }
    }

    if !admitted.is_empty() {
        request.mode = SynthesisMode::Grounded;
        request.evidence = admitted;
    }
    request.evidence_dropped = dropped;

    tracing::debug!(
        mode = ?request.mode,
        evidence = request.evidence.len(),
        dropped = request.evidence_dropped,
        text_truncated = request.text_truncated,
        budget = budget_chars,
        "Prompt composed"
    );

    Ok(request)
}
