//! Keyword selection delegated to the text model.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{KeywordError, KeywordExtractor};
use crate::models::ScoredTerm;
use crate::pipeline::sanitize::sanitize_untrusted;
use crate::pipeline::synthesis::llm::LlmGenerate;

const SYSTEM_PROMPT: &str = "\
You select search keywords from food label text. Pick ingredients, additives, \
nutrients and health-relevant claims that are worth looking up in nutrition \
and medical literature. Ignore brand names, addresses and marketing slogans.";

const MAX_TOKENS: u32 = 400;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTerm {
    Scored { term: String, score: f32 },
    Plain(String),
}

pub struct LlmKeywordExtractor {
    llm: Arc<dyn LlmGenerate>,
}

impl LlmKeywordExtractor {
    pub fn new(llm: Arc<dyn LlmGenerate>) -> Self {
        Self { llm }
    }
}

fn build_prompt(text: &str, max_terms: usize) -> String {
    format!(
        "Label text:\n<<<\n{text}\n>>>\n\n\
         Return at most {max_terms} keywords as a JSON array of objects \
         {{\"term\": string, \"score\": number between 0 and 1}}, most important first. \
         Output only the JSON array."
    )
}

/// Locate the JSON array in a model answer that may carry prose or code fences.
fn extract_json_array(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after_fence = &trimmed[start + fence.len()..];
            if let Some(end) = after_fence.find("```") {
                let block = after_fence[..end].trim();
                if block.starts_with('[') {
                    return Some(block);
                }
            }
        }
    }

    match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => Some(&trimmed[start..=end]),
        _ => None,
    }
}

pub(crate) fn parse_terms(response: &str, max_terms: usize) -> Result<Vec<ScoredTerm>, KeywordError> {
    let block = extract_json_array(response)
        .ok_or_else(|| KeywordError::Parsing("no JSON array in response".into()))?;
    let raw: Vec<RawTerm> =
        serde_json::from_str(block).map_err(|e| KeywordError::Parsing(e.to_string()))?;

    let count = raw.len().max(1) as f32;
    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(i, term)| match term {
            RawTerm::Scored { term, score } => ScoredTerm::new(term, score),
            // Unscored lists are ordered by importance.
            RawTerm::Plain(term) => ScoredTerm::new(term, 1.0 - i as f32 / count),
        })
        .filter(|t| !t.term.trim().is_empty())
        .take(max_terms)
        .collect())
}

#[async_trait]
impl KeywordExtractor for LlmKeywordExtractor {
    async fn extract(&self, text: &str, max_terms: usize) -> Result<Vec<ScoredTerm>, KeywordError> {
        let prompt = build_prompt(&sanitize_untrusted(text).text, max_terms);
        let response = self
            .llm
            .generate(SYSTEM_PROMPT, &prompt, MAX_TOKENS)
            .await
            .map_err(|e| KeywordError::Model(e.to_string()))?;

        let terms = parse_terms(&response, max_terms)?;
        tracing::debug!(
            model = self.llm.model_name(),
            terms = terms.len(),
            "Keywords extracted"
        );
        Ok(terms)
    }
}
