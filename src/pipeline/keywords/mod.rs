//! Keyword extraction from label text.

pub mod llm;

pub use llm::LlmKeywordExtractor;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::ScoredTerm;

#[derive(Error, Debug)]
pub enum KeywordError {
    #[error("Keyword model call failed: {0}")]
    Model(String),

    #[error("Keyword response could not be parsed: {0}")]
    Parsing(String),
}

/// Text to ranked terms. Implementations may return raw, unnormalized terms;
/// the coordinator normalizes and ranks them.
#[async_trait]
pub trait KeywordExtractor: Send + Sync {
    async fn extract(&self, text: &str, max_terms: usize) -> Result<Vec<ScoredTerm>, KeywordError>;
}

#[cfg(test)]
pub(crate) struct FixedKeywords(pub Vec<ScoredTerm>);

#[cfg(test)]
#[async_trait]
impl KeywordExtractor for FixedKeywords {
    async fn extract(&self, _text: &str, max_terms: usize) -> Result<Vec<ScoredTerm>, KeywordError> {
        Ok(self.0.iter().take(max_terms).cloned().collect())
    }
}
