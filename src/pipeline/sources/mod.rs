//! Source clients: thin adapters to external knowledge sources.
//!
//! Every client exposes the same `search(keyword, limit)` capability and maps
//! the remote response shape into [`EvidenceItem`]s at this boundary.
//! Nothing source-specific leaves this module.

pub mod cache;
pub mod europe_pmc;
pub mod fooddata;
pub mod http;
pub mod rate_limit;
pub mod relevance;
pub mod retry;
pub mod wikipedia;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{EvidenceItem, EvidenceSource, Keyword};

pub use cache::CachedSource;
pub use europe_pmc::EuropePmcClient;
pub use fooddata::FoodDataClient;
pub use rate_limit::{RateLimiter, SlidingWindowLimiter};
pub use retry::RetryPolicy;
pub use wikipedia::WikipediaClient;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("Rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected with status {status}")]
    Rejected { status: u16 },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

impl SourceError {
    /// Short machine-readable kind, used in logs and run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Rejected { .. } => "rejected",
            Self::InvalidQuery(_) => "invalid_query",
        }
    }
}

/// A knowledge source searchable by keyword.
///
/// Implementations count each outbound request against their rate limiter
/// before issuing it. An empty result list is a normal outcome.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Kind of evidence this client produces.
    fn source(&self) -> EvidenceSource;

    /// Stable name, also the rate-limit key.
    fn name(&self) -> &str;

    async fn search(&self, keyword: &Keyword, limit: usize) -> Result<Vec<EvidenceItem>, SourceError>;
}

/// Input constraints shared by every client.
pub fn validate_query(keyword: &Keyword, limit: usize) -> Result<(), SourceError> {
    if keyword.term().trim().is_empty() {
        return Err(SourceError::InvalidQuery("keyword is empty".into()));
    }
    if limit == 0 {
        return Err(SourceError::InvalidQuery("limit must be at least 1".into()));
    }
    Ok(())
}

/// Flatten remote HTML and clip to `max_chars` at a word boundary.
pub fn clean_snippet(raw: &str, max_chars: usize) -> String {
    let text = super::sanitize::strip_html(raw);
    super::sanitize::truncate_at_word_boundary(&text, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_snippet_strips_and_clips() {
        let snippet = clean_snippet("<p>Dietary <em>fiber</em> improves satiety</p>", 20);
        assert_eq!(snippet, "Dietary fiber");
    }

    #[test]
    fn zero_limit_is_invalid() {
        let kw = Keyword::new("sugar", 0.9, 0).unwrap();
        assert!(matches!(validate_query(&kw, 0), Err(SourceError::InvalidQuery(_))));
        assert!(validate_query(&kw, 1).is_ok());
    }

    #[test]
    fn rate_limited_message_includes_hint() {
        let err = SourceError::RateLimited {
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert_eq!(err.to_string(), "Rate limited (retry after 1500ms)");
        assert_eq!(SourceError::RateLimited { retry_after: None }.to_string(), "Rate limited");
        assert_eq!(err.kind(), "rate_limited");
    }
}
