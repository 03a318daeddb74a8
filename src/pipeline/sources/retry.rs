use std::time::Duration;

use super::{SourceClient, SourceError};
use crate::models::{EvidenceItem, Keyword};

/// Backoff policy for one source query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Timeout applied to every attempt.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::RetrievalConfig) -> Self {
        Self {
            max_retries: config.source_retries,
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_retry_backoff_ms),
            attempt_timeout: config.source_timeout(),
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` to give up.
    pub fn delay_for(&self, attempt: u32, error: &SourceError) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let exponential = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        match error {
            SourceError::Unavailable(_) => Some(exponential),
            // Honor the server's hint only when it fits our budget.
            SourceError::RateLimited { retry_after: Some(hint) } => {
                (*hint <= self.max_backoff).then_some((*hint).max(exponential).min(self.max_backoff))
            }
            SourceError::RateLimited { retry_after: None } => Some(exponential),
            SourceError::Rejected { .. } | SourceError::InvalidQuery(_) => None,
        }
    }
}

/// Run one `(client, keyword)` query under the retry policy.
///
/// Returns the items together with the number of attempts made.
pub async fn search_with_retry(
    client: &dyn SourceClient,
    keyword: &Keyword,
    limit: usize,
    policy: &RetryPolicy,
) -> (Result<Vec<EvidenceItem>, SourceError>, u32) {
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(policy.attempt_timeout, client.search(keyword, limit)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Unavailable(format!(
                "request timed out after {}ms",
                policy.attempt_timeout.as_millis()
            ))),
        };

        let error = match result {
            Ok(items) => return (Ok(items), attempt + 1),
            Err(e) => e,
        };

        match policy.delay_for(attempt, &error) {
            Some(delay) => {
                tracing::debug!(
                    source = client.name(),
                    keyword = keyword.term(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying source query"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => return (Err(error), attempt + 1),
        }
    }
}
