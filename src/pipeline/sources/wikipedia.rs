//! Wikipedia REST page search: encyclopedic background.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::http::{acquire, get_json};
use super::relevance::relevance;
use super::{clean_snippet, validate_query, RateLimiter, SourceClient, SourceError};
use crate::models::{EvidenceItem, EvidenceSource, Keyword};

const NAME: &str = "wikipedia";

pub struct WikipediaClient {
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<dyn RateLimiter>,
    max_snippet_chars: usize,
}

impl WikipediaClient {
    pub fn new(
        base_url: &str,
        client: reqwest::Client,
        limiter: Arc<dyn RateLimiter>,
        max_snippet_chars: usize,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            limiter,
            max_snippet_chars,
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Deserialize)]
struct Page {
    key: String,
    title: Option<String>,
    excerpt: Option<String>,
    description: Option<String>,
}

fn to_evidence(
    base_url: &str,
    response: SearchResponse,
    keyword: &Keyword,
    limit: usize,
    max_snippet_chars: usize,
) -> Vec<EvidenceItem> {
    response
        .pages
        .into_iter()
        .take(limit)
        .enumerate()
        .filter_map(|(position, page)| {
            let key = page.key.trim();
            if key.is_empty() {
                return None;
            }
            let url = format!("{base_url}/wiki/{key}");
            let title = page.title.unwrap_or_default();
            let excerpt = page.excerpt.unwrap_or_default();
            let combined = match page.description.as_deref().map(str::trim) {
                Some(desc) if !desc.is_empty() => format!("{desc}. {excerpt}"),
                _ => excerpt,
            };
            let snippet = clean_snippet(&combined, max_snippet_chars);
            let score = relevance(keyword.term(), &title, &snippet, position);
            EvidenceItem::new(EvidenceSource::Encyclopedia, title, snippet, url, keyword.clone(), score)
        })
        .collect()
}

#[async_trait]
impl SourceClient for WikipediaClient {
    fn source(&self) -> EvidenceSource {
        EvidenceSource::Encyclopedia
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn search(&self, keyword: &Keyword, limit: usize) -> Result<Vec<EvidenceItem>, SourceError> {
        validate_query(keyword, limit)?;
        acquire(self.limiter.as_ref(), NAME)?;

        let limit_param = limit.to_string();
        let request = self
            .client
            .get(format!("{}/w/rest.php/v1/search/page", self.base_url))
            .query(&[("q", keyword.term()), ("limit", limit_param.as_str())]);
        let response: SearchResponse = get_json(request).await?;
        let items = to_evidence(&self.base_url, response, keyword, limit, self.max_snippet_chars);
        tracing::debug!(source = NAME, keyword = keyword.term(), count = items.len(), "Wikipedia search complete");
        Ok(items)
    }
}
