//! Europe PMC REST search: scientific abstracts.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::http::{acquire, get_json};
use super::relevance::relevance;
use super::{clean_snippet, validate_query, RateLimiter, SourceClient, SourceError};
use crate::models::{EvidenceItem, EvidenceSource, Keyword};

const NAME: &str = "europe_pmc";

pub struct EuropePmcClient {
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<dyn RateLimiter>,
    max_snippet_chars: usize,
}

impl EuropePmcClient {
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
    #[serde(rename = "resultList", default)]
    result_list: ResultList,
}

#[derive(Deserialize, Default)]
struct ResultList {
    #[serde(default)]
    result: Vec<Article>,
}

#[derive(Deserialize)]
struct Article {
    id: Option<String>,
    source: Option<String>,
    title: Option<String>,
    #[serde(rename = "abstractText")]
    abstract_text: Option<String>,
}

fn article_url(article: &Article) -> Option<String> {
    let id = article.id.as_deref()?.trim();
    let source = article.source.as_deref().unwrap_or("MED").trim();
    if id.is_empty() {
        return None;
    }
    Some(format!("https://europepmc.org/article/{source}/{id}"))
}

/// Map a decoded search response to evidence items.
fn to_evidence(
    response: SearchResponse,
    keyword: &Keyword,
    limit: usize,
    max_snippet_chars: usize,
) -> Vec<EvidenceItem> {
    response
        .result_list
        .result
        .into_iter()
        .take(limit)
        .enumerate()
        .filter_map(|(position, article)| {
            let url = article_url(&article)?;
            let title = clean_snippet(article.title.as_deref().unwrap_or_default(), max_snippet_chars);
            let snippet = clean_snippet(
                article.abstract_text.as_deref().unwrap_or_default(),
                max_snippet_chars,
            );
            let score = relevance(keyword.term(), &title, &snippet, position);
            EvidenceItem::new(EvidenceSource::ArticleIndex, title, snippet, url, keyword.clone(), score)
        })
        .collect()
}

#[async_trait]
impl SourceClient for EuropePmcClient {
    fn source(&self) -> EvidenceSource {
        EvidenceSource::ArticleIndex
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn search(&self, keyword: &Keyword, limit: usize) -> Result<Vec<EvidenceItem>, SourceError> {
        validate_query(keyword, limit)?;
        acquire(self.limiter.as_ref(), NAME)?;

        let page_size = limit.to_string();
        let request = self.client.get(format!("{}/search", self.base_url)).query(&[
            ("query", keyword.term()),
            ("format", "json"),
            ("resultType", "core"),
            ("pageSize", page_size.as_str()),
        ]);
        let response: SearchResponse = get_json(request).await?;
        let items = to_evidence(response, keyword, limit, self.max_snippet_chars);
        tracing::debug!(source = NAME, keyword = keyword.term(), count = items.len(), "Europe PMC search complete");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sources::http::{build_client, serve};
    use crate::pipeline::sources::SlidingWindowLimiter;
    use axum::extract::Query;
    use axum::routing::get;
    use std::collections::HashMap;
    use std::time::Duration;

    const SAMPLE: &str = r#"{
        "hitCount": 2,
        "resultList": {"result": [
            {"id": "123", "source": "MED", "title": "Added sugar and cardiometabolic risk",
             "abstractText": "<h4>Background</h4>High added <i>sugar</i> intake is associated with risk."},
            {"id": "", "source": "MED", "title": "No id"},
            {"id": "PMC9", "source": "PMC", "title": "Sugar substitutes", "abstractText": null}
        ]}
    }"#;

    fn kw() -> Keyword {
        Keyword::new("sugar", 0.9, 0).unwrap()
    }

    #[test]
    fn parses_articles_and_skips_unaddressable_ones() {
        let response: SearchResponse = serde_json::from_str(SAMPLE).unwrap();
        let items = to_evidence(response, &kw(), 5, 600);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url(), "https://europepmc.org/article/MED/123");
        assert_eq!(items[0].snippet(), "Background High added sugar intake is associated with risk.");
        assert_eq!(items[1].url(), "https://europepmc.org/article/PMC/PMC9");
        assert_eq!(items[1].snippet(), "");
        assert!(items[0].relevance() > 0.0);
    }

    #[test]
    fn missing_result_list_is_empty() {
        let response: SearchResponse = serde_json::from_str(r#"{"hitCount": 0}"#).unwrap();
        assert!(to_evidence(response, &kw(), 3, 600).is_empty());
    }

    #[tokio::test]
    async fn sends_expected_query_parameters() {
        let router = axum::Router::new().route(
            "/search",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("query").map(String::as_str), Some("sugar"));
                assert_eq!(params.get("format").map(String::as_str), Some("json"));
                assert_eq!(params.get("resultType").map(String::as_str), Some("core"));
                assert_eq!(params.get("pageSize").map(String::as_str), Some("2"));
                SAMPLE
            }),
        );
        let base = serve(router).await;
        let limiter = Arc::new(SlidingWindowLimiter::per_minute(10));
        let client = EuropePmcClient::new(&base, build_client(Duration::from_secs(5)).unwrap(), limiter.clone(), 600);
        let items = client.search(&kw(), 2).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(limiter.admitted(NAME), 1);
    }
}
