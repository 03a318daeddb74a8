//! Evidence aggregation: fan keywords out to every source, merge the results.
//!
//! Queries for all `(keyword, source)` pairs run concurrently up to
//! `max_concurrency`. A failing query is logged and counted; it never
//! aborts the others. With a time budget, queries still running when it is
//! spent are cancelled and counted as failed. The merged [`EvidenceSet`] is
//! ordered by content, so completion order has no effect on the result.

pub mod merge;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;

use super::sources::retry::search_with_retry;
use super::sources::{RetryPolicy, SourceClient, SourceError};
use crate::config::RetrievalConfig;
use crate::models::{EvidenceItem, EvidenceSet, Keyword};
use merge::{merge, MergeLimits};

#[derive(Error, Debug, PartialEq)]
pub enum AggregationError {
    #[error("No evidence sources configured")]
    NoSources,

    #[error("No keywords to search for")]
    NoKeywords,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSettings {
    pub top_k_keywords: usize,
    pub results_per_source: usize,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub limits: MergeLimits,
}

impl AggregatorSettings {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            top_k_keywords: config.top_k_keywords,
            results_per_source: config.results_per_source,
            max_concurrency: config.max_concurrency,
            retry: RetryPolicy::from_config(config),
            limits: MergeLimits {
                min_relevance: config.min_relevance,
                max_items: config.max_evidence_items,
                max_chars: config.max_evidence_chars,
            },
        }
    }
}

/// One `(keyword, source)` query that ended in an error after retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryFailure {
    pub source: String,
    pub keyword: String,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOutcome {
    pub evidence: EvidenceSet,
    pub queries_attempted: usize,
    pub queries_failed: usize,
    pub failures: Vec<QueryFailure>,
}

impl AggregationOutcome {
    /// Some, but not all, queries failed.
    pub fn is_partial(&self) -> bool {
        self.queries_failed > 0 && self.queries_failed < self.queries_attempted
    }

    pub fn all_failed(&self) -> bool {
        self.queries_attempted > 0 && self.queries_failed == self.queries_attempted
    }
}

pub struct EvidenceAggregator {
    sources: Vec<Arc<dyn SourceClient>>,
    settings: AggregatorSettings,
}

impl EvidenceAggregator {
    pub fn new(sources: Vec<Arc<dyn SourceClient>>, settings: AggregatorSettings) -> Self {
        Self { sources, settings }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Query every source for the top-K keywords and merge the results.
    pub async fn aggregate(&self, keywords: &[Keyword]) -> Result<AggregationOutcome, AggregationError> {
        self.aggregate_within(keywords, None, |_| {}).await
    }

    /// [`aggregate`](Self::aggregate) with an optional time budget.
    ///
    /// Once the budget is spent no further queries are awaited; the ones
    /// still outstanding are cancelled and counted as failures, and whatever
    /// evidence already arrived is merged. `on_failure` sees each failed
    /// query as soon as it is known.
    pub async fn aggregate_within<F>(
        &self,
        keywords: &[Keyword],
        budget: Option<Duration>,
        on_failure: F,
    ) -> Result<AggregationOutcome, AggregationError>
    where
        F: Fn(&QueryFailure) + Send + Sync,
    {
        if self.sources.is_empty() {
            return Err(AggregationError::NoSources);
        }
        if keywords.is_empty() {
            return Err(AggregationError::NoKeywords);
        }

        let mut selected: Vec<&Keyword> = keywords.iter().collect();
        selected.sort_by_key(|k| k.rank());
        selected.truncate(self.settings.top_k_keywords.max(1));

        let queries: Vec<(&Arc<dyn SourceClient>, &Keyword)> = selected
            .iter()
            .flat_map(|kw| self.sources.iter().map(move |src| (src, *kw)))
            .collect();
        let queries_attempted = queries.len();
        let mut outstanding: HashSet<(String, String)> = queries
            .iter()
            .map(|(src, kw)| (src.name().to_string(), kw.term().to_string()))
            .collect();
        let limit = self.settings.results_per_source.max(1);
        let policy = &self.settings.retry;
        let deadline = budget.map(|b| tokio::time::Instant::now() + b);

        tracing::info!(
            keywords = selected.len(),
            sources = self.sources.len(),
            queries = queries_attempted,
            budget_ms = budget.map(|b| b.as_millis() as u64),
            "Starting evidence retrieval"
        );

        let mut pending = Box::pin(
            stream::iter(queries)
                .map(|(source, keyword)| async move {
                    let started = std::time::Instant::now();
                    let (result, attempts) = search_with_retry(source.as_ref(), keyword, limit, policy).await;
                    tracing::debug!(
                        source = source.name(),
                        keyword = keyword.term(),
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        ok = result.is_ok(),
                        "Source query finished"
                    );
                    (source.name().to_string(), keyword.term().to_string(), result)
                })
                .buffer_unordered(self.settings.max_concurrency.max(1)),
        );

        let mut items = Vec::new();
        let mut failures = Vec::new();
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => pending.next().await,
            };
            let Some((source, keyword, result)) = next else {
                break;
            };
            outstanding.remove(&(source.clone(), keyword.clone()));
            match result {
                Ok(found) => items.extend(found),
                Err(error) => {
                    let failure = query_failure(source, keyword, &error);
                    on_failure(&failure);
                    failures.push(failure);
                }
            }
        }
        drop(pending);

        if !outstanding.is_empty() {
            let budget_ms = budget.map(|b| b.as_millis()).unwrap_or_default();
            tracing::warn!(
                unfinished = outstanding.len(),
                budget_ms = budget_ms as u64,
                "Retrieval budget spent, cancelling remaining queries"
            );
            let error = SourceError::Unavailable(format!("retrieval budget of {budget_ms}ms spent"));
            for (source, keyword) in outstanding {
                let failure = query_failure(source, keyword, &error);
                on_failure(&failure);
                failures.push(failure);
            }
        }
        failures.sort_by(|a, b| (&a.source, &a.keyword).cmp(&(&b.source, &b.keyword)));

        let retrieved = items.len();
        let evidence = merge(items, &self.settings.limits);
        tracing::info!(
            retrieved,
            kept = evidence.len(),
            failed = failures.len(),
            snippet_chars = evidence.total_snippet_chars(),
            "Evidence retrieval complete"
        );

        Ok(AggregationOutcome {
            evidence,
            queries_attempted,
            queries_failed: failures.len(),
            failures,
        })
    }
}

fn query_failure(source: String, keyword: String, error: &SourceError) -> QueryFailure {
    tracing::warn!(
        source = %source,
        keyword = %keyword,
        kind = error.kind(),
        error = %error,
        "Source query failed"
    );
    QueryFailure {
        source,
        keyword,
        kind: error.kind(),
        message: error.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::EvidenceSource;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted source: per-term results, optional failure and delay.
    pub(crate) struct FakeSource {
        pub name: &'static str,
        pub source: EvidenceSource,
        pub results: HashMap<String, Vec<(String, f32)>>,
        pub fail_with: Option<SourceError>,
        pub delay: Duration,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl FakeSource {
        pub(crate) fn new(name: &'static str, source: EvidenceSource) -> Self {
            Self {
                name,
                source,
                results: HashMap::new(),
                fail_with: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_result(mut self, term: &str, url: &str, relevance: f32) -> Self {
            self.results
                .entry(term.to_string())
                .or_default()
                .push((url.to_string(), relevance));
            self
        }

        pub(crate) fn failing(mut self, error: SourceError) -> Self {
            self.fail_with = Some(error);
            self
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceClient for FakeSource {
        fn source(&self) -> EvidenceSource {
            self.source
        }

        fn name(&self) -> &str {
            self.name
        }

        async fn search(&self, keyword: &Keyword, limit: usize) -> Result<Vec<EvidenceItem>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(error) = &self.fail_with {
                return Err(error.clone());
            }
            Ok(self
                .results
                .get(keyword.term())
                .map(|found| {
                    found
                        .iter()
                        .take(limit)
                        .filter_map(|(url, relevance)| {
                            EvidenceItem::new(
                                self.source,
                                format!("{} on {}", self.name, keyword.term()),
                                format!("About {}", keyword.term()),
                                url.clone(),
                                keyword.clone(),
                                *relevance,
                            )
                        })
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    pub(crate) fn test_settings() -> AggregatorSettings {
        AggregatorSettings {
            top_k_keywords: 8,
            results_per_source: 3,
            max_concurrency: 4,
            retry: RetryPolicy {
                max_retries: 0,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                attempt_timeout: Duration::from_secs(2),
            },
            limits: MergeLimits {
                min_relevance: 0.0,
                max_items: 12,
                max_chars: 6000,
            },
        }
    }

    fn sugar_fiber() -> Vec<Keyword> {
        vec![
            Keyword::new("sugar", 0.9, 0).unwrap(),
            Keyword::new("fiber", 0.7, 1).unwrap(),
        ]
    }

    #[tokio::test]
    async fn sugar_and_fiber_scenario() {
        let wiki = Arc::new(FakeSource::new("wikipedia", EvidenceSource::Encyclopedia).with_result(
            "sugar",
            "https://w/Sugar",
            0.6,
        ));
        let pmc = Arc::new(FakeSource::new("europe_pmc", EvidenceSource::ArticleIndex).with_result(
            "sugar",
            "https://pmc/1",
            0.6,
        ));
        let aggregator = EvidenceAggregator::new(vec![wiki.clone(), pmc.clone()], test_settings());

        let outcome = aggregator.aggregate(&sugar_fiber()).await.unwrap();
        assert_eq!(outcome.evidence.len(), 2);
        assert_eq!(outcome.queries_attempted, 4);
        assert_eq!(outcome.queries_failed, 0);

        // A fiber item at equal relevance would score 0.6 / 2.
        let hypothetical_fiber = 0.6 / 2.0;
        assert!(outcome.evidence.items().iter().all(|e| e.score > hypothetical_fiber));
        assert!(outcome
            .evidence
            .items()
            .iter()
            .all(|e| e.item.retrieved_for().term() == "sugar"));
        assert_eq!(wiki.calls(), 2);
        assert_eq!(pmc.calls(), 2);
    }

    #[tokio::test]
    async fn all_sources_failing_is_empty_not_error() {
        let down = Arc::new(
            FakeSource::new("wikipedia", EvidenceSource::Encyclopedia)
                .failing(SourceError::Unavailable("503".into())),
        );
        let limited = Arc::new(
            FakeSource::new("europe_pmc", EvidenceSource::ArticleIndex)
                .failing(SourceError::RateLimited { retry_after: None }),
        );
        let aggregator = EvidenceAggregator::new(vec![down, limited], test_settings());

        let outcome = aggregator.aggregate(&sugar_fiber()).await.unwrap();
        assert!(outcome.evidence.is_empty());
        assert!(outcome.all_failed());
        assert_eq!(outcome.failures.len(), 4);
        assert_eq!(outcome.failures[0].source, "europe_pmc");
        assert_eq!(outcome.failures[0].kind, "rate_limited");
    }

    #[tokio::test]
    async fn one_failing_source_does_not_abort_others() {
        let down = Arc::new(
            FakeSource::new("europe_pmc", EvidenceSource::ArticleIndex)
                .failing(SourceError::Rejected { status: 400 }),
        );
        let wiki = Arc::new(FakeSource::new("wikipedia", EvidenceSource::Encyclopedia).with_result(
            "fiber",
            "https://w/Fiber",
            0.5,
        ));
        let aggregator = EvidenceAggregator::new(vec![down, wiki], test_settings());
        let outcome = aggregator.aggregate(&sugar_fiber()).await.unwrap();
        assert_eq!(outcome.evidence.urls(), vec!["https://w/Fiber"]);
        assert!(outcome.is_partial());
    }

    #[tokio::test]
    async fn cached_results_are_scored_with_current_rank() {
        let wiki = Arc::new(FakeSource::new("wikipedia", EvidenceSource::Encyclopedia).with_result(
            "sugar",
            "https://w/Sugar",
            0.6,
        ));
        let cached: Arc<dyn SourceClient> = Arc::new(super::super::sources::CachedSource::new(
            wiki.clone(),
            Duration::from_secs(60),
            10,
        ));
        let aggregator = EvidenceAggregator::new(vec![cached], test_settings());

        let minor = aggregator
            .aggregate(&[Keyword::new("sugar", 0.2, 3).unwrap()])
            .await
            .unwrap();
        assert!((minor.evidence.items()[0].score - 0.15).abs() < 1e-6);

        let major = aggregator
            .aggregate(&[Keyword::new("sugar", 0.9, 0).unwrap()])
            .await
            .unwrap();
        assert_eq!(wiki.calls(), 1);
        assert_eq!(major.evidence.items()[0].item.retrieved_for().rank(), 0);
        assert!((major.evidence.items()[0].score - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn configuration_errors() {
        let aggregator = EvidenceAggregator::new(vec![], test_settings());
        assert_eq!(aggregator.aggregate(&sugar_fiber()).await, Err(AggregationError::NoSources));

        let wiki = Arc::new(FakeSource::new("wikipedia", EvidenceSource::Encyclopedia));
        let aggregator = EvidenceAggregator::new(vec![wiki], test_settings());
        assert_eq!(aggregator.aggregate(&[]).await, Err(AggregationError::NoKeywords));
    }

    #[tokio::test]
    async fn only_top_k_keywords_are_queried() {
        let wiki = Arc::new(FakeSource::new("wikipedia", EvidenceSource::Encyclopedia));
        let mut settings = test_settings();
        settings.top_k_keywords = 2;
        let aggregator = EvidenceAggregator::new(vec![wiki.clone()], settings);
        let keywords: Vec<Keyword> = ["salt", "sugar", "fat", "fiber"]
            .iter()
            .enumerate()
            .map(|(rank, t)| Keyword::new(t, 0.5, rank).unwrap())
            .collect();
        let outcome = aggregator.aggregate(&keywords).await.unwrap();
        assert_eq!(outcome.queries_attempted, 2);
        assert_eq!(wiki.calls(), 2);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let slow = Arc::new(
            FakeSource::new("wikipedia", EvidenceSource::Encyclopedia).with_delay(Duration::from_millis(20)),
        );
        let mut settings = test_settings();
        settings.max_concurrency = 2;
        let aggregator = EvidenceAggregator::new(vec![slow.clone()], settings);
        let keywords: Vec<Keyword> = ["a1", "b1", "c1", "d1", "e1", "f1"]
            .iter()
            .enumerate()
            .map(|(rank, t)| Keyword::new(t, 0.5, rank).unwrap())
            .collect();
        aggregator.aggregate(&keywords).await.unwrap();
        assert_eq!(slow.calls(), 6);
        assert!(slow.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn slow_source_times_out_without_blocking_fast_one() {
        let slow = Arc::new(
            FakeSource::new("europe_pmc", EvidenceSource::ArticleIndex)
                .with_result("sugar", "https://pmc/1", 0.9)
                .with_delay(Duration::from_secs(10)),
        );
        let fast = Arc::new(FakeSource::new("wikipedia", EvidenceSource::Encyclopedia).with_result(
            "sugar",
            "https://w/Sugar",
            0.6,
        ));
        let mut settings = test_settings();
        settings.retry.attempt_timeout = Duration::from_millis(50);
        let aggregator = EvidenceAggregator::new(vec![slow, fast], settings);

        let started = std::time::Instant::now();
        let outcome = aggregator.aggregate(&sugar_fiber()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.evidence.urls(), vec!["https://w/Sugar"]);
        assert_eq!(outcome.queries_failed, 2);
    }

    #[tokio::test]
    async fn spent_budget_keeps_evidence_that_arrived() {
        let hanging = Arc::new(
            FakeSource::new("europe_pmc", EvidenceSource::ArticleIndex)
                .with_result("sugar", "https://pmc/1", 0.9)
                .with_delay(Duration::from_secs(10)),
        );
        let fast = Arc::new(FakeSource::new("wikipedia", EvidenceSource::Encyclopedia).with_result(
            "sugar",
            "https://w/Sugar",
            0.6,
        ));
        let mut settings = test_settings();
        settings.retry.attempt_timeout = Duration::from_secs(30);
        let aggregator = EvidenceAggregator::new(vec![hanging, fast], settings);

        let seen = std::sync::Mutex::new(Vec::new());
        let started = std::time::Instant::now();
        let outcome = aggregator
            .aggregate_within(&sugar_fiber(), Some(Duration::from_millis(100)), |failure| {
                seen.lock().unwrap().push(failure.source.clone())
            })
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.evidence.urls(), vec!["https://w/Sugar"]);
        assert_eq!(outcome.queries_attempted, 4);
        assert_eq!(outcome.queries_failed, 2);
        assert!(outcome.is_partial());
        assert!(outcome
            .failures
            .iter()
            .all(|f| f.source == "europe_pmc" && f.kind == "unavailable"));
        assert_eq!(*seen.lock().unwrap(), vec!["europe_pmc", "europe_pmc"]);
    }
}
