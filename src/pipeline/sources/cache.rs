//! In-memory TTL cache in front of a [`SourceClient`].
//!
//! Identical `(keyword, limit)` queries within the TTL are answered without a
//! network call and without touching the rate limiter. Only successful
//! responses are stored. Hits are re-attributed to the caller's keyword, so
//! the rank of the run that filled the cache never leaks into a later run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{SourceClient, SourceError};
use crate::models::{EvidenceItem, EvidenceSource, Keyword};

struct CacheEntry {
    items: Vec<EvidenceItem>,
    stored_at: Instant,
    seq: u64,
}

pub struct CachedSource {
    inner: Arc<dyn SourceClient>,
    entries: Mutex<HashMap<(String, usize), CacheEntry>>,
    next_seq: AtomicU64,
    ttl: Duration,
    capacity: usize,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn SourceClient>, ttl: Duration, capacity: usize) -> Self {
        Self {
            inner,
            entries: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, usize), CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, key: &(String, usize)) -> Option<Vec<EvidenceItem>> {
        let entries = self.lock();
        entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.items.clone())
    }

    fn store(&self, key: (String, usize), items: Vec<EvidenceItem>) {
        let mut entries = self.lock();
        let ttl = self.ttl;
        entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.seq)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                items,
                stored_at: Instant::now(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
    }
}

#[async_trait]
impl SourceClient for CachedSource {
    fn source(&self) -> EvidenceSource {
        self.inner.source()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn search(&self, keyword: &Keyword, limit: usize) -> Result<Vec<EvidenceItem>, SourceError> {
        let key = (keyword.term().to_string(), limit);
        if let Some(items) = self.lookup(&key) {
            tracing::debug!(source = self.name(), keyword = keyword.term(), "Source cache hit");
            return Ok(items.iter().map(|item| item.for_keyword(keyword)).collect());
        }
        let items = self.inner.search(keyword, limit).await?;
        self.store(key, items.clone());
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingSource {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl SourceClient for CountingSource {
        fn source(&self) -> EvidenceSource {
            EvidenceSource::Encyclopedia
        }

        fn name(&self) -> &str {
            "counting"
        }

        async fn search(&self, keyword: &Keyword, _limit: usize) -> Result<Vec<EvidenceItem>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SourceError::Unavailable("down".into()));
            }
            Ok(EvidenceItem::new(
                EvidenceSource::Encyclopedia,
                keyword.term(),
                "snippet",
                format!("https://w/{}", keyword.term()),
                keyword.clone(),
                0.5,
            )
            .into_iter()
            .collect())
        }
    }

    fn counting(fail: bool) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            fail,
        })
    }

    fn kw(term: &str) -> Keyword {
        Keyword::new(term, 0.5, 0).unwrap()
    }

    #[tokio::test]
    async fn second_identical_query_is_served_from_cache() {
        let inner = counting(false);
        let cached = CachedSource::new(inner.clone(), Duration::from_secs(60), 10);
        let first = cached.search(&kw("sugar"), 3).await.unwrap();
        let second = cached.search(&kw("sugar"), 3).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hit_carries_the_callers_keyword_rank() {
        let inner = counting(false);
        let cached = CachedSource::new(inner.clone(), Duration::from_secs(60), 10);

        let earlier = cached.search(&Keyword::new("sugar", 0.2, 3).unwrap(), 3).await.unwrap();
        assert_eq!(earlier[0].retrieved_for().rank(), 3);

        let later = cached.search(&Keyword::new("sugar", 0.9, 0).unwrap(), 3).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(later[0].retrieved_for().rank(), 0);
        assert_eq!(later[0].retrieved_for().score(), 0.9);
        assert_eq!(later[0].url(), earlier[0].url());
        assert_eq!(later[0].relevance(), earlier[0].relevance());
    }

    #[tokio::test]
    async fn different_limit_is_a_different_entry() {
        let inner = counting(false);
        let cached = CachedSource::new(inner.clone(), Duration::from_secs(60), 10);
        cached.search(&kw("sugar"), 3).await.unwrap();
        cached.search(&kw("sugar"), 5).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let inner = counting(true);
        let cached = CachedSource::new(inner.clone(), Duration::from_secs(60), 10);
        assert!(cached.search(&kw("salt"), 3).await.is_err());
        assert!(cached.search(&kw("salt"), 3).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert!(cached.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let inner = counting(false);
        let cached = CachedSource::new(inner.clone(), Duration::from_millis(10), 10);
        cached.search(&kw("fiber"), 3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cached.search(&kw("fiber"), 3).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let inner = counting(false);
        let cached = CachedSource::new(inner.clone(), Duration::from_secs(60), 2);
        cached.search(&kw("a1"), 1).await.unwrap();
        cached.search(&kw("b1"), 1).await.unwrap();
        cached.search(&kw("c1"), 1).await.unwrap();
        assert_eq!(cached.len(), 2);
        cached.search(&kw("a1"), 1).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }
}
