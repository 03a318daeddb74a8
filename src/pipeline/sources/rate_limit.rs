//! Local per-source rate limiting.
//!
//! Counters are shared process-wide through `Arc<dyn RateLimiter>` so that
//! concurrent runs draw from the same budget. Check-and-record happens in one
//! critical section, so two callers can never both take the last slot.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Admission control for outbound source requests.
pub trait RateLimiter: Send + Sync {
    /// Record one request for `key`, or return how long to wait if the
    /// budget is exhausted. A refused request is not recorded.
    fn try_acquire(&self, key: &str) -> Result<(), Duration>;

    /// Total requests admitted for `key` since creation.
    fn admitted(&self, key: &str) -> u64;
}

struct Window {
    recent: VecDeque<Instant>,
    admitted: u64,
}

/// Sliding-window limiter: at most `max_requests` per `window` for each key.
pub struct SlidingWindowLimiter {
    windows: Mutex<HashMap<String, Window>>,
    max_requests: u32,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests: max_requests.max(1),
            window,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = windows.entry(key.to_string()).or_insert_with(|| Window {
            recent: VecDeque::new(),
            admitted: 0,
        });

        while let Some(oldest) = entry.recent.front() {
            if now.duration_since(*oldest) >= self.window {
                entry.recent.pop_front();
            } else {
                break;
            }
        }

        if entry.recent.len() as u32 >= self.max_requests {
            let oldest = entry.recent.front().copied().unwrap_or(now);
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            return Err(wait);
        }

        entry.recent.push_back(now);
        entry.admitted += 1;
        Ok(())
    }

    fn admitted(&self, key: &str) -> u64 {
        let windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        windows.get(key).map(|w| w.admitted).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allows_under_limit() {
        let limiter = SlidingWindowLimiter::per_minute(3);
        for _ in 0..3 {
            assert!(limiter.try_acquire("wikipedia").is_ok());
        }
        assert_eq!(limiter.admitted("wikipedia"), 3);
    }

    #[test]
    fn rejects_over_limit_with_wait_hint() {
        let limiter = SlidingWindowLimiter::per_minute(2);
        limiter.try_acquire("europe_pmc").unwrap();
        limiter.try_acquire("europe_pmc").unwrap();
        let wait = limiter.try_acquire("europe_pmc").unwrap_err();
        assert!(wait <= Duration::from_secs(60));
        assert!(wait > Duration::from_secs(50));
        assert_eq!(limiter.admitted("europe_pmc"), 2);
    }

    #[test]
    fn isolates_keys() {
        let limiter = SlidingWindowLimiter::per_minute(1);
        limiter.try_acquire("a").unwrap();
        assert!(limiter.try_acquire("a").is_err());
        assert!(limiter.try_acquire("b").is_ok());
    }

    #[test]
    fn window_expiry_frees_slots() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(20));
        limiter.try_acquire("a").unwrap();
        assert!(limiter.try_acquire("a").is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire("a").is_ok());
    }

    #[test]
    fn concurrent_callers_never_exceed_budget() {
        let limiter = Arc::new(SlidingWindowLimiter::per_minute(25));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| limiter.try_acquire("shared").is_ok())
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 25);
        assert_eq!(limiter.admitted("shared"), 25);
    }
}
