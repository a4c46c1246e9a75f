//! Rate limiting primitives.
//!
//! Two modes: a token bucket for per-feature global caps (embedding,
//! analysis, chat) and a sliding window for per-client HTTP limits.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Token bucket with lazy refill. `acquire` never blocks.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token. Returns false when the bucket is empty.
    pub fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
        state.tokens as u32
    }
}

/// Result of a sliding-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    Allowed { remaining: u32 },
    Rejected { retry_after: Duration },
}

/// Sliding-window limiter keyed by an arbitrary identifier, typically
/// `"{ip}:{route}"`. Entries older than the window are pruned on every
/// check; the retry-after is derived from the oldest surviving timestamp.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    state: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, identifier: &str) -> WindowDecision {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window_start = now.checked_sub(self.window);

        let log = state.entry(identifier.to_string()).or_default();
        while window_start.is_some_and(|ws| log.front().is_some_and(|&t| t < ws)) {
            log.pop_front();
        }

        if log.len() >= self.max_requests {
            let retry_after = log
                .front()
                .map(|&oldest| (oldest + self.window).saturating_duration_since(now) + Duration::from_secs(1))
                .unwrap_or(self.window);
            return WindowDecision::Rejected { retry_after };
        }

        log.push_back(now);
        WindowDecision::Allowed {
            remaining: (self.max_requests - log.len()) as u32,
        }
    }

    /// Drop identifiers with no activity inside two windows. Called from a
    /// background task.
    pub fn cleanup(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.window * 2) else {
            return;
        };
        let mut state = self.state.lock();
        state.retain(|_, log| log.back().is_some_and(|&t| t >= cutoff));
    }
}

/// Per-feature buckets shared across the process.
pub struct FeatureLimits {
    pub embedding: Arc<TokenBucket>,
    pub analysis: Arc<TokenBucket>,
    pub chat: Arc<TokenBucket>,
}

impl Default for FeatureLimits {
    fn default() -> Self {
        Self {
            embedding: Arc::new(TokenBucket::new(60, 1.0)),
            analysis: Arc::new(TokenBucket::new(30, 0.5)),
            chat: Arc::new(TokenBucket::new(120, 2.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_drains_and_refills() {
        let bucket = TokenBucket::new(2, 1000.0);
        assert!(bucket.acquire());
        assert!(bucket.acquire());
        // Bucket empty, high refill rate means it recovers almost instantly.
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.acquire());
    }

    #[test]
    fn test_token_bucket_rejects_when_empty() {
        let bucket = TokenBucket::new(1, 0.0);
        assert!(bucket.acquire());
        assert!(!bucket.acquire());
    }

    #[test]
    fn test_sliding_window_allows_then_rejects() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(matches!(limiter.check("1.2.3.4:/api/news"), WindowDecision::Allowed { .. }));
        }
        match limiter.check("1.2.3.4:/api/news") {
            WindowDecision::Rejected { retry_after } => {
                assert!(retry_after <= Duration::from_secs(61));
                assert!(retry_after >= Duration::from_secs(1));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_sliding_window_isolates_identifiers() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert!(matches!(limiter.check("a:/x"), WindowDecision::Allowed { .. }));
        assert!(matches!(limiter.check("b:/x"), WindowDecision::Allowed { .. }));
        assert!(matches!(limiter.check("a:/x"), WindowDecision::Rejected { .. }));
    }

    #[test]
    fn test_cleanup_retains_active_keys() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_millis(10));
        limiter.check("active");
        limiter.cleanup();
        assert!(limiter.state.lock().contains_key("active"));
        std::thread::sleep(Duration::from_millis(30));
        limiter.cleanup();
        assert!(!limiter.state.lock().contains_key("active"));
    }
}
