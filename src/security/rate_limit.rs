//! Rate limiting.
//!
//! # Responsibilities
//! - Token bucket, sliding window and leaky bucket limiters keyed per client
//! - Composite limiter combining others with ALL / ANY semantics
//! - Build the configured limiter stack
//! - Periodically drop client state that no longer affects decisions
//!
//! Each limiter keeps per-key state behind one mutex that covers both the
//! decision and the update.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::config::{CombineMode, LimiterConfig, RateLimitConfig};

/// A per-key admission decision.
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Returns true if a request for `key` is admitted right now.
    fn allow_request(&self, key: &str) -> bool;

    /// Algorithm name, used as the metrics label.
    fn kind(&self) -> &'static str;

    fn stats(&self) -> RateLimiterStats;

    /// Drop per-key state that is back at its starting point or untouched
    /// for `idle`. Returns the number of keys removed.
    fn cleanup(&self, idle: Duration) -> usize;
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub kind: &'static str,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
    /// Percentage of admitted requests.
    pub success_rate: f64,
    /// Per-key level: tokens left, requests in window, or bucket level.
    pub keys: BTreeMap<String, f64>,
    /// Stats of wrapped limiters for composites.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<RateLimiterStats>,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn record(&self, allowed: bool) -> bool {
        self.total.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    fn stats(&self, kind: &'static str, keys: BTreeMap<String, f64>) -> RateLimiterStats {
        let total = self.total.load(Ordering::Relaxed);
        let allowed = self.allowed.load(Ordering::Relaxed);
        RateLimiterStats {
            kind,
            total_requests: total,
            allowed_requests: allowed,
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            success_rate: if total > 0 {
                allowed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            keys,
            components: Vec::new(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn retain_keys<V>(map: &mut HashMap<String, V>, keep: impl FnMut(&String, &mut V) -> bool) -> usize {
    let before = map.len();
    map.retain(keep);
    before - map.len()
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Continuous-refill token bucket. New keys start full.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
    counters: Counters,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }
}

impl RateLimiter for TokenBucket {
    fn kind(&self) -> &'static str {
        "token_bucket"
    }

    fn allow_request(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = lock(&self.buckets);
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        self.counters.record(allowed)
    }

    fn stats(&self) -> RateLimiterStats {
        let keys = lock(&self.buckets)
            .iter()
            .map(|(k, b)| (k.clone(), b.tokens))
            .collect();
        self.counters.stats(self.kind(), keys)
    }

    fn cleanup(&self, idle: Duration) -> usize {
        let now = Instant::now();
        retain_keys(&mut lock(&self.buckets), |_, bucket| {
            let elapsed = now.duration_since(bucket.last_refill);
            let tokens = bucket.tokens + elapsed.as_secs_f64() * self.refill_rate;
            elapsed < idle && tokens < self.capacity
        })
    }
}

/// Sliding window log: at most `max_requests` admitted in any trailing `window`.
#[derive(Debug)]
pub struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    counters: Counters,
}

impl SlidingWindow {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    fn purge(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&oldest) = queue.front() {
            if now.duration_since(oldest) >= window {
                queue.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter for SlidingWindow {
    fn kind(&self) -> &'static str {
        "sliding_window"
    }

    fn allow_request(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = lock(&self.windows);
        let queue = windows.entry(key.to_string()).or_default();
        Self::purge(queue, now, self.window);

        let allowed = queue.len() < self.max_requests;
        if allowed {
            queue.push_back(now);
        }
        self.counters.record(allowed)
    }

    fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let mut windows = lock(&self.windows);
        let keys = windows
            .iter_mut()
            .map(|(k, queue)| {
                Self::purge(queue, now, self.window);
                (k.clone(), queue.len() as f64)
            })
            .collect();
        self.counters.stats(self.kind(), keys)
    }

    /// Only empty windows are dropped; a key with entries still in the
    /// window is kept whatever `idle` says.
    fn cleanup(&self, _idle: Duration) -> usize {
        let now = Instant::now();
        retain_keys(&mut lock(&self.windows), |_, queue| {
            Self::purge(queue, now, self.window);
            !queue.is_empty()
        })
    }
}

#[derive(Debug)]
struct Level {
    level: f64,
    last_leak: Instant,
}

/// Leaky bucket: the level drains at `leak_rate` per second; admit while below capacity.
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: f64,
    leak_rate: f64,
    buckets: Mutex<HashMap<String, Level>>,
    counters: Counters,
}

impl LeakyBucket {
    pub fn new(capacity: f64, leak_rate: f64) -> Self {
        Self {
            capacity,
            leak_rate,
            buckets: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }
}

impl RateLimiter for LeakyBucket {
    fn kind(&self) -> &'static str {
        "leaky_bucket"
    }

    fn allow_request(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = lock(&self.buckets);
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Level {
            level: 0.0,
            last_leak: now,
        });

        let elapsed = now.duration_since(bucket.last_leak).as_secs_f64();
        bucket.level = (bucket.level - elapsed * self.leak_rate).max(0.0);
        bucket.last_leak = now;

        let allowed = bucket.level < self.capacity;
        if allowed {
            bucket.level += 1.0;
        }
        self.counters.record(allowed)
    }

    fn stats(&self) -> RateLimiterStats {
        let keys = lock(&self.buckets)
            .iter()
            .map(|(k, b)| (k.clone(), b.level))
            .collect();
        self.counters.stats(self.kind(), keys)
    }

    fn cleanup(&self, idle: Duration) -> usize {
        let now = Instant::now();
        retain_keys(&mut lock(&self.buckets), |_, bucket| {
            let elapsed = now.duration_since(bucket.last_leak);
            let level = bucket.level - elapsed.as_secs_f64() * self.leak_rate;
            elapsed < idle && level > 0.0
        })
    }
}

/// Combines limiters. `All` admits only if every limiter admits and stops at the
/// first rejection; `Any` admits at the first limiter that admits.
#[derive(Debug)]
pub struct CompositeLimiter {
    mode: CombineMode,
    limiters: Vec<Arc<dyn RateLimiter>>,
    counters: Counters,
}

impl CompositeLimiter {
    pub fn new(mode: CombineMode, limiters: Vec<Arc<dyn RateLimiter>>) -> Self {
        Self {
            mode,
            limiters,
            counters: Counters::default(),
        }
    }
}

impl RateLimiter for CompositeLimiter {
    fn kind(&self) -> &'static str {
        "composite"
    }

    fn allow_request(&self, key: &str) -> bool {
        let allowed = match self.mode {
            CombineMode::All => self.limiters.iter().all(|l| l.allow_request(key)),
            CombineMode::Any => self.limiters.iter().any(|l| l.allow_request(key)),
        };
        self.counters.record(allowed)
    }

    fn stats(&self) -> RateLimiterStats {
        let mut stats = self.counters.stats(self.kind(), BTreeMap::new());
        stats.components = self.limiters.iter().map(|l| l.stats()).collect();
        stats
    }

    fn cleanup(&self, idle: Duration) -> usize {
        self.limiters.iter().map(|l| l.cleanup(idle)).sum()
    }
}

/// Build one limiter from its configuration.
pub fn build_limiter(config: &LimiterConfig) -> Arc<dyn RateLimiter> {
    match *config {
        LimiterConfig::TokenBucket { capacity, refill_rate } => {
            Arc::new(TokenBucket::new(capacity, refill_rate))
        }
        LimiterConfig::SlidingWindow { max_requests, window_secs } => {
            // Unvalidated windows that do not fit a Duration saturate.
            let window = Duration::try_from_secs_f64(window_secs).unwrap_or(Duration::MAX);
            Arc::new(SlidingWindow::new(max_requests, window))
        }
        LimiterConfig::LeakyBucket { capacity, leak_rate } => {
            Arc::new(LeakyBucket::new(capacity, leak_rate))
        }
    }
}

/// Build the configured limiter stack, or `None` when rate limiting is off.
///
/// A single configured limiter is used as is; several are wrapped in a composite.
pub fn from_config(config: &RateLimitConfig) -> Option<Arc<dyn RateLimiter>> {
    if !config.enabled || config.limiters.is_empty() {
        return None;
    }

    let mut limiters: Vec<Arc<dyn RateLimiter>> = config.limiters.iter().map(build_limiter).collect();
    if limiters.len() == 1 {
        return limiters.pop();
    }
    Some(Arc::new(CompositeLimiter::new(config.combine, limiters)))
}

/// Drop idle client state every `interval` until shutdown.
pub async fn run_cleanup(
    limiter: Arc<dyn RateLimiter>,
    interval: Duration,
    idle: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = limiter.cleanup(idle);
                if removed > 0 {
                    tracing::debug!(removed, limiter = limiter.kind(), "Dropped idle rate limit keys");
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("Rate limit cleanup received shutdown signal, exiting loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn token_bucket_refills_over_time() {
        let limiter = TokenBucket::new(5.0, 1.0);
        for _ in 0..5 {
            assert!(limiter.allow_request("client"));
        }
        assert!(!limiter.allow_request("client"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow_request("client"));
        assert!(!limiter.allow_request("client"));

        // other keys have their own bucket
        assert!(limiter.allow_request("other"));

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 9);
        assert_eq!(stats.allowed_requests, 7);
        assert_eq!(stats.rejected_requests, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_never_exceeds_capacity() {
        let limiter = TokenBucket::new(2.0, 10.0);
        assert!(limiter.allow_request("k"));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.allow_request("k"));
        assert!(limiter.allow_request("k"));
        assert!(!limiter.allow_request("k"));
        assert!(limiter.stats().keys["k"] < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_purges_old_entries() {
        let limiter = SlidingWindow::new(3, Duration::from_secs(10));
        for _ in 0..3 {
            assert!(limiter.allow_request("k"));
        }
        assert!(!limiter.allow_request("k"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.allow_request("k"));
        assert_eq!(limiter.stats().keys["k"], 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn leaky_bucket_drains() {
        let limiter = LeakyBucket::new(2.0, 1.0);
        assert!(limiter.allow_request("k"));
        assert!(limiter.allow_request("k"));
        assert!(!limiter.allow_request("k"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow_request("k"));
        assert!(!limiter.allow_request("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn composite_modes() {
        let strict: Arc<dyn RateLimiter> = Arc::new(TokenBucket::new(1.0, 0.0));
        let loose: Arc<dyn RateLimiter> = Arc::new(TokenBucket::new(3.0, 0.0));

        let all = CompositeLimiter::new(CombineMode::All, vec![Arc::clone(&strict), Arc::clone(&loose)]);
        assert!(all.allow_request("k"));
        assert!(!all.allow_request("k"));

        let any = CompositeLimiter::new(
            CombineMode::Any,
            vec![Arc::new(TokenBucket::new(1.0, 0.0)), Arc::new(TokenBucket::new(2.0, 0.0))],
        );
        assert!(any.allow_request("k"));
        assert!(any.allow_request("k"));
        assert!(any.allow_request("k"));
        assert!(!any.allow_request("k"));

        let stats = any.stats();
        assert_eq!(stats.components.len(), 2);
        assert!((stats.success_rate - 75.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_refilled_and_idle_buckets() {
        let limiter = TokenBucket::new(2.0, 1.0);
        for i in 0..100 {
            limiter.allow_request(&format!("10.0.0.{}", i));
        }
        assert!(limiter.allow_request("busy"));
        assert!(limiter.allow_request("busy"));
        assert_eq!(limiter.stats().keys.len(), 101);

        // one second refills the single-use buckets, "busy" is still short
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.cleanup(Duration::from_secs(300)), 100);
        assert_eq!(limiter.stats().keys.keys().collect::<Vec<_>>(), vec!["busy"]);

        let frozen = TokenBucket::new(2.0, 0.0);
        assert!(frozen.allow_request("k"));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(frozen.cleanup(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(frozen.cleanup(Duration::from_secs(60)), 1);
        assert!(frozen.stats().keys.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_keeps_keys_still_limiting() {
        let window = SlidingWindow::new(5, Duration::from_secs(10));
        assert!(window.allow_request("old"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(window.allow_request("new"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(window.cleanup(Duration::from_secs(1)), 1);
        assert_eq!(window.stats().keys.keys().collect::<Vec<_>>(), vec!["new"]);

        let leaky = LeakyBucket::new(2.0, 1.0);
        assert!(leaky.allow_request("full"));
        assert!(leaky.allow_request("full"));
        assert!(leaky.allow_request("light"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(leaky.cleanup(Duration::from_secs(300)), 1);
        assert_eq!(leaky.stats().keys.keys().collect::<Vec<_>>(), vec!["full"]);

        let composite = CompositeLimiter::new(
            CombineMode::All,
            vec![Arc::new(TokenBucket::new(1.0, 1.0)), Arc::new(LeakyBucket::new(1.0, 1.0))],
        );
        assert!(composite.allow_request("k"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(composite.cleanup(Duration::from_secs(300)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_runs_until_shutdown() {
        let limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucket::new(1.0, 1.0));
        assert!(limiter.allow_request("k"));
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(run_cleanup(
            Arc::clone(&limiter),
            Duration::from_secs(5),
            Duration::from_secs(60),
            rx,
        ));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(limiter.stats().keys.is_empty());

        tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn builds_from_config() {
        let mut config = RateLimitConfig::default();
        assert!(from_config(&config).is_none());

        config.enabled = true;
        assert_eq!(from_config(&config).unwrap().stats().kind, "token_bucket");

        config.limiters.push(LimiterConfig::SlidingWindow {
            max_requests: 10,
            window_secs: 1.0,
        });
        assert_eq!(from_config(&config).unwrap().stats().kind, "composite");

        let endless = build_limiter(&LimiterConfig::SlidingWindow {
            max_requests: 1,
            window_secs: f64::INFINITY,
        });
        assert!(endless.allow_request("k"));
        assert!(!endless.allow_request("k"));
    }
}
