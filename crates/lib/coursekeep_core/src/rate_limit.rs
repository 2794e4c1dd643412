//! Per-client token-bucket rate limiting for the auth routes.
//!
//! Each `(route class, client key)` pair owns one bucket. The map only
//! synchronizes insertion and eviction; every bucket has its own mutex, so
//! requests from different clients never wait on each other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

/// Which bucket family a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// Login and register.
    Credentials,
    Refresh,
}

/// Capacity and full-refill window of one bucket family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub capacity: u32,
    pub window: Duration,
}

impl BucketConfig {
    pub const fn new(capacity: u32, window: Duration) -> Self {
        Self { capacity, window }
    }

    /// Permits regained over `elapsed`.
    fn permits_for(&self, elapsed: Duration) -> f64 {
        elapsed.as_secs_f64() * f64::from(self.capacity) / self.window.as_secs_f64()
    }

    /// Time needed to regain `permits`.
    fn time_for(&self, permits: f64) -> Duration {
        Duration::from_secs_f64(permits * self.window.as_secs_f64() / f64::from(self.capacity))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub credentials: BucketConfig,
    pub refresh: BucketConfig,
    /// Upper bound on live buckets across both classes.
    pub max_tracked_keys: usize,
}

impl RateLimitConfig {
    pub fn bucket(&self, class: RouteClass) -> BucketConfig {
        match class {
            RouteClass::Credentials => self.credentials,
            RouteClass::Refresh => self.refresh,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            credentials: BucketConfig::new(5, Duration::from_secs(60)),
            refresh: BucketConfig::new(10, Duration::from_secs(60)),
            max_tracked_keys: 100_000,
        }
    }
}

/// Outcome of a [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(config: BucketConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.capacity),
            last_refill: now,
        }
    }

    fn refill(&mut self, config: BucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + config.permits_for(elapsed)).min(f64::from(config.capacity));
        self.last_refill = self.last_refill.max(now);
    }

    fn try_acquire(&mut self, config: BucketConfig, now: Instant) -> RateLimitDecision {
        if config.capacity == 0 || config.window.is_zero() {
            return RateLimitDecision::Limited {
                retry_after: config.window,
            };
        }
        self.refill(config, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateLimitDecision::Allowed {
                remaining: self.tokens.floor() as u32,
            }
        } else {
            let missing = 1.0 - self.tokens;
            RateLimitDecision::Limited {
                retry_after: config.time_for(missing),
            }
        }
    }

    /// Idle for a full window means the bucket is full again and can be
    /// dropped without changing any future decision.
    fn is_idle(&self, config: BucketConfig, now: Instant) -> bool {
        now.saturating_duration_since(self.last_refill) >= config.window
    }
}

fn lock(bucket: &Mutex<TokenBucket>) -> MutexGuard<'_, TokenBucket> {
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}

type BucketKey = (RouteClass, String);

/// Token-bucket limiter keyed by route class and client identity.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<BucketKey, Mutex<TokenBucket>>,
    /// Slots reserved or occupied in `buckets`. Reserved before insertion so
    /// concurrent new keys cannot overshoot `max_tracked_keys`.
    tracked: AtomicUsize,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            tracked: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Consume one permit for `key` if available.
    pub fn check(&self, class: RouteClass, key: &str) -> RateLimitDecision {
        self.check_at(class, key, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&self, class: RouteClass, key: &str, now: Instant) -> RateLimitDecision {
        let config = self.config.bucket(class);
        let bucket_key = (class, key.to_string());

        // Permits are spent while the map guard is held, so a sweep cannot
        // detach the bucket between lookup and acquire.
        let existing = self
            .buckets
            .get(&bucket_key)
            .map(|bucket| lock(&bucket).try_acquire(config, now));
        let decision = match existing {
            Some(decision) => decision,
            None => self.acquire_new(bucket_key, config, now),
        };
        if !decision.is_allowed() {
            debug!(?class, client = key, "rate limit exceeded");
        }
        decision
    }

    fn acquire_new(&self, key: BucketKey, config: BucketConfig, now: Instant) -> RateLimitDecision {
        if !self.reserve_slot() {
            self.sweep_at(now);
            if !self.reserve_slot() {
                warn!(
                    max = self.config.max_tracked_keys,
                    "rate limiter key capacity exhausted, rejecting new client"
                );
                return RateLimitDecision::Limited {
                    retry_after: config.window,
                };
            }
        }
        match self.buckets.entry(key) {
            // Another request created it first; give the slot back.
            Entry::Occupied(entry) => {
                self.tracked.fetch_sub(1, Ordering::AcqRel);
                lock(entry.get()).try_acquire(config, now)
            }
            Entry::Vacant(entry) => {
                let mut bucket = TokenBucket::full(config, now);
                let decision = bucket.try_acquire(config, now);
                entry.insert(Mutex::new(bucket));
                decision
            }
        }
    }

    fn reserve_slot(&self) -> bool {
        let max = self.config.max_tracked_keys;
        self.tracked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// Evict buckets idle for at least one window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut evicted = 0;
        self.buckets.retain(|(class, _), bucket| {
            let idle = lock(bucket).is_idle(self.config.bucket(*class), now);
            evicted += usize::from(idle);
            !idle
        });
        self.tracked.fetch_sub(evicted, Ordering::AcqRel);
        evicted
    }

    /// Spawn a periodic sweep.
    pub fn spawn_sweep_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let evicted = limiter.sweep();
                if evicted > 0 {
                    debug!(evicted, remaining = limiter.len(), "rate limiter sweep");
                }
            }
        })
    }
}
