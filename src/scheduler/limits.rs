//! Concurrency quotas and token-bucket rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::model::NodeKind;

/// Static concurrency quotas. A kind or resource absent from a map is
/// uncapped (the global cap still applies).
#[derive(Clone, Debug)]
pub struct ResourceLimits {
    pub max_concurrent_tasks: usize,
    pub max_per_kind: HashMap<NodeKind, usize>,
    pub max_per_agent: HashMap<String, usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 100,
            max_per_kind: HashMap::new(),
            max_per_agent: HashMap::new(),
        }
    }
}

/// What one task needs to hold while running.
#[derive(Clone, Debug)]
pub struct TaskClaims {
    pub kind: NodeKind,
    pub resource_key: Option<String>,
}

#[derive(Default)]
struct Usage {
    total: usize,
    by_kind: HashMap<NodeKind, usize>,
    by_resource: HashMap<String, usize>,
}

/// Point-in-time usage snapshot for monitoring.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageStats {
    pub total_active: usize,
    pub by_kind: HashMap<NodeKind, usize>,
    pub by_resource: HashMap<String, usize>,
}

/// Tracks slot usage against the configured quotas. Acquisition is
/// all-or-nothing under a single lock, so no partial reservations exist
/// and waiters cannot deadlock against each other.
pub struct ResourceManager {
    limits: ResourceLimits,
    usage: Mutex<Usage>,
    released: Notify,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            usage: Mutex::new(Usage::default()),
            released: Notify::new(),
        }
    }

    /// Attempt to take every slot the claims need; either all counters
    /// move or none do.
    pub fn try_acquire(&self, claims: &TaskClaims) -> bool {
        let mut usage = self.usage.lock().expect("resource usage lock");
        if usage.total >= self.limits.max_concurrent_tasks {
            return false;
        }
        if let Some(cap) = self.limits.max_per_kind.get(&claims.kind)
            && usage.by_kind.get(&claims.kind).copied().unwrap_or(0) >= *cap
        {
            return false;
        }
        if let Some(key) = &claims.resource_key
            && let Some(cap) = self.limits.max_per_agent.get(key)
            && usage.by_resource.get(key).copied().unwrap_or(0) >= *cap
        {
            return false;
        }
        usage.total += 1;
        *usage.by_kind.entry(claims.kind).or_insert(0) += 1;
        if let Some(key) = &claims.resource_key {
            *usage.by_resource.entry(key.clone()).or_insert(0) += 1;
        }
        true
    }

    /// Wait until every needed slot is free, then take them.
    pub async fn acquire(&self, claims: &TaskClaims) {
        loop {
            // Arm the notification before the check so a release between
            // check and await cannot be missed.
            let mut notified = std::pin::pin!(self.released.notified());
            notified.as_mut().enable();
            if self.try_acquire(claims) {
                return;
            }
            notified.await;
        }
    }

    /// Release all slots taken for the claims and wake every waiter.
    pub fn release(&self, claims: &TaskClaims) {
        let mut usage = self.usage.lock().expect("resource usage lock");
        usage.total = usage.total.saturating_sub(1);
        if let Some(count) = usage.by_kind.get_mut(&claims.kind) {
            *count = count.saturating_sub(1);
        }
        if let Some(key) = &claims.resource_key
            && let Some(count) = usage.by_resource.get_mut(key)
        {
            *count = count.saturating_sub(1);
        }
        drop(usage);
        self.released.notify_waiters();
    }

    pub fn stats(&self) -> UsageStats {
        let usage = self.usage.lock().expect("resource usage lock");
        UsageStats {
            total_active: usage.total,
            by_kind: usage.by_kind.clone(),
            by_resource: usage.by_resource.clone(),
        }
    }
}

/// Token bucket configuration: `refill` tokens are added per `interval`,
/// capped at `capacity`.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill: u32,
    pub interval: Duration,
}

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Cooperative token bucket. Waiters sleep until the next refill instead
/// of spinning; acquisition never holds any concurrency slot.
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let tokens = config.capacity;
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().expect("rate limiter lock");
                let elapsed = bucket.last_refill.elapsed();
                let intervals = (elapsed.as_nanos() / self.config.interval.as_nanos().max(1)) as u32;
                if intervals > 0 {
                    let refilled = intervals.saturating_mul(self.config.refill);
                    bucket.tokens = bucket
                        .tokens
                        .saturating_add(refilled)
                        .min(self.config.capacity);
                    bucket.last_refill += self.config.interval * intervals;
                }
                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return;
                }
                self.config
                    .interval
                    .saturating_sub(bucket.last_refill.elapsed())
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limited, waiting for refill");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

/// Per-key limiters, created lazily from configuration. Keys without a
/// configured limit are unthrottled.
#[derive(Default)]
pub struct RateLimiterRegistry {
    configs: HashMap<String, RateLimitConfig>,
    limiters: Mutex<HashMap<String, std::sync::Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new(configs: HashMap<String, RateLimitConfig>) -> Self {
        Self {
            configs,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, key: &str) {
        let limiter = {
            let Some(config) = self.configs.get(key) else {
                return;
            };
            let mut limiters = self.limiters.lock().expect("rate limiter registry lock");
            limiters
                .entry(key.to_string())
                .or_insert_with(|| std::sync::Arc::new(RateLimiter::new(config.clone())))
                .clone()
        };
        limiter.acquire().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(kind: NodeKind, key: Option<&str>) -> TaskClaims {
        TaskClaims {
            kind,
            resource_key: key.map(str::to_string),
        }
    }

    #[test]
    fn global_cap_is_enforced() {
        let manager = ResourceManager::new(ResourceLimits {
            max_concurrent_tasks: 2,
            ..ResourceLimits::default()
        });
        let c = claims(NodeKind::Tool, None);
        assert!(manager.try_acquire(&c));
        assert!(manager.try_acquire(&c));
        assert!(!manager.try_acquire(&c));
        manager.release(&c);
        assert!(manager.try_acquire(&c));
    }

    #[test]
    fn per_kind_and_per_agent_caps() {
        let mut limits = ResourceLimits::default();
        limits.max_per_kind.insert(NodeKind::Agent, 1);
        limits.max_per_agent.insert("gpt".into(), 1);
        let manager = ResourceManager::new(limits);

        let agent = claims(NodeKind::Agent, Some("gpt"));
        assert!(manager.try_acquire(&agent));
        // Kind cap blocks a second agent even with a different key.
        assert!(!manager.try_acquire(&claims(NodeKind::Agent, Some("claude"))));
        // Tools are unaffected.
        assert!(manager.try_acquire(&claims(NodeKind::Tool, None)));
        manager.release(&agent);
        assert!(manager.try_acquire(&claims(NodeKind::Agent, Some("claude"))));
    }

    #[test]
    fn failed_acquire_reserves_nothing() {
        let mut limits = ResourceLimits::default();
        limits.max_per_agent.insert("gpt".into(), 0);
        let manager = ResourceManager::new(limits);
        assert!(!manager.try_acquire(&claims(NodeKind::Agent, Some("gpt"))));
        assert_eq!(manager.stats(), UsageStats::default());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let manager = std::sync::Arc::new(ResourceManager::new(ResourceLimits {
            max_concurrent_tasks: 1,
            ..ResourceLimits::default()
        }));
        let c = claims(NodeKind::Tool, None);
        assert!(manager.try_acquire(&c));

        let waiter = {
            let manager = manager.clone();
            let c = c.clone();
            tokio::spawn(async move {
                manager.acquire(&c).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        manager.release(&c);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish after release")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_refills_per_interval() {
        let limiter = RateLimiter::new(RateLimitConfig {
            capacity: 2,
            refill: 1,
            interval: Duration::from_millis(100),
        });
        // Burst up to capacity.
        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn unconfigured_key_is_unthrottled() {
        let registry = RateLimiterRegistry::new(HashMap::new());
        registry.acquire("anything").await;
    }
}
