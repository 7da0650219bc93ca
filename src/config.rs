//! Engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use crate::error_handler::CircuitBreakerConfig;
use crate::scheduler::{RateLimitConfig, ResourceLimits};

/// Runtime configuration, loadable from environment variables.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Concurrency quotas enforced by the scheduler.
    pub limits: ResourceLimits,

    /// Token-bucket settings per resource key (agent id, tool id).
    pub rate_limits: HashMap<String, RateLimitConfig>,

    /// Circuit breaker tuning, applied per resource key.
    pub breaker: CircuitBreakerConfig,

    /// Deadline for nodes that do not declare `timeout_ms`.
    pub default_node_timeout_ms: u64,

    /// Hard bound on loop iterations regardless of loop kind.
    pub max_loop_iterations: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            rate_limits: HashMap::new(),
            breaker: CircuitBreakerConfig::default(),
            default_node_timeout_ms: 300_000,
            max_loop_iterations: 100,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Some(value) = read_env("SKEIN_MAX_CONCURRENT_TASKS")? {
            config.limits.max_concurrent_tasks = value;
        }
        if let Some(value) = read_env("SKEIN_MAX_CONCURRENT_AGENTS")? {
            config
                .limits
                .max_per_kind
                .insert(crate::model::NodeKind::Agent, value);
        }
        if let Some(value) = read_env("SKEIN_MAX_CONCURRENT_TOOLS")? {
            config
                .limits
                .max_per_kind
                .insert(crate::model::NodeKind::Tool, value);
        }
        if let Some(value) = read_env("SKEIN_DEFAULT_NODE_TIMEOUT_MS")? {
            config.default_node_timeout_ms = value as u64;
        }
        if let Some(value) = read_env("SKEIN_MAX_LOOP_ITERATIONS")? {
            config.max_loop_iterations = value as u64;
        }
        if let Some(value) = read_env("SKEIN_BREAKER_FAILURE_THRESHOLD")? {
            config.breaker.failure_threshold = value as u32;
        }
        if let Some(value) = read_env("SKEIN_BREAKER_COOLDOWN_MS")? {
            config.breaker.cooldown = Duration::from_millis(value as u64);
        }

        Ok(config)
    }
}

fn read_env(name: &str) -> anyhow::Result<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<usize>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{name} must be a non-negative integer, got '{raw}'")),
        Err(_) => Ok(None),
    }
}
