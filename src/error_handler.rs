//! Error-to-policy resolution and per-resource circuit breakers.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::WorkflowError;
use crate::model::{CompensationStrategy, ErrorHandlerRule, ErrorPolicy, Node, RetryPolicy};

/// Outcome of consulting the error handler for one failed attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Re-run the node after the given delay.
    Retry { delay_ms: u64 },
    /// Mark the node skipped and propagate an empty output.
    Skip,
    /// Invoke the designated alternative node or return the declared
    /// default output.
    Fallback {
        target: Option<String>,
        default_output: Option<Value>,
    },
    /// Trigger Saga rollback for the execution.
    Compensate { strategy: CompensationStrategy },
    /// Mark the node failed and terminate the workflow.
    Escalate,
}

struct CompiledRule {
    pattern: Regex,
    error_kinds: Vec<String>,
    policy: ErrorPolicy,
}

/// Matches failures against the workflow's ordered handler list.
/// Node-local retry policies take precedence over global handlers.
pub struct ErrorHandler {
    rules: Vec<CompiledRule>,
}

impl ErrorHandler {
    /// Compile the handler rules. Patterns were validated at parse time;
    /// an uncompilable pattern here is skipped rather than poisoning the
    /// whole handler chain.
    pub fn new(rules: &[ErrorHandlerRule]) -> Self {
        let rules = rules
            .iter()
            .filter_map(|rule| match Regex::new(&rule.node_pattern) {
                Ok(pattern) => Some(CompiledRule {
                    pattern,
                    error_kinds: rule.error_kinds.clone(),
                    policy: rule.policy.clone(),
                }),
                Err(err) => {
                    warn!(pattern = %rule.node_pattern, error = %err, "dropping invalid handler pattern");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Decide what happens after attempt number `attempt` (1-based) of
    /// `node` failed with `error`.
    pub fn decide(&self, node: &Node, error: &WorkflowError, attempt: u32) -> Decision {
        // Cancellation is a terminal non-failure; it is never retried,
        // skipped, or compensated per policy.
        if matches!(error, WorkflowError::Cancelled) {
            return Decision::Escalate;
        }

        if let Some(policy) = &node.retry_policy
            && let Some(decision) = retry_decision(policy, error, attempt)
        {
            return decision;
        }

        let kind = error.kind();
        for rule in &self.rules {
            if !rule.pattern.is_match(&node.id) {
                continue;
            }
            if !rule.error_kinds.is_empty() && !rule.error_kinds.iter().any(|k| k == kind) {
                continue;
            }
            debug!(node_id = %node.id, error_kind = kind, "error handler rule matched");
            return match &rule.policy {
                ErrorPolicy::Retry(policy) => {
                    retry_decision(policy, error, attempt).unwrap_or(Decision::Escalate)
                }
                ErrorPolicy::Skip => Decision::Skip,
                ErrorPolicy::Fallback {
                    target,
                    default_output,
                } => Decision::Fallback {
                    target: target.clone(),
                    default_output: default_output.clone(),
                },
                ErrorPolicy::Compensate { strategy } => Decision::Compensate {
                    strategy: *strategy,
                },
                ErrorPolicy::Escalate => Decision::Escalate,
            };
        }

        Decision::Escalate
    }
}

/// Retry iff the policy covers the error kind, the error is retryable,
/// and attempts remain.
fn retry_decision(policy: &RetryPolicy, error: &WorkflowError, attempt: u32) -> Option<Decision> {
    if attempt >= policy.max_attempts {
        return None;
    }
    if !error.retryable() || !policy.covers(error.kind()) {
        return None;
    }
    Some(Decision::Retry {
        delay_ms: policy.delay_ms(attempt),
    })
}

/// Circuit breaker tuning, applied uniformly per resource key.
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Failures within the rolling window that open the breaker.
    pub failure_threshold: u32,
    /// Rolling window over which failures are counted.
    pub window: Duration,
    /// How long an open breaker rejects before allowing one probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

enum BreakerState {
    Closed { failures: VecDeque<Instant> },
    Open { since: Instant },
    HalfOpen { probe_inflight: bool },
}

/// Per-key breakers: `closed -> open -> half_open -> closed`. Calls in
/// `open` are rejected immediately with `CircuitOpen`; after the cooldown
/// exactly one probe is admitted.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check before invoking the resource.
    pub fn check(&self, key: &str) -> Result<(), WorkflowError> {
        let mut breakers = self.breakers.lock().expect("breaker lock");
        let state = breakers
            .entry(key.to_string())
            .or_insert_with(|| BreakerState::Closed {
                failures: VecDeque::new(),
            });
        match state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { since } => {
                if since.elapsed() >= self.config.cooldown {
                    *state = BreakerState::HalfOpen {
                        probe_inflight: true,
                    };
                    debug!(key, "circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(WorkflowError::CircuitOpen {
                        key: key.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen { probe_inflight } => {
                if *probe_inflight {
                    Err(WorkflowError::CircuitOpen {
                        key: key.to_string(),
                    })
                } else {
                    *probe_inflight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock");
        if let Some(state) = breakers.get_mut(key) {
            *state = BreakerState::Closed {
                failures: VecDeque::new(),
            };
        }
    }

    pub fn record_failure(&self, key: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock");
        let state = breakers
            .entry(key.to_string())
            .or_insert_with(|| BreakerState::Closed {
                failures: VecDeque::new(),
            });
        match state {
            BreakerState::Closed { failures } => {
                let now = Instant::now();
                failures.push_back(now);
                while let Some(first) = failures.front() {
                    if now.duration_since(*first) > self.config.window {
                        failures.pop_front();
                    } else {
                        break;
                    }
                }
                if failures.len() as u32 >= self.config.failure_threshold {
                    warn!(key, failures = failures.len(), "circuit breaker opened");
                    *state = BreakerState::Open { since: now };
                }
            }
            BreakerState::HalfOpen { .. } => {
                warn!(key, "probe failed, circuit breaker re-opened");
                *state = BreakerState::Open {
                    since: Instant::now(),
                };
            }
            BreakerState::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{AgentErrorKind, ToolErrorKind};
    use crate::model::{Backoff, NodeKind};

    fn retryable_error() -> WorkflowError {
        WorkflowError::Agent {
            kind: AgentErrorKind::Execution,
            message: "boom".into(),
        }
    }

    fn node_with_retry(max_attempts: u32) -> Node {
        let mut node = Node::new("x", NodeKind::Agent);
        node.retry_policy = Some(RetryPolicy {
            max_attempts,
            backoff: Backoff::Exponential,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
            jitter: false,
            retryable_errors: Vec::new(),
        });
        node
    }

    #[test]
    fn node_retry_takes_precedence_over_rules() {
        let handler = ErrorHandler::new(&[ErrorHandlerRule {
            node_pattern: ".*".into(),
            error_kinds: Vec::new(),
            policy: ErrorPolicy::Skip,
        }]);
        let node = node_with_retry(3);
        assert_eq!(
            handler.decide(&node, &retryable_error(), 1),
            Decision::Retry { delay_ms: 10 }
        );
        assert_eq!(
            handler.decide(&node, &retryable_error(), 2),
            Decision::Retry { delay_ms: 20 }
        );
        // Attempts exhausted: falls through to the skip rule.
        assert_eq!(handler.decide(&node, &retryable_error(), 3), Decision::Skip);
    }

    #[test]
    fn max_attempts_zero_retries_means_no_retry() {
        let handler = ErrorHandler::new(&[]);
        let node = node_with_retry(1);
        assert_eq!(
            handler.decide(&node, &retryable_error(), 1),
            Decision::Escalate
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let handler = ErrorHandler::new(&[
            ErrorHandlerRule {
                node_pattern: "^payment_.*".into(),
                error_kinds: vec!["tool_execution".into()],
                policy: ErrorPolicy::Compensate {
                    strategy: CompensationStrategy::SequentialReverse,
                },
            },
            ErrorHandlerRule {
                node_pattern: ".*".into(),
                error_kinds: Vec::new(),
                policy: ErrorPolicy::Skip,
            },
        ]);
        let node = Node::new("payment_charge", NodeKind::Tool);
        let error = WorkflowError::Tool {
            kind: ToolErrorKind::Execution,
            message: "declined".into(),
        };
        assert_eq!(
            handler.decide(&node, &error, 1),
            Decision::Compensate {
                strategy: CompensationStrategy::SequentialReverse
            }
        );
        // Different kind falls to the catch-all.
        let timeout = WorkflowError::Timeout {
            node_id: "payment_charge".into(),
            timeout_ms: 5,
        };
        assert_eq!(handler.decide(&node, &timeout, 1), Decision::Skip);
    }

    #[test]
    fn non_retryable_error_skips_retry_policy() {
        let handler = ErrorHandler::new(&[]);
        let node = node_with_retry(5);
        let auth = WorkflowError::Agent {
            kind: AgentErrorKind::Auth,
            message: "401".into(),
        };
        assert_eq!(handler.decide(&node, &auth, 1), Decision::Escalate);
    }

    #[test]
    fn cancellation_is_never_handled() {
        let handler = ErrorHandler::new(&[ErrorHandlerRule {
            node_pattern: ".*".into(),
            error_kinds: Vec::new(),
            policy: ErrorPolicy::Skip,
        }]);
        let node = node_with_retry(5);
        assert_eq!(
            handler.decide(&node, &WorkflowError::Cancelled, 1),
            Decision::Escalate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_at_threshold_and_probes_after_cooldown() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(100),
        });

        for _ in 0..5 {
            registry.check("k1").unwrap();
            registry.record_failure("k1");
        }
        // Exactly at threshold: open.
        assert!(matches!(
            registry.check("k1"),
            Err(WorkflowError::CircuitOpen { .. })
        ));

        tokio::time::advance(Duration::from_millis(110)).await;
        // One probe admitted, a second concurrent call rejected.
        registry.check("k1").unwrap();
        assert!(registry.check("k1").is_err());

        registry.record_success("k1");
        registry.check("k1").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(50),
        });
        registry.record_failure("k");
        assert!(registry.check("k").is_err());
        tokio::time::advance(Duration::from_millis(60)).await;
        registry.check("k").unwrap();
        registry.record_failure("k");
        assert!(registry.check("k").is_err());
    }

    #[test]
    fn distinct_keys_are_independent() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        registry.record_failure("a");
        assert!(registry.check("a").is_err());
        assert!(registry.check("b").is_ok());
    }
}
