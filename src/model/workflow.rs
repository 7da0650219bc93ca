//! Immutable workflow definitions: nodes, edges, policies, and states.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topology of a workflow definition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    #[default]
    Dag,
    StateMachine,
    Hybrid,
}

/// What a node does. Dispatch at runtime goes through the capability
/// registry keyed by this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Agent,
    Tool,
    Control,
    Aggregation,
    SubWorkflow,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Agent => "agent",
            NodeKind::Tool => "tool",
            NodeKind::Control => "control",
            NodeKind::Aggregation => "aggregation",
            NodeKind::SubWorkflow => "sub_workflow",
        }
    }
}

/// Control-node subkind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Switch,
    Parallel,
    Loop,
    Join,
}

/// Loop termination discipline. Declarations must pick one explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    While,
    ForEach,
    Count,
}

/// Reducer applied by an aggregation node over its source outputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    Concat,
    #[default]
    Merge,
    Sum,
    Last,
}

/// Join wait mode for parallel fan-in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    #[default]
    WaitAll,
    WaitAny,
}

/// Backoff discipline between retry attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Per-node retry policy. `max_attempts` counts total attempts, so
/// `max_attempts = 1` means no retry at all.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter: bool,
    /// Error kind tags eligible for retry; empty means any retryable error.
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (1-based attempt that
    /// just failed). Jitter only ever lengthens the delay so measured
    /// gaps stay above the configured floor.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 || self.base_delay_ms == 0 {
            return 0;
        }
        let raw = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Linear => self.base_delay_ms.saturating_mul(attempt as u64),
            Backoff::Exponential => {
                let factor = 2f64.powi(attempt.saturating_sub(1) as i32);
                (self.base_delay_ms as f64 * factor) as u64
            }
        };
        let capped = raw.min(self.max_delay_ms);
        if self.jitter {
            let factor = 1.0 + rand::random::<f64>() * 0.1;
            (capped as f64 * factor) as u64
        } else {
            capped
        }
    }

    /// Whether an error with the given kind tag falls under this policy.
    pub fn covers(&self, error_kind: &str) -> bool {
        self.retryable_errors.is_empty()
            || self.retryable_errors.iter().any(|k| k == error_kind)
    }
}

/// Compensating action attached to a node. Recorded into the per-execution
/// compensation log when the node commits `success`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompensationSpec {
    /// Named handler, or a tool id when `tool: true`.
    pub action: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default = "default_compensation_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_compensation_attempts")]
    pub max_attempts: u32,
}

fn default_compensation_timeout_ms() -> u64 {
    300_000
}

fn default_compensation_attempts() -> u32 {
    1
}

/// Ordering strategy for running a compensation log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    #[default]
    SequentialReverse,
    Parallel,
    CustomPlan,
}

/// What to do when a node exhausts local handling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorPolicy {
    Retry(RetryPolicy),
    Skip,
    Fallback {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        default_output: Option<Value>,
    },
    Compensate {
        #[serde(default)]
        strategy: CompensationStrategy,
    },
    Escalate,
}

/// One workflow-level error handler. Matching is first-match-wins over the
/// declared order; node-local retry policies take precedence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlerRule {
    /// Regex matched against the failing node's id.
    #[serde(default = "default_node_pattern")]
    pub node_pattern: String,
    /// Error kind tags this rule applies to; empty means any.
    #[serde(default)]
    pub error_kinds: Vec<String>,
    pub policy: ErrorPolicy,
}

fn default_node_pattern() -> String {
    ".*".to_string()
}

/// Data vs. control vs. conditional edges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Data,
    #[default]
    Control,
    Conditional,
}

/// Directed edge between two nodes. Edges may be omitted entirely when
/// node dependencies suffice; the parser infers control edges from them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(alias = "source")]
    pub from: String,
    #[serde(alias = "target")]
    pub to: String,
    #[serde(default)]
    pub kind: EdgeKind,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub data_mapping: Option<HashMap<String, String>>,
}

impl Edge {
    pub fn control(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: EdgeKind::Control,
            condition: None,
            data_mapping: None,
        }
    }

    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: EdgeKind::Conditional,
            condition: Some(condition.into()),
            data_mapping: None,
        }
    }
}

/// A single unit of work in the graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Control subkind; required when `kind` is `control`.
    #[serde(default, alias = "subtype")]
    pub control: Option<ControlKind>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Template bindings resolved against the context snapshot per
    /// invocation.
    #[serde(default, alias = "inputs")]
    pub input_bindings: HashMap<String, String>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "retry")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub compensation: Option<CompensationSpec>,
    #[serde(default)]
    pub priority: i32,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            control: None,
            config: HashMap::new(),
            input_bindings: HashMap::new(),
            output_schema: None,
            dependencies: Vec::new(),
            retry_policy: None,
            timeout_ms: None,
            compensation: None,
            priority: 0,
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Resource key for rate limiting and circuit breaking: the agent or
    /// tool this node talks to, if any.
    pub fn resource_key(&self) -> Option<&str> {
        match self.kind {
            NodeKind::Agent => self.config_str("agent_id"),
            NodeKind::Tool => self.config_str("tool_id"),
            _ => None,
        }
    }
}

/// Category of a state-machine state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Initial,
    #[default]
    Normal,
    Final,
}

/// Action run by the state machine on enter, exit, or during a transition.
/// Executed through the same adapter seams as DAG node executors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
    SetContext {
        key: String,
        value: Value,
    },
    EmitEvent {
        topic: String,
        #[serde(default)]
        payload: Value,
    },
    InvokeAgent {
        agent_id: String,
        #[serde(default)]
        input: HashMap<String, String>,
    },
    InvokeTool {
        tool_id: String,
        #[serde(default)]
        params: HashMap<String, String>,
    },
    TimerStart {
        timer_id: String,
        delay_ms: u64,
        /// Event injected back into the same instance when the timer fires.
        event: String,
    },
    TimerCancel {
        timer_id: String,
    },
}

/// Event-triggered transition out of a state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub event: String,
    #[serde(default, alias = "condition")]
    pub guard: Option<String>,
    pub target: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// One state in a state-machine workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: StateKind,
    #[serde(default)]
    pub on_enter: Vec<Action>,
    #[serde(default)]
    pub on_exit: Vec<Action>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

/// Immutable, versioned workflow definition. A `(name, version)` pair is
/// unique in the repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, rename = "type")]
    pub kind: WorkflowKind,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub error_handlers: Vec<ErrorHandlerRule>,
    #[serde(default)]
    pub initial_state: Option<String>,
    #[serde(default)]
    pub states: Vec<StateDefinition>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Workflow {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn state(&self, name: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Nodes reachable through outgoing edges of `node_id`.
    pub fn downstream(&self, node_id: &str) -> Vec<&Node> {
        self.edges
            .iter()
            .filter(|e| e.from == node_id)
            .filter_map(|e| self.node(&e.to))
            .collect()
    }

    pub fn has_graph(&self) -> bool {
        matches!(self.kind, WorkflowKind::Dag | WorkflowKind::Hybrid)
    }

    pub fn has_states(&self) -> bool {
        matches!(self.kind, WorkflowKind::StateMachine | WorkflowKind::Hybrid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_fixed() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed,
            base_delay_ms: 100,
            max_delay_ms: 60_000,
            jitter: false,
            retryable_errors: Vec::new(),
        };
        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(5), 100);
    }

    #[test]
    fn retry_delay_linear() {
        let policy = RetryPolicy {
            backoff: Backoff::Linear,
            base_delay_ms: 100,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(3), 300);
    }

    #[test]
    fn retry_delay_exponential_caps_at_max() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 3_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_ms(1), 1_000); // 1000 * 2^0
        assert_eq!(policy.delay_ms(2), 2_000); // 1000 * 2^1
        assert_eq!(policy.delay_ms(3), 3_000); // capped
    }

    #[test]
    fn retry_delay_jitter_never_shortens() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential,
            base_delay_ms: 10,
            jitter: true,
            ..RetryPolicy::default()
        };
        for attempt in 1..=4 {
            assert!(policy.delay_ms(attempt) >= 10 * 2u64.pow(attempt - 1));
        }
    }

    #[test]
    fn retry_covers_empty_list_means_any() {
        let policy = RetryPolicy::default();
        assert!(policy.covers("timeout"));
        let scoped = RetryPolicy {
            retryable_errors: vec!["agent_rate_limit".into()],
            ..RetryPolicy::default()
        };
        assert!(scoped.covers("agent_rate_limit"));
        assert!(!scoped.covers("timeout"));
    }

    #[test]
    fn resource_key_reads_agent_and_tool_config() {
        let mut node = Node::new("a", NodeKind::Agent);
        node.config
            .insert("agent_id".into(), Value::String("summarizer".into()));
        assert_eq!(node.resource_key(), Some("summarizer"));

        let mut node = Node::new("t", NodeKind::Tool);
        node.config
            .insert("tool_id".into(), Value::String("http".into()));
        assert_eq!(node.resource_key(), Some("http"));

        let node = Node::new("c", NodeKind::Control);
        assert_eq!(node.resource_key(), None);
    }

    #[test]
    fn action_round_trips_through_serde() {
        let action = Action::TimerStart {
            timer_id: "t1".into(),
            delay_ms: 500,
            event: "tick".into(),
        };
        let json = serde_json::to_string(&action).unwrap();
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(action, back);
    }
}
