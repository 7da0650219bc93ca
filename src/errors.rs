//! Error taxonomy shared by the engine, scheduler, and adapters.

use serde::{Deserialize, Serialize};

/// Subkind for failures surfaced by an agent adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    NotFound,
    Timeout,
    RateLimit,
    Auth,
    Execution,
}

impl AgentErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentErrorKind::NotFound => "agent_not_found",
            AgentErrorKind::Timeout => "agent_timeout",
            AgentErrorKind::RateLimit => "agent_rate_limit",
            AgentErrorKind::Auth => "agent_auth",
            AgentErrorKind::Execution => "agent_execution",
        }
    }
}

/// Subkind for failures surfaced by a tool adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    NotFound,
    InvalidParams,
    Execution,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::NotFound => "tool_not_found",
            ToolErrorKind::InvalidParams => "tool_invalid_params",
            ToolErrorKind::Execution => "tool_execution",
        }
    }
}

/// A single structural problem found while validating a workflow definition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("schema error: {0}")]
    Schema(String),
    #[error("duplicate node id: {id}")]
    DuplicateId { id: String },
    #[error("unknown reference '{reference}' from '{source_node}'")]
    UnknownReference { source_node: String, reference: String },
    #[error("cycle detected through nodes: {}", cycle_nodes.join(" -> "))]
    Cycle { cycle_nodes: Vec<String> },
    #[error("node '{node_id}': {message}")]
    Node { node_id: String, message: String },
    #[error("state '{state}': {message}")]
    State { state: String, message: String },
}

/// Top-level error type for everything the core can fail with.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow validation failed: {}", format_validation(.0))]
    Validation(Vec<ValidationError>),
    #[error("template resolution failed: {0}")]
    Template(String),
    #[error("agent error ({}): {message}", kind.as_str())]
    Agent {
        kind: AgentErrorKind,
        message: String,
    },
    #[error("tool error ({}): {message}", kind.as_str())]
    Tool { kind: ToolErrorKind, message: String },
    #[error("node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout { node_id: String, timeout_ms: u64 },
    #[error("cancelled")]
    Cancelled,
    #[error("circuit open for resource '{key}'")]
    CircuitOpen { key: String },
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("switch node '{node_id}' matched no case and has no default")]
    UnmatchedBranch { node_id: String },
    #[error("compensation failed: {0}")]
    Compensation(String),
    #[error("invalid state transition from '{from}': {message}")]
    StateTransition { from: String, message: String },
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("{0}")]
    Internal(String),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl WorkflowError {
    /// Stable tag used for handler matching and persistence.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::Validation(_) => "validation",
            WorkflowError::Template(_) => "template",
            WorkflowError::Agent { kind, .. } => kind.as_str(),
            WorkflowError::Tool { kind, .. } => kind.as_str(),
            WorkflowError::Timeout { .. } => "timeout",
            WorkflowError::Cancelled => "cancelled",
            WorkflowError::CircuitOpen { .. } => "circuit_open",
            WorkflowError::ResourceExhausted(_) => "resource_exhausted",
            WorkflowError::UnmatchedBranch { .. } => "unmatched_branch",
            WorkflowError::Compensation(_) => "compensation",
            WorkflowError::StateTransition { .. } => "state_transition",
            WorkflowError::WorkflowNotFound(_) => "workflow_not_found",
            WorkflowError::ExecutionNotFound(_) => "execution_not_found",
            WorkflowError::Storage(_) => "storage",
            WorkflowError::Internal(_) => "internal",
        }
    }

    /// Whether a retry could plausibly succeed without operator action.
    pub fn retryable(&self) -> bool {
        match self {
            WorkflowError::Agent { kind, .. } => matches!(
                kind,
                AgentErrorKind::Timeout | AgentErrorKind::RateLimit | AgentErrorKind::Execution
            ),
            WorkflowError::Tool { kind, .. } => matches!(kind, ToolErrorKind::Execution),
            WorkflowError::Timeout { .. } => true,
            WorkflowError::Storage(_) => true,
            WorkflowError::ResourceExhausted(_) => true,
            _ => false,
        }
    }

    /// Error info suitable for attaching to execution and node records.
    pub fn to_info(&self, node_id: Option<&str>, retry_count: u32) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind().to_string(),
            message: self.to_string(),
            node_id: node_id.map(|s| s.to_string()),
            retry_count,
            retryable: self.retryable(),
        }
    }
}

/// Serializable failure record attached to executions, node executions,
/// and failure events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    pub node_id: Option<String>,
    pub retry_count: u32,
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_rate_limit_is_retryable() {
        let err = WorkflowError::Agent {
            kind: AgentErrorKind::RateLimit,
            message: "429".into(),
        };
        assert!(err.retryable());
        assert_eq!(err.kind(), "agent_rate_limit");
    }

    #[test]
    fn circuit_open_is_terminal() {
        let err = WorkflowError::CircuitOpen { key: "k1".into() };
        assert!(!err.retryable());
    }

    #[test]
    fn error_info_carries_node_and_retry_count() {
        let err = WorkflowError::Timeout {
            node_id: "a".into(),
            timeout_ms: 5,
        };
        let info = err.to_info(Some("a"), 2);
        assert_eq!(info.kind, "timeout");
        assert_eq!(info.node_id.as_deref(), Some("a"));
        assert_eq!(info.retry_count, 2);
        assert!(info.retryable);
    }
}
