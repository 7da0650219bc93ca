//! Agent and tool adapter seams.
//!
//! The engine is agnostic to what actually answers an invocation; LLM
//! provider adapters and HTTP/email/database tool executors implement
//! these traits out of tree. The static implementations here back tests
//! and single-process deployments with plain async closures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{AgentErrorKind, ToolErrorKind, WorkflowError};

/// Options forwarded to an agent invocation.
#[derive(Clone, Debug, Default)]
pub struct InvokeOptions {
    pub metadata: HashMap<String, Value>,
}

/// Response from a successful agent invocation.
#[derive(Clone, Debug)]
pub struct AgentResponse {
    pub output: Value,
    pub usage: Option<Value>,
    pub trace_id: String,
}

impl AgentResponse {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            usage: None,
            trace_id: Uuid::new_v4().to_string(),
        }
    }
}

pub trait AgentRuntime: Send + Sync {
    fn invoke_agent<'a>(
        &'a self,
        agent_id: &'a str,
        input: Value,
        options: InvokeOptions,
        cancellation: CancellationToken,
        deadline: Option<Duration>,
    ) -> BoxFuture<'a, Result<AgentResponse, WorkflowError>>;
}

pub trait ToolRegistry: Send + Sync {
    fn invoke_tool<'a>(
        &'a self,
        tool_id: &'a str,
        params: Value,
        cancellation: CancellationToken,
        deadline: Option<Duration>,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>>;
}

pub type AgentFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, WorkflowError>> + Send + Sync>;
pub type ToolFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, WorkflowError>> + Send + Sync>;

/// Function-map-backed agent runtime.
#[derive(Clone, Default)]
pub struct StaticAgentRuntime {
    agents: HashMap<String, AgentFn>,
}

impl StaticAgentRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, agent_id: impl Into<String>, handler: AgentFn) -> Self {
        self.agents.insert(agent_id.into(), handler);
        self
    }
}

impl AgentRuntime for StaticAgentRuntime {
    fn invoke_agent<'a>(
        &'a self,
        agent_id: &'a str,
        input: Value,
        _options: InvokeOptions,
        cancellation: CancellationToken,
        _deadline: Option<Duration>,
    ) -> BoxFuture<'a, Result<AgentResponse, WorkflowError>> {
        Box::pin(async move {
            let handler = self.agents.get(agent_id).cloned().ok_or_else(|| {
                WorkflowError::Agent {
                    kind: AgentErrorKind::NotFound,
                    message: format!("agent not found: {agent_id}"),
                }
            })?;
            tokio::select! {
                _ = cancellation.cancelled() => Err(WorkflowError::Cancelled),
                result = handler(input) => result.map(AgentResponse::new),
            }
        })
    }
}

/// Function-map-backed tool registry.
#[derive(Clone, Default)]
pub struct StaticToolRegistry {
    tools: HashMap<String, ToolFn>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, tool_id: impl Into<String>, handler: ToolFn) -> Self {
        self.tools.insert(tool_id.into(), handler);
        self
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn invoke_tool<'a>(
        &'a self,
        tool_id: &'a str,
        params: Value,
        cancellation: CancellationToken,
        _deadline: Option<Duration>,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let handler = self.tools.get(tool_id).cloned().ok_or_else(|| {
                WorkflowError::Tool {
                    kind: ToolErrorKind::NotFound,
                    message: format!("tool not found: {tool_id}"),
                }
            })?;
            tokio::select! {
                _ = cancellation.cancelled() => Err(WorkflowError::Cancelled),
                result = handler(params) => result,
            }
        })
    }
}
