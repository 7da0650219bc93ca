//! Node executors and the capability registry.
//!
//! Dispatch is by node kind through `{kind -> executor}`; new kinds plug
//! in without touching the engine. Loop and sub-workflow nodes are driven
//! by the engine coordinator instead because they steer execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::adapters::{AgentRuntime, InvokeOptions, ToolRegistry};
use crate::errors::WorkflowError;
use crate::model::{ControlKind, JoinMode, Node, NodeKind, Reducer};
use crate::template::Condition;

/// Per-invocation context handed to an executor: an immutable snapshot of
/// the execution context plus cancellation and deadline.
#[derive(Clone)]
pub struct ExecutorContext {
    pub snapshot: Value,
    pub cancellation: CancellationToken,
    pub deadline: Option<Duration>,
}

pub trait NodeExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        input: Value,
        ctx: &'a ExecutorContext,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>>;
}

/// `{kind -> executor}` capability registry.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapters(agents: Arc<dyn AgentRuntime>, tools: Arc<dyn ToolRegistry>) -> Self {
        let mut registry = Self::new();
        registry.register(NodeKind::Agent, Arc::new(AgentExecutor { runtime: agents }));
        registry.register(NodeKind::Tool, Arc::new(ToolExecutor { registry: tools }));
        registry.register(NodeKind::Control, Arc::new(ControlExecutor));
        registry.register(NodeKind::Aggregation, Arc::new(AggregationExecutor));
        registry
    }

    pub fn register(&mut self, kind: NodeKind, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&kind).cloned()
    }
}

/// Invokes the agent adapter with the node's resolved input.
pub struct AgentExecutor {
    pub runtime: Arc<dyn AgentRuntime>,
}

impl NodeExecutor for AgentExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        input: Value,
        ctx: &'a ExecutorContext,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let agent_id = node.config_str("agent_id").ok_or_else(|| {
                WorkflowError::Internal(format!("node '{}' missing agent_id", node.id))
            })?;
            let response = self
                .runtime
                .invoke_agent(
                    agent_id,
                    input,
                    InvokeOptions::default(),
                    ctx.cancellation.clone(),
                    ctx.deadline,
                )
                .await?;
            Ok(response.output)
        })
    }
}

/// Invokes the tool adapter with the node's resolved parameters.
pub struct ToolExecutor {
    pub registry: Arc<dyn ToolRegistry>,
}

impl NodeExecutor for ToolExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        input: Value,
        ctx: &'a ExecutorContext,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let tool_id = node.config_str("tool_id").ok_or_else(|| {
                WorkflowError::Internal(format!("node '{}' missing tool_id", node.id))
            })?;
            self.registry
                .invoke_tool(tool_id, input, ctx.cancellation.clone(), ctx.deadline)
                .await
        })
    }
}

/// Pure evaluation for switch/parallel/join. The returned metadata is
/// interpreted by the engine (branch pruning, fan-out, fan-in collection).
pub struct ControlExecutor;

impl NodeExecutor for ControlExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        _input: Value,
        ctx: &'a ExecutorContext,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
        Box::pin(async move {
            match node.control {
                Some(ControlKind::Switch) => execute_switch(node, &ctx.snapshot),
                Some(ControlKind::Parallel) => Ok(json!({
                    "branches": node.config.get("branches").cloned().unwrap_or(json!([])),
                    "mode": node.config.get("mode").cloned().unwrap_or(json!("wait_all")),
                })),
                Some(ControlKind::Join) => execute_join(node, &ctx.snapshot),
                Some(ControlKind::Loop) => Err(WorkflowError::Internal(format!(
                    "loop node '{}' must be driven by the engine",
                    node.id
                ))),
                None => Err(WorkflowError::Internal(format!(
                    "control node '{}' missing subtype",
                    node.id
                ))),
            }
        })
    }
}

fn execute_switch(node: &Node, snapshot: &Value) -> Result<Value, WorkflowError> {
    let expression = node.config_str("expression").ok_or_else(|| {
        WorkflowError::Internal(format!("switch node '{}' missing expression", node.id))
    })?;
    let condition =
        Condition::parse(expression).map_err(|e| WorkflowError::Template(e.to_string()))?;
    let value = condition
        .eval(snapshot)
        .map_err(|e| WorkflowError::Template(e.to_string()))?;

    let cases = node
        .config
        .get("cases")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut selected = None;
    for case in &cases {
        let matches = match case.get("equals") {
            Some(expected) => json_matches(expected, &value),
            // A case without `equals` matches on its own condition.
            None => match case.get("when").and_then(Value::as_str) {
                Some(when) => Condition::parse(when)
                    .and_then(|c| c.eval_bool(snapshot))
                    .map_err(|e| WorkflowError::Template(e.to_string()))?,
                None => false,
            },
        };
        if matches {
            selected = case.get("target").and_then(Value::as_str).map(str::to_string);
            break;
        }
    }
    let selected = selected.or_else(|| node.config_str("default").map(str::to_string));
    let Some(selected) = selected else {
        return Err(WorkflowError::UnmatchedBranch {
            node_id: node.id.clone(),
        });
    };
    Ok(json!({ "selected": selected, "value": value }))
}

fn json_matches(expected: &Value, actual: &Value) -> bool {
    if let (Value::Number(a), Value::Number(b)) = (expected, actual) {
        return a.as_f64() == b.as_f64();
    }
    expected == actual
}

/// Collect the outputs of whichever dependencies have completed.
fn execute_join(node: &Node, snapshot: &Value) -> Result<Value, WorkflowError> {
    let mut collected = Map::new();
    for dep in &node.dependencies {
        if let Some(output) = snapshot["nodes"].get(dep).and_then(|n| n.get("output")) {
            collected.insert(dep.clone(), output.clone());
        }
    }
    Ok(json!({ "collected": Value::Object(collected) }))
}

/// Join wait mode from node config.
pub fn join_mode(node: &Node) -> JoinMode {
    node.config
        .get("mode")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Reduces the declared upstream outputs with the declared reducer.
pub struct AggregationExecutor;

impl NodeExecutor for AggregationExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        _input: Value,
        ctx: &'a ExecutorContext,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let sources: Vec<String> = node
                .config
                .get("sources")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            let reducer: Reducer = node
                .config
                .get("reducer")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();

            let mut outputs = Vec::with_capacity(sources.len());
            for source in &sources {
                let output = ctx.snapshot["nodes"]
                    .get(source)
                    .and_then(|n| n.get("output"))
                    .cloned()
                    .unwrap_or(Value::Null);
                outputs.push(output);
            }
            Ok(reduce(reducer, outputs))
        })
    }
}

fn reduce(reducer: Reducer, outputs: Vec<Value>) -> Value {
    match reducer {
        Reducer::Concat => {
            let mut items = Vec::new();
            for output in outputs {
                match output {
                    Value::Array(array) => items.extend(array),
                    other => items.push(other),
                }
            }
            Value::Array(items)
        }
        Reducer::Merge => {
            let mut merged = Map::new();
            for output in outputs {
                if let Value::Object(map) = output {
                    merged.extend(map);
                }
            }
            Value::Object(merged)
        }
        Reducer::Sum => {
            let mut total = 0.0;
            for output in &outputs {
                total += match output {
                    Value::Number(n) => n.as_f64().unwrap_or(0.0),
                    Value::Object(map) => map
                        .values()
                        .filter_map(Value::as_f64)
                        .sum(),
                    _ => 0.0,
                };
            }
            json!(total)
        }
        Reducer::Last => outputs.into_iter().last().unwrap_or(Value::Null),
    }
}
