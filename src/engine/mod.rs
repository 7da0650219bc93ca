//! DAG execution engine.
//!
//! One coordinator task per execution owns the execution record, node
//! statuses, and the context tree (single writer). Node work runs in
//! scheduler-admitted tasks that own their node-execution record for the
//! duration of the call and report back over a completion channel; the
//! coordinator merges outputs and recomputes the ready set. Control nodes
//! (switch pruning, join wait modes, loops) are interpreted here because
//! they steer execution.

pub mod executors;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{AgentRuntime, ToolRegistry};
use crate::bus::EventBus;
use crate::compensation::{CompensationEntry, CompensationManager, FailureMode};
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, dependencies_present, resolve_bindings};
use crate::error_handler::{CircuitBreakerRegistry, Decision, ErrorHandler};
use crate::errors::{ErrorInfo, WorkflowError};
use crate::events::EventEmitter;
use crate::graph::ExecutionGraph;
use crate::model::{
    CompensationStrategy, ControlKind, EdgeKind, EventKind, ExecutionStatus, JoinMode, LoopKind,
    Node, NodeExecution, NodeKind, NodeStatus, TriggerType, Workflow, WorkflowExecution,
};
use crate::parser::WorkflowParser;
use crate::scheduler::{ScheduledTask, TaskClaims, TaskScheduler};
use crate::storage::{ExecutionRepo, WorkflowRepo};
use crate::template::{Condition, Template};

pub use executors::{ExecutorContext, ExecutorRegistry, NodeExecutor};

enum ControlSignal {
    Suspend,
    Resume,
}

#[derive(Clone)]
struct ExecutionHandle {
    cancel: CancellationToken,
    user_cancelled: Arc<AtomicBool>,
    control: mpsc::UnboundedSender<ControlSignal>,
    status_rx: watch::Receiver<ExecutionStatus>,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    workflows: Arc<dyn WorkflowRepo>,
    executions: Arc<dyn ExecutionRepo>,
    scheduler: Arc<TaskScheduler>,
    emitter: EventEmitter,
    executors: ExecutorRegistry,
    compensation: Arc<CompensationManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    parser: WorkflowParser,
    active: Mutex<HashMap<Uuid, ExecutionHandle>>,
}

/// The workflow execution engine. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        workflows: Arc<dyn WorkflowRepo>,
        executions: Arc<dyn ExecutionRepo>,
        bus: Arc<dyn EventBus>,
        agents: Arc<dyn AgentRuntime>,
        tools: Arc<dyn ToolRegistry>,
    ) -> Self {
        let scheduler = TaskScheduler::new(
            config.limits.clone(),
            crate::scheduler::RateLimiterRegistry::new(config.rate_limits.clone()),
        );
        scheduler.start();
        let emitter = EventEmitter::new(bus, executions.clone());
        let executors = ExecutorRegistry::with_adapters(agents, tools.clone());
        let compensation = Arc::new(CompensationManager::new(
            tools,
            FailureMode::ContinueOnError,
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        Self {
            inner: Arc::new(EngineInner {
                config,
                workflows,
                executions,
                scheduler,
                emitter,
                executors,
                compensation,
                breakers,
                parser: WorkflowParser::new(),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Parse, validate, optimize, and persist a workflow definition.
    /// Returns the workflow id.
    pub async fn create_workflow(&self, definition: &str) -> Result<String, WorkflowError> {
        let workflow = self.inner.parser.parse_str(definition)?;
        self.inner.workflows.save(&workflow).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, "workflow created");
        Ok(workflow.id)
    }

    /// Validate and persist a workflow built in code.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<String, WorkflowError> {
        let workflow = self.inner.parser.parse_workflow(workflow)?;
        self.inner.workflows.save(&workflow).await?;
        Ok(workflow.id)
    }

    /// Start executing a workflow. Returns the execution id immediately;
    /// the execution proceeds in the background.
    pub async fn execute(&self, workflow_id: &str, input: Value) -> Result<Uuid, WorkflowError> {
        let workflow = self
            .inner
            .workflows
            .load_by_id(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
        let (execution_id, _) = self
            .inner
            .clone()
            .spawn_execution(Arc::new(workflow), input, None, TriggerType::Manual, None)
            .await?;
        Ok(execution_id)
    }

    /// Block until the execution reaches a terminal status.
    pub async fn wait(&self, execution_id: Uuid) -> Result<ExecutionStatus, WorkflowError> {
        let rx = {
            let active = self.inner.active.lock().expect("active executions lock");
            active.get(&execution_id).map(|h| h.status_rx.clone())
        };
        match rx {
            Some(mut rx) => {
                loop {
                    let status = *rx.borrow();
                    if status.is_terminal() {
                        return Ok(status);
                    }
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                self.load_status(execution_id).await
            }
            None => self.load_status(execution_id).await,
        }
    }

    async fn load_status(&self, execution_id: Uuid) -> Result<ExecutionStatus, WorkflowError> {
        let record = self
            .inner
            .executions
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))?;
        Ok(record
            .execution
            .map(|e| e.status)
            .unwrap_or(ExecutionStatus::Pending))
    }

    /// Cancel a running execution. Pending nodes are removed, in-flight
    /// nodes observe the cancellation token.
    pub fn cancel(&self, execution_id: Uuid) -> Result<(), WorkflowError> {
        let active = self.inner.active.lock().expect("active executions lock");
        let handle = active
            .get(&execution_id)
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))?;
        handle.user_cancelled.store(true, Ordering::SeqCst);
        handle.cancel.cancel();
        Ok(())
    }

    /// Stop enqueueing new nodes; running nodes drain, then the execution
    /// parks as `suspended`.
    pub fn suspend(&self, execution_id: Uuid) -> Result<(), WorkflowError> {
        self.signal(execution_id, ControlSignal::Suspend)
    }

    /// Re-derive the ready set of a suspended execution and continue.
    /// Resuming twice is equivalent to resuming once.
    pub fn resume(&self, execution_id: Uuid) -> Result<(), WorkflowError> {
        self.signal(execution_id, ControlSignal::Resume)
    }

    fn signal(&self, execution_id: Uuid, signal: ControlSignal) -> Result<(), WorkflowError> {
        let active = self.inner.active.lock().expect("active executions lock");
        let handle = active
            .get(&execution_id)
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))?;
        handle
            .control
            .send(signal)
            .map_err(|_| WorkflowError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Per-node status summary assembled from persisted records.
    pub async fn execution_status(&self, execution_id: Uuid) -> Result<Value, WorkflowError> {
        let record = self
            .inner
            .executions
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))?;
        let execution = record
            .execution
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))?;
        let nodes: serde_json::Map<String, Value> = record
            .node_execs
            .iter()
            .map(|(key, node)| {
                (
                    key.clone(),
                    json!({
                        "status": node.status,
                        "retry_count": node.retry_count,
                        "start_ts": node.start_ts,
                        "end_ts": node.end_ts,
                        "error": node.error,
                    }),
                )
            })
            .collect();
        Ok(json!({
            "execution_id": execution.execution_id,
            "workflow_id": execution.workflow_id,
            "status": execution.status,
            "start_ts": execution.start_ts,
            "end_ts": execution.end_ts,
            "output": execution.output,
            "error": execution.error,
            "nodes": nodes,
        }))
    }

    pub fn scheduler_stats(&self) -> crate::scheduler::SchedulerStats {
        self.inner.scheduler.stats()
    }

    /// Handle for registering named compensating actions.
    pub fn compensation(&self) -> Arc<CompensationManager> {
        self.inner.compensation.clone()
    }

    pub fn shutdown(&self) {
        self.inner.scheduler.stop();
    }
}

impl EngineInner {
    /// Create the execution record and spawn its coordinator.
    ///
    /// Returns an explicitly boxed future (rather than `async fn`) because this
    /// function is part of a mutually recursive call cycle with `run_node_task`
    /// (via `run_sub_workflow`); an opaque `impl Future` return type here makes
    /// rustc's Send auto-trait inference cycle on itself.
    fn spawn_execution(
        self: Arc<Self>,
        workflow: Arc<Workflow>,
        input: Value,
        parent_execution_id: Option<Uuid>,
        trigger: TriggerType,
        parent_cancel: Option<CancellationToken>,
    ) -> Pin<Box<dyn Future<Output = Result<(Uuid, watch::Receiver<ExecutionStatus>), WorkflowError>> + Send>>
    {
        Box::pin(async move {
        let graph = Arc::new(ExecutionGraph::build(&workflow));
        let mut execution = WorkflowExecution::new(
            workflow.id.clone(),
            workflow.name.clone(),
            workflow.version.clone(),
            input,
        );
        execution.parent_execution_id = parent_execution_id;
        execution.trigger_type = trigger;
        let execution_id = execution.execution_id;

        self.executions.create(&execution).await?;
        self.emitter
            .emit_execution(execution_id, EventKind::ExecutionCreated)
            .await;

        let cancel = parent_cancel
            .map(|t| t.child_token())
            .unwrap_or_default();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ExecutionStatus::Pending);
        let handle = ExecutionHandle {
            cancel: cancel.clone(),
            user_cancelled: Arc::new(AtomicBool::new(false)),
            control: control_tx,
            status_rx: status_rx.clone(),
        };
        self.active
            .lock()
            .expect("active executions lock")
            .insert(execution_id, handle.clone());

        let inner = self.clone();
        tokio::spawn(async move {
            let coordinator = Coordinator::new(
                inner.clone(),
                workflow,
                graph,
                execution,
                handle,
                control_rx,
                status_tx,
            );
            coordinator.run().await;
            inner
                .active
                .lock()
                .expect("active executions lock")
                .remove(&execution_id);
        });
        Ok((execution_id, status_rx))
        })
    }
}

/// Readiness decision for a waiting node.
enum Readiness {
    NotReady,
    Dispatch,
    Skip,
}

/// Outcome of one node task, reported back to the coordinator.
struct NodeOutcome {
    node_id: String,
    record_key: String,
    record: NodeExecution,
    result: TaskResult,
}

enum TaskResult {
    Success {
        output: Value,
        /// Loop-body outputs to merge (body node id, output).
        body_outputs: Vec<(String, Value)>,
    },
    Skipped,
    Cancelled,
    Failed {
        error: ErrorInfo,
    },
    Compensate {
        strategy: CompensationStrategy,
        error: ErrorInfo,
    },
}

struct Coordinator {
    inner: Arc<EngineInner>,
    workflow: Arc<Workflow>,
    graph: Arc<ExecutionGraph>,
    handler: Arc<ErrorHandler>,
    execution: WorkflowExecution,
    handle: ExecutionHandle,
    control_rx: mpsc::UnboundedReceiver<ControlSignal>,
    status_tx: watch::Sender<ExecutionStatus>,
    outcome_tx: mpsc::UnboundedSender<NodeOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<NodeOutcome>,
    context: ExecutionContext,
    statuses: HashMap<String, NodeStatus>,
    records: HashMap<String, NodeExecution>,
    /// Nodes skipped because their path was not taken (switch pruning or
    /// a false conditional edge). Policy-skipped nodes are NOT in here:
    /// they satisfy dependencies and their successors still run.
    pruned: HashSet<String>,
    inflight: HashSet<String>,
    suspended: bool,
    pending_error: Option<ErrorInfo>,
    compensate: Option<(CompensationStrategy, ErrorInfo)>,
}

impl Coordinator {
    fn new(
        inner: Arc<EngineInner>,
        workflow: Arc<Workflow>,
        graph: Arc<ExecutionGraph>,
        execution: WorkflowExecution,
        handle: ExecutionHandle,
        control_rx: mpsc::UnboundedReceiver<ControlSignal>,
        status_tx: watch::Sender<ExecutionStatus>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ErrorHandler::new(&workflow.error_handlers));
        let context = ExecutionContext::new(execution.input.clone());
        let statuses = workflow
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Waiting))
            .collect();
        Self {
            inner,
            workflow,
            graph,
            handler,
            execution,
            handle,
            control_rx,
            status_tx,
            outcome_tx,
            outcome_rx,
            context,
            statuses,
            records: HashMap::new(),
            pruned: HashSet::new(),
            inflight: HashSet::new(),
            suspended: false,
            pending_error: None,
            compensate: None,
        }
    }

    async fn run(mut self) {
        let execution_id = self.execution.execution_id;
        self.execution.start();
        let _ = self.inner.executions.update_execution(&self.execution).await;
        self.inner
            .emitter
            .emit_execution(execution_id, EventKind::ExecutionStarted)
            .await;
        let _ = self.status_tx.send(ExecutionStatus::Running);
        info!(execution_id = %execution_id, workflow = %self.workflow.name, "execution started");

        let initial = self.graph.initial_ready();
        self.propagate(initial).await;

        loop {
            if self.inflight.is_empty() {
                if self.aborting() {
                    break;
                }
                if self.suspended {
                    if !self.park_suspended().await {
                        break;
                    }
                    continue;
                }
                break;
            }
            tokio::select! {
                Some(outcome) = self.outcome_rx.recv() => {
                    self.process_outcome(outcome).await;
                }
                Some(signal) = self.control_rx.recv() => match signal {
                    ControlSignal::Suspend => self.suspended = true,
                    ControlSignal::Resume => self.suspended = false,
                },
            }
        }

        self.finalize().await;
    }

    fn aborting(&self) -> bool {
        self.pending_error.is_some()
            || self.compensate.is_some()
            || self.handle.cancel.is_cancelled()
    }

    /// Park until resumed or cancelled. Returns false when the execution
    /// should terminate instead of continuing.
    async fn park_suspended(&mut self) -> bool {
        let execution_id = self.execution.execution_id;
        self.execution.status = ExecutionStatus::Suspended;
        let _ = self.inner.executions.update_execution(&self.execution).await;
        self.inner
            .emitter
            .emit_execution(execution_id, EventKind::ExecutionSuspended)
            .await;
        let _ = self.status_tx.send(ExecutionStatus::Suspended);
        info!(execution_id = %execution_id, "execution suspended");

        loop {
            tokio::select! {
                signal = self.control_rx.recv() => match signal {
                    Some(ControlSignal::Resume) => break,
                    Some(ControlSignal::Suspend) => continue,
                    None => return false,
                },
                _ = self.handle.cancel.cancelled() => return false,
            }
        }

        self.suspended = false;
        self.execution.status = ExecutionStatus::Running;
        let _ = self.inner.executions.update_execution(&self.execution).await;
        self.inner
            .emitter
            .emit_execution(execution_id, EventKind::ExecutionResumed)
            .await;
        let _ = self.status_tx.send(ExecutionStatus::Running);

        // Re-derive the ready set from node statuses.
        let waiting: Vec<String> = self
            .statuses
            .iter()
            .filter(|(_, status)| **status == NodeStatus::Waiting)
            .map(|(id, _)| id.clone())
            .collect();
        self.propagate(waiting).await;
        true
    }

    async fn process_outcome(&mut self, outcome: NodeOutcome) {
        self.inflight.remove(&outcome.node_id);
        self.records
            .insert(outcome.record_key.clone(), outcome.record.clone());

        match outcome.result {
            TaskResult::Success {
                output,
                body_outputs,
            } => {
                self.statuses
                    .insert(outcome.node_id.clone(), NodeStatus::Success);
                for (body_id, body_output) in body_outputs {
                    self.statuses.insert(body_id.clone(), NodeStatus::Success);
                    self.context.set_node_output(&body_id, body_output);
                }
                self.context.set_node_output(&outcome.node_id, output.clone());

                let node = self.workflow.node(&outcome.node_id).cloned();
                if let Some(node) = &node {
                    self.record_compensation(node, &output);
                    if node.control == Some(ControlKind::Switch) {
                        self.prune_switch_branches(node, &output).await;
                    }
                }
                self.dispatch_successors(&outcome.node_id).await;
            }
            TaskResult::Skipped => {
                self.statuses
                    .insert(outcome.node_id.clone(), NodeStatus::Skipped);
                // Skip propagates an empty output downstream.
                self.context.set_node_output(&outcome.node_id, json!({}));
                self.dispatch_successors(&outcome.node_id).await;
            }
            TaskResult::Cancelled => {
                self.statuses
                    .insert(outcome.node_id.clone(), NodeStatus::Cancelled);
            }
            TaskResult::Failed { error } => {
                self.statuses
                    .insert(outcome.node_id.clone(), NodeStatus::Failed);
                if self.pending_error.is_none() {
                    self.pending_error = Some(error);
                }
                // Escalation terminates the workflow: stop in-flight work.
                self.handle.cancel.cancel();
            }
            TaskResult::Compensate { strategy, error } => {
                self.statuses
                    .insert(outcome.node_id.clone(), NodeStatus::Failed);
                if self.compensate.is_none() {
                    self.compensate = Some((strategy, error));
                }
                self.handle.cancel.cancel();
            }
        }
    }

    /// Append a compensation entry when a node with a compensation spec
    /// commits success.
    fn record_compensation(&self, node: &Node, output: &Value) {
        let Some(spec) = &node.compensation else {
            return;
        };
        let snapshot = self.context.snapshot();
        let mut params = serde_json::Map::new();
        for (key, raw) in &spec.params {
            let value = Template::parse(raw)
                .and_then(|t| t.resolve(&snapshot))
                .unwrap_or(Value::Null);
            params.insert(key.clone(), value);
        }
        self.inner.compensation.record(
            self.execution.execution_id,
            CompensationEntry {
                node_id: node.id.clone(),
                action: spec.action.clone(),
                input: json!({ "params": params, "output": output }),
                timeout_ms: spec.timeout_ms,
                max_attempts: spec.max_attempts,
                recorded_at: chrono::Utc::now(),
            },
        );
    }

    /// After a switch selects a branch, skip the heads of every other
    /// branch (and transitively their descendants that lose all paths).
    async fn prune_switch_branches(&mut self, node: &Node, output: &Value) {
        let selected = output.get("selected").and_then(Value::as_str).unwrap_or("");
        let mut heads: Vec<String> = node
            .config
            .get("cases")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|case| case.get("target").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        if let Some(default) = node.config_str("default") {
            heads.push(default.to_string());
        }

        let mut seeds = Vec::new();
        for head in heads {
            if head != selected && self.statuses.get(&head) == Some(&NodeStatus::Waiting) {
                self.mark_skipped(&head).await;
                seeds.extend(self.graph.successors_of(&head).cloned());
            }
        }
        self.propagate(seeds).await;
    }

    /// Mark one node pruned-skipped (no cascade) and persist the decision.
    async fn mark_skipped(&mut self, node_id: &str) {
        self.statuses
            .insert(node_id.to_string(), NodeStatus::Skipped);
        self.pruned.insert(node_id.to_string());
        self.context.set_node_output(node_id, json!({}));

        let mut record = NodeExecution::new(self.execution.execution_id, node_id);
        record.mark_skipped();
        let _ = self.inner.executions.upsert_node_exec(node_id, &record).await;
        self.records.insert(node_id.to_string(), record);
        self.inner
            .emitter
            .emit_node(self.execution.execution_id, node_id, EventKind::NodeSkipped)
            .await;
        debug!(node_id, "node skipped (branch not taken)");
    }

    async fn dispatch_successors(&mut self, node_id: &str) {
        let seeds: Vec<String> = self.graph.successors_of(node_id).cloned().collect();
        self.propagate(seeds).await;
    }

    /// Worklist propagation of readiness decisions. Dropping seeds while
    /// suspended or aborting is safe: the ready set is re-derived from
    /// node statuses on resume.
    async fn propagate(&mut self, seeds: Vec<String>) {
        let mut queue: std::collections::VecDeque<String> = seeds.into();
        while let Some(node_id) = queue.pop_front() {
            if self.suspended || self.aborting() {
                return;
            }
            match self.evaluate_readiness(&node_id) {
                Readiness::NotReady => {}
                Readiness::Dispatch => self.dispatch(&node_id).await,
                Readiness::Skip => {
                    self.mark_skipped(&node_id).await;
                    queue.extend(self.graph.successors_of(&node_id).cloned());
                }
            }
        }
    }

    /// Decide what to do with a waiting node. A node is ready when every
    /// dependency has observably completed (`success` or `skipped`) and
    /// every conditional edge into it is satisfied; joins relax this per
    /// their wait mode. A node whose every path was pruned is skipped.
    fn evaluate_readiness(&self, node_id: &str) -> Readiness {
        if self.statuses.get(node_id) != Some(&NodeStatus::Waiting)
            || self.inflight.contains(node_id)
            || self.graph.loop_owner.contains_key(node_id)
        {
            return Readiness::NotReady;
        }
        let Some(node) = self.workflow.node(node_id) else {
            return Readiness::NotReady;
        };

        let mut all_satisfied = true;
        let mut any_success = false;
        let mut all_pruned = true;
        let mut has_preds = false;
        for pred in self.graph.predecessors_of(node_id) {
            has_preds = true;
            match self.statuses.get(pred) {
                Some(NodeStatus::Success) => {
                    any_success = true;
                    all_pruned = false;
                }
                Some(NodeStatus::Skipped) => {
                    if !self.pruned.contains(pred) {
                        all_pruned = false;
                    }
                }
                _ => {
                    all_satisfied = false;
                    all_pruned = false;
                }
            }
        }

        // Every path into this node was pruned away.
        if has_preds && all_pruned && all_satisfied {
            return Readiness::Skip;
        }

        let is_join = node.kind == NodeKind::Control && node.control == Some(ControlKind::Join);
        let ready = if is_join && executors::join_mode(node) == JoinMode::WaitAny {
            any_success
        } else {
            all_satisfied
        };
        if !ready {
            return Readiness::NotReady;
        }

        // Conditional edges: a false condition from a successful source
        // means this path is not taken.
        let snapshot = self.context.snapshot();
        for edge in &self.workflow.edges {
            if edge.to != node_id || edge.kind != EdgeKind::Conditional {
                continue;
            }
            if self.statuses.get(&edge.from) != Some(&NodeStatus::Success) {
                continue;
            }
            let taken = edge
                .condition
                .as_deref()
                .map(|raw| {
                    Condition::parse(raw)
                        .and_then(|c| c.eval_bool(&snapshot))
                        .unwrap_or(false)
                })
                .unwrap_or(true);
            if !taken {
                return Readiness::Skip;
            }
        }

        Readiness::Dispatch
    }

    async fn dispatch(&mut self, node_id: &str) {
        let Some(node) = self.workflow.node(node_id).cloned() else {
            return;
        };
        let execution_id = self.execution.execution_id;

        // A wait_any join legitimately starts before all of its
        // dependencies have produced output.
        let wait_any_join = node.control == Some(ControlKind::Join)
            && executors::join_mode(&node) == JoinMode::WaitAny;
        if !wait_any_join && !dependencies_present(&node, &self.context) {
            // Readiness implies every dependency output is in the tree; a
            // miss here is an engine bug, surfaced instead of masked.
            let error = WorkflowError::Internal(format!(
                "dispatching '{node_id}' without all dependency outputs"
            ));
            self.pending_error = Some(error.to_info(Some(node_id), 0));
            self.handle.cancel.cancel();
            return;
        }

        let mut record = NodeExecution::new(execution_id, node_id);
        record.mark_ready();
        self.statuses.insert(node_id.to_string(), NodeStatus::Ready);
        let _ = self.inner.executions.upsert_node_exec(node_id, &record).await;
        self.inner
            .emitter
            .emit_node(execution_id, node_id, EventKind::NodeReady)
            .await;

        let snapshot = self.context.snapshot();
        let cancel = self.handle.cancel.child_token();
        let task_ctx = NodeTaskContext {
            inner: self.inner.clone(),
            workflow: self.workflow.clone(),
            graph: self.graph.clone(),
            handler: self.handler.clone(),
            outcome_tx: self.outcome_tx.clone(),
        };

        self.statuses
            .insert(node_id.to_string(), NodeStatus::Running);
        self.inflight.insert(node_id.to_string());

        let claims = TaskClaims {
            kind: node.kind,
            resource_key: node.resource_key().map(str::to_string),
        };
        let task = ScheduledTask {
            execution_id,
            node_id: node_id.to_string(),
            priority: node.priority,
            claims,
            cancellation: cancel.clone(),
            run: Box::pin(async move {
                run_node_task(task_ctx, node, record, snapshot, cancel).await;
            }),
        };
        if let Err(err) = self.inner.scheduler.submit(task) {
            self.inflight.remove(node_id);
            self.statuses.insert(node_id.to_string(), NodeStatus::Failed);
            self.pending_error = Some(err.to_info(Some(node_id), 0));
            self.handle.cancel.cancel();
        }
    }

    async fn finalize(mut self) {
        let execution_id = self.execution.execution_id;

        // Every reachable node must be terminal at termination.
        let unterminated: Vec<String> = self
            .statuses
            .iter()
            .filter(|(_, status)| !status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in unterminated {
            self.statuses
                .insert(node_id.clone(), NodeStatus::Cancelled);
            let record = self.records.entry(node_id.clone()).or_insert_with(|| {
                NodeExecution::new(execution_id, node_id.clone())
            });
            record.mark_cancelled();
            let _ = self
                .inner
                .executions
                .upsert_node_exec(&node_id, record)
                .await;
        }

        let user_cancelled = self.handle.user_cancelled.load(Ordering::SeqCst);
        if user_cancelled {
            self.execution.cancel();
            let _ = self.inner.executions.update_execution(&self.execution).await;
            self.inner
                .emitter
                .emit_execution(execution_id, EventKind::ExecutionCancelled)
                .await;
        } else if let Some((strategy, error)) = self.compensate.take() {
            self.execution.status = ExecutionStatus::Compensating;
            let _ = self.inner.executions.update_execution(&self.execution).await;
            self.inner
                .emitter
                .emit(
                    execution_id,
                    None,
                    EventKind::CompensationStarted,
                    json!({ "strategy": strategy, "trigger": &error }),
                )
                .await;
            let plan = self.compensation_plan();
            let report = self
                .inner
                .compensation
                .compensate(execution_id, strategy, plan.as_deref())
                .await;
            self.inner
                .emitter
                .emit(
                    execution_id,
                    None,
                    EventKind::CompensationCompleted,
                    json!({
                        "success": report.success,
                        "outcomes": report
                            .outcomes
                            .iter()
                            .map(|(id, outcome)| json!({ "node_id": id, "outcome": format!("{outcome:?}") }))
                            .collect::<Vec<_>>(),
                    }),
                )
                .await;
            self.execution.fail(error);
            let _ = self.inner.executions.update_execution(&self.execution).await;
            self.inner
                .emitter
                .emit_execution(execution_id, EventKind::ExecutionFailed)
                .await;
        } else if let Some(error) = self.pending_error.take() {
            self.execution.fail(error.clone());
            let _ = self.inner.executions.update_execution(&self.execution).await;
            self.inner
                .emitter
                .emit(
                    execution_id,
                    None,
                    EventKind::ExecutionFailed,
                    serde_json::to_value(&error).unwrap_or(Value::Null),
                )
                .await;
        } else {
            let output = self.sink_outputs();
            self.execution.complete(Some(output));
            let _ = self.inner.executions.update_execution(&self.execution).await;
            self.inner
                .emitter
                .emit_execution(execution_id, EventKind::ExecutionCompleted)
                .await;
        }

        let _ = self.status_tx.send(self.execution.status);
        info!(
            execution_id = %execution_id,
            status = self.execution.status.as_str(),
            "execution finished"
        );
    }

    /// Output of the execution: outputs of sink nodes (no successors).
    fn sink_outputs(&self) -> Value {
        let mut output = serde_json::Map::new();
        for node in &self.workflow.nodes {
            let is_sink = self.graph.successors_of(&node.id).next().is_none()
                && !self.graph.loop_owner.contains_key(&node.id);
            if is_sink
                && let Some(value) = self.context.node_output(&node.id)
            {
                output.insert(node.id.clone(), value.clone());
            }
        }
        Value::Object(output)
    }

    fn compensation_plan(&self) -> Option<Vec<String>> {
        self.workflow
            .metadata
            .get("compensation_plan")
            .and_then(Value::as_array)
            .map(|plan| {
                plan.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
    }
}

/// Everything a node task needs, cloned out of the coordinator.
struct NodeTaskContext {
    inner: Arc<EngineInner>,
    workflow: Arc<Workflow>,
    graph: Arc<ExecutionGraph>,
    handler: Arc<ErrorHandler>,
    outcome_tx: mpsc::UnboundedSender<NodeOutcome>,
}

async fn run_node_task(
    ctx: NodeTaskContext,
    node: Node,
    mut record: NodeExecution,
    snapshot: Value,
    cancel: CancellationToken,
) {
    let execution_id = record.execution_id;
    let record_key = node.id.clone();

    if cancel.is_cancelled() {
        record.mark_cancelled();
        let _ = ctx
            .inner
            .executions
            .upsert_node_exec(&record_key, &record)
            .await;
        let _ = ctx.outcome_tx.send(NodeOutcome {
            node_id: node.id.clone(),
            record_key,
            record,
            result: TaskResult::Cancelled,
        });
        return;
    }

    let result = match (node.kind, node.control) {
        (NodeKind::Control, Some(ControlKind::Loop)) => {
            run_loop(&ctx, &node, &mut record, snapshot, &cancel).await
        }
        (NodeKind::SubWorkflow, _) => {
            run_sub_workflow(&ctx, &node, &mut record, snapshot, &cancel).await
        }
        _ => {
            record.mark_running();
            let _ = ctx
                .inner
                .executions
                .upsert_node_exec(&record_key, &record)
                .await;
            ctx.inner
                .emitter
                .emit_node(execution_id, &node.id, EventKind::NodeStarted)
                .await;
            run_attempts(&ctx, &node, &record_key, &mut record, &snapshot, &cancel)
                .await
                .map(|output| (output, Vec::new()))
        }
    };

    let result = match result {
        Ok((output, body_outputs)) => TaskResult::Success {
            output,
            body_outputs,
        },
        Err(outcome) => outcome,
    };
    let _ = ctx.outcome_tx.send(NodeOutcome {
        node_id: node.id.clone(),
        record_key,
        record,
        result,
    });
}

/// Run one node through its retry/skip/fallback/compensate policy until a
/// terminal outcome. The record is mutated and persisted along the way.
async fn run_attempts(
    ctx: &NodeTaskContext,
    node: &Node,
    record_key: &str,
    record: &mut NodeExecution,
    snapshot: &Value,
    cancel: &CancellationToken,
) -> Result<Value, TaskResult> {
    let execution_id = record.execution_id;
    let input = match resolve_input(node, snapshot) {
        Ok(input) => input,
        Err(error) => {
            return Err(settle_failure(ctx, node, record_key, record, error).await);
        }
    };
    record.input = Some(input.clone());

    loop {
        let attempt = record.retry_count + 1;
        match invoke_once(ctx, node, input.clone(), snapshot, cancel).await {
            Ok(output) => {
                record.mark_success(output.clone());
                let _ = ctx
                    .inner
                    .executions
                    .upsert_node_exec(record_key, record)
                    .await;
                ctx.inner
                    .emitter
                    .emit_node(execution_id, &node.id, EventKind::NodeCompleted)
                    .await;
                return Ok(output);
            }
            Err(WorkflowError::Cancelled) => {
                record.mark_cancelled();
                let _ = ctx
                    .inner
                    .executions
                    .upsert_node_exec(record_key, record)
                    .await;
                return Err(TaskResult::Cancelled);
            }
            Err(error) => {
                let decision = ctx.handler.decide(node, &error, attempt);
                match decision {
                    Decision::Retry { delay_ms } => {
                        let info = error.to_info(Some(&node.id), record.retry_count);
                        record.mark_retrying(info);
                        let _ = ctx
                            .inner
                            .executions
                            .upsert_node_exec(record_key, record)
                            .await;
                        ctx.inner
                            .emitter
                            .emit(
                                execution_id,
                                Some(&node.id),
                                EventKind::NodeRetrying,
                                json!({ "retry_count": record.retry_count, "delay_ms": delay_ms }),
                            )
                            .await;
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                record.mark_cancelled();
                                let _ = ctx.inner.executions.upsert_node_exec(record_key, record).await;
                                return Err(TaskResult::Cancelled);
                            }
                            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                        }
                        record.mark_running();
                        let _ = ctx
                            .inner
                            .executions
                            .upsert_node_exec(record_key, record)
                            .await;
                    }
                    Decision::Skip => {
                        record.error = Some(error.to_info(Some(&node.id), record.retry_count));
                        record.mark_skipped();
                        let _ = ctx
                            .inner
                            .executions
                            .upsert_node_exec(record_key, record)
                            .await;
                        ctx.inner
                            .emitter
                            .emit_node(execution_id, &node.id, EventKind::NodeSkipped)
                            .await;
                        return Err(TaskResult::Skipped);
                    }
                    Decision::Fallback {
                        target,
                        default_output,
                    } => {
                        if let Some(output) = default_output {
                            record.mark_success(output.clone());
                            let _ = ctx
                                .inner
                                .executions
                                .upsert_node_exec(record_key, record)
                                .await;
                            ctx.inner
                                .emitter
                                .emit_node(execution_id, &node.id, EventKind::NodeCompleted)
                                .await;
                            return Ok(output);
                        }
                        let fallback = target.as_deref().and_then(|id| ctx.workflow.node(id));
                        match fallback {
                            Some(fallback_node) => {
                                debug!(node_id = %node.id, fallback = %fallback_node.id, "degrading to fallback node");
                                match invoke_once(ctx, fallback_node, input.clone(), snapshot, cancel)
                                    .await
                                {
                                    Ok(output) => {
                                        record.mark_success(output.clone());
                                        let _ = ctx
                                            .inner
                                            .executions
                                            .upsert_node_exec(record_key, record)
                                            .await;
                                        ctx.inner
                                            .emitter
                                            .emit_node(
                                                execution_id,
                                                &node.id,
                                                EventKind::NodeCompleted,
                                            )
                                            .await;
                                        return Ok(output);
                                    }
                                    Err(fallback_error) => {
                                        return Err(settle_failure(
                                            ctx,
                                            node,
                                            record_key,
                                            record,
                                            fallback_error,
                                        )
                                        .await);
                                    }
                                }
                            }
                            None => {
                                return Err(settle_failure(
                                    ctx, node, record_key, record, error,
                                )
                                .await);
                            }
                        }
                    }
                    Decision::Compensate { strategy } => {
                        let info = error.to_info(Some(&node.id), record.retry_count);
                        record.mark_failed(info.clone());
                        let _ = ctx
                            .inner
                            .executions
                            .upsert_node_exec(record_key, record)
                            .await;
                        ctx.inner
                            .emitter
                            .emit(
                                execution_id,
                                Some(&node.id),
                                EventKind::NodeFailed,
                                serde_json::to_value(&info).unwrap_or(Value::Null),
                            )
                            .await;
                        return Err(TaskResult::Compensate {
                            strategy,
                            error: info,
                        });
                    }
                    Decision::Escalate => {
                        return Err(
                            settle_failure(ctx, node, record_key, record, error).await
                        );
                    }
                }
            }
        }
    }
}

async fn settle_failure(
    ctx: &NodeTaskContext,
    node: &Node,
    record_key: &str,
    record: &mut NodeExecution,
    error: WorkflowError,
) -> TaskResult {
    if matches!(error, WorkflowError::Cancelled) {
        record.mark_cancelled();
        let _ = ctx
            .inner
            .executions
            .upsert_node_exec(record_key, record)
            .await;
        return TaskResult::Cancelled;
    }
    let info = error.to_info(Some(&node.id), record.retry_count);
    record.mark_failed(info.clone());
    let _ = ctx
        .inner
        .executions
        .upsert_node_exec(record_key, record)
        .await;
    ctx.inner
        .emitter
        .emit(
            record.execution_id,
            Some(&node.id),
            EventKind::NodeFailed,
            serde_json::to_value(&info).unwrap_or(Value::Null),
        )
        .await;
    warn!(node_id = %node.id, error = %info.message, "node failed");
    TaskResult::Failed { error: info }
}

fn resolve_input(node: &Node, snapshot: &Value) -> Result<Value, WorkflowError> {
    let mut bindings = HashMap::new();
    for (key, raw) in &node.input_bindings {
        let template = Template::parse(raw).map_err(|e| WorkflowError::Template(e.to_string()))?;
        bindings.insert(key.clone(), template);
    }
    resolve_bindings(&bindings, snapshot)
}

/// One attempt: circuit-breaker admission, capability dispatch, and an
/// engine-enforced deadline raced against the executor.
async fn invoke_once(
    ctx: &NodeTaskContext,
    node: &Node,
    input: Value,
    snapshot: &Value,
    cancel: &CancellationToken,
) -> Result<Value, WorkflowError> {
    let resource_key = node.resource_key().map(str::to_string);
    if let Some(key) = &resource_key {
        ctx.inner.breakers.check(key)?;
    }

    let timeout_ms = node
        .timeout_ms
        .unwrap_or(ctx.inner.config.default_node_timeout_ms);
    let result = if timeout_ms == 0 {
        Err(WorkflowError::Timeout {
            node_id: node.id.clone(),
            timeout_ms,
        })
    } else {
        let executor = ctx.executors_for(node)?;
        let exec_ctx = ExecutorContext {
            snapshot: snapshot.clone(),
            cancellation: cancel.clone(),
            deadline: Some(Duration::from_millis(timeout_ms)),
        };
        let fut = executor.execute(node, input, &exec_ctx);
        tokio::select! {
            _ = cancel.cancelled() => Err(WorkflowError::Cancelled),
            outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), fut) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(WorkflowError::Timeout {
                        node_id: node.id.clone(),
                        timeout_ms,
                    }),
                }
            }
        }
    };

    if let Some(key) = &resource_key {
        match &result {
            Ok(_) => ctx.inner.breakers.record_success(key),
            Err(WorkflowError::CircuitOpen { .. }) | Err(WorkflowError::Cancelled) => {}
            Err(_) => ctx.inner.breakers.record_failure(key),
        }
    }
    result
}

impl NodeTaskContext {
    fn executors_for(&self, node: &Node) -> Result<Arc<dyn NodeExecutor>, WorkflowError> {
        self.inner.executors.get(node.kind).ok_or_else(|| {
            WorkflowError::Internal(format!(
                "no executor registered for kind '{}'",
                node.kind.as_str()
            ))
        })
    }
}

/// Drive a loop node: iterate the body sub-region until the termination
/// condition holds, bounded by the iteration cap. Each iteration creates
/// fresh node-execution records keyed `node_id#iteration`.
async fn run_loop(
    ctx: &NodeTaskContext,
    node: &Node,
    record: &mut NodeExecution,
    snapshot: Value,
    cancel: &CancellationToken,
) -> Result<(Value, Vec<(String, Value)>), TaskResult> {
    let execution_id = record.execution_id;
    record.mark_running();
    let _ = ctx.inner.executions.upsert_node_exec(&node.id, record).await;
    ctx.inner
        .emitter
        .emit_node(execution_id, &node.id, EventKind::NodeStarted)
        .await;

    let loop_kind: Option<LoopKind> = node
        .config
        .get("loop_kind")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok());
    let Some(loop_kind) = loop_kind else {
        let error = WorkflowError::Internal(format!("loop '{}' missing loop_kind", node.id));
        return Err(settle_failure(ctx, node, &node.id, record, error).await);
    };
    let cap = node
        .config
        .get("max_iterations")
        .and_then(Value::as_u64)
        .unwrap_or(ctx.inner.config.max_loop_iterations)
        .min(ctx.inner.config.max_loop_iterations);

    let body_order = ctx
        .graph
        .loop_bodies
        .get(&node.id)
        .cloned()
        .unwrap_or_default();

    let condition = match loop_kind {
        LoopKind::While => {
            let raw = node.config_str("condition").unwrap_or("false");
            match Condition::parse(raw) {
                Ok(condition) => Some(condition),
                Err(e) => {
                    let error = WorkflowError::Template(e.to_string());
                    return Err(settle_failure(ctx, node, &node.id, record, error).await);
                }
            }
        }
        _ => None,
    };
    let items: Vec<Value> = match loop_kind {
        LoopKind::ForEach => {
            let raw = node.config_str("items").unwrap_or("");
            let resolved = Template::parse(raw)
                .and_then(|t| t.resolve(&snapshot))
                .map_err(|e| WorkflowError::Template(e.to_string()));
            match resolved {
                Ok(Value::Array(items)) => items,
                Ok(other) => {
                    let error = WorkflowError::Template(format!(
                        "for_each items resolved to a non-array: {other}"
                    ));
                    return Err(settle_failure(ctx, node, &node.id, record, error).await);
                }
                Err(error) => {
                    return Err(settle_failure(ctx, node, &node.id, record, error).await);
                }
            }
        }
        _ => Vec::new(),
    };
    let count = node.config.get("iterations").and_then(Value::as_u64).unwrap_or(0);

    // Iterations mutate a local copy of the snapshot; the coordinator
    // merges committed body outputs when the loop succeeds.
    let mut local = snapshot;
    let mut body_outputs: HashMap<String, Value> = HashMap::new();
    let mut iteration: u64 = 0;

    loop {
        if iteration >= cap {
            break;
        }
        let proceed = match loop_kind {
            LoopKind::While => {
                let condition = condition.as_ref().expect("while loop has condition");
                match condition.eval_bool(&local) {
                    Ok(proceed) => proceed,
                    Err(e) => {
                        let error = WorkflowError::Template(e.to_string());
                        return Err(settle_failure(ctx, node, &node.id, record, error).await);
                    }
                }
            }
            LoopKind::ForEach => (iteration as usize) < items.len(),
            LoopKind::Count => iteration < count,
        };
        if !proceed {
            break;
        }

        let scope = match loop_kind {
            LoopKind::ForEach => json!({
                "item": &items[iteration as usize],
                "index": iteration,
            }),
            _ => json!({ "index": iteration }),
        };
        if let Some(map) = local.as_object_mut() {
            map.insert("loop".to_string(), scope);
        }

        for body_id in &body_order {
            if cancel.is_cancelled() {
                record.mark_cancelled();
                let _ = ctx.inner.executions.upsert_node_exec(&node.id, record).await;
                return Err(TaskResult::Cancelled);
            }
            let Some(body_node) = ctx.workflow.node(body_id) else {
                continue;
            };
            let record_key = format!("{body_id}#{iteration}");
            let mut body_record = NodeExecution::new(execution_id, body_id.clone());
            body_record.mark_ready();
            body_record.mark_running();
            let _ = ctx
                .inner
                .executions
                .upsert_node_exec(&record_key, &body_record)
                .await;
            ctx.inner
                .emitter
                .emit(
                    execution_id,
                    Some(body_id),
                    EventKind::NodeStarted,
                    json!({ "iteration": iteration }),
                )
                .await;

            let attempt =
                run_attempts(ctx, body_node, &record_key, &mut body_record, &local, cancel).await;
            match attempt {
                Ok(output) => {
                    if let Some(nodes) = local.get_mut("nodes").and_then(Value::as_object_mut) {
                        nodes.insert(body_id.clone(), json!({ "output": output }));
                    }
                    body_outputs.insert(body_id.clone(), output);
                }
                Err(TaskResult::Skipped) => {
                    if let Some(nodes) = local.get_mut("nodes").and_then(Value::as_object_mut) {
                        nodes.insert(body_id.clone(), json!({ "output": {} }));
                    }
                }
                Err(failure) => {
                    // Body failure fails the loop node with the same
                    // terminal outcome.
                    let info = body_record
                        .error
                        .clone()
                        .unwrap_or_else(|| {
                            WorkflowError::Internal("loop body failed".into())
                                .to_info(Some(body_id), 0)
                        });
                    record.mark_failed(info);
                    let _ = ctx.inner.executions.upsert_node_exec(&node.id, record).await;
                    ctx.inner
                        .emitter
                        .emit_node(execution_id, &node.id, EventKind::NodeFailed)
                        .await;
                    return Err(failure);
                }
            }
        }
        iteration += 1;
    }

    if let Some(map) = local.as_object_mut() {
        map.remove("loop");
    }
    let output = json!({ "iterations": iteration });
    record.mark_success(output.clone());
    let _ = ctx.inner.executions.upsert_node_exec(&node.id, record).await;
    ctx.inner
        .emitter
        .emit_node(execution_id, &node.id, EventKind::NodeCompleted)
        .await;
    Ok((output, body_outputs.into_iter().collect()))
}

/// Run a child workflow to completion under this node's timeout and
/// cancellation token.
async fn run_sub_workflow(
    ctx: &NodeTaskContext,
    node: &Node,
    record: &mut NodeExecution,
    snapshot: Value,
    cancel: &CancellationToken,
) -> Result<(Value, Vec<(String, Value)>), TaskResult> {
    let execution_id = record.execution_id;
    record.mark_running();
    let _ = ctx.inner.executions.upsert_node_exec(&node.id, record).await;
    ctx.inner
        .emitter
        .emit_node(execution_id, &node.id, EventKind::NodeStarted)
        .await;

    let child = match load_child_workflow(ctx, node).await {
        Ok(child) => child,
        Err(error) => return Err(settle_failure(ctx, node, &node.id, record, error).await),
    };
    let input = match resolve_input(node, &snapshot) {
        Ok(input) => input,
        Err(error) => return Err(settle_failure(ctx, node, &node.id, record, error).await),
    };

    let spawned = ctx
        .inner
        .clone()
        .spawn_execution(
            Arc::new(child),
            input,
            Some(execution_id),
            TriggerType::SubWorkflow,
            Some(cancel.clone()),
        )
        .await;
    let (child_id, mut status_rx) = match spawned {
        Ok(pair) => pair,
        Err(error) => return Err(settle_failure(ctx, node, &node.id, record, error).await),
    };

    let timeout_ms = node
        .timeout_ms
        .unwrap_or(ctx.inner.config.default_node_timeout_ms);
    let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
    tokio::pin!(deadline);
    let final_status = loop {
        let status = *status_rx.borrow();
        if status.is_terminal() {
            break status;
        }
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break *status_rx.borrow();
                }
            }
            _ = &mut deadline => {
                let error = WorkflowError::Timeout { node_id: node.id.clone(), timeout_ms };
                return Err(settle_failure(ctx, node, &node.id, record, error).await);
            }
            _ = cancel.cancelled() => {
                record.mark_cancelled();
                let _ = ctx.inner.executions.upsert_node_exec(&node.id, record).await;
                return Err(TaskResult::Cancelled);
            }
        }
    };

    match final_status {
        ExecutionStatus::Completed => {
            let output = ctx
                .inner
                .executions
                .load_execution(child_id)
                .await
                .ok()
                .flatten()
                .and_then(|r| r.execution)
                .and_then(|e| e.output)
                .unwrap_or(Value::Null);
            record.mark_success(output.clone());
            let _ = ctx.inner.executions.upsert_node_exec(&node.id, record).await;
            ctx.inner
                .emitter
                .emit_node(execution_id, &node.id, EventKind::NodeCompleted)
                .await;
            Ok((output, Vec::new()))
        }
        ExecutionStatus::Cancelled => {
            record.mark_cancelled();
            let _ = ctx.inner.executions.upsert_node_exec(&node.id, record).await;
            Err(TaskResult::Cancelled)
        }
        _ => {
            let error = WorkflowError::Internal(format!(
                "sub-workflow '{child_id}' finished with status '{}'",
                final_status.as_str()
            ));
            Err(settle_failure(ctx, node, &node.id, record, error).await)
        }
    }
}

async fn load_child_workflow(
    ctx: &NodeTaskContext,
    node: &Node,
) -> Result<Workflow, WorkflowError> {
    if let Some(workflow_id) = node.config_str("workflow_id") {
        return ctx
            .inner
            .workflows
            .load_by_id(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()));
    }
    let name = node
        .config_str("workflow")
        .ok_or_else(|| WorkflowError::Internal(format!("node '{}' names no workflow", node.id)))?;
    let version = node.config_str("workflow_version").unwrap_or("1.0.0");
    ctx.inner
        .workflows
        .load_by_name_version(name, version)
        .await?
        .ok_or_else(|| WorkflowError::WorkflowNotFound(format!("{name}@{version}")))
}
