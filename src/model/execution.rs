//! Mutable execution records: one per workflow invocation, one per node
//! attempt stream, plus the append-only event log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::ErrorInfo;

/// Execution-level lifecycle status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    Compensating,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Suspended => "suspended",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Compensating => "compensating",
        }
    }
}

/// Node-level lifecycle status.
///
/// Legal transitions: `waiting -> ready -> running -> (success | failed |
/// cancelled)`, `running -> retrying -> running`, `waiting -> skipped`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Waiting,
    Ready,
    Running,
    Success,
    Failed,
    Skipped,
    Retrying,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }

    /// Terminal outcomes that satisfy a downstream dependency.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Skipped)
    }
}

/// Timing of one node attempt, kept for audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorInfo>,
}

/// One node's execution within a workflow execution. Loop iterations get
/// fresh records keyed `node_id#iteration`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: NodeStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub retry_count: u32,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub attempt_history: Vec<AttemptRecord>,
}

impl NodeExecution {
    pub fn new(execution_id: Uuid, node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.into(),
            status: NodeStatus::Waiting,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
            start_ts: None,
            end_ts: None,
            attempt_history: Vec::new(),
        }
    }

    pub fn mark_ready(&mut self) {
        self.status = NodeStatus::Ready;
    }

    pub fn mark_running(&mut self) {
        self.status = NodeStatus::Running;
        if self.start_ts.is_none() {
            self.start_ts = Some(Utc::now());
        }
        self.attempt_history.push(AttemptRecord {
            attempt: self.retry_count + 1,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        });
    }

    pub fn mark_retrying(&mut self, error: ErrorInfo) {
        self.status = NodeStatus::Retrying;
        self.retry_count += 1;
        if let Some(attempt) = self.attempt_history.last_mut() {
            attempt.ended_at = Some(Utc::now());
            attempt.error = Some(error);
        }
    }

    /// Output must be written before the success transition; enforced here
    /// by taking the output as a parameter.
    pub fn mark_success(&mut self, output: Value) {
        self.output = Some(output);
        self.status = NodeStatus::Success;
        self.end_ts = Some(Utc::now());
        if let Some(attempt) = self.attempt_history.last_mut() {
            attempt.ended_at = Some(Utc::now());
        }
    }

    pub fn mark_failed(&mut self, error: ErrorInfo) {
        if let Some(attempt) = self.attempt_history.last_mut() {
            attempt.ended_at = Some(Utc::now());
            attempt.error = Some(error.clone());
        }
        self.error = Some(error);
        self.status = NodeStatus::Failed;
        self.end_ts = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self) {
        self.status = NodeStatus::Skipped;
        self.end_ts = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = NodeStatus::Cancelled;
        self.end_ts = Some(Utc::now());
    }
}

/// How an execution was triggered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Schedule,
    Event,
    SubWorkflow,
}

/// One invocation of a workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_version: String,
    pub parent_execution_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub trigger_type: TriggerType,
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        workflow_version: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            workflow_version: workflow_version.into(),
            parent_execution_id: None,
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error: None,
            start_ts: None,
            end_ts: None,
            trigger_type: TriggerType::Manual,
            created_at: Utc::now(),
        }
    }

    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.start_ts = Some(Utc::now());
    }

    pub fn complete(&mut self, output: Option<Value>) {
        self.status = ExecutionStatus::Completed;
        self.output = output;
        self.end_ts = Some(Utc::now());
    }

    pub fn fail(&mut self, error: ErrorInfo) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
        self.end_ts = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = ExecutionStatus::Cancelled;
        self.end_ts = Some(Utc::now());
    }
}

/// Lifecycle event names emitted by the engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionCreated,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionSuspended,
    ExecutionResumed,
    ExecutionCancelled,
    NodeReady,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeRetrying,
    NodeSkipped,
    TransitionFired,
    TransitionAborted,
    EventUnhandled,
    OnEnterFailed,
    InstanceCompleted,
    CompensationStarted,
    CompensationCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ExecutionCreated => "execution.created",
            EventKind::ExecutionStarted => "execution.started",
            EventKind::ExecutionCompleted => "execution.completed",
            EventKind::ExecutionFailed => "execution.failed",
            EventKind::ExecutionSuspended => "execution.suspended",
            EventKind::ExecutionResumed => "execution.resumed",
            EventKind::ExecutionCancelled => "execution.cancelled",
            EventKind::NodeReady => "node.ready",
            EventKind::NodeStarted => "node.started",
            EventKind::NodeCompleted => "node.completed",
            EventKind::NodeFailed => "node.failed",
            EventKind::NodeRetrying => "node.retrying",
            EventKind::NodeSkipped => "node.skipped",
            EventKind::TransitionFired => "transition.fired",
            EventKind::TransitionAborted => "transition.aborted",
            EventKind::EventUnhandled => "event.unhandled",
            EventKind::OnEnterFailed => "on_enter.failed",
            EventKind::InstanceCompleted => "instance.completed",
            EventKind::CompensationStarted => "compensation.started",
            EventKind::CompensationCompleted => "compensation.completed",
        }
    }

    pub fn is_node_event(&self) -> bool {
        matches!(
            self,
            EventKind::NodeReady
                | EventKind::NodeStarted
                | EventKind::NodeCompleted
                | EventKind::NodeFailed
                | EventKind::NodeRetrying
                | EventKind::NodeSkipped
        )
    }
}

/// Append-only audit record. Ordered within an execution by `event_seq`;
/// consumers deduplicate on `(execution_id, event_seq)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: Option<String>,
    pub event_type: EventKind,
    pub event_seq: u64,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

/// One committed state-machine transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: String,
    pub event: String,
    pub to: String,
    pub ts: DateTime<Utc>,
    pub payload: Value,
}

/// Live state of one state-machine instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMachineInstance {
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub current_state: String,
    pub context: HashMap<String, Value>,
    pub history: Vec<TransitionRecord>,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StateMachineInstance {
    pub fn new(workflow_id: impl Into<String>, initial_state: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            current_state: initial_state.into(),
            context: HashMap::new(),
            history: Vec::new(),
            is_final: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_transition(&mut self, from: String, event: String, to: String, payload: Value) {
        self.history.push(TransitionRecord {
            from,
            event,
            to: to.clone(),
            ts: Utc::now(),
            payload,
        });
        self.current_state = to;
        self.updated_at = Utc::now();
    }
}
