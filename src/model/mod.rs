//! Domain model: immutable definitions and mutable execution records.

pub mod execution;
pub mod workflow;

pub use execution::{
    AttemptRecord, EventKind, ExecutionEvent, ExecutionStatus, NodeExecution, NodeStatus,
    StateMachineInstance, TransitionRecord, TriggerType, WorkflowExecution,
};
pub use workflow::{
    Action, Backoff, CompensationSpec, CompensationStrategy, ControlKind, Edge, EdgeKind,
    ErrorHandlerRule, ErrorPolicy, JoinMode, LoopKind, Node, NodeKind, Reducer, RetryPolicy,
    StateDefinition, StateKind, Transition, Workflow, WorkflowKind,
};
