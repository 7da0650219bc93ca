//! Skein - a workflow execution core.
//!
//! Orchestrates heterogeneous work items (agent calls, tool invocations,
//! control flow) over a DAG or state-machine topology. The key components
//! are:
//!
//! ## Definitions
//!
//! - [`parser`]: YAML/JSON parsing plus structural validation (unique ids,
//!   acyclicity, reference resolution)
//! - [`graph`]: precomputed adjacency, topological layers, and
//!   parallel-eligible groups
//!
//! ## Execution
//!
//! - [`engine`]: the DAG engine - lifecycle, ready-set propagation,
//!   control nodes, retries, timeouts, suspend/resume/cancel
//! - [`state_machine`]: event-driven transitions with entry/exit hooks
//! - [`scheduler`]: priority queue, concurrency quotas, token-bucket rate
//!   limiting
//!
//! ## Failure handling
//!
//! - [`error_handler`]: retry/skip/fallback/compensate/escalate policies
//!   and per-resource circuit breakers
//! - [`compensation`]: Saga-style rollback over a per-execution log

pub mod adapters;
pub mod bus;
pub mod compensation;
pub mod config;
pub mod context;
pub mod engine;
pub mod error_handler;
pub mod errors;
pub mod events;
pub mod graph;
pub mod model;
pub mod observability;
pub mod parser;
pub mod scheduler;
pub mod state_machine;
pub mod storage;
pub mod template;

// Configuration
pub use config::EngineConfig;
pub use observability::init_tracing;

// Errors
pub use errors::{AgentErrorKind, ErrorInfo, ToolErrorKind, ValidationError, WorkflowError};

// Domain model
pub use model::{
    Action, Backoff, CompensationSpec, CompensationStrategy, ControlKind, Edge, EdgeKind,
    ErrorHandlerRule, ErrorPolicy, EventKind, ExecutionEvent, ExecutionStatus, JoinMode, LoopKind,
    Node, NodeExecution, NodeKind, NodeStatus, Reducer, RetryPolicy, StateDefinition, StateKind,
    StateMachineInstance, Transition, TriggerType, Workflow, WorkflowExecution, WorkflowKind,
};

// Parsing & graph preparation
pub use graph::ExecutionGraph;
pub use parser::WorkflowParser;

// Templates & context
pub use context::ExecutionContext;
pub use template::{Condition, PathExpr, Template, TemplateError};

// Engines
pub use engine::{ExecutorContext, ExecutorRegistry, NodeExecutor, WorkflowEngine};
pub use state_machine::{ProcessOutcome, StateMachineEngine};

// Scheduling
pub use scheduler::{
    RateLimitConfig, RateLimiter, ResourceLimits, ScheduledTask, SchedulerStats, TaskClaims,
    TaskScheduler,
};

// Failure handling
pub use compensation::{
    CompensationEntry, CompensationManager, CompensationReport, EntryOutcome, FailureMode,
};
pub use error_handler::{
    CircuitBreakerConfig, CircuitBreakerRegistry, Decision, ErrorHandler,
};

// Adapter seams
pub use adapters::{
    AgentFn, AgentResponse, AgentRuntime, InvokeOptions, StaticAgentRuntime, StaticToolRegistry,
    ToolFn, ToolRegistry,
};
pub use bus::{BusEvent, BusHandler, EventBus, MemoryEventBus};
pub use events::EventEmitter;
pub use storage::{
    ExecutionRecord, ExecutionRepo, MemoryExecutionRepo, MemoryWorkflowRepo, WorkflowRepo,
};
