//! Persistence seams consumed by the engines.
//!
//! The core requires read-after-write consistency within a single
//! execution's records; the SQL-backed implementations live out of tree.

pub mod memory;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::errors::WorkflowError;
use crate::model::{
    ExecutionEvent, ExecutionStatus, NodeExecution, Workflow, WorkflowExecution,
};

pub use memory::{MemoryExecutionRepo, MemoryWorkflowRepo};

pub type StorageResult<T> = Result<T, WorkflowError>;

pub trait WorkflowRepo: Send + Sync {
    fn save<'a>(&'a self, workflow: &'a Workflow) -> BoxFuture<'a, StorageResult<()>>;

    fn load_by_id<'a>(&'a self, workflow_id: &'a str)
    -> BoxFuture<'a, StorageResult<Option<Workflow>>>;

    fn load_by_name_version<'a>(
        &'a self,
        name: &'a str,
        version: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Workflow>>>;

    fn list<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<Workflow>>>;

    fn delete<'a>(&'a self, workflow_id: &'a str) -> BoxFuture<'a, StorageResult<()>>;
}

pub trait ExecutionRepo: Send + Sync {
    fn create<'a>(&'a self, execution: &'a WorkflowExecution) -> BoxFuture<'a, StorageResult<()>>;

    fn update_execution<'a>(
        &'a self,
        execution: &'a WorkflowExecution,
    ) -> BoxFuture<'a, StorageResult<()>>;

    /// Insert-or-update one node execution record, keyed by its record key
    /// (`node_id`, or `node_id#iteration` inside loops).
    fn upsert_node_exec<'a>(
        &'a self,
        key: &'a str,
        node_exec: &'a NodeExecution,
    ) -> BoxFuture<'a, StorageResult<()>>;

    /// Append an audit event. Duplicate `(execution_id, event_seq)` pairs
    /// must be ignored.
    fn append_event<'a>(&'a self, event: &'a ExecutionEvent) -> BoxFuture<'a, StorageResult<()>>;

    fn load_execution<'a>(
        &'a self,
        execution_id: Uuid,
    ) -> BoxFuture<'a, StorageResult<Option<ExecutionRecord>>>;

    fn list_by_status<'a>(
        &'a self,
        status: ExecutionStatus,
    ) -> BoxFuture<'a, StorageResult<Vec<WorkflowExecution>>>;
}

/// Everything persisted for one execution.
#[derive(Clone, Debug, Default)]
pub struct ExecutionRecord {
    pub execution: Option<WorkflowExecution>,
    pub node_execs: Vec<(String, NodeExecution)>,
    pub events: Vec<ExecutionEvent>,
}
