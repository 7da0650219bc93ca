//! In-memory repositories for tests and single-process deployments.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::errors::WorkflowError;
use crate::model::{
    ExecutionEvent, ExecutionStatus, NodeExecution, Workflow, WorkflowExecution,
};

use super::{ExecutionRecord, ExecutionRepo, StorageResult, WorkflowRepo};

#[derive(Default)]
pub struct MemoryWorkflowRepo {
    workflows: Mutex<HashMap<String, Workflow>>,
}

impl MemoryWorkflowRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepo for MemoryWorkflowRepo {
    fn save<'a>(&'a self, workflow: &'a Workflow) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut workflows = self.workflows.lock().expect("workflow repo lock");
            let duplicate = workflows.values().any(|existing| {
                existing.id != workflow.id
                    && existing.name == workflow.name
                    && existing.version == workflow.version
            });
            if duplicate {
                return Err(WorkflowError::Storage(format!(
                    "workflow '{}' version '{}' already exists",
                    workflow.name, workflow.version
                )));
            }
            workflows.insert(workflow.id.clone(), workflow.clone());
            Ok(())
        })
    }

    fn load_by_id<'a>(
        &'a self,
        workflow_id: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Workflow>>> {
        Box::pin(async move {
            let workflows = self.workflows.lock().expect("workflow repo lock");
            Ok(workflows.get(workflow_id).cloned())
        })
    }

    fn load_by_name_version<'a>(
        &'a self,
        name: &'a str,
        version: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Workflow>>> {
        Box::pin(async move {
            let workflows = self.workflows.lock().expect("workflow repo lock");
            Ok(workflows
                .values()
                .find(|w| w.name == name && w.version == version)
                .cloned())
        })
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<Workflow>>> {
        Box::pin(async move {
            let workflows = self.workflows.lock().expect("workflow repo lock");
            Ok(workflows.values().cloned().collect())
        })
    }

    fn delete<'a>(&'a self, workflow_id: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut workflows = self.workflows.lock().expect("workflow repo lock");
            workflows.remove(workflow_id);
            Ok(())
        })
    }
}

#[derive(Default)]
struct ExecutionStore {
    executions: HashMap<Uuid, WorkflowExecution>,
    node_execs: HashMap<Uuid, Vec<(String, NodeExecution)>>,
    events: HashMap<Uuid, Vec<ExecutionEvent>>,
    seen_seqs: HashMap<Uuid, HashSet<u64>>,
}

#[derive(Default)]
pub struct MemoryExecutionRepo {
    store: Mutex<ExecutionStore>,
}

impl MemoryExecutionRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: events recorded for an execution, in append order.
    pub fn events_for(&self, execution_id: Uuid) -> Vec<ExecutionEvent> {
        let store = self.store.lock().expect("execution repo lock");
        store.events.get(&execution_id).cloned().unwrap_or_default()
    }
}

impl ExecutionRepo for MemoryExecutionRepo {
    fn create<'a>(&'a self, execution: &'a WorkflowExecution) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut store = self.store.lock().expect("execution repo lock");
            store
                .executions
                .insert(execution.execution_id, execution.clone());
            Ok(())
        })
    }

    fn update_execution<'a>(
        &'a self,
        execution: &'a WorkflowExecution,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut store = self.store.lock().expect("execution repo lock");
            if !store.executions.contains_key(&execution.execution_id) {
                return Err(WorkflowError::ExecutionNotFound(
                    execution.execution_id.to_string(),
                ));
            }
            store
                .executions
                .insert(execution.execution_id, execution.clone());
            Ok(())
        })
    }

    fn upsert_node_exec<'a>(
        &'a self,
        key: &'a str,
        node_exec: &'a NodeExecution,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut store = self.store.lock().expect("execution repo lock");
            let records = store.node_execs.entry(node_exec.execution_id).or_default();
            match records.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) => *existing = node_exec.clone(),
                None => records.push((key.to_string(), node_exec.clone())),
            }
            Ok(())
        })
    }

    fn append_event<'a>(&'a self, event: &'a ExecutionEvent) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut store = self.store.lock().expect("execution repo lock");
            let seen = store.seen_seqs.entry(event.execution_id).or_default();
            // Redelivered (execution_id, event_seq) pairs are dropped.
            if !seen.insert(event.event_seq) {
                return Ok(());
            }
            store
                .events
                .entry(event.execution_id)
                .or_default()
                .push(event.clone());
            Ok(())
        })
    }

    fn load_execution<'a>(
        &'a self,
        execution_id: Uuid,
    ) -> BoxFuture<'a, StorageResult<Option<ExecutionRecord>>> {
        Box::pin(async move {
            let store = self.store.lock().expect("execution repo lock");
            let Some(execution) = store.executions.get(&execution_id) else {
                return Ok(None);
            };
            Ok(Some(ExecutionRecord {
                execution: Some(execution.clone()),
                node_execs: store
                    .node_execs
                    .get(&execution_id)
                    .cloned()
                    .unwrap_or_default(),
                events: store.events.get(&execution_id).cloned().unwrap_or_default(),
            }))
        })
    }

    fn list_by_status<'a>(
        &'a self,
        status: ExecutionStatus,
    ) -> BoxFuture<'a, StorageResult<Vec<WorkflowExecution>>> {
        Box::pin(async move {
            let store = self.store.lock().expect("execution repo lock");
            Ok(store
                .executions
                .values()
                .filter(|e| e.status == status)
                .cloned()
                .collect())
        })
    }
}
