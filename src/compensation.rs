//! Saga-style compensation.
//!
//! As nodes commit `success`, the engine appends an entry to the
//! per-execution compensation log. On a compensate trigger the log runs in
//! reverse completion order (or per a named strategy), each entry with its
//! own timeout and best-effort retry budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::ToolRegistry;
use crate::errors::WorkflowError;
use crate::model::CompensationStrategy;

/// Handler for a named compensating action.
pub type CompensationHandler =
    Arc<dyn Fn(CompensationEntry) -> BoxFuture<'static, Result<Value, WorkflowError>> + Send + Sync>;

/// One recorded compensating action, appended when its node committed
/// `success`.
#[derive(Clone, Debug)]
pub struct CompensationEntry {
    pub node_id: String,
    pub action: String,
    pub input: Value,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Terminal outcome of one entry.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryOutcome {
    Success,
    Failed(String),
    Skipped,
}

/// Result of a full compensation run. `success` iff every executed entry
/// succeeded.
#[derive(Clone, Debug, Default)]
pub struct CompensationReport {
    pub success: bool,
    pub outcomes: Vec<(String, EntryOutcome)>,
}

/// What to do when one compensating action fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Log the failure and keep unwinding.
    #[default]
    ContinueOnError,
    /// Stop and surface; remaining entries are recorded as skipped.
    AbortOnError,
}

pub struct CompensationManager {
    logs: Mutex<HashMap<Uuid, Vec<CompensationEntry>>>,
    handlers: Mutex<HashMap<String, CompensationHandler>>,
    tools: Arc<dyn ToolRegistry>,
    failure_mode: FailureMode,
}

impl CompensationManager {
    pub fn new(tools: Arc<dyn ToolRegistry>, failure_mode: FailureMode) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            tools,
            failure_mode,
        }
    }

    /// Register a named compensating action. Actions without a registered
    /// handler fall back to tool invocation with the action as tool id.
    pub fn register_handler(&self, action: impl Into<String>, handler: CompensationHandler) {
        self.handlers
            .lock()
            .expect("compensation handler lock")
            .insert(action.into(), handler);
    }

    /// Append an entry; must be called on commit of the node's `success`,
    /// never at dispatch.
    pub fn record(&self, execution_id: Uuid, entry: CompensationEntry) {
        self.logs
            .lock()
            .expect("compensation log lock")
            .entry(execution_id)
            .or_default()
            .push(entry);
    }

    /// Entries recorded so far, in completion order.
    pub fn log_for(&self, execution_id: Uuid) -> Vec<CompensationEntry> {
        self.logs
            .lock()
            .expect("compensation log lock")
            .get(&execution_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self, execution_id: Uuid) {
        self.logs
            .lock()
            .expect("compensation log lock")
            .remove(&execution_id);
    }

    /// Run the recorded log. `plan` orders a `custom_plan` run by node id;
    /// ids absent from the log are ignored.
    pub async fn compensate(
        &self,
        execution_id: Uuid,
        strategy: CompensationStrategy,
        plan: Option<&[String]>,
    ) -> CompensationReport {
        let recorded = self.log_for(execution_id);
        if recorded.is_empty() {
            return CompensationReport {
                success: true,
                outcomes: Vec::new(),
            };
        }
        info!(
            execution_id = %execution_id,
            entries = recorded.len(),
            strategy = ?strategy,
            "running compensation"
        );

        let ordered: Vec<CompensationEntry> = match strategy {
            CompensationStrategy::SequentialReverse => recorded.into_iter().rev().collect(),
            CompensationStrategy::Parallel => recorded,
            CompensationStrategy::CustomPlan => match plan {
                Some(plan) => plan
                    .iter()
                    .filter_map(|node_id| {
                        recorded.iter().find(|e| &e.node_id == node_id).cloned()
                    })
                    .collect(),
                None => recorded.into_iter().rev().collect(),
            },
        };

        let mut report = CompensationReport {
            success: true,
            outcomes: Vec::new(),
        };

        if strategy == CompensationStrategy::Parallel {
            let runs = ordered.iter().map(|entry| self.run_entry(entry.clone()));
            for (entry, outcome) in ordered.iter().zip(join_all(runs).await) {
                if !matches!(outcome, EntryOutcome::Success) {
                    report.success = false;
                }
                report.outcomes.push((entry.node_id.clone(), outcome));
            }
            return report;
        }

        let mut aborted = false;
        for entry in ordered {
            if aborted {
                report.outcomes.push((entry.node_id, EntryOutcome::Skipped));
                continue;
            }
            let outcome = self.run_entry(entry.clone()).await;
            if !matches!(outcome, EntryOutcome::Success) {
                report.success = false;
                if self.failure_mode == FailureMode::AbortOnError {
                    aborted = true;
                }
            }
            report.outcomes.push((entry.node_id, outcome));
        }
        report
    }

    async fn run_entry(&self, entry: CompensationEntry) -> EntryOutcome {
        let handler = self
            .handlers
            .lock()
            .expect("compensation handler lock")
            .get(&entry.action)
            .cloned();
        let attempts = entry.max_attempts.max(1);
        let timeout = Duration::from_millis(entry.timeout_ms);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let invocation: BoxFuture<'_, Result<Value, WorkflowError>> = match &handler {
                Some(handler) => handler(entry.clone()),
                None => self.tools.invoke_tool(
                    &entry.action,
                    entry.input.clone(),
                    CancellationToken::new(),
                    Some(timeout),
                ),
            };
            match tokio::time::timeout(timeout, invocation).await {
                Ok(Ok(_)) => return EntryOutcome::Success,
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = format!("timed out after {}ms", entry.timeout_ms),
            }
            if attempt < attempts {
                warn!(
                    node_id = %entry.node_id,
                    action = %entry.action,
                    attempt,
                    error = %last_error,
                    "compensating action failed, retrying"
                );
            }
        }
        EntryOutcome::Failed(last_error)
    }
}
