//! State-machine engine: event intake, guarded transition selection, and
//! the exit/transition/enter action sequence.
//!
//! Events for one instance are serialized behind a per-instance mutex;
//! different instances process concurrently. An on-exit failure aborts the
//! transition with the state unchanged; once the state is committed,
//! on-enter failures are surfaced but do not roll back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{AgentRuntime, InvokeOptions, ToolRegistry};
use crate::bus::{EventBus, STATE_MACHINE_TOPIC};
use crate::errors::WorkflowError;
use crate::events::EventEmitter;
use crate::model::{
    Action, EventKind, StateDefinition, StateKind, StateMachineInstance, Transition, Workflow,
};
use crate::template::{Condition, Template};

/// Result of processing one event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessOutcome {
    /// A transition fired and the state was committed.
    Transitioned {
        from: String,
        to: String,
        is_final: bool,
    },
    /// No transition matched (unknown event or all guards false); the
    /// instance is unchanged.
    Unhandled,
    /// An on-exit action failed; the transition was abandoned with the
    /// state unchanged.
    Aborted { from: String, error: String },
}

pub struct StateMachineEngine {
    workflows: Mutex<HashMap<String, Arc<Workflow>>>,
    instances: Mutex<HashMap<Uuid, StateMachineInstance>>,
    instance_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    timers: Mutex<HashMap<(Uuid, String), JoinHandle<()>>>,
    agents: Arc<dyn AgentRuntime>,
    tools: Arc<dyn ToolRegistry>,
    bus: Arc<dyn EventBus>,
    emitter: EventEmitter,
}

impl StateMachineEngine {
    pub fn new(
        agents: Arc<dyn AgentRuntime>,
        tools: Arc<dyn ToolRegistry>,
        bus: Arc<dyn EventBus>,
        emitter: EventEmitter,
    ) -> Arc<Self> {
        Arc::new(Self {
            workflows: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            instance_locks: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            agents,
            tools,
            bus,
            emitter,
        })
    }

    /// Register a validated state-machine workflow definition.
    pub fn register_workflow(&self, workflow: Workflow) -> Result<(), WorkflowError> {
        if !workflow.has_states() {
            return Err(WorkflowError::Internal(format!(
                "workflow '{}' has no states",
                workflow.name
            )));
        }
        info!(workflow_id = %workflow.id, name = %workflow.name, "state machine registered");
        self.workflows
            .lock()
            .expect("state machine workflows lock")
            .insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    /// Create an instance in the workflow's initial state and run the
    /// initial state's on-enter actions.
    pub async fn create_instance(
        self: &Arc<Self>,
        workflow_id: &str,
        initial_context: HashMap<String, Value>,
    ) -> Result<Uuid, WorkflowError> {
        let workflow = self.workflow(workflow_id)?;
        let initial = initial_state(&workflow).ok_or_else(|| {
            WorkflowError::Internal(format!("workflow '{workflow_id}' has no initial state"))
        })?;
        let mut instance = StateMachineInstance::new(workflow_id, &initial.name);
        instance.context = initial_context;
        let instance_id = instance.instance_id;

        if !initial.on_enter.is_empty() {
            let mut context = instance.context.clone();
            if let Err(err) = self
                .run_actions(&initial.on_enter, &mut context, instance_id)
                .await
            {
                warn!(instance_id = %instance_id, error = %err, "initial on_enter action failed");
            }
            instance.context = context;
        }
        self.instances
            .lock()
            .expect("state machine instances lock")
            .insert(instance_id, instance);
        debug!(instance_id = %instance_id, state = %initial.name, "instance created");
        Ok(instance_id)
    }

    pub fn instance(&self, instance_id: Uuid) -> Option<StateMachineInstance> {
        self.instances
            .lock()
            .expect("state machine instances lock")
            .get(&instance_id)
            .cloned()
    }

    /// Process one event against an instance. Events for the same
    /// instance are totally ordered.
    pub async fn process_event(
        self: &Arc<Self>,
        instance_id: Uuid,
        event: &str,
        payload: Value,
    ) -> Result<ProcessOutcome, WorkflowError> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        let instance = self
            .instance(instance_id)
            .ok_or_else(|| WorkflowError::ExecutionNotFound(instance_id.to_string()))?;
        let workflow = self.workflow(&instance.workflow_id)?;
        let current = workflow.state(&instance.current_state).ok_or_else(|| {
            WorkflowError::StateTransition {
                from: instance.current_state.clone(),
                message: "current state is not declared".into(),
            }
        })?;

        // Guards see the stored context plus the incoming payload, but the
        // payload is only committed when a transition fires.
        let mut working = instance.context.clone();
        merge_payload(&mut working, &payload);
        let view = context_view(&working, event, &payload);

        let transition = match select_transition(current, event, &view) {
            Some(transition) => transition.clone(),
            None => {
                debug!(instance_id = %instance_id, event, state = %instance.current_state, "event unhandled");
                self.emitter
                    .emit(
                        instance_id,
                        None,
                        EventKind::EventUnhandled,
                        json!({ "event": event, "state": &instance.current_state }),
                    )
                    .await;
                return Ok(ProcessOutcome::Unhandled);
            }
        };

        // Exit actions first; failure aborts with the state unchanged.
        if let Err(err) = self
            .run_actions(&current.on_exit, &mut working, instance_id)
            .await
        {
            self.emitter
                .emit(
                    instance_id,
                    None,
                    EventKind::TransitionAborted,
                    json!({
                        "from": &instance.current_state,
                        "event": event,
                        "error": err.to_string(),
                    }),
                )
                .await;
            return Ok(ProcessOutcome::Aborted {
                from: instance.current_state.clone(),
                error: err.to_string(),
            });
        }

        if let Err(err) = self
            .run_actions(&transition.actions, &mut working, instance_id)
            .await
        {
            self.emitter
                .emit(
                    instance_id,
                    None,
                    EventKind::TransitionAborted,
                    json!({
                        "from": &instance.current_state,
                        "event": event,
                        "error": err.to_string(),
                    }),
                )
                .await;
            return Ok(ProcessOutcome::Aborted {
                from: instance.current_state.clone(),
                error: err.to_string(),
            });
        }

        // Commit: state, history, and context update atomically under the
        // instance map lock.
        let from = instance.current_state.clone();
        let target = workflow.state(&transition.target).ok_or_else(|| {
            WorkflowError::StateTransition {
                from: from.clone(),
                message: format!("target state '{}' is not declared", transition.target),
            }
        })?;
        {
            let mut instances = self.instances.lock().expect("state machine instances lock");
            let stored = instances
                .get_mut(&instance_id)
                .ok_or_else(|| WorkflowError::ExecutionNotFound(instance_id.to_string()))?;
            stored.context = working.clone();
            stored.record_transition(
                from.clone(),
                event.to_string(),
                transition.target.clone(),
                payload.clone(),
            );
        }
        info!(instance_id = %instance_id, from = %from, to = %transition.target, event, "transition fired");
        self.emitter
            .emit(
                instance_id,
                None,
                EventKind::TransitionFired,
                json!({ "from": &from, "to": &transition.target, "event": event }),
            )
            .await;
        self.bus
            .publish(
                STATE_MACHINE_TOPIC,
                json!({
                    "instance_id": instance_id,
                    "from": &from,
                    "to": &transition.target,
                    "event": event,
                }),
            )
            .await;

        // Enter actions after commit; failures surface but do not roll
        // back the transition.
        if let Err(err) = self
            .run_actions(&target.on_enter, &mut working, instance_id)
            .await
        {
            warn!(instance_id = %instance_id, state = %target.name, error = %err, "on_enter action failed");
            self.emitter
                .emit(
                    instance_id,
                    None,
                    EventKind::OnEnterFailed,
                    json!({ "state": &target.name, "error": err.to_string() }),
                )
                .await;
        }
        {
            let mut instances = self.instances.lock().expect("state machine instances lock");
            if let Some(stored) = instances.get_mut(&instance_id) {
                stored.context = working;
            }
        }

        let is_final = target.kind == StateKind::Final;
        if is_final {
            {
                let mut instances = self.instances.lock().expect("state machine instances lock");
                if let Some(stored) = instances.get_mut(&instance_id) {
                    stored.is_final = true;
                }
            }
            self.emitter
                .emit(
                    instance_id,
                    None,
                    EventKind::InstanceCompleted,
                    json!({ "final_state": &target.name }),
                )
                .await;
        }

        Ok(ProcessOutcome::Transitioned {
            from,
            to: transition.target.clone(),
            is_final,
        })
    }

    fn workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>, WorkflowError> {
        self.workflows
            .lock()
            .expect("state machine workflows lock")
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn instance_lock(&self, instance_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.instance_locks
            .lock()
            .expect("instance locks lock")
            .entry(instance_id)
            .or_default()
            .clone()
    }

    async fn run_actions(
        self: &Arc<Self>,
        actions: &[Action],
        context: &mut HashMap<String, Value>,
        instance_id: Uuid,
    ) -> Result<(), WorkflowError> {
        for action in actions {
            self.run_action(action, context, instance_id).await?;
        }
        Ok(())
    }

    async fn run_action(
        self: &Arc<Self>,
        action: &Action,
        context: &mut HashMap<String, Value>,
        instance_id: Uuid,
    ) -> Result<(), WorkflowError> {
        match action {
            Action::Log { level, message } => {
                match level.as_deref() {
                    Some("warn") => warn!(instance_id = %instance_id, "{message}"),
                    Some("debug") => debug!(instance_id = %instance_id, "{message}"),
                    _ => info!(instance_id = %instance_id, "{message}"),
                }
                Ok(())
            }
            Action::SetContext { key, value } => {
                context.insert(key.clone(), value.clone());
                Ok(())
            }
            Action::EmitEvent { topic, payload } => {
                self.bus.publish(topic, payload.clone()).await;
                Ok(())
            }
            Action::InvokeAgent { agent_id, input } => {
                let resolved = resolve_action_input(input, context)?;
                let response = self
                    .agents
                    .invoke_agent(
                        agent_id,
                        resolved,
                        InvokeOptions::default(),
                        CancellationToken::new(),
                        None,
                    )
                    .await?;
                context.insert("last_result".to_string(), response.output);
                Ok(())
            }
            Action::InvokeTool { tool_id, params } => {
                let resolved = resolve_action_input(params, context)?;
                let result = self
                    .tools
                    .invoke_tool(tool_id, resolved, CancellationToken::new(), None)
                    .await?;
                context.insert("last_result".to_string(), result);
                Ok(())
            }
            Action::TimerStart {
                timer_id,
                delay_ms,
                event,
            } => {
                let engine = self.clone();
                let event = event.clone();
                let delay = Duration::from_millis(*delay_ms);
                let key = (instance_id, timer_id.clone());
                let timer_label = timer_id.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    debug!(instance_id = %instance_id, timer_id = %timer_label, event = %event, "timer fired");
                    deliver_timer_event(engine, instance_id, event, timer_label).await;
                });
                if let Some(previous) = self
                    .timers
                    .lock()
                    .expect("timers lock")
                    .insert(key, handle)
                {
                    previous.abort();
                }
                Ok(())
            }
            Action::TimerCancel { timer_id } => {
                if let Some(handle) = self
                    .timers
                    .lock()
                    .expect("timers lock")
                    .remove(&(instance_id, timer_id.clone()))
                {
                    handle.abort();
                }
                Ok(())
            }
        }
    }
}

/// Boxed timer delivery: the erased future breaks the type cycle between
/// `process_event` and the timer action that re-enters it.
fn deliver_timer_event(
    engine: Arc<StateMachineEngine>,
    instance_id: Uuid,
    event: String,
    timer_id: String,
) -> futures::future::BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Err(err) = engine
            .process_event(instance_id, &event, json!({ "timer_id": timer_id }))
            .await
        {
            warn!(instance_id = %instance_id, error = %err, "timer event delivery failed");
        }
    })
}

fn initial_state(workflow: &Workflow) -> Option<&StateDefinition> {
    if let Some(name) = &workflow.initial_state {
        return workflow.state(name);
    }
    workflow.states.iter().find(|s| s.kind == StateKind::Initial)
}

/// First transition on the event whose guard is satisfied.
fn select_transition<'a>(
    state: &'a StateDefinition,
    event: &str,
    view: &Value,
) -> Option<&'a Transition> {
    state.transitions.iter().find(|transition| {
        if transition.event != event {
            return false;
        }
        match &transition.guard {
            None => true,
            Some(raw) => Condition::parse(raw)
                .and_then(|c| c.eval_bool(view))
                .unwrap_or(false),
        }
    })
}

fn merge_payload(context: &mut HashMap<String, Value>, payload: &Value) {
    if let Value::Object(map) = payload {
        for (key, value) in map {
            context.insert(key.clone(), value.clone());
        }
    }
}

/// Root value guards and action templates resolve against: the context
/// entries at top level plus the triggering event under `event`.
fn context_view(context: &HashMap<String, Value>, event: &str, payload: &Value) -> Value {
    let mut map = Map::new();
    for (key, value) in context {
        map.insert(key.clone(), value.clone());
    }
    map.insert(
        "event".to_string(),
        json!({ "name": event, "payload": payload }),
    );
    Value::Object(map)
}

fn resolve_action_input(
    bindings: &HashMap<String, String>,
    context: &HashMap<String, Value>,
) -> Result<Value, WorkflowError> {
    let view = Value::Object(
        context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Map<String, Value>>(),
    );
    let mut resolved = Map::new();
    for (key, raw) in bindings {
        let value = Template::parse(raw)
            .and_then(|t| t.resolve(&view))
            .map_err(|e| WorkflowError::Template(e.to_string()))?;
        resolved.insert(key.clone(), value);
    }
    Ok(Value::Object(resolved))
}
