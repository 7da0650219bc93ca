//! End-to-end state-machine scenarios driven through the parser.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use skein::{
    EventEmitter, EventKind, MemoryEventBus, MemoryExecutionRepo, ProcessOutcome,
    StateMachineEngine, StaticAgentRuntime, StaticToolRegistry, WorkflowParser,
};

fn engine_with_repo() -> (Arc<StateMachineEngine>, Arc<MemoryExecutionRepo>) {
    let repo = Arc::new(MemoryExecutionRepo::new());
    let bus = Arc::new(MemoryEventBus::new());
    let emitter = EventEmitter::new(bus.clone(), repo.clone());
    let engine = StateMachineEngine::new(
        Arc::new(StaticAgentRuntime::new()),
        Arc::new(StaticToolRegistry::new()),
        bus,
        emitter,
    );
    (engine, repo)
}

const ORDER_FLOW: &str = r#"
workflow:
  name: order-flow
  type: state_machine
  initial_state: created
  states:
    - name: created
      type: initial
      transitions:
        - event: pay
          target: paid
    - name: paid
      transitions:
        - event: ship
          target: shipped
    - name: shipped
      transitions:
        - event: deliver
          target: delivered
    - name: delivered
      type: final
"#;

#[tokio::test]
async fn order_flow_end_to_end() {
    let workflow = WorkflowParser::new().parse_str(ORDER_FLOW).unwrap();
    let workflow_id = workflow.id.clone();
    let (engine, repo) = engine_with_repo();
    engine.register_workflow(workflow).unwrap();

    assert!(engine.create_instance("unknown", HashMap::new()).await.is_err());
    let instance_id = engine
        .create_instance(&workflow_id, HashMap::new())
        .await
        .unwrap();

    for event in ["pay", "ship", "deliver"] {
        let outcome = engine
            .process_event(instance_id, event, json!({}))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Transitioned { .. }));
    }

    let instance = engine.instance(instance_id).unwrap();
    assert_eq!(instance.current_state, "delivered");
    assert_eq!(instance.history.len(), 3);
    assert!(instance.is_final);

    // Unknown event from the final state: state unchanged, unhandled
    // recorded.
    let outcome = engine
        .process_event(instance_id, "refund", json!({}))
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Unhandled);
    let instance = engine.instance(instance_id).unwrap();
    assert_eq!(instance.current_state, "delivered");
    assert_eq!(instance.history.len(), 3);

    let events: Vec<_> = repo
        .events_for(instance_id)
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == EventKind::TransitionFired)
            .count(),
        3
    );
    assert!(events.contains(&EventKind::InstanceCompleted));
    assert!(events.contains(&EventKind::EventUnhandled));
}

#[tokio::test]
async fn history_records_from_event_to() {
    let workflow = WorkflowParser::new().parse_str(ORDER_FLOW).unwrap();
    let workflow_id = workflow.id.clone();
    let (engine, _repo) = engine_with_repo();
    engine.register_workflow(workflow).unwrap();
    let instance_id = engine
        .create_instance(&workflow_id, HashMap::new())
        .await
        .unwrap();

    engine
        .process_event(instance_id, "pay", json!({"amount": 42}))
        .await
        .unwrap();

    let instance = engine.instance(instance_id).unwrap();
    let record = &instance.history[0];
    assert_eq!(record.from, "created");
    assert_eq!(record.event, "pay");
    assert_eq!(record.to, "paid");
    assert_eq!(record.payload["amount"], json!(42));
    // Payload merged into context on commit.
    assert_eq!(instance.context.get("amount"), Some(&json!(42)));
}

#[tokio::test]
async fn concurrent_instances_do_not_interfere() {
    let workflow = WorkflowParser::new().parse_str(ORDER_FLOW).unwrap();
    let workflow_id = workflow.id.clone();
    let (engine, _repo) = engine_with_repo();
    engine.register_workflow(workflow).unwrap();

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(
            engine
                .create_instance(&workflow_id, HashMap::new())
                .await
                .unwrap(),
        );
    }

    let mut handles = Vec::new();
    for (i, id) in ids.iter().copied().enumerate() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.process_event(id, "pay", json!({})).await.unwrap();
            if i % 2 == 0 {
                engine.process_event(id, "ship", json!({})).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for (i, id) in ids.iter().enumerate() {
        let instance = engine.instance(*id).unwrap();
        let expected = if i % 2 == 0 { "shipped" } else { "paid" };
        assert_eq!(instance.current_state, expected);
    }
}
